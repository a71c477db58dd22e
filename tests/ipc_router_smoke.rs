use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let id = format!("req-{}", method);
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id.as_str()));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(serde_json::Value::Null)
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
        .to_string()
}

struct Seeded {
    admin: String,
    teacher: String,
    parent: String,
    student: String,
    class_id: String,
}

/// Admin, one teacher with one class, one enrolled student with one parent.
/// Leaves the admin session open.
fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Seeded {
    request_ok(stdin, reader, "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let admin = str_field(
        &request_ok(
            stdin,
            reader,
            "users.create",
            json!({ "name": "Ada Admin", "email": "admin@school.test", "role": "ADMIN" }),
        ),
        "userId",
    );
    request_ok(stdin, reader, "session.begin", json!({ "userId": admin }));
    let teacher = str_field(
        &request_ok(
            stdin,
            reader,
            "users.create",
            json!({ "name": "Tom Teacher", "email": "tom@school.test", "role": "TEACHER" }),
        ),
        "userId",
    );
    let parent = str_field(
        &request_ok(
            stdin,
            reader,
            "users.create",
            json!({ "name": "Pat Parent", "email": "pat@home.test", "role": "PARENT" }),
        ),
        "userId",
    );
    let student = str_field(
        &request_ok(
            stdin,
            reader,
            "users.create",
            json!({
                "name": "Sam Student",
                "email": "sam@school.test",
                "role": "STUDENT",
                "parentIds": [parent]
            }),
        ),
        "userId",
    );
    let class_id = str_field(
        &request_ok(
            stdin,
            reader,
            "classes.create",
            json!({ "name": "Math 8A", "subject": "Math", "teacherId": teacher }),
        ),
        "classId",
    );
    request_ok(
        stdin,
        reader,
        "classes.students.add",
        json!({ "classId": class_id, "studentId": student }),
    );
    Seeded {
        admin,
        teacher,
        parent,
        student,
        class_id,
    }
}

const METHODS: &[&str] = &[
    "health",
    "session.end",
    "settings.get",
    "settings.set",
    "users.list",
    "users.update",
    "users.delete",
    "teachers.list",
    "classes.list",
    "classes.open",
    "classes.update",
    "classes.availableStudents",
    "classes.students.remove",
    "assignments.list",
    "assignments.archive",
    "grades.list",
    "grades.report",
    "attendance.list",
    "attendance.summary",
    "dashboard.admin",
    "dashboard.teacher",
    "dashboard.student",
    "dashboard.parent",
    "parent.child",
    "parent.childClass",
    "parent.attendance",
    "classes.delete",
];

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("gradebook-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "health", json!({}));
    assert!(health["workspacePath"].is_null());
    let early = request(&mut stdin, &mut reader, "classes.list", json!({}));
    assert_eq!(error_code(&early), "no_workspace");

    let s = seed(&mut stdin, &mut reader, &workspace);
    for method in METHODS {
        let resp = request(
            &mut stdin,
            &mut reader,
            method,
            json!({ "classId": s.class_id, "userId": s.teacher }),
        );
        assert_ne!(error_code(&resp), "not_implemented", "{} not routed", method);
        assert_ne!(error_code(&resp), "no_workspace", "{} lost the workspace", method);
    }

    let unknown = request(&mut stdin, &mut reader, "marksets.list", json!({}));
    assert_eq!(error_code(&unknown), "not_implemented");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn malformed_lines_get_bad_json_and_the_loop_continues() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read bad_json reply");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("reply is json");
    assert_eq!(value["ok"].as_bool(), Some(false));
    assert_eq!(error_code(&value), "bad_json");

    let health = request_ok(&mut stdin, &mut reader, "health", json!({}));
    assert!(health["version"].is_string());

    drop(stdin);
    let _ = child.wait();
}
