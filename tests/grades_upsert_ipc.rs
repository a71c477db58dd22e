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

fn final_grade_of(report: &serde_json::Value) -> Option<i64> {
    report
        .get("reports")
        .and_then(|r| r.get(0))
        .and_then(|r| r.get("finalGrade"))
        .and_then(|v| v.as_i64())
}

#[test]
fn grade_upsert_keeps_one_row_per_student_and_assignment() {
    let workspace = temp_dir("gradebook-grades-upsert");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let s = seed(&mut stdin, &mut reader, &workspace);
    request_ok(&mut stdin, &mut reader, "session.begin", json!({ "userId": s.teacher }));

    let hw = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "assignments.create",
            json!({ "classId": s.class_id, "name": "Homework 1", "category": "Homework", "totalPoints": 10 }),
        ),
        "assignmentId",
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "grades.upsert",
        json!({ "classId": s.class_id, "studentId": s.student, "assignmentId": hw, "points": 5 }),
    );
    assert_eq!(first["grade"]["percentage"].as_i64(), Some(50));
    assert_eq!(first["report"]["finalGrade"].as_i64(), Some(95));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "grades.upsert",
        json!({ "classId": s.class_id, "studentId": s.student, "assignmentId": hw, "points": 8 }),
    );
    assert_eq!(second["grade"]["id"], first["grade"]["id"]);
    assert_eq!(second["grade"]["percentage"].as_i64(), Some(80));

    let listed = request_ok(&mut stdin, &mut reader, "grades.list", json!({ "classId": s.class_id }));
    let grades = listed["grades"].as_array().expect("grades");
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0]["points"].as_f64(), Some(8.0));
    assert_eq!(grades[0]["totalPoints"].as_f64(), Some(10.0));

    let negative = request(
        &mut stdin,
        &mut reader,
        "grades.upsert",
        json!({ "classId": s.class_id, "studentId": s.student, "assignmentId": hw, "points": -1 }),
    );
    assert_eq!(error_code(&negative), "bad_params");

    // Extra credit is stored as-is.
    let over = request_ok(
        &mut stdin,
        &mut reader,
        "grades.upsert",
        json!({ "classId": s.class_id, "studentId": s.student, "assignmentId": hw, "points": 12 }),
    );
    assert_eq!(over["grade"]["percentage"].as_i64(), Some(120));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn empty_categories_count_as_full_credit() {
    let workspace = temp_dir("gradebook-category-default");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let s = seed(&mut stdin, &mut reader, &workspace);
    request_ok(&mut stdin, &mut reader, "session.begin", json!({ "userId": s.teacher }));

    let report = request_ok(&mut stdin, &mut reader, "grades.report", json!({ "classId": s.class_id }));
    assert_eq!(final_grade_of(&report), Some(100));

    // Zero on the only unit test still leaves 75 from the untouched categories.
    let ut = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "assignments.create",
            json!({ "classId": s.class_id, "name": "Unit 1", "category": "Unit Test", "totalPoints": 50 }),
        ),
        "assignmentId",
    );
    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "grades.upsert",
        json!({ "classId": s.class_id, "studentId": s.student, "assignmentId": ut, "points": 0 }),
    );
    assert_eq!(graded["report"]["finalGrade"].as_i64(), Some(75));

    // Archiving drops the assignment from the computation.
    request_ok(&mut stdin, &mut reader, "assignments.archive", json!({ "assignmentId": ut }));
    let report = request_ok(&mut stdin, &mut reader, "grades.report", json!({ "classId": s.class_id }));
    assert_eq!(final_grade_of(&report), Some(100));

    let archived = request(
        &mut stdin,
        &mut reader,
        "grades.upsert",
        json!({ "classId": s.class_id, "studentId": s.student, "assignmentId": ut, "points": 10 }),
    );
    assert_eq!(error_code(&archived), "conflict");

    let unknown = request(
        &mut stdin,
        &mut reader,
        "assignments.create",
        json!({ "classId": s.class_id, "name": "Quiz", "category": "Quiz", "totalPoints": 10 }),
    );
    assert_eq!(error_code(&unknown), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn class_report_cache_follows_writes() {
    let workspace = temp_dir("gradebook-report-cache");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let s = seed(&mut stdin, &mut reader, &workspace);
    request_ok(&mut stdin, &mut reader, "session.begin", json!({ "userId": s.teacher }));

    let hw = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "assignments.create",
            json!({ "classId": s.class_id, "name": "Homework 1", "category": "Homework", "totalPoints": 10 }),
        ),
        "assignmentId",
    );

    let fresh = request_ok(&mut stdin, &mut reader, "grades.report", json!({ "classId": s.class_id }));
    assert_eq!(fresh["cached"].as_bool(), Some(false));
    let again = request_ok(&mut stdin, &mut reader, "grades.report", json!({ "classId": s.class_id }));
    assert_eq!(again["cached"].as_bool(), Some(true));

    // A successful grade write patches the cached report in place.
    request_ok(
        &mut stdin,
        &mut reader,
        "grades.upsert",
        json!({ "classId": s.class_id, "studentId": s.student, "assignmentId": hw, "points": 5 }),
    );
    let patched = request_ok(&mut stdin, &mut reader, "grades.report", json!({ "classId": s.class_id }));
    assert_eq!(patched["cached"].as_bool(), Some(true));
    assert_eq!(final_grade_of(&patched), Some(95));
    assert_eq!(patched["grades"].as_array().map(|g| g.len()), Some(1));

    // Structural writes drop every key of the class.
    request_ok(
        &mut stdin,
        &mut reader,
        "assignments.create",
        json!({ "classId": s.class_id, "name": "Research 1", "category": "Research", "totalPoints": 20 }),
    );
    let rebuilt = request_ok(&mut stdin, &mut reader, "grades.report", json!({ "classId": s.class_id }));
    assert_eq!(rebuilt["cached"].as_bool(), Some(false));
    assert_eq!(final_grade_of(&rebuilt), Some(95));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn renaming_a_student_drops_cached_reports() {
    let workspace = temp_dir("gradebook-rename-cache");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let s = seed(&mut stdin, &mut reader, &workspace);

    request_ok(&mut stdin, &mut reader, "session.begin", json!({ "userId": s.teacher }));
    let before = request_ok(&mut stdin, &mut reader, "grades.report", json!({ "classId": s.class_id }));
    assert_eq!(before["students"][0]["name"].as_str(), Some("Sam Student"));

    request_ok(&mut stdin, &mut reader, "session.begin", json!({ "userId": s.admin }));
    request_ok(
        &mut stdin,
        &mut reader,
        "users.update",
        json!({ "userId": s.student, "name": "Samantha Student" }),
    );

    request_ok(&mut stdin, &mut reader, "session.begin", json!({ "userId": s.teacher }));
    let after = request_ok(&mut stdin, &mut reader, "grades.report", json!({ "classId": s.class_id }));
    assert_eq!(after["cached"].as_bool(), Some(false));
    assert_eq!(after["students"][0]["name"].as_str(), Some("Samantha Student"));

    drop(stdin);
    let _ = child.wait();
}
