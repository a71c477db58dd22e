use crate::access::{self, Principal, Role};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    children_of, enrolled_students, get_optional_str, get_required_str, list_assignments,
    list_classes, list_users, load_class, load_user_with_role, now_rfc3339, with_ctx, ClassRow,
    ClassScope,
};
use crate::ipc::types::{AppState, Ctx, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

/// Class-level read access: admins, the class teacher, enrolled students and
/// their parents.
pub fn require_class_visible(conn: &Connection, p: &Principal, class: &ClassRow) -> Result<(), HandlerErr> {
    let visible = match p.role {
        Role::Admin => true,
        Role::Teacher => p.user_id == class.teacher_id,
        Role::Student => list_classes(conn, ClassScope::AttendedBy(&p.user_id))?
            .iter()
            .any(|c| c.id == class.id),
        Role::Parent => {
            let mut any = false;
            for child in children_of(conn, &p.user_id)? {
                if list_classes(conn, ClassScope::AttendedBy(&child.id))?
                    .iter()
                    .any(|c| c.id == class.id)
                {
                    any = true;
                    break;
                }
            }
            any
        }
    };
    if visible {
        Ok(())
    } else {
        Err(HandlerErr::new("forbidden", "class not visible to this user"))
    }
}

fn classes_create(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let name = get_required_str(params, "name")?;
    let subject = get_required_str(params, "subject")?;
    let teacher_id = get_required_str(params, "teacherId")?;
    load_user_with_role(ctx.conn, &teacher_id, Role::Teacher)?;

    let class_id = Uuid::new_v4().to_string();
    ctx.conn
        .execute(
            "INSERT INTO classes(id, name, subject, teacher_id, created_at) VALUES(?, ?, ?, ?, ?)",
            (&class_id, &name, &subject, &teacher_id, now_rfc3339()),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "classes" })))?;
    tracing::info!(class_id = %class_id, teacher_id = %teacher_id, "class created");
    Ok(json!({ "classId": class_id }))
}

fn classes_list(ctx: &mut Ctx<'_>, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let classes = match p.role {
        Role::Admin => list_classes(ctx.conn, ClassScope::All)?,
        Role::Teacher => list_classes(ctx.conn, ClassScope::TaughtBy(&p.user_id))?,
        Role::Student => list_classes(ctx.conn, ClassScope::AttendedBy(&p.user_id))?,
        Role::Parent => {
            let mut out: Vec<ClassRow> = Vec::new();
            for child in children_of(ctx.conn, &p.user_id)? {
                for c in list_classes(ctx.conn, ClassScope::AttendedBy(&child.id))? {
                    if !out.iter().any(|o| o.id == c.id) {
                        out.push(c);
                    }
                }
            }
            out
        }
    };
    Ok(json!({ "classes": classes }))
}

fn classes_open(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let class_id = get_required_str(params, "classId")?;
    let class = load_class(ctx.conn, &class_id)?;
    require_class_visible(ctx.conn, p, &class)?;

    // Rosters are only shown to staff.
    let students = match p.role {
        Role::Admin | Role::Teacher => Some(enrolled_students(ctx.conn, &class_id)?),
        Role::Student | Role::Parent => None,
    };
    let assignments = list_assignments(ctx.conn, &class_id, false)?;
    Ok(json!({
        "class": class,
        "students": students,
        "assignments": assignments,
    }))
}

fn classes_update(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let class_id = get_required_str(params, "classId")?;
    load_class(ctx.conn, &class_id)?;

    let name = get_optional_str(params, "name")?;
    let subject = get_optional_str(params, "subject")?;
    let teacher_id = get_optional_str(params, "teacherId")?;
    if let Some(t) = &teacher_id {
        load_user_with_role(ctx.conn, t, Role::Teacher)?;
    }

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for (column, value) in [("name", &name), ("subject", &subject), ("teacher_id", &teacher_id)] {
        let Some(v) = value else { continue };
        let sql = format!("UPDATE classes SET {} = ? WHERE id = ?", column);
        tx.execute(&sql, (v, &class_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "column": column })))?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    ctx.cache.invalidate_class(&class_id);
    let class = load_class(ctx.conn, &class_id)?;
    Ok(json!({ "class": class }))
}

fn classes_delete(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let class_id = get_required_str(params, "classId")?;
    let changed = ctx
        .conn
        .execute("DELETE FROM classes WHERE id = ?", [&class_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "classes" })))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("class"));
    }
    ctx.cache.invalidate_class(&class_id);
    tracing::info!(class_id = %class_id, "class deleted");
    Ok(json!({ "ok": true }))
}

fn class_students_add(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    load_class(ctx.conn, &class_id)?;
    load_user_with_role(ctx.conn, &student_id, Role::Student)?;

    let next_sort: i64 = ctx.conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM enrollments WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    )?;
    // Set semantics: enrolling twice is a no-op.
    let inserted = ctx
        .conn
        .execute(
            "INSERT OR IGNORE INTO enrollments(class_id, student_id, sort_order) VALUES(?, ?, ?)",
            (&class_id, &student_id, next_sort),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "enrollments" })))?;
    ctx.cache.invalidate_class(&class_id);

    let students = enrolled_students(ctx.conn, &class_id)?;
    Ok(json!({ "added": inserted > 0, "students": students }))
}

fn class_students_remove(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    load_class(ctx.conn, &class_id)?;

    let removed = ctx
        .conn
        .execute(
            "DELETE FROM enrollments WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "enrollments" })))?;
    ctx.cache.invalidate_class(&class_id);

    let students = enrolled_students(ctx.conn, &class_id)?;
    Ok(json!({ "removed": removed > 0, "students": students }))
}

fn class_available_students(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let class_id = get_required_str(params, "classId")?;
    load_class(ctx.conn, &class_id)?;

    let enrolled = enrolled_students(ctx.conn, &class_id)?;
    let available: Vec<_> = list_users(ctx.conn, Some(Role::Student))?
        .into_iter()
        .filter(|s| !enrolled.iter().any(|e| e.id == s.id))
        .collect();
    Ok(json!({ "students": available }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(with_ctx(state, req, classes_create)),
        "classes.list" => Some(with_ctx(state, req, classes_list)),
        "classes.open" => Some(with_ctx(state, req, classes_open)),
        "classes.update" => Some(with_ctx(state, req, classes_update)),
        "classes.delete" => Some(with_ctx(state, req, classes_delete)),
        "classes.students.add" => Some(with_ctx(state, req, class_students_add)),
        "classes.students.remove" => Some(with_ctx(state, req, class_students_remove)),
        "classes.availableStudents" => Some(with_ctx(state, req, class_available_students)),
        _ => None,
    }
}
