use crate::access::{self, Role};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, get_string_list, list_users, load_user,
    load_user_with_role, now_rfc3339, parent_ids_of, with_ctx, UserRow,
};
use crate::ipc::types::{AppState, Ctx, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn user_count(conn: &Connection) -> Result<i64, HandlerErr> {
    Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?)
}

fn normalize_email(raw: &str) -> Result<String, HandlerErr> {
    let email = raw.trim().to_ascii_lowercase();
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("email must contain @"));
    }
    Ok(email)
}

fn email_taken(conn: &Connection, email: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let owner: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [email], |r| r.get(0))
        .optional()?;
    Ok(match owner {
        Some(id) => Some(id.as_str()) != except_id,
        None => false,
    })
}

/// Students need at least one parent, and every listed id must be a PARENT.
fn validate_parents(conn: &Connection, parent_ids: &[String]) -> Result<(), HandlerErr> {
    if parent_ids.is_empty() {
        return Err(HandlerErr::bad_params("student must have at least one parent"));
    }
    for pid in parent_ids {
        load_user_with_role(conn, pid, Role::Parent)?;
    }
    Ok(())
}

fn replace_parent_links(conn: &Connection, student_id: &str, parent_ids: &[String]) -> Result<(), HandlerErr> {
    conn.execute("DELETE FROM parent_links WHERE student_id = ?", [student_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    for pid in parent_ids {
        conn.execute(
            "INSERT INTO parent_links(student_id, parent_id) VALUES(?, ?)",
            (student_id, pid),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "parent_links" }))
        })?;
    }
    Ok(())
}

fn user_json(conn: &Connection, user: &UserRow) -> Result<serde_json::Value, HandlerErr> {
    let mut v = json!({
        "id": user.id,
        "name": user.name,
        "email": user.email,
        "role": user.role,
    });
    if user.role == Role::Student {
        v["parentIds"] = json!(parent_ids_of(conn, &user.id)?);
    }
    Ok(v)
}

fn users_create(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let email = normalize_email(&get_required_str(params, "email")?)?;
    let role = get_required_str(params, "role")?.parse::<Role>()?;
    let parent_ids = get_string_list(params, "parentIds")?;

    // An empty workspace accepts its first admin without a session.
    let bootstrap = user_count(ctx.conn)? == 0;
    if bootstrap {
        if role != Role::Admin {
            return Err(HandlerErr::bad_params("the first user must be an ADMIN"));
        }
    } else {
        access::require_role(ctx.session, Role::Admin)?;
    }

    match role {
        Role::Student => validate_parents(ctx.conn, &parent_ids)?,
        Role::Admin | Role::Teacher | Role::Parent => {
            if !parent_ids.is_empty() {
                return Err(HandlerErr::bad_params("only students have parents"));
            }
        }
    }
    if email_taken(ctx.conn, &email, None)? {
        return Err(HandlerErr::new("conflict", "email already in use"));
    }

    let user_id = Uuid::new_v4().to_string();
    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "INSERT INTO users(id, name, email, role, created_at) VALUES(?, ?, ?, ?, ?)",
        (&user_id, &name, &email, role.as_str(), now_rfc3339()),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "users" })))?;
    if role == Role::Student {
        replace_parent_links(&tx, &user_id, &parent_ids)?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    tracing::info!(user_id = %user_id, role = %role, bootstrap, "user created");
    Ok(json!({ "userId": user_id }))
}

fn users_list(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let role = get_optional_str(params, "role")?
        .map(|r| r.parse::<Role>())
        .transpose()?;
    let users = list_users(ctx.conn, role)?;
    let out = users
        .iter()
        .map(|u| user_json(ctx.conn, u))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "users": out }))
}

fn users_update(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let user_id = get_required_str(params, "userId")?;
    let user = load_user(ctx.conn, &user_id)?;

    let name = get_optional_str(params, "name")?;
    let email = get_optional_str(params, "email")?
        .map(|e| normalize_email(&e))
        .transpose()?;
    let parent_ids = if params.get("parentIds").is_some() {
        Some(get_string_list(params, "parentIds")?)
    } else {
        None
    };

    if let Some(ids) = &parent_ids {
        if user.role != Role::Student {
            return Err(HandlerErr::bad_params("only students have parents"));
        }
        validate_parents(ctx.conn, ids)?;
    }
    if let Some(e) = &email {
        if email_taken(ctx.conn, e, Some(&user_id))? {
            return Err(HandlerErr::new("conflict", "email already in use"));
        }
    }

    let tx = ctx
        .conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    if let Some(n) = &name {
        tx.execute("UPDATE users SET name = ? WHERE id = ?", (n, &user_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(e) = &email {
        tx.execute("UPDATE users SET email = ? WHERE id = ?", (e, &user_id))
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(ids) = &parent_ids {
        replace_parent_links(&tx, &user_id, ids)?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    // Cached gradebooks and class views embed user names and parent links.
    ctx.cache.clear();
    tracing::info!(user_id = %user_id, "user updated");

    let updated = load_user(ctx.conn, &user_id)?;
    user_json(ctx.conn, &updated)
}

fn users_delete(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let admin = access::require_role(ctx.session, Role::Admin)?;
    let user_id = get_required_str(params, "userId")?;
    if admin.user_id == user_id {
        return Err(HandlerErr::new("conflict", "cannot delete the signed-in user"));
    }
    let user = load_user(ctx.conn, &user_id)?;

    match user.role {
        Role::Teacher => {
            let classes: i64 = ctx.conn.query_row(
                "SELECT COUNT(*) FROM classes WHERE teacher_id = ?",
                [&user_id],
                |r| r.get(0),
            )?;
            if classes > 0 {
                return Err(HandlerErr::new("conflict", "teacher still assigned to classes")
                    .with_details(json!({ "classCount": classes })));
            }
        }
        Role::Parent => {
            // Removing the last parent of a student would break the parent-set invariant.
            let orphaned: Vec<String> = {
                let mut stmt = ctx.conn.prepare(
                    "SELECT p.student_id
                     FROM parent_links p
                     WHERE p.parent_id = ?
                       AND (SELECT COUNT(*) FROM parent_links q WHERE q.student_id = p.student_id) = 1",
                )?;
                let ids = stmt
                    .query_map([&user_id], |r| r.get::<_, String>(0))
                    .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
                ids
            };
            if !orphaned.is_empty() {
                return Err(HandlerErr::new("conflict", "parent is the only parent of a student")
                    .with_details(json!({ "studentIds": orphaned })));
            }
        }
        Role::Admin | Role::Student => {}
    }

    ctx.conn
        .execute("DELETE FROM users WHERE id = ?", [&user_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "users" })))?;
    ctx.cache.clear();
    tracing::info!(user_id = %user_id, role = %user.role, "user deleted");
    Ok(json!({ "ok": true }))
}

fn teachers_list(ctx: &mut Ctx<'_>, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let teachers = list_users(ctx.conn, Some(Role::Teacher))?;
    let mut out: Vec<serde_json::Value> = Vec::with_capacity(teachers.len());
    for t in &teachers {
        let class_count: i64 = ctx.conn.query_row(
            "SELECT COUNT(*) FROM classes WHERE teacher_id = ?",
            [&t.id],
            |r| r.get(0),
        )?;
        out.push(json!({
            "id": t.id,
            "name": t.name,
            "email": t.email,
            "classCount": class_count,
        }));
    }
    Ok(json!({ "teachers": out }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(with_ctx(state, req, users_create)),
        "users.list" => Some(with_ctx(state, req, users_list)),
        "users.update" => Some(with_ctx(state, req, users_update)),
        "users.delete" => Some(with_ctx(state, req, users_delete)),
        "teachers.list" => Some(with_ctx(state, req, teachers_list)),
        _ => None,
    }
}
