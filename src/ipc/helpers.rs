use crate::access::Role;
use crate::calc::{self, AttendanceStatus, Category};
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Ctx, Request};
use chrono::{DateTime, Days, NaiveDate, Utc};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;

pub const ATTENDANCE_WINDOW_KEY: &str = "attendance.windowDays";
pub const DEFAULT_ATTENDANCE_WINDOW_DAYS: u64 = 30;

/// Runs `f` against the open workspace and wraps the outcome in the response
/// envelope.
pub fn with_ctx<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(&mut Ctx<'_>, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut ctx = Ctx {
        conn,
        session: state.session.as_ref(),
        cache: &mut state.cache,
    };
    match f(&mut ctx, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => {
            tracing::warn!(
                method = %req.method,
                code = error.code,
                message = %error.message,
                "request failed"
            );
            error.response(&req.id)
        }
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s)
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(HandlerErr::bad_params(format!(
                    "{} must be string or null",
                    key
                )));
            };
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
    }
}

pub fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    let v = params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if !v.is_finite() {
        return Err(HandlerErr::bad_params(format!("{} must be a finite number", key)));
    }
    Ok(v)
}

pub fn get_flag(params: &serde_json::Value, key: &str) -> bool {
    params.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub fn get_string_list(params: &serde_json::Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Ok(Vec::new());
    };
    if v.is_null() {
        return Ok(Vec::new());
    }
    let Some(arr) = v.as_array() else {
        return Err(HandlerErr::bad_params(format!("{} must be an array", key)));
    };
    let mut out: Vec<String> = Vec::with_capacity(arr.len());
    for item in arr {
        let Some(s) = item.as_str() else {
            return Err(HandlerErr::bad_params(format!("{} must contain strings", key)));
        };
        let s = s.trim().to_string();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    Ok(out)
}

pub fn parse_day(raw: &str) -> Result<NaiveDate, HandlerErr> {
    let t = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return Ok(d);
    }
    // Full timestamps collapse to their UTC calendar day.
    DateTime::parse_from_rfc3339(t)
        .map(|dt| dt.with_timezone(&Utc).date_naive())
        .map_err(|_| HandlerErr::bad_params(format!("invalid date: {}", t)))
}

pub fn day_key(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn attendance_window_days(conn: &Connection) -> Result<u64, HandlerErr> {
    let v = db::settings_get_json(conn, ATTENDANCE_WINDOW_KEY)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(v.and_then(|v| v.as_u64())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_ATTENDANCE_WINDOW_DAYS))
}

/// First day included in the rolling attendance window.
pub fn attendance_window_start(conn: &Connection) -> Result<NaiveDate, HandlerErr> {
    let days = attendance_window_days(conn)?;
    Ok(today()
        .checked_sub_days(Days::new(days))
        .unwrap_or(NaiveDate::MIN))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub role: Role,
}

fn users_from_raw(raw: Vec<(String, String, String, String)>) -> Result<Vec<UserRow>, HandlerErr> {
    raw.into_iter()
        .map(|(id, name, email, role)| {
            let role = role
                .parse::<Role>()
                .map_err(|e| HandlerErr::db("db_query_failed", e))?;
            Ok(UserRow {
                id,
                name,
                email,
                role,
            })
        })
        .collect()
}

fn query_users(conn: &Connection, sql: &str, binds: Vec<Value>) -> Result<Vec<UserRow>, HandlerErr> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    users_from_raw(raw)
}

pub fn load_user(conn: &Connection, user_id: &str) -> Result<UserRow, HandlerErr> {
    query_users(
        conn,
        "SELECT id, name, email, role FROM users WHERE id = ?",
        vec![Value::Text(user_id.to_string())],
    )?
    .into_iter()
    .next()
    .ok_or_else(|| HandlerErr::not_found("user"))
}

pub fn load_user_with_role(conn: &Connection, user_id: &str, role: Role) -> Result<UserRow, HandlerErr> {
    let user = load_user(conn, user_id)?;
    if user.role != role {
        return Err(HandlerErr::bad_params(format!(
            "user {} is not a {}",
            user_id, role
        )));
    }
    Ok(user)
}

pub fn list_users(conn: &Connection, role: Option<Role>) -> Result<Vec<UserRow>, HandlerErr> {
    match role {
        Some(role) => query_users(
            conn,
            "SELECT id, name, email, role FROM users WHERE role = ? ORDER BY name, id",
            vec![Value::Text(role.as_str().to_string())],
        ),
        None => query_users(
            conn,
            "SELECT id, name, email, role FROM users ORDER BY name, id",
            Vec::new(),
        ),
    }
}

pub fn parent_ids_of(conn: &Connection, student_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT parent_id FROM parent_links WHERE student_id = ? ORDER BY parent_id",
    )?;
    let ids = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(ids)
}

pub fn children_of(conn: &Connection, parent_id: &str) -> Result<Vec<UserRow>, HandlerErr> {
    query_users(
        conn,
        "SELECT u.id, u.name, u.email, u.role
         FROM users u
         JOIN parent_links p ON p.student_id = u.id
         WHERE p.parent_id = ? AND u.role = 'STUDENT'
         ORDER BY u.name, u.id",
        vec![Value::Text(parent_id.to_string())],
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRow {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub teacher_id: String,
    pub teacher_name: Option<String>,
    pub student_count: i64,
}

pub enum ClassScope<'a> {
    All,
    TaughtBy(&'a str),
    AttendedBy(&'a str),
}

const CLASS_SELECT: &str = "SELECT c.id, c.name, c.subject, c.teacher_id, t.name,
        (SELECT COUNT(*) FROM enrollments e WHERE e.class_id = c.id)
     FROM classes c
     LEFT JOIN users t ON t.id = c.teacher_id";

fn query_classes(conn: &Connection, sql: &str, binds: Vec<Value>) -> Result<Vec<ClassRow>, HandlerErr> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(ClassRow {
                id: r.get(0)?,
                name: r.get(1)?,
                subject: r.get(2)?,
                teacher_id: r.get(3)?,
                teacher_name: r.get(4)?,
                student_count: r.get(5)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

pub fn load_class(conn: &Connection, class_id: &str) -> Result<ClassRow, HandlerErr> {
    let sql = format!("{} WHERE c.id = ?", CLASS_SELECT);
    query_classes(conn, &sql, vec![Value::Text(class_id.to_string())])?
        .into_iter()
        .next()
        .ok_or_else(|| HandlerErr::not_found("class"))
}

pub fn list_classes(conn: &Connection, scope: ClassScope<'_>) -> Result<Vec<ClassRow>, HandlerErr> {
    let (filter, binds) = match scope {
        ClassScope::All => ("", Vec::new()),
        ClassScope::TaughtBy(teacher_id) => (
            " WHERE c.teacher_id = ?",
            vec![Value::Text(teacher_id.to_string())],
        ),
        ClassScope::AttendedBy(student_id) => (
            " WHERE c.id IN (SELECT class_id FROM enrollments WHERE student_id = ?)",
            vec![Value::Text(student_id.to_string())],
        ),
    };
    let sql = format!("{}{} ORDER BY c.name, c.id", CLASS_SELECT, filter);
    query_classes(conn, &sql, binds)
}

pub fn enrolled_students(conn: &Connection, class_id: &str) -> Result<Vec<UserRow>, HandlerErr> {
    query_users(
        conn,
        "SELECT u.id, u.name, u.email, u.role
         FROM enrollments e
         JOIN users u ON u.id = e.student_id
         WHERE e.class_id = ?
         ORDER BY e.sort_order, u.name, u.id",
        vec![Value::Text(class_id.to_string())],
    )
}

pub fn is_enrolled(conn: &Connection, class_id: &str, student_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM enrollments WHERE class_id = ? AND student_id = ?",
            (class_id, student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

pub fn teaches_student(conn: &Connection, teacher_id: &str, student_id: &str) -> Result<bool, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT 1
             FROM enrollments e
             JOIN classes c ON c.id = e.class_id
             WHERE c.teacher_id = ? AND e.student_id = ?
             LIMIT 1",
            (teacher_id, student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()?
        .is_some())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRow {
    pub id: String,
    pub class_id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Category,
    pub total_points: f64,
    pub status: String,
    pub due_date: Option<String>,
    pub created_at: String,
}

impl AssignmentRow {
    pub fn to_calc(&self) -> calc::Assignment {
        calc::Assignment {
            id: self.id.clone(),
            category: self.category,
            total_points: self.total_points,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

fn query_assignments(conn: &Connection, sql: &str, binds: Vec<Value>) -> Result<Vec<AssignmentRow>, HandlerErr> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, Option<String>>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, f64>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, Option<String>>(7)?,
                r.get::<_, String>(8)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    raw.into_iter()
        .map(
            |(id, class_id, name, description, category, total_points, status, due_date, created_at)| {
                let Some(category) = Category::parse(&category) else {
                    return Err(HandlerErr::new(
                        "db_query_failed",
                        format!("assignment {} has unknown category {}", id, category),
                    ));
                };
                Ok(AssignmentRow {
                    id,
                    class_id,
                    name,
                    description,
                    category,
                    total_points,
                    status,
                    due_date,
                    created_at,
                })
            },
        )
        .collect()
}

const ASSIGNMENT_SELECT: &str = "SELECT id, class_id, name, description, category, total_points,
        status, due_date, created_at
     FROM assignments";

pub fn load_assignment(conn: &Connection, assignment_id: &str) -> Result<AssignmentRow, HandlerErr> {
    let sql = format!("{} WHERE id = ?", ASSIGNMENT_SELECT);
    query_assignments(conn, &sql, vec![Value::Text(assignment_id.to_string())])?
        .into_iter()
        .next()
        .ok_or_else(|| HandlerErr::not_found("assignment"))
}

pub fn list_assignments(
    conn: &Connection,
    class_id: &str,
    include_archived: bool,
) -> Result<Vec<AssignmentRow>, HandlerErr> {
    let sql = if include_archived {
        format!("{} WHERE class_id = ? ORDER BY created_at, rowid", ASSIGNMENT_SELECT)
    } else {
        format!(
            "{} WHERE class_id = ? AND status = 'active' ORDER BY created_at, rowid",
            ASSIGNMENT_SELECT
        )
    };
    query_assignments(conn, &sql, vec![Value::Text(class_id.to_string())])
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRow {
    pub id: String,
    pub student_id: String,
    pub assignment_id: String,
    pub class_id: String,
    pub points: f64,
    pub total_points: f64,
    pub percentage: i64,
    pub updated_at: String,
}

impl GradeRow {
    pub fn to_calc(&self) -> calc::Grade {
        calc::Grade {
            student_id: self.student_id.clone(),
            assignment_id: self.assignment_id.clone(),
            points: self.points,
        }
    }

    pub fn snapshot(&self) -> calc::PointsSnapshot {
        calc::PointsSnapshot {
            points: self.points,
            total_points: self.total_points,
        }
    }
}

pub fn list_grades(
    conn: &Connection,
    class_id: Option<&str>,
    student_id: Option<&str>,
) -> Result<Vec<GradeRow>, HandlerErr> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(c) = class_id {
        clauses.push("class_id = ?");
        binds.push(Value::Text(c.to_string()));
    }
    if let Some(s) = student_id {
        clauses.push("student_id = ?");
        binds.push(Value::Text(s.to_string()));
    }
    let filter = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT id, student_id, assignment_id, class_id, points, total_points, percentage, updated_at
         FROM grades{}
         ORDER BY student_id, assignment_id",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(GradeRow {
                id: r.get(0)?,
                student_id: r.get(1)?,
                assignment_id: r.get(2)?,
                class_id: r.get(3)?,
                points: r.get(4)?,
                total_points: r.get(5)?,
                percentage: r.get(6)?,
                updated_at: r.get(7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRow {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub teacher_id: String,
    pub date: NaiveDate,
    pub status: AttendanceStatus,
    pub note: Option<String>,
}

impl AttendanceRow {
    pub fn to_calc(&self) -> calc::AttendanceRecord {
        calc::AttendanceRecord {
            student_id: self.student_id.clone(),
            class_id: self.class_id.clone(),
            date: self.date,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AttendanceQuery<'a> {
    pub class_id: Option<&'a str>,
    pub student_id: Option<&'a str>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

pub fn list_attendance(conn: &Connection, q: AttendanceQuery<'_>) -> Result<Vec<AttendanceRow>, HandlerErr> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(c) = q.class_id {
        clauses.push("class_id = ?");
        binds.push(Value::Text(c.to_string()));
    }
    if let Some(s) = q.student_id {
        clauses.push("student_id = ?");
        binds.push(Value::Text(s.to_string()));
    }
    if let Some(d) = q.from {
        clauses.push("date >= ?");
        binds.push(Value::Text(day_key(d)));
    }
    if let Some(d) = q.to {
        clauses.push("date <= ?");
        binds.push(Value::Text(day_key(d)));
    }
    let filter = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT id, student_id, class_id, teacher_id, date, status, note
         FROM attendance{}
         ORDER BY date, student_id",
        filter
    );
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, Option<String>>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    raw.into_iter()
        .map(|(id, student_id, class_id, teacher_id, date, status, note)| {
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|e| {
                HandlerErr::new("db_query_failed", format!("attendance {} date: {}", id, e))
            })?;
            let Some(status) = AttendanceStatus::parse(&status) else {
                return Err(HandlerErr::new(
                    "db_query_failed",
                    format!("attendance {} has unknown status {}", id, status),
                ));
            };
            Ok(AttendanceRow {
                id,
                student_id,
                class_id,
                teacher_id,
                date,
                status,
                note,
            })
        })
        .collect()
}
