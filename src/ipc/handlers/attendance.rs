use crate::access;
use crate::cache::QueryKey;
use crate::calc::{self, AttendanceStatus};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    day_key, enrolled_students, get_optional_str, get_required_str, is_enrolled, list_attendance,
    load_class, parse_day, with_ctx, AttendanceQuery, AttendanceRow,
};
use crate::ipc::types::{AppState, Ctx, Request};
use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn date_range(params: &serde_json::Value) -> Result<(Option<NaiveDate>, Option<NaiveDate>), HandlerErr> {
    // A single `date` pins both ends.
    if let Some(d) = get_optional_str(params, "date")? {
        let day = parse_day(&d)?;
        return Ok((Some(day), Some(day)));
    }
    let from = get_optional_str(params, "startDate")?
        .map(|s| parse_day(&s))
        .transpose()?;
    let to = get_optional_str(params, "endDate")?
        .map(|s| parse_day(&s))
        .transpose()?;
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err(HandlerErr::bad_params("startDate must not be after endDate"));
        }
    }
    Ok((from, to))
}

fn attendance_list(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let class_id = get_required_str(params, "classId")?;
    let class = load_class(ctx.conn, &class_id)?;
    access::can_read_class_records(p, &class.teacher_id)?;

    let (from, to) = date_range(params)?;
    let records = list_attendance(
        ctx.conn,
        AttendanceQuery {
            class_id: Some(&class_id),
            from,
            to,
            ..Default::default()
        },
    )?;
    let students = enrolled_students(ctx.conn, &class_id)?;
    Ok(json!({ "students": students, "records": records }))
}

fn attendance_mark(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let class_id = get_required_str(params, "classId")?;
    let student_id = get_required_str(params, "studentId")?;
    let date = parse_day(&get_required_str(params, "date")?)?;
    let status_raw = get_required_str(params, "status")?;
    let Some(status) = AttendanceStatus::parse(&status_raw) else {
        return Err(HandlerErr::bad_params(format!("unknown status: {}", status_raw))
            .with_details(json!({ "allowed": ["present", "absent", "late"] })));
    };
    let note = get_optional_str(params, "note")?;

    let class = load_class(ctx.conn, &class_id)?;
    access::can_write_class(p, &class.teacher_id)?;
    if !is_enrolled(ctx.conn, &class_id, &student_id)? {
        return Err(HandlerErr::not_found("student in class"));
    }

    let date_key = day_key(date);
    let existing: Option<(String, String)> = ctx
        .conn
        .query_row(
            "SELECT id, status FROM attendance WHERE student_id = ? AND class_id = ? AND date = ?",
            (&student_id, &class_id, &date_key),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    // Marking the same status twice clears the mark.
    let action = match existing {
        Some((id, current)) if AttendanceStatus::parse(&current) == Some(status) => {
            ctx.conn
                .execute("DELETE FROM attendance WHERE id = ?", [&id])
                .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "attendance" })))?;
            "removed"
        }
        Some((id, _)) => {
            ctx.conn
                .execute(
                    "UPDATE attendance SET status = ?, note = ?, teacher_id = ? WHERE id = ?",
                    (status.as_str(), &note, &p.user_id, &id),
                )
                .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "attendance" })))?;
            "updated"
        }
        None => {
            ctx.conn
                .execute(
                    "INSERT INTO attendance(id, student_id, class_id, teacher_id, date, status, note)
                     VALUES(?, ?, ?, ?, ?, ?, ?)",
                    (
                        Uuid::new_v4().to_string(),
                        &student_id,
                        &class_id,
                        &p.user_id,
                        &date_key,
                        status.as_str(),
                        &note,
                    ),
                )
                .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "attendance" })))?;
            "created"
        }
    };

    ctx.cache.invalidate(&QueryKey::StudentReport {
        class_id: class_id.clone(),
        student_id: student_id.clone(),
    });
    tracing::info!(
        class_id = %class_id,
        student_id = %student_id,
        date = %date_key,
        status = status.as_str(),
        action,
        "attendance marked"
    );

    let record: Option<AttendanceRow> = list_attendance(
        ctx.conn,
        AttendanceQuery {
            class_id: Some(&class_id),
            student_id: Some(&student_id),
            from: Some(date),
            to: Some(date),
        },
    )?
    .into_iter()
    .next();
    Ok(json!({ "action": action, "record": record }))
}

fn attendance_summary(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let class_id = get_required_str(params, "classId")?;
    let class = load_class(ctx.conn, &class_id)?;
    access::can_read_class_records(p, &class.teacher_id)?;

    let (from, to) = date_range(params)?;
    let records: Vec<calc::AttendanceRecord> = list_attendance(
        ctx.conn,
        AttendanceQuery {
            class_id: Some(&class_id),
            from,
            to,
            ..Default::default()
        },
    )?
    .iter()
    .map(AttendanceRow::to_calc)
    .collect();

    let students = enrolled_students(ctx.conn, &class_id)?;
    let rows: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            let own: Vec<calc::AttendanceRecord> = records
                .iter()
                .filter(|r| r.student_id == s.id)
                .cloned()
                .collect();
            json!({
                "studentId": s.id,
                "name": s.name,
                "summary": calc::attendance_breakdown(&own),
            })
        })
        .collect();

    Ok(json!({
        "classId": class_id,
        "startDate": from.map(day_key),
        "endDate": to.map(day_key),
        "students": rows,
        "class": calc::attendance_breakdown(&records),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.list" => Some(with_ctx(state, req, attendance_list)),
        "attendance.mark" => Some(with_ctx(state, req, attendance_mark)),
        "attendance.summary" => Some(with_ctx(state, req, attendance_summary)),
        _ => None,
    }
}
