use crate::access;
use crate::calc::Category;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::classes::require_class_visible;
use crate::ipc::helpers::{
    day_key, get_flag, get_optional_str, get_required_f64, get_required_str, list_assignments,
    load_assignment, load_class, now_rfc3339, parse_day, with_ctx,
};
use crate::ipc::types::{AppState, Ctx, Request};
use serde_json::json;
use uuid::Uuid;

fn assignments_create(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let class_id = get_required_str(params, "classId")?;
    let class = load_class(ctx.conn, &class_id)?;
    access::can_write_class(p, &class.teacher_id)?;

    let name = get_required_str(params, "name")?;
    let category_raw = get_required_str(params, "category")?;
    let Some(category) = Category::parse(&category_raw) else {
        return Err(HandlerErr::bad_params(format!("unknown category: {}", category_raw))
            .with_details(json!({
                "allowed": Category::ALL.iter().map(|c| c.as_str()).collect::<Vec<_>>()
            })));
    };
    // Percentages are undefined without a positive total.
    let total_points = get_required_f64(params, "totalPoints")?;
    if total_points <= 0.0 {
        return Err(HandlerErr::bad_params("totalPoints must be > 0"));
    }
    let description = get_optional_str(params, "description")?;
    let due_date = get_optional_str(params, "dueDate")?
        .map(|d| parse_day(&d).map(day_key))
        .transpose()?;

    let assignment_id = Uuid::new_v4().to_string();
    ctx.conn
        .execute(
            "INSERT INTO assignments(id, class_id, name, description, category, total_points, status, due_date, created_at)
             VALUES(?, ?, ?, ?, ?, ?, 'active', ?, ?)",
            (
                &assignment_id,
                &class_id,
                &name,
                &description,
                category.as_str(),
                total_points,
                &due_date,
                now_rfc3339(),
            ),
        )
        .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "assignments" })))?;
    ctx.cache.invalidate_class(&class_id);
    tracing::info!(
        assignment_id = %assignment_id,
        class_id = %class_id,
        category = %category,
        total_points,
        "assignment created"
    );

    let created = load_assignment(ctx.conn, &assignment_id)?;
    Ok(json!({ "assignmentId": assignment_id, "assignment": created }))
}

fn assignments_list(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let class_id = get_required_str(params, "classId")?;
    let class = load_class(ctx.conn, &class_id)?;
    require_class_visible(ctx.conn, p, &class)?;

    let include_archived = get_flag(params, "includeArchived");
    let assignments = list_assignments(ctx.conn, &class_id, include_archived)?;
    Ok(json!({ "assignments": assignments }))
}

fn assignments_archive(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let p = access::require_session(ctx.session)?;
    let assignment_id = get_required_str(params, "assignmentId")?;
    let assignment = load_assignment(ctx.conn, &assignment_id)?;
    let class = load_class(ctx.conn, &assignment.class_id)?;
    access::can_write_class(p, &class.teacher_id)?;

    ctx.conn
        .execute(
            "UPDATE assignments SET status = 'archived' WHERE id = ?",
            [&assignment_id],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "assignments" })))?;
    ctx.cache.invalidate_class(&class.id);
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.create" => Some(with_ctx(state, req, assignments_create)),
        "assignments.list" => Some(with_ctx(state, req, assignments_list)),
        "assignments.archive" => Some(with_ctx(state, req, assignments_archive)),
        _ => None,
    }
}
