use crate::access::{self, Principal, Role};
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_required_str, load_user, with_ctx, ATTENDANCE_WINDOW_KEY};
use crate::ipc::types::{AppState, Ctx, Request};
use serde_json::json;
use std::path::{Path, PathBuf};

/// Opens (or creates) the workspace database and resets per-workspace state.
pub fn select_workspace(state: &mut AppState, path: &Path) -> anyhow::Result<()> {
    let conn = db::open_db(path)?;
    state.workspace = Some(path.to_path_buf());
    state.db = Some(conn);
    state.session = None;
    state.cache.clear();
    tracing::info!(workspace = %path.display(), "workspace selected");
    Ok(())
}

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "session": state.session,
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match select_workspace(state, &path) {
        Ok(()) => ok(&req.id, json!({ "workspacePath": path.to_string_lossy() })),
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_session_begin(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let user = match get_required_str(&req.params, "userId").and_then(|id| load_user(conn, &id)) {
        Ok(u) => u,
        Err(e) => return e.response(&req.id),
    };
    tracing::info!(user_id = %user.id, role = %user.role, "session started");
    state.session = Some(Principal {
        user_id: user.id.clone(),
        role: user.role,
    });
    ok(
        &req.id,
        json!({
            "userId": user.id,
            "name": user.name,
            "role": user.role,
        }),
    )
}

fn handle_session_end(state: &mut AppState, req: &Request) -> serde_json::Value {
    let ended = state.session.take().is_some();
    ok(&req.id, json!({ "ended": ended }))
}

fn settings_get(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_session(ctx.session)?;
    let key = get_required_str(params, "key")?;
    let value = db::settings_get_json(ctx.conn, &key)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "key": key, "value": value }))
}

fn settings_set(ctx: &mut Ctx<'_>, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    access::require_role(ctx.session, Role::Admin)?;
    let key = get_required_str(params, "key")?;
    let Some(value) = params.get("value") else {
        return Err(HandlerErr::bad_params("missing value"));
    };
    if key == ATTENDANCE_WINDOW_KEY && value.as_u64().filter(|n| *n > 0).is_none() {
        return Err(HandlerErr::bad_params(format!(
            "{} must be a positive integer",
            ATTENDANCE_WINDOW_KEY
        )));
    }
    db::settings_set_json(ctx.conn, &key, value)
        .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "settings" })))?;
    Ok(json!({ "key": key, "value": value }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "session.begin" => Some(handle_session_begin(state, req)),
        "session.end" => Some(handle_session_end(state, req)),
        "settings.get" => Some(with_ctx(state, req, settings_get)),
        "settings.set" => Some(with_ctx(state, req, settings_set)),
        _ => None,
    }
}
