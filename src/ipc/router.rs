use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: [TryHandle; 7] = [
    handlers::core::try_handle,
    handlers::users::try_handle,
    handlers::classes::try_handle,
    handlers::assignments::try_handle,
    handlers::grades::try_handle,
    handlers::attendance::try_handle,
    handlers::dashboard::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");
    for try_handle in FAMILIES {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
