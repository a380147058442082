use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Handler = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

/// Each handler claims the methods it knows; first match answers.
const HANDLERS: &[Handler] = &[
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::roster::try_handle,
    handlers::exams::try_handle,
    handlers::marks::try_handle,
    handlers::results::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for handler in HANDLERS {
        if let Some(resp) = handler(state, &req) {
            return resp;
        }
    }

    tracing::debug!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        Some(serde_json::json!({ "method": req.method })),
    )
}
