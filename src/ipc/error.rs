use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

pub fn ok(id: &str, result: Value) -> Value {
    json!({ "id": id, "ok": true, "result": result })
}

pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    let body = ErrorBody {
        code,
        message: message.into(),
        details,
    };
    json!({ "id": id, "ok": false, "error": body })
}

/// Batch rejection pointing at the offending element; nothing in the batch is written.
pub fn rejected_item(id: &str, message: impl Into<String>, index: usize) -> Value {
    err(id, "bad_params", message, Some(json!({ "index": index })))
}

/// Reply for a line that did not parse; there is no request id to echo.
pub fn bad_json(e: &serde_json::Error) -> Value {
    let body = ErrorBody {
        code: "bad_json",
        message: e.to_string(),
        details: Some(json!({ "line": e.line(), "column": e.column() })),
    };
    json!({ "ok": false, "error": body })
}
