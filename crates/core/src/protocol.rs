//! JSON-RPC 2.0 wire protocol helpers.
//!
//! Every frame on a client or worker socket is a JSON-RPC 2.0 text
//! message. Frames are built as strings here so both the serving side
//! (axum) and the dialing side (tungstenite) can send them unchanged.
//!
//! The error codes are part of the public wire contract and must not
//! be renumbered.

use serde_json::{json, Value};

/// The inbound frame could not be parsed as JSON.
pub const ERROR_JSON_PARSE: i64 = 1;
/// Lost child output, duplicate request id, dead worker, CSRF anomaly.
pub const ERROR_INTERNAL: i64 = 2;
/// Identity-provider failure, or no slot/worker serves the requested
/// engraver version.
pub const ERROR_GITHUB: i64 = 3;
/// Shares a code with [`ERROR_GITHUB`] on the wire.
pub const ERROR_INVALID_VERSION: i64 = 3;

/// A leniently-parsed inbound frame.
///
/// Clients are not trusted to send well-formed JSON-RPC; missing
/// fields default rather than fail so the handler can decide how to
/// answer.
#[derive(Debug)]
pub struct Frame {
    pub id: Value,
    pub method: String,
    pub params: Value,
}

impl Frame {
    /// Parse a text frame. `Err` carries the serde message used in the
    /// code-1 error reply.
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        Ok(Self {
            id: value.get("id").cloned().unwrap_or(Value::Null),
            method: value
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            params: value.get("params").cloned().unwrap_or(Value::Null),
        })
    }

    /// The id as a correlation key. Non-string ids map to the empty
    /// string, which never collides with an in-flight request.
    pub fn id_key(&self) -> &str {
        self.id.as_str().unwrap_or_default()
    }

    /// A string field of `params`, or `""` when absent.
    pub fn param_str(&self, key: &str) -> &str {
        self.params.get(key).and_then(Value::as_str).unwrap_or_default()
    }
}

/// Successful response frame.
pub fn result_frame(id: &Value, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

/// Error response frame with a coded error object.
pub fn error_frame(id: &Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
    .to_string()
}

/// Request (or notification, with a null id) frame.
pub fn request_frame(id: &Value, method: &str, params: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string()
}

/// The one reply that is deliberately *not* JSON-RPC: malformed render
/// parameters get this bare object for compatibility with existing
/// clients.
pub fn invalid_request_frame() -> String {
    json!({ "error": "Invalid request.", "errorSlug": "invalid_request" }).to_string()
}
