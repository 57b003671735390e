//! JSON-RPC 2.0 binding: `POST /asap` plus the health document.

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, warn};

use asap_core::envelope::{Envelope, PayloadType};
use asap_core::jsonrpc::{
    JsonRpcError, JsonRpcResponse, INVALID_PARAMS, INVALID_REQUEST, JSONRPC_VERSION,
    METHOD_NOT_FOUND, PARSE_ERROR,
};

use crate::state::AppState;

/// Protocol failures all travel in the body; the HTTP status is always 200.
fn rpc_reply(response: JsonRpcResponse) -> Response {
    (StatusCode::OK, Json(response)).into_response()
}

fn rpc_error(id: Value, code: i32, message: impl Into<String>) -> Response {
    rpc_reply(JsonRpcResponse::failure(
        id,
        JsonRpcError::new(code, message, None),
    ))
}

/// Parse the JSON-RPC frame, returning the request id alongside the envelope.
fn parse_request(body: &[u8]) -> Result<(Value, Envelope), Response> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| rpc_error(Value::Null, PARSE_ERROR, format!("parse error: {err}")))?;

    let Some(object) = value.as_object() else {
        return Err(rpc_error(
            Value::Null,
            INVALID_REQUEST,
            "request must be a JSON object",
        ));
    };
    let id = object.get("id").cloned().unwrap_or(Value::Null);

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(rpc_error(id, INVALID_REQUEST, "jsonrpc must be \"2.0\""));
    }
    let Some(method) = object.get("method").and_then(Value::as_str) else {
        return Err(rpc_error(id, INVALID_REQUEST, "method must be a string"));
    };
    let Ok(payload_type) = method.parse::<PayloadType>() else {
        return Err(rpc_error(
            id,
            METHOD_NOT_FOUND,
            format!("method '{method}' not found"),
        ));
    };

    let Some(raw_envelope) = object.get("params").and_then(|params| params.get("envelope"))
    else {
        return Err(rpc_error(id, INVALID_PARAMS, "params.envelope is required"));
    };
    let envelope: Envelope = serde_json::from_value(raw_envelope.clone())
        .map_err(|err| rpc_error(id.clone(), INVALID_PARAMS, format!("invalid envelope: {err}")))?;

    if envelope.payload_type() != payload_type {
        return Err(rpc_error(
            id,
            INVALID_PARAMS,
            format!(
                "method '{method}' does not match payload_type '{}'",
                envelope.payload_type()
            ),
        ));
    }
    Ok((id, envelope))
}

pub async fn handle_rpc(Extension(state): Extension<AppState>, body: Bytes) -> Response {
    let (id, envelope) = match parse_request(&body) {
        Ok(parsed) => parsed,
        Err(response) => return response,
    };

    match state.process(&envelope).await {
        Ok(reply) => {
            debug!(
                envelope_id = %envelope.id(),
                reply_id = %reply.id(),
                "rpc handled"
            );
            rpc_reply(JsonRpcResponse::success(id, &reply))
        }
        Err(err) => {
            warn!(
                envelope_id = %envelope.id(),
                code = err.code(),
                error = %err,
                "rpc failed"
            );
            rpc_reply(JsonRpcResponse::failure(id, JsonRpcError::from(&err)))
        }
    }
}

pub async fn health(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "identity": state.identity(),
        "transports": ["http", "websocket"],
        "tasks": state.tasks().len(),
        "time": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_has_null_id() {
        let response = parse_request(b"{not json").unwrap_err();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn method_must_match_payload_type() {
        let envelope = Envelope::builder("a", "b", PayloadType::TaskRequest, json!({})).build();
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "method": "task.cancel",
            "params": { "envelope": envelope },
            "id": 7,
        }))
        .unwrap();
        assert!(parse_request(&body).is_err());
    }

    #[test]
    fn well_formed_request_parses() {
        let envelope = Envelope::builder("a", "b", PayloadType::StateQuery, json!({})).build();
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "method": "state.query",
            "params": { "envelope": envelope },
            "id": "c-1",
        }))
        .unwrap();
        let Ok((id, parsed)) = parse_request(&body) else {
            panic!("request should parse");
        };
        assert_eq!(id, json!("c-1"));
        assert_eq!(parsed.id(), envelope.id());
    }
}
