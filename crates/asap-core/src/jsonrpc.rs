//! JSON-RPC 2.0 framing for the HTTP binding.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::envelope::Envelope;
use crate::errors::AsapError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvelopeParams {
    pub envelope: Envelope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: EnvelopeParams,
    pub id: Value,
}

impl JsonRpcRequest {
    /// `method` carries the payload type, `id` the correlation id.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: envelope.payload_type().as_str().to_string(),
            params: EnvelopeParams {
                envelope: envelope.clone(),
            },
            id: Value::String(envelope.correlation_id().to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>, asap_error: Option<&str>) -> Self {
        Self {
            code,
            message: message.into(),
            data: asap_error.map(|code| json!({ "asap_error": code })),
        }
    }

    pub fn asap_error(&self) -> Option<&str> {
        self.data.as_ref()?.get("asap_error")?.as_str()
    }
}

impl From<&AsapError> for JsonRpcError {
    fn from(err: &AsapError) -> Self {
        Self {
            code: err.rpc_code(),
            message: err.to_string(),
            data: Some(err.rpc_data()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default)]
    pub id: Value,
}

impl JsonRpcResponse {
    pub fn success(id: Value, envelope: &Envelope) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(json!({ "envelope": envelope })),
            error: None,
            id,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Exactly one of `result` / `error` and the right protocol version.
    ///
    /// A well-formed error response still proves the channel is healthy.
    pub fn is_well_formed(&self) -> bool {
        self.jsonrpc == JSONRPC_VERSION && (self.result.is_some() != self.error.is_some())
    }

    pub fn envelope(&self) -> Option<Envelope> {
        let value = self.result.as_ref()?.get("envelope")?;
        serde_json::from_value(value.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::PayloadType;

    #[test]
    fn request_uses_payload_type_and_correlation_id() {
        let env = Envelope::builder("a", "b", PayloadType::StateQuery, json!({})).build();
        let req = JsonRpcRequest::from_envelope(&env);
        assert_eq!(req.method, "state.query");
        assert_eq!(req.id, Value::String(env.correlation_id().to_string()));
        assert_eq!(req.jsonrpc, "2.0");
    }

    #[test]
    fn well_formedness() {
        let env = Envelope::builder("a", "b", PayloadType::TaskResponse, json!({})).build();
        let ok = JsonRpcResponse::success(json!(1), &env);
        assert!(ok.is_well_formed());
        assert_eq!(ok.envelope().unwrap().id(), env.id());

        let err = JsonRpcResponse::failure(
            json!(1),
            JsonRpcError::new(INVALID_PARAMS, "bad", Some("asap:protocol/nonce_replayed")),
        );
        assert!(err.is_well_formed());
        assert_eq!(
            err.error.as_ref().unwrap().asap_error(),
            Some("asap:protocol/nonce_replayed")
        );

        let neither: JsonRpcResponse =
            serde_json::from_value(json!({ "jsonrpc": "2.0", "id": 1 })).unwrap();
        assert!(!neither.is_well_formed());

        let wrong_version: JsonRpcResponse =
            serde_json::from_value(json!({ "jsonrpc": "1.0", "result": {}, "id": 1 })).unwrap();
        assert!(!wrong_version.is_well_formed());
    }
}
