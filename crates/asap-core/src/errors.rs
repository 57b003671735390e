//! # ASAP Error Types
//!
//! Every failure the runtime can surface maps to one [`AsapError`] variant.
//! Each variant carries a stable machine-readable code (`asap:*`), a
//! JSON-RPC error code for the HTTP binding and a retry classification.
//!
//! ## Error Categories
//!
//! - **Validation**: state machine violations, replay-guard rejections and
//!   webhook URL rejections. Detected before any side effect, never retried.
//! - **Transport**: transient connection or timeout failures (retried locally)
//!   and the terminal errors raised once the retry budget is spent.
//! - **Delivery**: acknowledgment and webhook budgets exhausted.

use serde_json::{json, Value};
use thiserror::Error;

use crate::jsonrpc::{INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND};
use crate::task::TaskStatus;

/// Result type for all runtime operations.
pub type AsapResult<T> = Result<T, AsapError>;

#[derive(Debug, Error)]
pub enum AsapError {
    /// The requested status is not a successor of the current one.
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("delegation depth {depth} exceeds limit of {max}")]
    DelegationDepthExceeded { depth: u32, max: u32 },

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("envelope {envelope_id} expired: age {age_secs}s exceeds {max_age_secs}s")]
    ExpiredEnvelope {
        envelope_id: String,
        age_secs: i64,
        max_age_secs: u64,
    },

    #[error(
        "envelope {envelope_id} is {ahead_secs}s in the future (tolerance {tolerance_secs}s)"
    )]
    FutureEnvelope {
        envelope_id: String,
        ahead_secs: i64,
        tolerance_secs: u64,
    },

    #[error("nonce '{nonce}' on envelope {envelope_id} was already used")]
    ReplayedNonce { envelope_id: String, nonce: String },

    #[error("invalid nonce on envelope {envelope_id}: {reason}")]
    InvalidNonce { envelope_id: String, reason: String },

    /// A single attempt failed with a connection error or timeout.
    #[error("transient transport failure for {envelope_id}: {cause}")]
    TransientTransport { envelope_id: String, cause: String },

    #[error("delivery of {envelope_id} failed after {attempts} attempts: {cause}")]
    TransportExhausted {
        envelope_id: String,
        attempts: u32,
        cause: String,
    },

    #[error("circuit '{target}' is open, retry in {retry_in_ms}ms")]
    CircuitOpen { target: String, retry_in_ms: u64 },

    #[error("endpoint {target} reported unhealthy")]
    EndpointUnhealthy { target: String },

    #[error("remote returned HTTP {status} for {envelope_id}: {body}")]
    RemoteStatus {
        envelope_id: String,
        status: u16,
        body: String,
    },

    #[error("invalid response for {envelope_id}: {reason}")]
    InvalidResponse { envelope_id: String, reason: String },

    #[error("no acknowledgment for {envelope_id} after {attempts} attempts")]
    AckTimeoutExceeded { envelope_id: String, attempts: u32 },

    #[error("envelope {envelope_id} is already awaiting acknowledgment")]
    DuplicatePending { envelope_id: String },

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("invalid webhook url '{url}': {reason}")]
    WebhookValidation { url: String, reason: String },

    #[error("webhook {job_id} to {url} exhausted after {attempts} attempts: {last_error}")]
    WebhookDeliveryExhausted {
        job_id: String,
        url: String,
        attempts: u32,
        last_error: String,
    },

    #[error("no handler registered for '{0}'")]
    HandlerNotFound(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AsapError {
    /// Stable domain code carried in `data.asap_error` on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            AsapError::InvalidTransition { .. } => "asap:task/invalid_transition",
            AsapError::DelegationDepthExceeded { .. } => "asap:task/depth_exceeded",
            AsapError::TaskNotFound(_) => "asap:task/not_found",
            AsapError::ExpiredEnvelope { .. } => "asap:protocol/envelope_expired",
            AsapError::FutureEnvelope { .. } => "asap:protocol/envelope_future",
            AsapError::ReplayedNonce { .. } => "asap:protocol/nonce_replayed",
            AsapError::InvalidNonce { .. } => "asap:protocol/nonce_invalid",
            AsapError::TransientTransport { .. } => "asap:transport/transient",
            AsapError::TransportExhausted { .. } => "asap:transport/exhausted",
            AsapError::CircuitOpen { .. } => "asap:transport/circuit_open",
            AsapError::EndpointUnhealthy { .. } => "asap:transport/unhealthy",
            AsapError::RemoteStatus { .. } => "asap:transport/remote_status",
            AsapError::InvalidResponse { .. } => "asap:transport/invalid_response",
            AsapError::AckTimeoutExceeded { .. } => "asap:delivery/ack_timeout",
            AsapError::DuplicatePending { .. } => "asap:delivery/duplicate_pending",
            AsapError::ChannelClosed(_) => "asap:delivery/channel_closed",
            AsapError::WebhookValidation { .. } => "asap:webhook/invalid_url",
            AsapError::WebhookDeliveryExhausted { .. } => "asap:webhook/exhausted",
            AsapError::HandlerNotFound(_) => "asap:protocol/handler_not_found",
            AsapError::InvalidPayload(_) => "asap:protocol/invalid_payload",
            AsapError::Config(_) => "asap:config/invalid",
            AsapError::Serialization(_) => "asap:protocol/serialization",
            AsapError::Internal(_) => "asap:internal",
        }
    }

    /// JSON-RPC error code used by the HTTP binding.
    pub fn rpc_code(&self) -> i32 {
        match self {
            AsapError::HandlerNotFound(_) => METHOD_NOT_FOUND,
            AsapError::Serialization(_) => INVALID_REQUEST,
            AsapError::InvalidTransition { .. }
            | AsapError::DelegationDepthExceeded { .. }
            | AsapError::TaskNotFound(_)
            | AsapError::ExpiredEnvelope { .. }
            | AsapError::FutureEnvelope { .. }
            | AsapError::ReplayedNonce { .. }
            | AsapError::InvalidNonce { .. }
            | AsapError::InvalidPayload(_)
            | AsapError::WebhookValidation { .. } => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        }
    }

    /// Only single-attempt transport failures may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AsapError::TransientTransport { .. })
    }

    /// Structured `data` object for JSON-RPC error responses.
    pub fn rpc_data(&self) -> Value {
        let mut data = json!({ "asap_error": self.code() });
        let details = match self {
            AsapError::InvalidTransition { task_id, from, to } => {
                json!({ "task_id": task_id, "from": from, "to": to })
            }
            AsapError::ExpiredEnvelope {
                envelope_id,
                age_secs,
                max_age_secs,
            } => json!({
                "envelope_id": envelope_id,
                "age_secs": age_secs,
                "max_age_secs": max_age_secs,
            }),
            AsapError::FutureEnvelope {
                envelope_id,
                ahead_secs,
                tolerance_secs,
            } => json!({
                "envelope_id": envelope_id,
                "ahead_secs": ahead_secs,
                "tolerance_secs": tolerance_secs,
            }),
            AsapError::ReplayedNonce { envelope_id, .. }
            | AsapError::InvalidNonce { envelope_id, .. } => {
                json!({ "envelope_id": envelope_id })
            }
            AsapError::TaskNotFound(task_id) => json!({ "task_id": task_id }),
            _ => Value::Null,
        };
        if !details.is_null() {
            data["details"] = details;
        }
        data
    }
}

impl From<toml::de::Error> for AsapError {
    fn from(err: toml::de::Error) -> Self {
        AsapError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_map_to_invalid_params() {
        let err = AsapError::InvalidTransition {
            task_id: "t-1".into(),
            from: TaskStatus::Completed,
            to: TaskStatus::Working,
        };
        assert_eq!(err.rpc_code(), INVALID_PARAMS);
        assert_eq!(err.code(), "asap:task/invalid_transition");
        assert!(!err.is_retryable());

        let data = err.rpc_data();
        assert_eq!(data["asap_error"], "asap:task/invalid_transition");
        assert_eq!(data["details"]["from"], "completed");
        assert_eq!(data["details"]["to"], "working");
    }

    #[test]
    fn only_transient_transport_is_retryable() {
        let transient = AsapError::TransientTransport {
            envelope_id: "e".into(),
            cause: "connection refused".into(),
        };
        let exhausted = AsapError::TransportExhausted {
            envelope_id: "e".into(),
            attempts: 4,
            cause: "connection refused".into(),
        };
        assert!(transient.is_retryable());
        assert!(!exhausted.is_retryable());
        assert_eq!(exhausted.rpc_code(), INTERNAL_ERROR);
    }

    #[test]
    fn handler_not_found_is_method_not_found() {
        let err = AsapError::HandlerNotFound("state.restore".into());
        assert_eq!(err.rpc_code(), METHOD_NOT_FOUND);
        assert_eq!(err.rpc_data()["asap_error"], "asap:protocol/handler_not_found");
    }
}
