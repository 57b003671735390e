//! Transport envelope shared by the HTTP and WebSocket bindings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::errors::{AsapError, AsapResult};

/// Extension key carrying the anti-replay nonce.
pub const NONCE_EXTENSION: &str = "nonce";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PayloadType {
    #[serde(rename = "task.request")]
    TaskRequest,
    #[serde(rename = "task.response")]
    TaskResponse,
    #[serde(rename = "task.update")]
    TaskUpdate,
    #[serde(rename = "task.cancel")]
    TaskCancel,
    #[serde(rename = "message.send")]
    MessageSend,
    #[serde(rename = "state.query")]
    StateQuery,
    #[serde(rename = "state.restore")]
    StateRestore,
    #[serde(rename = "artifact.notify")]
    ArtifactNotify,
    #[serde(rename = "ack")]
    Ack,
}

impl PayloadType {
    pub const ALL: [PayloadType; 9] = [
        PayloadType::TaskRequest,
        PayloadType::TaskResponse,
        PayloadType::TaskUpdate,
        PayloadType::TaskCancel,
        PayloadType::MessageSend,
        PayloadType::StateQuery,
        PayloadType::StateRestore,
        PayloadType::ArtifactNotify,
        PayloadType::Ack,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PayloadType::TaskRequest => "task.request",
            PayloadType::TaskResponse => "task.response",
            PayloadType::TaskUpdate => "task.update",
            PayloadType::TaskCancel => "task.cancel",
            PayloadType::MessageSend => "message.send",
            PayloadType::StateQuery => "state.query",
            PayloadType::StateRestore => "state.restore",
            PayloadType::ArtifactNotify => "artifact.notify",
            PayloadType::Ack => "ack",
        }
    }

    /// State-changing payloads need a selective acknowledgment on duplex transports.
    pub fn requires_ack(self) -> bool {
        matches!(
            self,
            PayloadType::TaskRequest
                | PayloadType::TaskCancel
                | PayloadType::StateRestore
                | PayloadType::MessageSend
        )
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadType {
    type Err = AsapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PayloadType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| AsapError::HandlerNotFound(s.to_string()))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Received,
    Processed,
    Rejected,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AckPayload {
    pub original_envelope_id: String,
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable protocol message. Retransmissions clone it and keep the same id.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    id: String,
    correlation_id: String,
    trace_id: String,
    sender: String,
    recipient: String,
    #[serde(with = "utc_timestamp")]
    timestamp: DateTime<Utc>,
    payload_type: PayloadType,
    payload: Value,
    #[serde(default)]
    requires_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    extensions: Option<Map<String, Value>>,
}

impl Envelope {
    pub fn builder(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload_type: PayloadType,
        payload: Value,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder {
            sender: sender.into(),
            recipient: recipient.into(),
            payload_type,
            payload,
            correlation_id: None,
            trace_id: None,
            timestamp: None,
            requires_ack: None,
            extensions: Map::new(),
        }
    }

    /// `task.cancel` for `task_id`, routed through the same ack-aware path as
    /// any other state-changing message.
    pub fn task_cancel(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        task_id: &str,
        reason: Option<&str>,
    ) -> Envelope {
        let mut payload = json!({ "task_id": task_id });
        if let Some(reason) = reason {
            payload["reason"] = Value::String(reason.to_string());
        }
        Envelope::builder(sender, recipient, PayloadType::TaskCancel, payload)
            .with_fresh_nonce()
            .build()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn requires_ack(&self) -> bool {
        self.requires_ack
    }

    pub fn extensions(&self) -> Option<&Map<String, Value>> {
        self.extensions.as_ref()
    }

    /// Raw nonce value; type checking is left to the replay guard.
    pub fn nonce(&self) -> Option<&Value> {
        self.extensions.as_ref()?.get(NONCE_EXTENSION)
    }

    /// Build a reply that keeps correlation and trace identifiers.
    pub fn reply(&self, payload_type: PayloadType, payload: Value) -> EnvelopeBuilder {
        Envelope::builder(
            self.recipient.clone(),
            self.sender.clone(),
            payload_type,
            payload,
        )
        .correlation_id(self.correlation_id.clone())
        .trace_id(self.trace_id.clone())
    }

    pub fn ack(&self, status: AckStatus, error: Option<String>) -> Envelope {
        let payload = AckPayload {
            original_envelope_id: self.id.clone(),
            status,
            error,
        };
        self.reply(
            PayloadType::Ack,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
        .build()
    }

    pub fn ack_payload(&self) -> AsapResult<AckPayload> {
        if self.payload_type != PayloadType::Ack {
            return Err(AsapError::InvalidPayload(format!(
                "expected ack payload, got {}",
                self.payload_type
            )));
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

pub struct EnvelopeBuilder {
    sender: String,
    recipient: String,
    payload_type: PayloadType,
    payload: Value,
    correlation_id: Option<String>,
    trace_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    requires_ack: Option<bool>,
    extensions: Map<String, Value>,
}

impl EnvelopeBuilder {
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn trace_id(mut self, id: impl Into<String>) -> Self {
        self.trace_id = Some(id.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Override the per-payload-type default.
    pub fn requires_ack(mut self, requires_ack: bool) -> Self {
        self.requires_ack = Some(requires_ack);
        self
    }

    pub fn nonce(self, nonce: impl Into<String>) -> Self {
        self.extension(NONCE_EXTENSION, Value::String(nonce.into()))
    }

    pub fn with_fresh_nonce(self) -> Self {
        self.nonce(Uuid::new_v4().to_string())
    }

    pub fn extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    pub fn build(self) -> Envelope {
        let id = Uuid::now_v7().to_string();
        Envelope {
            correlation_id: self.correlation_id.unwrap_or_else(|| id.clone()),
            trace_id: self
                .trace_id
                .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
            id,
            sender: self.sender,
            recipient: self.recipient,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            requires_ack: self
                .requires_ack
                .unwrap_or_else(|| self.payload_type.requires_ack()),
            payload_type: self.payload_type,
            payload: self.payload,
            extensions: if self.extensions.is_empty() {
                None
            } else {
                Some(self.extensions)
            },
        }
    }
}

/// RFC 3339 on the wire; timestamps without an offset are read as UTC.
mod utc_timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(D::Error::custom)
    }

    pub(super) fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        let trimmed = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(parsed.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
                return Ok(Utc.from_utc_datetime(&naive));
            }
        }
        Err(format!("invalid timestamp '{}'", raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request() -> Envelope {
        Envelope::builder(
            "agent:orchestrator",
            "agent:worker",
            PayloadType::TaskRequest,
            json!({ "skill_id": "summarize" }),
        )
        .with_fresh_nonce()
        .build()
    }

    #[test]
    fn state_changing_payloads_require_ack_by_default() {
        let acked: Vec<_> = PayloadType::ALL
            .into_iter()
            .filter(|kind| kind.requires_ack())
            .collect();
        assert_eq!(
            acked,
            vec![
                PayloadType::TaskRequest,
                PayloadType::TaskCancel,
                PayloadType::MessageSend,
                PayloadType::StateRestore,
            ]
        );

        let update = Envelope::builder("a", "b", PayloadType::TaskUpdate, json!({})).build();
        assert!(!update.requires_ack());
        assert!(request().requires_ack());
    }

    #[test]
    fn ids_are_time_ordered() {
        let first = request();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = request();
        assert!(first.id() < second.id());
        assert_eq!(first.correlation_id(), first.id());
    }

    #[test]
    fn reply_keeps_correlation_and_swaps_parties() {
        let req = request();
        let resp = req
            .reply(PayloadType::TaskResponse, json!({ "status": "working" }))
            .build();
        assert_eq!(resp.correlation_id(), req.correlation_id());
        assert_eq!(resp.trace_id(), req.trace_id());
        assert_eq!(resp.sender(), "agent:worker");
        assert_eq!(resp.recipient(), "agent:orchestrator");
        assert_ne!(resp.id(), req.id());
    }

    #[test]
    fn ack_references_original_id() {
        let req = request();
        let ack = req.ack(AckStatus::Processed, None);
        assert!(!ack.requires_ack());
        let payload = ack.ack_payload().unwrap();
        assert_eq!(payload.original_envelope_id, req.id());
        assert_eq!(payload.status, AckStatus::Processed);
        assert!(req.ack_payload().is_err());
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let mut value = serde_json::to_value(request()).unwrap();
        value["timestamp"] = json!("2025-03-01T12:00:00");
        let env: Envelope = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(
            env.timestamp(),
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
        );

        value["timestamp"] = json!("2025-03-01T14:00:00+02:00");
        let env: Envelope = serde_json::from_value(value).unwrap();
        assert_eq!(
            env.timestamp(),
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn cancel_carries_task_id_and_nonce() {
        let cancel = Envelope::task_cancel("a", "b", "task-9", Some("user abort"));
        assert_eq!(cancel.payload_type(), PayloadType::TaskCancel);
        assert!(cancel.requires_ack());
        assert_eq!(cancel.payload()["task_id"], "task-9");
        assert_eq!(cancel.payload()["reason"], "user abort");
        assert!(matches!(cancel.nonce(), Some(Value::String(_))));
    }

    #[test]
    fn payload_type_parses_method_names() {
        assert_eq!(
            "task.cancel".parse::<PayloadType>().unwrap(),
            PayloadType::TaskCancel
        );
        assert!("task.explode".parse::<PayloadType>().is_err());
    }
}
