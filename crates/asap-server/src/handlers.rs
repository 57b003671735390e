//! Payload handlers invoked after the replay guard admits an envelope.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use asap_core::envelope::{Envelope, PayloadType};
use asap_core::errors::{AsapError, AsapResult};
use asap_core::task::{Task, TaskStatus};

use crate::state::AppState;
use crate::tasks::TaskRecord;

#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    fn payload_type(&self) -> PayloadType;

    /// Handle `envelope` and produce the reply envelope.
    async fn handle(&self, state: &AppState, envelope: &Envelope) -> AsapResult<Envelope>;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<PayloadType, Arc<dyn EnvelopeHandler>>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn EnvelopeHandler>>) -> Self {
        let mut registry = Self::default();
        for handler in handlers {
            registry.register(handler);
        }
        registry
    }

    /// Task lifecycle, state query and messaging. `state.restore` has no
    /// default handler.
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Arc::new(TaskRequestHandler),
            Arc::new(TaskUpdateHandler),
            Arc::new(TaskCancelHandler),
            Arc::new(StateQueryHandler),
            Arc::new(MessageSendHandler),
        ])
    }

    pub fn register(&mut self, handler: Arc<dyn EnvelopeHandler>) {
        self.handlers.insert(handler.payload_type(), handler);
    }

    pub fn get(&self, payload_type: PayloadType) -> Option<Arc<dyn EnvelopeHandler>> {
        self.handlers.get(&payload_type).cloned()
    }

    pub async fn dispatch(&self, state: &AppState, envelope: &Envelope) -> AsapResult<Envelope> {
        let handler = self
            .get(envelope.payload_type())
            .ok_or_else(|| AsapError::HandlerNotFound(envelope.payload_type().to_string()))?;
        handler.handle(state, envelope).await
    }
}

fn required_str<'a>(payload: &'a Value, field: &str) -> AsapResult<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AsapError::InvalidPayload(format!("'{field}' is required")))
}

fn optional_str<'a>(payload: &'a Value, field: &str) -> Option<&'a str> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn task_reply(envelope: &Envelope, record: &TaskRecord) -> Envelope {
    envelope
        .reply(
            PayloadType::TaskResponse,
            json!({
                "task_id": record.task.id(),
                "status": record.task.status(),
                "task": record.task,
                "messages": record.messages.len(),
            }),
        )
        .build()
}

/// Queue a status webhook once a task with a callback reaches a terminal state.
async fn notify_terminal(state: &AppState, record: &TaskRecord) {
    if !record.task.is_terminal() {
        return;
    }
    let (Some(manager), Some(url)) = (state.webhooks(), record.webhook_url.as_deref()) else {
        return;
    };
    let payload = json!({
        "event": "task.status",
        "task_id": record.task.id(),
        "status": record.task.status(),
        "updated_at": record.task.updated_at(),
    });
    match manager.deliver(url, payload).await {
        Ok(job_id) => info!(task_id = %record.task.id(), job_id = %job_id, "status webhook queued"),
        Err(err) => warn!(task_id = %record.task.id(), error = %err, "status webhook not queued"),
    }
}

pub struct TaskRequestHandler;

#[async_trait]
impl EnvelopeHandler for TaskRequestHandler {
    fn payload_type(&self) -> PayloadType {
        PayloadType::TaskRequest
    }

    async fn handle(&self, state: &AppState, envelope: &Envelope) -> AsapResult<Envelope> {
        let payload = envelope.payload();

        let webhook_url = match optional_str(payload, "webhook_url") {
            Some(url) => {
                if let Some(manager) = state.webhooks() {
                    manager.validate_url(url).await?;
                }
                Some(url.to_string())
            }
            None => None,
        };

        let task = match optional_str(payload, "parent_task_id") {
            Some(parent_id) => state.tasks().get(parent_id)?.task.spawn_child()?,
            None => Task::new(),
        };
        let task_id = task.id().to_string();
        state.tasks().insert(task, webhook_url);
        let record = state.tasks().transition(&task_id, TaskStatus::Working)?;

        info!(
            task_id = %task_id,
            sender = %envelope.sender(),
            depth = record.task.depth(),
            "task accepted"
        );
        Ok(task_reply(envelope, &record))
    }
}

pub struct TaskUpdateHandler;

#[async_trait]
impl EnvelopeHandler for TaskUpdateHandler {
    fn payload_type(&self) -> PayloadType {
        PayloadType::TaskUpdate
    }

    async fn handle(&self, state: &AppState, envelope: &Envelope) -> AsapResult<Envelope> {
        let payload = envelope.payload();
        let task_id = required_str(payload, "task_id")?;
        let raw_status = required_str(payload, "status")?;
        let target = TaskStatus::parse(raw_status)
            .ok_or_else(|| AsapError::InvalidPayload(format!("unknown status '{raw_status}'")))?;

        let record = state.tasks().transition(task_id, target)?;
        info!(task_id, status = %target, "task updated");
        notify_terminal(state, &record).await;
        Ok(task_reply(envelope, &record))
    }
}

pub struct TaskCancelHandler;

#[async_trait]
impl EnvelopeHandler for TaskCancelHandler {
    fn payload_type(&self) -> PayloadType {
        PayloadType::TaskCancel
    }

    async fn handle(&self, state: &AppState, envelope: &Envelope) -> AsapResult<Envelope> {
        let payload = envelope.payload();
        let task_id = required_str(payload, "task_id")?;
        let record = state.tasks().transition(task_id, TaskStatus::Cancelled)?;
        info!(
            task_id,
            reason = optional_str(payload, "reason").unwrap_or("unspecified"),
            "task cancelled"
        );
        notify_terminal(state, &record).await;
        Ok(task_reply(envelope, &record))
    }
}

pub struct StateQueryHandler;

#[async_trait]
impl EnvelopeHandler for StateQueryHandler {
    fn payload_type(&self) -> PayloadType {
        PayloadType::StateQuery
    }

    async fn handle(&self, state: &AppState, envelope: &Envelope) -> AsapResult<Envelope> {
        let task_id = required_str(envelope.payload(), "task_id")?;
        let record = state.tasks().get(task_id)?;
        Ok(task_reply(envelope, &record))
    }
}

pub struct MessageSendHandler;

#[async_trait]
impl EnvelopeHandler for MessageSendHandler {
    fn payload_type(&self) -> PayloadType {
        PayloadType::MessageSend
    }

    async fn handle(&self, state: &AppState, envelope: &Envelope) -> AsapResult<Envelope> {
        let payload = envelope.payload();
        let task_id = required_str(payload, "task_id")?;
        let message = payload
            .get("message")
            .cloned()
            .ok_or_else(|| AsapError::InvalidPayload("'message' is required".to_string()))?;
        state.tasks().push_message(task_id, message)?;
        let record = state.tasks().get(task_id)?;
        Ok(task_reply(envelope, &record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asap_core::config::AsapConfig;

    fn state() -> AppState {
        AppState::new(AsapConfig::default(), None)
    }

    fn envelope(kind: PayloadType, payload: Value) -> Envelope {
        Envelope::builder("urn:test:client", "urn:test:server", kind, payload).build()
    }

    fn task_id(reply: &Envelope) -> String {
        reply.payload()["task_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn request_creates_working_task() {
        let state = state();
        let reply = state
            .process(&envelope(PayloadType::TaskRequest, json!({})))
            .await
            .unwrap();
        assert_eq!(reply.payload_type(), PayloadType::TaskResponse);
        assert_eq!(reply.payload()["status"], "working");
        assert_eq!(state.tasks().len(), 1);
    }

    #[tokio::test]
    async fn child_tasks_record_depth() {
        let state = state();
        let parent = state
            .process(&envelope(PayloadType::TaskRequest, json!({})))
            .await
            .unwrap();
        let child = state
            .process(&envelope(
                PayloadType::TaskRequest,
                json!({ "parent_task_id": task_id(&parent) }),
            ))
            .await
            .unwrap();
        assert_eq!(child.payload()["task"]["depth"], 1);
        assert_eq!(child.payload()["task"]["parent_id"], task_id(&parent));
    }

    #[tokio::test]
    async fn update_cancel_and_query() {
        let state = state();
        let created = state
            .process(&envelope(PayloadType::TaskRequest, json!({})))
            .await
            .unwrap();
        let id = task_id(&created);

        let paused = state
            .process(&envelope(
                PayloadType::TaskUpdate,
                json!({ "task_id": id, "status": "paused" }),
            ))
            .await
            .unwrap();
        assert_eq!(paused.payload()["status"], "paused");

        state
            .process(&envelope(PayloadType::TaskCancel, json!({ "task_id": id })))
            .await
            .unwrap();
        let queried = state
            .process(&envelope(PayloadType::StateQuery, json!({ "task_id": id })))
            .await
            .unwrap();
        assert_eq!(queried.payload()["status"], "cancelled");

        let err = state
            .process(&envelope(
                PayloadType::TaskUpdate,
                json!({ "task_id": id, "status": "working" }),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, AsapError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn bad_payloads() {
        let state = state();
        assert!(matches!(
            state
                .process(&envelope(PayloadType::TaskUpdate, json!({ "status": "working" })))
                .await,
            Err(AsapError::InvalidPayload(_))
        ));
        assert!(matches!(
            state
                .process(&envelope(
                    PayloadType::TaskUpdate,
                    json!({ "task_id": "x", "status": "exploded" })
                ))
                .await,
            Err(AsapError::InvalidPayload(_))
        ));
        assert!(matches!(
            state
                .process(&envelope(PayloadType::StateRestore, json!({})))
                .await,
            Err(AsapError::HandlerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn messages_accumulate() {
        let state = state();
        let id = task_id(
            &state
                .process(&envelope(PayloadType::TaskRequest, json!({})))
                .await
                .unwrap(),
        );
        let reply = state
            .process(&envelope(
                PayloadType::MessageSend,
                json!({ "task_id": id, "message": { "text": "more context" } }),
            ))
            .await
            .unwrap();
        assert_eq!(reply.payload()["messages"], 1);
    }
}
