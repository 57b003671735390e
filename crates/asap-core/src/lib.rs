pub mod ack;
pub mod circuit;
pub mod client;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod jsonrpc;
pub mod replay;
pub mod retry;
pub mod task;
pub mod webhook;
pub mod ws;

pub use ack::{AckCoordinator, DeliveryOutcome, FrameSink};
pub use circuit::{CircuitBreaker, CircuitState};
pub use client::{HealthGate, HttpTransport, ResilientClient, Transport, TransportError};
pub use config::AsapConfig;
pub use envelope::{AckPayload, AckStatus, Envelope, EnvelopeBuilder, PayloadType};
pub use errors::{AsapError, AsapResult};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use replay::{InMemoryNonceStore, NonceStore, ReplayGuard};
pub use task::{transition, Task, TaskStatus, MAX_TASK_DEPTH};
pub use webhook::{WebhookManager, WebhookStatus};
pub use ws::WsClient;
