//! Message handler port and the registry the consumer dispatches through.
//!
//! Same blanket-impl pattern as the step worker port:
//! 1. `MessageHandler` uses RPITIT for its async method
//! 2. `MessageHandlerDyn` is the object-safe variant with boxed futures
//! 3. `BoxMessageHandler` wraps `Arc<dyn MessageHandlerDyn>` for sharing across tasks

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use conduit_types::envelope::{MessageEnvelope, MessageKind};
use conduit_types::error::ErrorKind;
use conduit_types::queue::QueueMessage;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// What a handler produced for one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    pub workflow_id: Option<Uuid>,
    /// Merged into the top level of the published result envelope.
    pub result: Map<String, Value>,
}

impl HandlerOutput {
    pub fn new(result: Map<String, Value>) -> Self {
        Self {
            workflow_id: None,
            result,
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }
}

/// A handled failure. Becomes an error outcome on the results queue,
/// unless `deferred`: then the message keeps its claim and is redelivered
/// once the visibility timeout lapses, with no outcome published.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
    pub workflow_id: Option<Uuid>,
    pub deferred: bool,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            workflow_id: None,
            deferred: false,
        }
    }

    /// The work is held elsewhere right now; try the message again later.
    pub fn deferred(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            deferred: true,
            ..Self::new(kind, message)
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }
}

/// Handles one decoded message.
pub trait MessageHandler: Send + Sync {
    fn handle(
        &self,
        message: &QueueMessage,
        envelope: MessageEnvelope,
    ) -> impl Future<Output = Result<HandlerOutput, HandlerError>> + Send;
}

/// Object-safe version of [`MessageHandler`] with boxed futures.
pub trait MessageHandlerDyn: Send + Sync {
    fn handle_boxed<'a>(
        &'a self,
        message: &'a QueueMessage,
        envelope: MessageEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'a>>;
}

impl<T: MessageHandler> MessageHandlerDyn for T {
    fn handle_boxed<'a>(
        &'a self,
        message: &'a QueueMessage,
        envelope: MessageEnvelope,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'a>> {
        Box::pin(self.handle(message, envelope))
    }
}

#[derive(Clone)]
pub struct BoxMessageHandler {
    inner: Arc<dyn MessageHandlerDyn>,
}

impl BoxMessageHandler {
    pub fn new<T: MessageHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn handle(
        &self,
        message: &QueueMessage,
        envelope: MessageEnvelope,
    ) -> Result<HandlerOutput, HandlerError> {
        self.inner.handle_boxed(message, envelope).await
    }
}

impl std::fmt::Debug for BoxMessageHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BoxMessageHandler")
    }
}

/// Envelope kind to handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, BoxMessageHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with only the built-in `ping` handler.
    pub fn with_ping() -> Self {
        Self::new().register(MessageKind::Ping, BoxMessageHandler::new(PingHandler))
    }

    pub fn register(mut self, kind: MessageKind, handler: BoxMessageHandler) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: MessageKind) -> Option<&BoxMessageHandler> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<MessageKind> {
        MessageKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }
}

/// Liveness check: answers `pong` and echoes the payload back.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingHandler;

impl MessageHandler for PingHandler {
    async fn handle(
        &self,
        message: &QueueMessage,
        envelope: MessageEnvelope,
    ) -> Result<HandlerOutput, HandlerError> {
        let kind = envelope.kind();
        let MessageEnvelope::Ping { echo } = envelope else {
            return Err(HandlerError::new(
                ErrorKind::UnknownMessageType,
                format!("ping handler cannot handle '{kind}'"),
            ));
        };

        let mut result = Map::new();
        result.insert("pong".into(), Value::Bool(true));
        result.insert("read_count".into(), Value::from(message.read_count));
        if let Some(echo) = echo {
            result.insert("echo".into(), echo);
        }
        Ok(HandlerOutput::new(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn message(body: Value) -> QueueMessage {
        QueueMessage {
            queue_name: "q".into(),
            message_id: 1,
            enqueued_at: Utc::now(),
            visible_at: Utc::now(),
            read_count: 1,
            body,
        }
    }

    #[tokio::test]
    async fn ping_echoes() {
        let registry = HandlerRegistry::with_ping();
        let handler = registry.get(MessageKind::Ping).unwrap();
        let out = handler
            .handle(
                &message(json!({})),
                MessageEnvelope::Ping {
                    echo: Some(json!({"hello": "world"})),
                },
            )
            .await
            .unwrap();
        assert_eq!(out.result["pong"], true);
        assert_eq!(out.result["echo"]["hello"], "world");
        assert!(out.workflow_id.is_none());
    }

    #[tokio::test]
    async fn ping_rejects_other_envelopes() {
        let err = PingHandler
            .handle(
                &message(json!({})),
                MessageEnvelope::Workflow {
                    workflow_type: "x".into(),
                    workflow_id: None,
                    payload: json!({}),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownMessageType);
    }

    #[test]
    fn registry_lists_registered_kinds_in_order() {
        let registry = HandlerRegistry::with_ping();
        assert_eq!(registry.kinds(), vec![MessageKind::Ping]);
        assert!(registry.get(MessageKind::Workflow).is_none());
    }
}
