//! Wire envelopes carried by the durable queue.
//!
//! Request bodies are a closed, internally tagged enum keyed by `type`.
//! Decoding validates the tag first so an unknown tag is reported as such
//! instead of as a generic parse failure.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::consensus::ConsensusInput;
use crate::error::ErrorKind;

// ---------------------------------------------------------------------------
// Request envelope
// ---------------------------------------------------------------------------

/// A typed request body.
///
/// ```json
/// {"type": "workflow", "workflow_type": "linear", "payload": {"n": 1}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEnvelope {
    /// Run a registered workflow definition to completion.
    Workflow {
        workflow_type: String,
        /// Set when the instance was pre-created by `submit_workflow`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workflow_id: Option<Uuid>,
        #[serde(default)]
        payload: Value,
    },
    /// Run the adaptive consensus review over a set of targets.
    ConsensusReview(ConsensusInput),
    /// Liveness check; echoes its payload back.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        echo: Option<Value>,
    },
}

/// Discriminant of [`MessageEnvelope`], used as the handler registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Workflow,
    ConsensusReview,
    Ping,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [
        MessageKind::Workflow,
        MessageKind::ConsensusReview,
        MessageKind::Ping,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Workflow => "workflow",
            MessageKind::ConsensusReview => "consensus_review",
            MessageKind::Ping => "ping",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == tag)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons a queue body cannot be turned into a [`MessageEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    #[error("message body is not a JSON object")]
    NotAnObject,

    #[error("message body has no string 'type' field")]
    MissingType,

    #[error("unknown workflow type: '{0}'")]
    UnknownType(String),

    #[error("malformed '{kind}' message: {reason}")]
    Malformed { kind: MessageKind, reason: String },
}

impl EnvelopeError {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            EnvelopeError::UnknownType(_) | EnvelopeError::MissingType => {
                ErrorKind::UnknownMessageType
            }
            EnvelopeError::NotAnObject | EnvelopeError::Malformed { .. } => ErrorKind::StepError,
        }
    }
}

impl MessageEnvelope {
    /// Decode a queue body, rejecting unknown tags with a typed error.
    pub fn decode(body: &Value) -> Result<Self, EnvelopeError> {
        let obj = body.as_object().ok_or(EnvelopeError::NotAnObject)?;
        let tag = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingType)?;
        let kind =
            MessageKind::from_tag(tag).ok_or_else(|| EnvelopeError::UnknownType(tag.to_string()))?;

        serde_json::from_value(body.clone()).map_err(|e| EnvelopeError::Malformed {
            kind,
            reason: e.to_string(),
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageEnvelope::Workflow { .. } => MessageKind::Workflow,
            MessageEnvelope::ConsensusReview(_) => MessageKind::ConsensusReview,
            MessageEnvelope::Ping { .. } => MessageKind::Ping,
        }
    }

    /// Pre-created instance this envelope runs, if any.
    pub fn workflow_id(&self) -> Option<Uuid> {
        match self {
            MessageEnvelope::Workflow { workflow_id, .. } => *workflow_id,
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        // Serializing a derived enum of owned JSON-compatible fields cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Result envelope
// ---------------------------------------------------------------------------

/// Whether a processed message succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Error,
}

/// Structured outcome published to a results queue.
///
/// The handler's result map is merged at the top level; the reserved keys
/// below always win over handler keys of the same name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResultEnvelope {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    pub source_queue: String,
    pub source_message_id: i64,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_type: Option<ErrorKind>,
    #[serde(default)]
    pub recovery_suggested: Option<bool>,
    #[serde(flatten)]
    pub result: Map<String, Value>,
}

impl ResultEnvelope {
    pub fn success(
        source_queue: impl Into<String>,
        source_message_id: i64,
        workflow_id: Option<Uuid>,
        result: Map<String, Value>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            status: OutcomeStatus::Success,
            workflow_id,
            source_queue: source_queue.into(),
            source_message_id,
            execution_time_ms,
            timestamp: Utc::now(),
            error: None,
            error_type: None,
            recovery_suggested: None,
            result,
        }
    }

    pub fn failure(
        source_queue: impl Into<String>,
        source_message_id: i64,
        workflow_id: Option<Uuid>,
        kind: ErrorKind,
        error: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            status: OutcomeStatus::Error,
            workflow_id,
            source_queue: source_queue.into(),
            source_message_id,
            execution_time_ms,
            timestamp: Utc::now(),
            error: Some(error.into()),
            error_type: Some(kind),
            recovery_suggested: Some(kind.recovery_suggested()),
            result: Map::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }

    /// Render the wire form: handler keys first, reserved keys layered on top.
    pub fn to_value(&self) -> Value {
        let mut out = self.result.clone();
        out.insert(
            "status".into(),
            Value::String(
                match self.status {
                    OutcomeStatus::Success => "success",
                    OutcomeStatus::Error => "error",
                }
                .into(),
            ),
        );
        out.insert(
            "workflow_id".into(),
            self.workflow_id
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null),
        );
        out.insert("source_queue".into(), Value::String(self.source_queue.clone()));
        out.insert("source_message_id".into(), Value::from(self.source_message_id));
        out.insert("execution_time_ms".into(), Value::from(self.execution_time_ms));
        out.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        if let Some(error) = &self.error {
            out.insert("error".into(), Value::String(error.clone()));
        }
        if let Some(kind) = self.error_type {
            out.insert("error_type".into(), Value::String(kind.as_str().into()));
        }
        if let Some(recovery) = self.recovery_suggested {
            out.insert("recovery_suggested".into(), Value::Bool(recovery));
        }
        Value::Object(out)
    }
}
