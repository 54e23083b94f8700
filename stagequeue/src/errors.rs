//! Error types for the stagequeue runner.
//!
//! Errors are split by where they originate: the queue broker, the
//! envelope codec, the task handler, and stage configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// The main error type for stagequeue operations.
#[derive(Debug, Error)]
pub enum StageQueueError {
    /// A queue broker call failed.
    #[error("{0}")]
    Broker(#[from] BrokerError),

    /// A message envelope could not be encoded or decoded.
    #[error("{0}")]
    Codec(#[from] CodecError),

    /// A task handler failed.
    #[error("{0}")]
    Task(#[from] TaskError),

    /// The stage configuration is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The runner was stopped.
    #[error("Stage cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StageQueueError {
    /// Returns the wrapped task error, if this is one.
    #[must_use]
    pub fn as_task_error(&self) -> Option<&TaskError> {
        match self {
            Self::Task(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if the runner was stopped.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}

/// Errors returned by a queue broker.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The named queue has not been created yet.
    #[error("Queue does not exist: {name}")]
    QueueDoesNotExist {
        /// The queue name.
        name: String,
    },

    /// A create call raced with another creator.
    #[error("Queue already exists: {name}")]
    QueueAlreadyExists {
        /// The queue name.
        name: String,
    },

    /// Any other broker or transport failure.
    #[error("Broker {operation} failed: {message}")]
    Transport {
        /// The broker operation (e.g. "receive").
        operation: String,
        /// The failure message.
        message: String,
    },
}

impl BrokerError {
    /// Creates a queue-does-not-exist error.
    #[must_use]
    pub fn does_not_exist(name: impl Into<String>) -> Self {
        Self::QueueDoesNotExist { name: name.into() }
    }

    /// Creates a queue-already-exists error.
    #[must_use]
    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::QueueAlreadyExists { name: name.into() }
    }

    /// Creates a transport error.
    #[must_use]
    pub fn transport(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns true if the queue has not been created yet.
    #[must_use]
    pub fn is_queue_does_not_exist(&self) -> bool {
        matches!(self, Self::QueueDoesNotExist { .. })
    }

    /// Returns true if a create call lost a race.
    #[must_use]
    pub fn is_queue_already_exists(&self) -> bool {
        matches!(self, Self::QueueAlreadyExists { .. })
    }

    /// Converts to a dictionary representation for event payloads.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        match self {
            Self::QueueDoesNotExist { name } => {
                map.insert("type".to_string(), serde_json::json!("QueueDoesNotExist"));
                map.insert("queue".to_string(), serde_json::json!(name));
            }
            Self::QueueAlreadyExists { name } => {
                map.insert("type".to_string(), serde_json::json!("QueueAlreadyExists"));
                map.insert("queue".to_string(), serde_json::json!(name));
            }
            Self::Transport { operation, .. } => {
                map.insert("type".to_string(), serde_json::json!("Transport"));
                map.insert("operation".to_string(), serde_json::json!(operation));
            }
        }
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Errors raised while encoding or decoding a message envelope.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// The body was not a valid envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(String),

    /// The envelope could not be serialized.
    #[error("Envelope serialization failed: {0}")]
    Serialize(String),
}

/// A failure produced by a task handler.
///
/// Cloning is cheap; the underlying error is shared.
#[derive(Debug, Clone, Error)]
#[error("Task failed: {inner}")]
pub struct TaskError {
    inner: Arc<anyhow::Error>,
}

impl TaskError {
    /// Wraps an error raised by a task handler.
    #[must_use]
    pub fn new(err: anyhow::Error) -> Self {
        Self {
            inner: Arc::new(err),
        }
    }

    /// Creates a task error from a message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(anyhow::anyhow!(message.into()))
    }

    /// Returns the wrapped error.
    #[must_use]
    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }

    /// Returns the innermost error message.
    #[must_use]
    pub fn root_cause(&self) -> String {
        self.inner.root_cause().to_string()
    }
}

/// Errors raised while loading or validating a stage configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A required field was empty or out of range.
    #[error("Invalid stage config field '{field}': {reason}")]
    InvalidField {
        /// The field name.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// A derived queue name is not accepted by the broker.
    #[error("Invalid queue name '{0}'")]
    InvalidQueueName(String),

    /// The config file could not be read or parsed.
    #[error("Failed to load stage config: {0}")]
    Load(String),
}

impl ConfigError {
    /// Creates an invalid-field error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = StageQueueError> = std::result::Result<T, E>;
