//! Queue broker contract and implementations.
//!
//! The runner talks to its broker only through [`QueueBroker`]. Two
//! implementations are provided:
//! - [`InMemoryBroker`] for tests and single-process pipelines
//! - `SqsBroker` (feature `sqs`) for AWS SQS and compatible services

mod memory;
#[cfg(feature = "sqs")]
mod sqs;

pub use memory::InMemoryBroker;
#[cfg(feature = "sqs")]
pub use sqs::SqsBroker;

use crate::errors::BrokerError;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/// A resolved queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    /// The queue name.
    pub name: String,
    /// The broker address of the queue.
    pub url: String,
}

impl QueueHandle {
    /// Creates a queue handle.
    #[must_use]
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Properties applied when creating a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAttributes {
    /// How long a received message stays hidden from other consumers.
    pub visibility_timeout: Duration,
    /// Whether the queue is an ordered (FIFO) queue.
    pub fifo: bool,
}

/// A message taken from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Handle used to delete the message.
    pub receipt_handle: String,
    /// The raw message body.
    pub body: String,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// The message body.
    pub body: String,
    /// Deduplication id, required by FIFO queues.
    pub deduplication_id: Option<String>,
    /// Message group id, required by FIFO queues.
    pub group_id: Option<String>,
}

impl SendRequest {
    /// Creates a plain send request.
    #[must_use]
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            deduplication_id: None,
            group_id: None,
        }
    }

    /// Attaches FIFO deduplication and group ids.
    #[must_use]
    pub fn with_fifo(mut self, deduplication_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        self.deduplication_id = Some(deduplication_id.into());
        self.group_id = Some(group_id.into());
        self
    }
}

/// Operations a queue broker must support.
///
/// `get_queue` must return [`BrokerError::QueueDoesNotExist`] for a
/// missing queue; every other failure is treated as fatal by the
/// provisioner.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Looks up an existing queue by name.
    async fn get_queue(&self, name: &str) -> Result<QueueHandle, BrokerError>;

    /// Creates a queue.
    async fn create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<QueueHandle, BrokerError>;

    /// Receives up to `max` messages.
    async fn receive(
        &self,
        queue: &QueueHandle,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, BrokerError>;

    /// Deletes a received message.
    async fn delete(&self, queue: &QueueHandle, receipt_handle: &str) -> Result<(), BrokerError>;

    /// Publishes a message.
    async fn send(&self, queue: &QueueHandle, request: SendRequest) -> Result<(), BrokerError>;
}
