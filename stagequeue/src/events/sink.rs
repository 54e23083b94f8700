//! Where runner events go.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::Level;

/// Receives named runner events with an optional JSON payload.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Delivers an event, possibly waiting on the destination.
    async fn emit(&self, name: &str, data: Option<Value>);

    /// Delivers an event from synchronous code.
    ///
    /// Implementations must not fail or block; the runner calls this while
    /// holding its completion lock.
    fn try_emit(&self, name: &str, data: Option<Value>);
}

/// Drops every event. The runner's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _name: &str, _data: Option<Value>) {}

    fn try_emit(&self, _name: &str, _data: Option<Value>) {}
}

/// Writes events as `tracing` records.
#[derive(Debug, Clone, Copy)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl LoggingEventSink {
    /// Logs at `level`. Only `DEBUG` is distinguished; anything else logs
    /// at `INFO`.
    #[must_use]
    pub const fn new(level: Level) -> Self {
        Self { level }
    }

    /// Logs at `DEBUG`.
    #[must_use]
    pub const fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn record(&self, name: &str, data: Option<&Value>) {
        let payload = data.map(Value::to_string).unwrap_or_default();
        if self.level == Level::DEBUG {
            tracing::debug!(event = %name, data = %payload, "stage event");
        } else {
            tracing::info!(event = %name, data = %payload, "stage event");
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, name: &str, data: Option<Value>) {
        self.record(name, data.as_ref());
    }

    fn try_emit(&self, name: &str, data: Option<Value>) {
        self.record(name, data.as_ref());
    }
}

/// Keeps every event in memory, for assertions.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    seen: RwLock<Vec<(String, Option<Value>)>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<Value>)> {
        self.seen.read().clone()
    }

    /// Number of events received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    /// Returns true if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.read().is_empty()
    }

    /// Events whose name starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<(String, Option<Value>)> {
        self.seen
            .read()
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Forgets everything received.
    pub fn clear(&self) {
        self.seen.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, name: &str, data: Option<Value>) {
        self.try_emit(name, data);
    }

    fn try_emit(&self, name: &str, data: Option<Value>) {
        self.seen.write().push((name.to_owned(), data));
    }
}
