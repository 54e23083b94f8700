//! Mock task handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::TaskOutcome;
use crate::pool::TaskHandler;

/// A handler that always returns the same value.
#[derive(Debug)]
pub struct StaticHandler {
    name: String,
    output: Option<Value>,
    call_count: AtomicUsize,
}

impl StaticHandler {
    /// Creates a handler returning `output` for every input.
    #[must_use]
    pub fn new(name: impl Into<String>, output: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            output: Some(output.into()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Creates a handler returning [`TaskOutcome::Empty`] for every input.
    #[must_use]
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: None,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Returns the number of times the handler was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskHandler for StaticHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _input: Value) -> anyhow::Result<TaskOutcome> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .output
            .clone()
            .map_or(TaskOutcome::Empty, TaskOutcome::Value))
    }
}

/// A handler that always fails.
#[derive(Debug)]
pub struct FailingHandler {
    name: String,
    message: String,
}

impl FailingHandler {
    /// Creates a handler failing with `message`.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl TaskHandler for FailingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _input: Value) -> anyhow::Result<TaskOutcome> {
        Err(anyhow::anyhow!("{}", self.message))
    }
}

/// A handler that records its inputs and echoes them back.
#[derive(Debug)]
pub struct RecordingHandler {
    name: String,
    inputs: Mutex<Vec<Value>>,
}

impl RecordingHandler {
    /// Creates a recording handler.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Returns every input seen, in call order.
    #[must_use]
    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().clone()
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.inputs.lock().len()
    }

    /// Clears recorded inputs.
    pub fn reset(&self) {
        self.inputs.lock().clear();
    }
}

#[async_trait]
impl TaskHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, input: Value) -> anyhow::Result<TaskOutcome> {
        self.inputs.lock().push(input.clone());
        Ok(TaskOutcome::Value(input))
    }
}

/// A handler that sleeps before echoing its input.
#[derive(Debug)]
pub struct SlowHandler {
    name: String,
    delay: Duration,
}

impl SlowHandler {
    /// Creates a handler that waits `delay` per task.
    #[must_use]
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }
}

#[async_trait]
impl TaskHandler for SlowHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, input: Value) -> anyhow::Result<TaskOutcome> {
        tokio::time::sleep(self.delay).await;
        Ok(TaskOutcome::Value(input))
    }
}

/// A handler that returns scripted outcomes, one per call.
///
/// Once the script runs out every call returns [`TaskOutcome::Empty`].
#[derive(Debug)]
pub struct SequenceHandler {
    name: String,
    script: Mutex<VecDeque<anyhow::Result<TaskOutcome>>>,
}

impl SequenceHandler {
    /// Creates a handler replaying `script`.
    pub fn new(
        name: impl Into<String>,
        script: impl IntoIterator<Item = anyhow::Result<TaskOutcome>>,
    ) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(script.into_iter().collect()),
        }
    }

    /// Number of scripted outcomes not yet returned.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl TaskHandler for SequenceHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _input: Value) -> anyhow::Result<TaskOutcome> {
        let next = self.script.lock().pop_front();
        next.unwrap_or(Ok(TaskOutcome::Empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_static_handler() {
        let handler = StaticHandler::new("static", "ok");
        let outcome = handler.handle(json!(1)).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Value(v) if v == json!("ok")));
        assert_eq!(handler.call_count(), 1);

        let empty = StaticHandler::empty("nothing");
        assert!(empty.handle(Value::Null).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_handler() {
        let handler = FailingHandler::new("fail", "disk full");
        let err = handler.handle(Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "disk full");
    }

    #[tokio::test]
    async fn test_recording_handler() {
        let handler = RecordingHandler::new("rec");
        handler.handle(json!("a")).await.unwrap();
        handler.handle(json!("b")).await.unwrap();

        assert_eq!(handler.inputs(), vec![json!("a"), json!("b")]);
        handler.reset();
        assert_eq!(handler.call_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_handler_waits() {
        let handler = SlowHandler::new("slow", Duration::from_millis(10));
        let start = std::time::Instant::now();
        handler.handle(Value::Null).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_sequence_handler() {
        let handler = SequenceHandler::new(
            "seq",
            vec![Ok(TaskOutcome::value(1)), Err(anyhow::anyhow!("second"))],
        );

        assert!(matches!(handler.handle(Value::Null).await, Ok(TaskOutcome::Value(_))));
        assert!(handler.handle(Value::Null).await.is_err());
        assert_eq!(handler.remaining(), 0);
        assert!(handler.handle(Value::Null).await.unwrap().is_empty());
    }
}
