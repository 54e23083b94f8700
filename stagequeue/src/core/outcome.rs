//! The result of running one task.

use crate::errors::TaskError;
use serde_json::Value;
use std::fmt;

/// A side effect to run after a task's output has been published.
pub type SideEffect = Box<dyn FnOnce() + Send + 'static>;

/// A task output paired with a side effect.
///
/// The side effect runs after the publish attempt, whether or not the
/// publish succeeded. It does not run if the output is not forwarded.
pub struct TaskCallback {
    value: Value,
    side_effect: SideEffect,
}

impl TaskCallback {
    /// Creates a callback result.
    pub fn new<F>(value: Value, side_effect: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            value,
            side_effect: Box::new(side_effect),
        }
    }

    /// Returns the value that will be forwarded.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Splits into the side effect and the forward value.
    #[must_use]
    pub fn into_parts(self) -> (SideEffect, Value) {
        (self.side_effect, self.value)
    }
}

impl fmt::Debug for TaskCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCallback")
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

/// What a task produced.
#[derive(Debug)]
pub enum TaskOutcome {
    /// An ordinary value, forwarded downstream.
    Value(Value),
    /// Explicitly nothing to forward.
    Empty,
    /// The task failed; never forwarded.
    Error(TaskError),
    /// A value plus a side effect to run after publishing.
    Callback(TaskCallback),
}

impl TaskOutcome {
    /// Creates a value outcome.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Creates an empty outcome.
    #[must_use]
    pub const fn empty() -> Self {
        Self::Empty
    }

    /// Creates an error outcome.
    #[must_use]
    pub fn error(err: anyhow::Error) -> Self {
        Self::Error(TaskError::new(err))
    }

    /// Creates a callback outcome.
    pub fn callback<F>(value: impl Into<Value>, side_effect: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::Callback(TaskCallback::new(value.into(), side_effect))
    }

    /// Returns true for the error variant.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Returns true for the empty variant.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Returns true when the outcome carries a `null` value.
    #[must_use]
    pub fn is_null(&self) -> bool {
        match self {
            Self::Value(v) => v.is_null(),
            Self::Callback(cb) => cb.value().is_null(),
            Self::Empty | Self::Error(_) => false,
        }
    }
}

impl From<Value> for TaskOutcome {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<TaskError> for TaskOutcome {
    fn from(err: TaskError) -> Self {
        Self::Error(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_outcome_variants() {
        assert!(TaskOutcome::empty().is_empty());
        assert!(TaskOutcome::error(anyhow::anyhow!("x")).is_error());
        assert!(TaskOutcome::Value(Value::Null).is_null());
        assert!(!TaskOutcome::value("ok").is_null());
    }

    #[test]
    fn test_callback_into_parts() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();

        let callback = TaskCallback::new(json!({"id": 7}), move || {
            ran_clone.store(true, Ordering::SeqCst);
        });
        assert_eq!(callback.value(), &json!({"id": 7}));

        let (side_effect, value) = callback.into_parts();
        assert_eq!(value, json!({"id": 7}));
        assert!(!ran.load(Ordering::SeqCst));

        side_effect();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_callback_debug_hides_closure() {
        let outcome = TaskOutcome::callback("v", || {});
        let debug = format!("{outcome:?}");
        assert!(debug.contains("TaskCallback"));
        assert!(debug.contains("\"v\""));
    }
}
