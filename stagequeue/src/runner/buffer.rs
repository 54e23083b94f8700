//! Accumulated task results and the per-iteration drain.

use crate::errors::TaskError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use tracing::warn;

/// One finished task, as recorded by the completion handler.
#[derive(Debug)]
pub enum BufferedResult {
    /// The task produced a value (possibly null).
    Completed(Value),
    /// The task produced no output.
    Empty,
    /// The task failed.
    Failed(TaskError),
}

/// Results recorded since the last drain.
///
/// Appends come from worker completions and the drain comes from the
/// runner loop; both go through one lock so a drain never loses or
/// duplicates an entry.
#[derive(Debug, Default)]
pub struct ResultBuffer {
    entries: Mutex<Vec<BufferedResult>>,
}

impl ResultBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a result.
    pub fn push(&self, entry: BufferedResult) {
        self.entries.lock().push(entry);
    }

    /// Number of results waiting to be drained.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Takes every recorded result, leaving the buffer empty.
    pub fn drain(&self) -> Vec<BufferedResult> {
        std::mem::take(&mut *self.entries.lock())
    }
}

/// The outcome of one runner iteration.
///
/// Yields every successful value first, then at most one task error. A
/// failing task therefore never hides results that completed alongside
/// it. Further errors from the same drain are logged and counted.
#[derive(Debug, Default)]
pub struct DrainedResults {
    values: VecDeque<Value>,
    error: Option<TaskError>,
    suppressed_errors: usize,
}

impl DrainedResults {
    /// Builds the iteration result from raw buffer entries.
    ///
    /// Empty outcomes are skipped, as are nulls when `ignore_none` is set.
    #[must_use]
    pub fn from_entries(entries: Vec<BufferedResult>, ignore_none: bool) -> Self {
        let mut drained = Self::default();
        for entry in entries {
            match entry {
                BufferedResult::Completed(Value::Null) if ignore_none => {}
                BufferedResult::Completed(value) => drained.values.push_back(value),
                BufferedResult::Empty => {}
                BufferedResult::Failed(err) => {
                    if drained.error.is_none() {
                        drained.error = Some(err);
                    } else {
                        warn!(error = %err, "Additional task failure in the same iteration");
                        drained.suppressed_errors += 1;
                    }
                }
            }
        }
        drained
    }

    /// Number of values still to be yielded.
    #[must_use]
    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// The error that will be yielded after the values, if any.
    #[must_use]
    pub const fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    /// Task errors beyond the first one, which are only logged.
    #[must_use]
    pub const fn suppressed_errors(&self) -> usize {
        self.suppressed_errors
    }

    /// Returns true if nothing remains to be yielded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.error.is_none()
    }

    /// Splits into the values and the deferred error.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Value>, Option<TaskError>) {
        (self.values.into(), self.error)
    }
}

impl Iterator for DrainedResults {
    type Item = Result<Value, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(value) = self.values.pop_front() {
            return Some(Ok(value));
        }
        self.error.take().map(Err)
    }
}
