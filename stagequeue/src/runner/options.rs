//! Per-run options.

use crate::core::Priority;
use crate::queues::PriorityFilter;

/// Options for [`StageRunner::process`](super::StageRunner::process) and
/// friends.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Priority attached to tasks a source stage submits.
    pub priority: Priority,
    /// Which input tiers to poll.
    pub filter: PriorityFilter,
}

impl RunOptions {
    /// Creates default options: priority 0, every tier polled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority for source-stage tasks.
    #[must_use]
    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Skips input tiers below `min`.
    #[must_use]
    pub const fn with_min_priority(mut self, min: usize) -> Self {
        self.filter.min = Some(min);
        self
    }

    /// Skips input tiers above `max`.
    #[must_use]
    pub const fn with_max_priority(mut self, max: usize) -> Self {
        self.filter.max = Some(max);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let options = RunOptions::new()
            .with_priority(2usize)
            .with_min_priority(1)
            .with_max_priority(3);

        assert_eq!(options.priority.resolve(&json!(null)), 2);
        assert_eq!(options.filter, PriorityFilter::new(Some(1), Some(3)));
    }

    #[test]
    fn test_defaults_poll_everything() {
        let options = RunOptions::default();
        assert_eq!(options.filter, PriorityFilter::all());
        assert!(!options.priority.is_dynamic());
    }
}
