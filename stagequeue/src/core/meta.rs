//! Task metadata carried alongside every value.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Function deciding a priority tier from a task's output.
pub type PriorityFn = Arc<dyn Fn(&Value) -> usize + Send + Sync>;

/// The priority tier a task's output is published to.
///
/// Tier 0 is the highest priority. A `Dynamic` priority is resolved
/// against the task output exactly once, when the output is forwarded.
#[derive(Clone)]
pub enum Priority {
    /// A concrete tier index.
    Fixed(usize),
    /// A tier computed from the task output.
    Dynamic(PriorityFn),
}

impl Priority {
    /// Creates a fixed priority.
    #[must_use]
    pub const fn fixed(tier: usize) -> Self {
        Self::Fixed(tier)
    }

    /// Creates a priority computed from the task output.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&Value) -> usize + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    /// Resolves the tier for the given output.
    #[must_use]
    pub fn resolve(&self, output: &Value) -> usize {
        match self {
            Self::Fixed(tier) => *tier,
            Self::Dynamic(f) => f(output),
        }
    }

    /// Returns true if the tier is computed from the output.
    #[must_use]
    pub const fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Fixed(0)
    }
}

impl From<usize> for Priority {
    fn from(tier: usize) -> Self {
        Self::Fixed(tier)
    }
}

impl fmt::Debug for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(tier) => f.debug_tuple("Fixed").field(tier).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

/// Metadata submitted with a task to the worker pool.
#[derive(Debug, Clone, Default)]
pub struct TaskMeta {
    /// Priority tier for the forwarded output.
    pub priority: Priority,
    /// Any other metadata, passed through between stages untouched.
    pub attributes: Map<String, Value>,
}

impl TaskMeta {
    /// Creates metadata with the given priority.
    #[must_use]
    pub fn new(priority: impl Into<Priority>) -> Self {
        Self {
            priority: priority.into(),
            attributes: Map::new(),
        }
    }

    /// Adds a pass-through attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Resolves the priority against `output`, producing wire metadata.
    #[must_use]
    pub fn resolve(&self, output: &Value) -> ResolvedMeta {
        ResolvedMeta {
            priority: self.priority.resolve(output),
            attributes: self.attributes.clone(),
        }
    }
}

/// Metadata with a concrete priority, as serialized on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMeta {
    /// Zero-based priority tier.
    pub priority: usize,
    /// Pass-through attributes.
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl ResolvedMeta {
    /// Creates resolved metadata with no extra attributes.
    #[must_use]
    pub fn new(priority: usize) -> Self {
        Self {
            priority,
            attributes: Map::new(),
        }
    }
}

impl From<ResolvedMeta> for TaskMeta {
    fn from(meta: ResolvedMeta) -> Self {
        Self {
            priority: Priority::Fixed(meta.priority),
            attributes: meta.attributes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fixed_priority_ignores_output() {
        let priority = Priority::fixed(2);
        assert_eq!(priority.resolve(&json!("anything")), 2);
        assert!(!priority.is_dynamic());
    }

    #[test]
    fn test_dynamic_priority_uses_output() {
        let priority = Priority::dynamic(|v| usize::from(v.get("urgent") == Some(&json!(false))));

        assert_eq!(priority.resolve(&json!({"urgent": true})), 0);
        assert_eq!(priority.resolve(&json!({"urgent": false})), 1);
        assert_eq!(format!("{priority:?}"), "Dynamic(<fn>)");
    }

    #[test]
    fn test_resolve_keeps_attributes() {
        let meta = TaskMeta::new(Priority::dynamic(|_| 3))
            .with_attribute("trace", json!("abc"));

        let resolved = meta.resolve(&Value::Null);
        assert_eq!(resolved.priority, 3);
        assert_eq!(resolved.attributes.get("trace"), Some(&json!("abc")));
    }

    #[test]
    fn test_resolved_meta_wire_shape() {
        let mut resolved = ResolvedMeta::new(1);
        resolved.attributes.insert("source".to_string(), json!("s3"));

        let wire = serde_json::to_value(&resolved).unwrap();
        assert_eq!(wire, json!({"priority": 1, "source": "s3"}));
    }
}
