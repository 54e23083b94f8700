//! The `{meta, value}` envelope exchanged between stages.

use super::{ResolvedMeta, TaskMeta};
use crate::errors::CodecError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The wire unit published to and received from a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Metadata with a resolved priority.
    pub meta: ResolvedMeta,
    /// The task payload.
    #[serde(default)]
    pub value: Value,
}

impl Envelope {
    /// Creates an envelope.
    #[must_use]
    pub fn new(meta: ResolvedMeta, value: Value) -> Self {
        Self { meta, value }
    }

    /// Serializes to a message body.
    pub fn encode(&self) -> Result<String, CodecError> {
        serde_json::to_string(self).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    /// Parses a message body.
    pub fn decode(body: &str) -> Result<Self, CodecError> {
        serde_json::from_str(body).map_err(|e| CodecError::Malformed(e.to_string()))
    }

    /// Splits into task metadata and value, ready for dispatch.
    #[must_use]
    pub fn into_task(self) -> (TaskMeta, Value) {
        (self.meta.into(), self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Priority;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_encode_decode_preserves_meta_and_value() {
        let mut meta = ResolvedMeta::new(2);
        meta.attributes.insert("batch".to_string(), json!({"id": 9, "tags": ["a", "b"]}));
        let value = json!([1, "two", {"three": null}]);

        let body = Envelope::new(meta.clone(), value.clone()).encode().unwrap();
        let decoded = Envelope::decode(&body).unwrap();

        assert_eq!(decoded.meta, meta);
        assert_eq!(decoded.value, value);
    }

    #[test]
    fn test_body_shape() {
        let body = Envelope::new(ResolvedMeta::new(0), json!("ok")).encode().unwrap();
        let parsed: Value = serde_json::from_str(&body).unwrap();

        assert_eq!(parsed, json!({"meta": {"priority": 0}, "value": "ok"}));
    }

    #[test]
    fn test_decode_missing_value_is_null() {
        let envelope = Envelope::decode(r#"{"meta": {"priority": 1}}"#).unwrap();
        assert_eq!(envelope.value, Value::Null);
    }

    #[test]
    fn test_decode_rejects_missing_priority() {
        let err = Envelope::decode(r#"{"meta": {}, "value": 1}"#).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
    }

    #[test]
    fn test_into_task_fixes_priority() {
        let (meta, value) = Envelope::new(ResolvedMeta::new(4), json!(1)).into_task();

        assert!(matches!(meta.priority, Priority::Fixed(4)));
        assert_eq!(value, json!(1));
    }
}
