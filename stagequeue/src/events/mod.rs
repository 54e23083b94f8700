//! Event sink system for observability.
//!
//! Stage runners report queue readiness, retries and publish outcomes to an
//! [`EventSink`] in addition to their `tracing` output, so that retry
//! durations and publish failures can be surfaced to metrics or alerting.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// First miss while resolving an input queue.
pub const QUEUE_WAITING: &str = "queue.waiting";
/// An input queue resolved after waiting; carries `waited_ms`.
pub const QUEUE_READY: &str = "queue.ready";
/// An output queue was created.
pub const QUEUE_CREATED: &str = "queue.created";
/// A receive call failed and will be retried.
pub const RECEIVE_RETRY: &str = "receive.retry";
/// A task output was published.
pub const TASK_PUBLISHED: &str = "task.published";
/// Publishing a task output failed.
pub const TASK_PUBLISH_FAILED: &str = "task.publish_failed";
/// A task handler failed.
pub const TASK_FAILED: &str = "task.failed";
/// A received message could not be decoded.
pub const MESSAGE_MALFORMED: &str = "message.malformed";

/// Builds an event payload stamped with the stage name and current time.
#[must_use]
pub fn event_data(stage: &str, mut fields: serde_json::Value) -> serde_json::Value {
    if let Some(map) = fields.as_object_mut() {
        map.insert("stage".to_string(), serde_json::json!(stage));
        map.insert(
            "timestamp".to_string(),
            serde_json::json!(chrono::Utc::now().to_rfc3339()),
        );
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_data_stamps_stage() {
        let data = event_data("shop-resize", serde_json::json!({"queue": "q"}));

        assert_eq!(data["stage"], "shop-resize");
        assert_eq!(data["queue"], "q");
        assert!(data["timestamp"].is_string());
    }

    #[test]
    fn test_event_data_leaves_non_objects() {
        let data = event_data("s", serde_json::json!(3));
        assert_eq!(data, serde_json::json!(3));
    }
}
