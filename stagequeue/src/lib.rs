//! # Stagequeue
//!
//! Priority-routed, queue-backed pipeline stages.
//!
//! A stage wraps a unit of work and connects it to the rest of a pipeline
//! only through named message queues on a broker:
//!
//! - **Queue topology**: every stage owns `{domain}-{stage}[--p{tier}][.fifo]`
//!   output queues, one per priority tier
//! - **Strict priority**: input queues are polled highest priority first and
//!   the first non-empty batch wins
//! - **Concurrent dispatch**: tasks run on a bounded worker pool and their
//!   outputs are forwarded as they finish
//! - **Deferred errors**: failed tasks are reported after the values that
//!   completed alongside them
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagequeue::prelude::*;
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let config = StageConfig::new("shop", "resize")
//!     .with_inputs(["shop-fetch", "shop-fetch--p1"])
//!     .with_priority_tiers(2)
//!     .with_workers(4);
//!
//! let runner = StageRunner::new(config, broker, Arc::new(RecordingHandler::new("resize")))?;
//! runner.run_forever(Value::Null, RunOptions::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod broker;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pool;
pub mod queues;
pub mod runner;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::broker::{InMemoryBroker, QueueBroker, QueueHandle};
    #[cfg(feature = "sqs")]
    pub use crate::broker::SqsBroker;
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{BrokerConfig, PollInterval, PublishFailurePolicy, StageConfig};
    pub use crate::core::{Envelope, Priority, TaskCallback, TaskMeta, TaskOutcome};
    pub use crate::errors::{BrokerError, StageQueueError, TaskError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pool::{AsyncFnHandler, FnHandler, TaskHandler};
    pub use crate::queues::{PriorityFilter, QueueTopology};
    pub use crate::runner::{DrainedResults, RunOptions, StageRunner};
    pub use crate::testing::{RecordingHandler, StaticHandler};
    pub use serde_json::Value;
    pub use std::sync::Arc;
}
