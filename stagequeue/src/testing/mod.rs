//! Testing utilities for stage runners.
//!
//! Mock task handlers to pair with
//! [`InMemoryBroker`](crate::broker::InMemoryBroker).

mod mocks;

pub use mocks::{FailingHandler, RecordingHandler, SequenceHandler, SlowHandler, StaticHandler};
