//! Core domain model types for stagequeue.
//!
//! This module contains the types exchanged between stages and the
//! worker pool:
//! - Task metadata and its (possibly deferred) priority
//! - The four-way task outcome
//! - The `{meta, value}` wire envelope

mod envelope;
mod meta;
mod outcome;

pub use envelope::Envelope;
pub use meta::{Priority, PriorityFn, ResolvedMeta, TaskMeta};
pub use outcome::{SideEffect, TaskCallback, TaskOutcome};
