//! Queue naming and provisioning.
//!
//! This module provides:
//! - `QueueTopology`, the pure mapping from a stage to its queue names
//! - `QueueProvisioner`, which creates output queues and resolves input queues

mod provisioner;
mod topology;

pub use provisioner::{PriorityFilter, QueueProvisioner};
pub use topology::QueueTopology;
