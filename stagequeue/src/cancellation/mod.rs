//! Cooperative stop signal for the run-loop.
//!
//! The runner checks the token between iterations and races every sleep
//! and retry back-off against it.

mod token;

pub use token::{sleep_or_cancel, CancellationToken};
