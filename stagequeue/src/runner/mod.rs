//! Stage runner: the polling loop that ties queues to a task handler.

mod buffer;
mod options;
mod stage;


pub use buffer::{BufferedResult, DrainedResults, ResultBuffer};
pub use options::RunOptions;
pub use stage::{StageRunner, StageRunnerBuilder};
