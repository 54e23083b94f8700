//! Bounded worker pool with exactly-once completion callbacks.

use super::TaskHandler;
use crate::core::{TaskMeta, TaskOutcome};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Receives the outcome of every task submitted to a [`WorkerPool`].
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    /// Called exactly once per submitted task.
    async fn on_task_finish(&self, meta: TaskMeta, outcome: TaskOutcome);
}

/// Runs task handlers on at most `workers` concurrent tokio tasks.
///
/// Submission never blocks; tasks beyond the worker count wait for a free
/// slot. Handler errors and panics are reported as [`TaskOutcome::Error`].
pub struct WorkerPool {
    workers: usize,
    semaphore: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Creates a pool with the given number of workers (at least one).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            workers,
            semaphore: Arc::new(Semaphore::new(workers)),
            handles: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the number of workers.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Number of submitted tasks whose completion has not been reported yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Submits a task. `completion` is called once the task finishes.
    pub fn run_task(
        &self,
        handler: Arc<dyn TaskHandler>,
        input: Value,
        meta: TaskMeta,
        completion: Arc<dyn CompletionHandler>,
    ) {
        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => execute(handler.as_ref(), input).await,
                Err(_) => TaskOutcome::error(anyhow::anyhow!("worker pool is closed")),
            };

            let finished = AssertUnwindSafe(completion.on_task_finish(meta, outcome))
                .catch_unwind()
                .await;
            if let Err(panic) = finished {
                error!(
                    handler = %handler.name(),
                    "Completion callback panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Waits until every submitted task has completed.
    pub async fn wait_idle(&self) {
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(join_error) = handle.await {
                    warn!("Worker task join error: {}", join_error);
                }
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

async fn execute(handler: &dyn TaskHandler, input: Value) -> TaskOutcome {
    match AssertUnwindSafe(handler.handle(input)).catch_unwind().await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => TaskOutcome::error(err),
        Err(panic) => TaskOutcome::error(anyhow::anyhow!(
            "task handler '{}' panicked: {}",
            handler.name(),
            panic_message(panic.as_ref())
        )),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Priority;
    use crate::pool::{AsyncFnHandler, FnHandler};
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct Collector {
        finished: Mutex<Vec<(usize, TaskOutcome)>>,
    }

    #[async_trait]
    impl CompletionHandler for Collector {
        async fn on_task_finish(&self, meta: TaskMeta, outcome: TaskOutcome) {
            self.finished.lock().push((meta.priority.resolve(&Value::Null), outcome));
        }
    }

    #[tokio::test]
    async fn test_every_task_completes_once() {
        let pool = WorkerPool::new(3);
        let collector = Arc::new(Collector::default());
        let handler: Arc<dyn TaskHandler> =
            Arc::new(FnHandler::new("echo", |v| Ok(TaskOutcome::Value(v))));

        for i in 0..10 {
            pool.run_task(
                handler.clone(),
                json!(i),
                TaskMeta::new(Priority::fixed(i)),
                collector.clone(),
            );
        }
        pool.wait_idle().await;

        let finished = collector.finished.lock();
        assert_eq!(finished.len(), 10);
        let mut priorities: Vec<_> = finished.iter().map(|(p, _)| *p).collect();
        priorities.sort_unstable();
        assert_eq!(priorities, (0..10).collect::<Vec<_>>());
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_and_panics_become_task_errors() {
        let pool = WorkerPool::new(2);
        let collector = Arc::new(Collector::default());
        let failing: Arc<dyn TaskHandler> =
            Arc::new(FnHandler::new("fail", |_| Err(anyhow::anyhow!("bad input"))));
        let panicking: Arc<dyn TaskHandler> =
            Arc::new(FnHandler::new("panic", |_| panic!("boom")));

        pool.run_task(failing, Value::Null, TaskMeta::default(), collector.clone());
        pool.run_task(panicking, Value::Null, TaskMeta::default(), collector.clone());
        pool.wait_idle().await;

        let finished = collector.finished.lock();
        assert_eq!(finished.len(), 2);
        assert!(finished.iter().all(|(_, outcome)| outcome.is_error()));
        let messages: Vec<String> = finished
            .iter()
            .filter_map(|(_, o)| match o {
                TaskOutcome::Error(e) => Some(e.to_string()),
                _ => None,
            })
            .collect();
        assert!(messages.iter().any(|m| m.contains("bad input")));
        assert!(messages.iter().any(|m| m.contains("boom")));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let collector = Arc::new(Collector::default());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handler: Arc<dyn TaskHandler> = {
            let running = running.clone();
            let peak = peak.clone();
            Arc::new(AsyncFnHandler::new("slow", move |_| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(TaskOutcome::empty())
                }
            }))
        };

        for _ in 0..6 {
            pool.run_task(handler.clone(), Value::Null, TaskMeta::default(), collector.clone());
        }
        assert_eq!(pool.workers(), 2);
        pool.wait_idle().await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(collector.finished.lock().len(), 6);
    }

    #[test]
    fn test_zero_workers_rounds_up() {
        assert_eq!(WorkerPool::new(0).workers(), 1);
    }
}
