//! The stage runner: receive, dispatch, forward, drain.

use super::buffer::{BufferedResult, DrainedResults, ResultBuffer};
use super::options::RunOptions;
use crate::broker::{QueueAttributes, QueueBroker, QueueHandle, ReceivedMessage, SendRequest};
use crate::cancellation::{sleep_or_cancel, CancellationToken};
use crate::config::{PublishFailurePolicy, StageConfig};
use crate::core::{Envelope, SideEffect, TaskMeta, TaskOutcome};
use crate::errors::{ConfigError, StageQueueError, TaskError};
use crate::events::{self, EventSink, NoOpEventSink};
use crate::observability::RetryTimer;
use crate::pool::{CompletionHandler, TaskHandler, WorkerPool};
use crate::queues::{PriorityFilter, QueueProvisioner, QueueTopology};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Builder for [`StageRunner`].
pub struct StageRunnerBuilder {
    config: StageConfig,
    broker: Arc<dyn QueueBroker>,
    handler: Arc<dyn TaskHandler>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl StageRunnerBuilder {
    /// Reports queue and task events to `sink`.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Uses `token` as the runner's stop signal.
    #[must_use]
    pub fn cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// Validates the config and builds the runner.
    pub fn build(self) -> Result<StageRunner, ConfigError> {
        self.config.validate()?;

        let topology = QueueTopology::from_config(&self.config);
        let attributes = QueueAttributes {
            visibility_timeout: Duration::from_secs(u64::from(
                self.config.visibility_timeout_secs,
            )),
            fifo: self.config.fifo,
        };
        let provisioner = QueueProvisioner::new(
            Arc::clone(&self.broker),
            topology,
            attributes,
            self.config.inputs.clone(),
            self.config.queue_wait_delay(),
            Arc::clone(&self.events),
        );
        let stage = provisioner.topology().base_name();

        Ok(StageRunner {
            pool: WorkerPool::new(self.config.workers),
            shared: Arc::new(StageShared {
                stage,
                config: self.config,
                broker: self.broker,
                provisioner,
                buffer: ResultBuffer::new(),
                finish_lock: Mutex::new(()),
                events: self.events,
            }),
            handler: self.handler,
            cancel: self.cancel,
        })
    }
}

/// Runs one pipeline stage against a queue broker.
///
/// Each call to [`process`](Self::process) is one iteration: receive a
/// batch from the highest-priority input queue that has messages (or
/// synthesize one task for a source stage), dispatch it to the worker
/// pool, and drain whatever results finished since the last drain.
/// Finished outputs are forwarded to the output queue of their priority
/// tier as they complete.
pub struct StageRunner {
    shared: Arc<StageShared>,
    handler: Arc<dyn TaskHandler>,
    pool: WorkerPool,
    cancel: Arc<CancellationToken>,
}

/// State shared between the polling loop and worker completions.
struct StageShared {
    stage: String,
    config: StageConfig,
    broker: Arc<dyn QueueBroker>,
    provisioner: QueueProvisioner,
    buffer: ResultBuffer,
    finish_lock: Mutex<()>,
    events: Arc<dyn EventSink>,
}

impl StageRunner {
    /// Starts building a runner.
    #[must_use]
    pub fn builder(
        config: StageConfig,
        broker: Arc<dyn QueueBroker>,
        handler: Arc<dyn TaskHandler>,
    ) -> StageRunnerBuilder {
        StageRunnerBuilder {
            config,
            broker,
            handler,
            events: Arc::new(NoOpEventSink),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Builds a runner with no event sink and a fresh stop signal.
    pub fn new(
        config: StageConfig,
        broker: Arc<dyn QueueBroker>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, ConfigError> {
        Self::builder(config, broker, handler).build()
    }

    /// The stage base name, `{domain}-{name}`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.stage
    }

    /// The stage config.
    #[must_use]
    pub fn config(&self) -> &StageConfig {
        &self.shared.config
    }

    /// The stage's queue naming.
    #[must_use]
    pub fn topology(&self) -> &QueueTopology {
        self.shared.provisioner.topology()
    }

    /// The stop signal shared with this runner.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// Stops the runner at the next suspension point.
    pub fn stop(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    /// Number of results recorded but not yet drained.
    #[must_use]
    pub fn pending_results(&self) -> usize {
        self.shared.buffer.len()
    }

    /// Number of dispatched tasks that have not finished.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }

    /// Creates the output queues. Safe to call repeatedly.
    pub async fn setup(&self) -> Result<(), StageQueueError> {
        self.shared.provisioner.setup().await?;
        Ok(())
    }

    /// Output queue handles indexed by tier, once `setup` has run.
    #[must_use]
    pub fn output_queues(&self) -> Option<&[QueueHandle]> {
        self.shared.provisioner.output_queues()
    }

    /// Resolves the input queues passing `filter`, waiting for any that
    /// do not exist yet.
    pub async fn in_queues(&self, filter: PriorityFilter) -> Result<Vec<QueueHandle>, StageQueueError> {
        let queues = self.shared.provisioner.in_queues(filter, &self.cancel).await?;
        Ok(queues.into_iter().map(|(_, queue)| queue).collect())
    }

    /// Waits for every dispatched task to finish.
    pub async fn wait_idle(&self) {
        self.pool.wait_idle().await;
    }

    /// Runs one iteration and returns the results drained at its end.
    ///
    /// `args` is only used by source stages, as the input of the one task
    /// submitted per iteration. Task failures do not fail the iteration;
    /// they are yielded by the returned [`DrainedResults`] after its values.
    pub async fn process(
        &self,
        args: &Value,
        options: &RunOptions,
    ) -> Result<DrainedResults, StageQueueError> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        self.setup().await?;

        if self.shared.config.is_source() {
            self.dispatch(args.clone(), TaskMeta::new(options.priority.clone()));
            self.finish_iteration().await;
            let interval = self.shared.config.interval.next_interval();
            sleep_or_cancel(&self.cancel, interval).await;
        } else {
            if let Some((queue, messages)) = self.receive_batch(options.filter).await? {
                for message in messages {
                    self.accept(&queue, message).await;
                }
            } else {
                // Brokers without long polling return at once.
                tokio::task::yield_now().await;
            }
            self.finish_iteration().await;
        }

        Ok(self.drain())
    }

    /// Runs iterations until stopped, yielding each result as it drains.
    ///
    /// Task failures are yielded as [`StageQueueError::Task`] and the
    /// stream carries on. Other failures are yielded too, and the next
    /// iteration waits `receive_retry_delay` first. The stream ends once
    /// the runner is stopped.
    pub fn stream(
        &self,
        args: Value,
        options: RunOptions,
    ) -> impl Stream<Item = Result<Value, StageQueueError>> + '_ {
        futures::stream::unfold(
            (args, options, None::<DrainedResults>, false),
            move |(args, options, mut pending, backoff)| async move {
                if backoff
                    && !sleep_or_cancel(&self.cancel, self.shared.config.receive_retry_delay())
                        .await
                {
                    return None;
                }
                loop {
                    if let Some(next) = pending.as_mut().and_then(|drained| drained.next()) {
                        let item = next.map_err(StageQueueError::from);
                        return Some((item, (args, options, pending, false)));
                    }
                    if self.cancel.is_cancelled() {
                        return None;
                    }
                    match self.process(&args, &options).await {
                        Ok(drained) => pending = Some(drained),
                        Err(err) if err.is_cancelled() => return None,
                        Err(err) => {
                            warn!(stage = %self.name(), error = %err, "Iteration failed");
                            return Some((Err(err), (args, options, None, true)));
                        }
                    }
                }
            },
        )
    }

    /// Runs iterations until stopped, logging task failures.
    ///
    /// Returns early on any non-task error. On stop, waits for in-flight
    /// tasks so their outputs are still forwarded.
    pub async fn run_forever(&self, args: Value, options: RunOptions) -> Result<(), StageQueueError> {
        info!(stage = %self.name(), source = self.shared.config.is_source(), "Stage starting");

        let stream = self.stream(args, options);
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            match item {
                Ok(value) => debug!(stage = %self.name(), value = %value, "Task completed"),
                Err(StageQueueError::Task(err)) => {
                    error!(stage = %self.name(), error = %err, "Task failed");
                }
                Err(err) => return Err(err),
            }
        }

        self.pool.wait_idle().await;
        info!(
            stage = %self.name(),
            reason = ?self.cancel.reason(),
            "Stage stopped"
        );
        Ok(())
    }

    fn dispatch(&self, input: Value, meta: TaskMeta) {
        let completion: Arc<dyn CompletionHandler> = self.shared.clone();
        self.pool
            .run_task(Arc::clone(&self.handler), input, meta, completion);
    }

    async fn finish_iteration(&self) {
        if self.shared.config.wait_for_batch {
            self.pool.wait_idle().await;
        }
    }

    fn drain(&self) -> DrainedResults {
        DrainedResults::from_entries(self.shared.buffer.drain(), self.shared.config.ignore_none)
    }

    fn cancelled(&self) -> StageQueueError {
        StageQueueError::Cancelled(self.cancel.reason().unwrap_or_default())
    }

    /// Polls input queues highest priority first; the first non-empty
    /// batch wins.
    async fn receive_batch(
        &self,
        filter: PriorityFilter,
    ) -> Result<Option<(QueueHandle, Vec<ReceivedMessage>)>, StageQueueError> {
        let queues = self.shared.provisioner.in_queues(filter, &self.cancel).await?;
        for (priority, queue) in queues {
            let messages = self.receive_with_retry(&queue).await?;
            if !messages.is_empty() {
                debug!(
                    stage = %self.name(),
                    queue = %queue.name,
                    priority,
                    count = messages.len(),
                    "Received batch"
                );
                return Ok(Some((queue, messages)));
            }
        }
        Ok(None)
    }

    async fn receive_with_retry(&self, queue: &QueueHandle) -> Result<Vec<ReceivedMessage>, StageQueueError> {
        let mut timer = RetryTimer::start();
        loop {
            match self.shared.broker.receive(queue, self.shared.config.batch_size()).await {
                Ok(messages) => return Ok(messages),
                Err(err) => {
                    let attempt = timer.record_attempt();
                    warn!(
                        stage = %self.name(),
                        queue = %queue.name,
                        attempt,
                        error = %err,
                        "Receive failed; retrying"
                    );
                    self.shared.events.try_emit(
                        events::RECEIVE_RETRY,
                        Some(events::event_data(
                            self.name(),
                            json!({
                                "queue": queue.name,
                                "attempt": attempt,
                                "waited_ms": timer.elapsed_ms(),
                                "error": err.to_dict(),
                            }),
                        )),
                    );
                    if !sleep_or_cancel(&self.cancel, self.shared.config.receive_retry_delay()).await {
                        return Err(self.cancelled());
                    }
                }
            }
        }
    }

    /// Decodes a message, deletes it, then dispatches it.
    async fn accept(&self, queue: &QueueHandle, message: ReceivedMessage) {
        let decoded = Envelope::decode(&message.body);

        if let Err(err) = self.shared.broker.delete(queue, &message.receipt_handle).await {
            warn!(
                stage = %self.name(),
                queue = %queue.name,
                error = %err,
                "Failed to delete message"
            );
        }

        match decoded {
            Ok(envelope) => {
                let (meta, value) = envelope.into_task();
                self.dispatch(value, meta);
            }
            Err(err) => {
                error!(
                    stage = %self.name(),
                    queue = %queue.name,
                    error = %err,
                    "Dropping malformed message"
                );
                self.shared.events.try_emit(
                    events::MESSAGE_MALFORMED,
                    Some(events::event_data(
                        self.name(),
                        json!({"queue": queue.name, "error": err.to_string()}),
                    )),
                );
            }
        }
    }
}

impl std::fmt::Debug for StageRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRunner")
            .field("stage", &self.shared.stage)
            .field("handler", &self.handler.name())
            .field("pool", &self.pool)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl CompletionHandler for StageShared {
    async fn on_task_finish(&self, meta: TaskMeta, outcome: TaskOutcome) {
        let _guard = self.finish_lock.lock().await;
        let forward = self.should_forward(&outcome);

        let entry = match outcome {
            TaskOutcome::Empty => BufferedResult::Empty,
            TaskOutcome::Error(err) => {
                warn!(
                    stage = %self.stage,
                    error = %err,
                    root_cause = %err.root_cause(),
                    "Task failed"
                );
                self.events.try_emit(
                    events::TASK_FAILED,
                    Some(events::event_data(&self.stage, json!({"error": err.to_string()}))),
                );
                BufferedResult::Failed(err)
            }
            TaskOutcome::Value(value) => self.complete(&meta, value, forward, None).await,
            TaskOutcome::Callback(callback) => {
                let (side_effect, value) = callback.into_parts();
                self.complete(&meta, value, forward, Some(side_effect)).await
            }
        };

        self.buffer.push(entry);
    }
}

impl StageShared {
    fn should_forward(&self, outcome: &TaskOutcome) -> bool {
        match outcome {
            TaskOutcome::Empty | TaskOutcome::Error(_) => false,
            _ if self.config.terminal => false,
            _ => !(self.config.ignore_none && outcome.is_null()),
        }
    }

    async fn complete(
        &self,
        meta: &TaskMeta,
        value: Value,
        forward: bool,
        side_effect: Option<SideEffect>,
    ) -> BufferedResult {
        if !forward {
            if side_effect.is_some() {
                debug!(stage = %self.stage, "Output not forwarded; skipping side effect");
            }
            return BufferedResult::Completed(value);
        }

        let published = self.publish(meta, &value).await;

        if let Some(side_effect) = side_effect {
            self.run_side_effect(side_effect);
        }

        match published {
            Err(err) if self.config.publish_failure == PublishFailurePolicy::FailTask => {
                BufferedResult::Failed(TaskError::new(
                    anyhow::Error::new(err).context("failed to publish task output"),
                ))
            }
            _ => BufferedResult::Completed(value),
        }
    }

    async fn publish(&self, meta: &TaskMeta, value: &Value) -> Result<(), StageQueueError> {
        let result = self.try_publish(meta, value).await;
        match &result {
            Ok(queue) => {
                debug!(stage = %self.stage, queue = %queue, "Published task output");
                self.events.try_emit(
                    events::TASK_PUBLISHED,
                    Some(events::event_data(&self.stage, json!({"queue": queue}))),
                );
            }
            Err(err) => {
                error!(stage = %self.stage, error = ?err, "Failed to publish task output");
                self.events.try_emit(
                    events::TASK_PUBLISH_FAILED,
                    Some(events::event_data(&self.stage, json!({"error": err.to_string()}))),
                );
            }
        }
        result.map(|_| ())
    }

    async fn try_publish(&self, meta: &TaskMeta, value: &Value) -> Result<String, StageQueueError> {
        let outputs = self.provisioner.output_queues().ok_or_else(|| {
            StageQueueError::Internal("output queues are not provisioned".to_string())
        })?;
        let last = outputs
            .len()
            .checked_sub(1)
            .ok_or_else(|| StageQueueError::Internal("stage has no output queues".to_string()))?;

        let mut resolved = meta.resolve(value);
        if resolved.priority > last {
            warn!(
                stage = %self.stage,
                priority = resolved.priority,
                tiers = outputs.len(),
                "Priority out of range; using lowest tier"
            );
            resolved.priority = last;
        }
        let queue = &outputs[resolved.priority];

        let body = Envelope::new(resolved, value.clone()).encode()?;
        let mut request = SendRequest::new(body);
        if self.config.fifo {
            request = request.with_fifo(Uuid::new_v4().to_string(), &self.stage);
        }

        self.broker.send(queue, request).await?;
        Ok(queue.name.clone())
    }

    fn run_side_effect(&self, side_effect: SideEffect) {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(side_effect)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(stage = %self.stage, "Task side effect panicked: {}", message);
        }
    }
}
