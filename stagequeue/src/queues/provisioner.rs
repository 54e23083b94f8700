//! Output queue provisioning and input queue resolution.

use super::QueueTopology;
use crate::broker::{QueueAttributes, QueueBroker, QueueHandle};
use crate::cancellation::{sleep_or_cancel, CancellationToken};
use crate::errors::{BrokerError, StageQueueError};
use crate::events::{self, EventSink};
use crate::observability::RetryTimer;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Inclusive bounds on the input priorities a stage polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PriorityFilter {
    /// Lowest tier index to poll (highest priority).
    pub min: Option<usize>,
    /// Highest tier index to poll (lowest priority).
    pub max: Option<usize>,
}

impl PriorityFilter {
    /// A filter accepting every tier.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            min: None,
            max: None,
        }
    }

    /// A filter accepting tiers in `[min, max]`.
    #[must_use]
    pub const fn new(min: Option<usize>, max: Option<usize>) -> Self {
        Self { min, max }
    }

    /// Returns true if `priority` passes the filter.
    #[must_use]
    pub fn contains(&self, priority: usize) -> bool {
        self.min.map_or(true, |min| priority >= min) && self.max.map_or(true, |max| priority <= max)
    }
}

/// Creates a stage's output queues and resolves its input queues.
pub struct QueueProvisioner {
    broker: Arc<dyn QueueBroker>,
    topology: QueueTopology,
    attributes: QueueAttributes,
    inputs: Vec<String>,
    queue_wait_delay: Duration,
    events: Arc<dyn EventSink>,
    outputs: OnceCell<Vec<QueueHandle>>,
    input_cache: RwLock<HashMap<usize, QueueHandle>>,
}

impl QueueProvisioner {
    /// Creates a provisioner.
    #[must_use]
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        topology: QueueTopology,
        attributes: QueueAttributes,
        inputs: Vec<String>,
        queue_wait_delay: Duration,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            broker,
            topology,
            attributes,
            inputs,
            queue_wait_delay,
            events,
            outputs: OnceCell::new(),
            input_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the stage's queue topology.
    #[must_use]
    pub const fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Ensures every output queue exists.
    ///
    /// Only the first successful call talks to the broker; later calls
    /// return the cached handles. A missing queue is created; a create
    /// that loses a race falls back to looking the queue up again.
    pub async fn setup(&self) -> Result<&[QueueHandle], BrokerError> {
        self.outputs
            .get_or_try_init(|| self.provision_outputs())
            .await
            .map(Vec::as_slice)
    }

    /// Output queue handles indexed by tier, if `setup` has completed.
    #[must_use]
    pub fn output_queues(&self) -> Option<&[QueueHandle]> {
        self.outputs.get().map(Vec::as_slice)
    }

    async fn provision_outputs(&self) -> Result<Vec<QueueHandle>, BrokerError> {
        let names = self.topology.output_queue_names();
        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            handles.push(self.get_or_create(name).await?);
        }
        info!(
            stage = %self.topology.base_name(),
            count = handles.len(),
            "Output queues ready"
        );
        Ok(handles)
    }

    async fn get_or_create(&self, name: &str) -> Result<QueueHandle, BrokerError> {
        match self.broker.get_queue(name).await {
            Ok(handle) => Ok(handle),
            Err(err) if err.is_queue_does_not_exist() => {
                match self.broker.create_queue(name, &self.attributes).await {
                    Ok(handle) => {
                        info!(queue = %name, fifo = self.attributes.fifo, "Created queue");
                        self.events.try_emit(
                            events::QUEUE_CREATED,
                            Some(events::event_data(
                                &self.topology.base_name(),
                                serde_json::json!({"queue": name, "fifo": self.attributes.fifo}),
                            )),
                        );
                        Ok(handle)
                    }
                    Err(err) if err.is_queue_already_exists() => {
                        debug!(queue = %name, "Queue created concurrently; looking it up");
                        self.broker.get_queue(name).await
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Resolves input queues that pass `filter`, highest priority first.
    ///
    /// Upstream stages may not have created their queues yet, so a missing
    /// queue restarts resolution after a fixed delay until it appears or
    /// `cancel` fires. Any other broker error is returned immediately.
    pub async fn in_queues(
        &self,
        filter: PriorityFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<(usize, QueueHandle)>, StageQueueError> {
        let mut waiting: Option<RetryTimer> = None;

        loop {
            match self.resolve_inputs(filter).await {
                Ok(queues) => {
                    if let Some(timer) = waiting {
                        info!(
                            stage = %self.topology.base_name(),
                            waited_ms = timer.elapsed_ms(),
                            "Input queues OK"
                        );
                        self.events.try_emit(
                            events::QUEUE_READY,
                            Some(events::event_data(
                                &self.topology.base_name(),
                                serde_json::json!({
                                    "waited_ms": timer.elapsed_ms(),
                                    "attempts": timer.attempts(),
                                }),
                            )),
                        );
                    }
                    return Ok(queues);
                }
                Err(BrokerError::QueueDoesNotExist { name }) => {
                    let timer = waiting.get_or_insert_with(|| {
                        info!(
                            stage = %self.topology.base_name(),
                            queue = %name,
                            "Waiting for input queue to be created"
                        );
                        self.events.try_emit(
                            events::QUEUE_WAITING,
                            Some(events::event_data(
                                &self.topology.base_name(),
                                serde_json::json!({"queue": name}),
                            )),
                        );
                        RetryTimer::start()
                    });
                    timer.record_attempt();

                    if !sleep_or_cancel(cancel, self.queue_wait_delay).await {
                        return Err(StageQueueError::Cancelled(
                            cancel.reason().unwrap_or_default(),
                        ));
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn resolve_inputs(
        &self,
        filter: PriorityFilter,
    ) -> Result<Vec<(usize, QueueHandle)>, BrokerError> {
        let mut resolved = Vec::with_capacity(self.inputs.len());
        for (priority, name) in self.inputs.iter().enumerate() {
            if !filter.contains(priority) {
                continue;
            }
            let cached = self.input_cache.read().get(&priority).cloned();
            let handle = match cached {
                Some(handle) => handle,
                None => {
                    let handle = self.broker.get_queue(name).await?;
                    self.input_cache.write().insert(priority, handle.clone());
                    handle
                }
            };
            resolved.push((priority, handle));
        }
        Ok(resolved)
    }
}

impl std::fmt::Debug for QueueProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProvisioner")
            .field("topology", &self.topology)
            .field("inputs", &self.inputs)
            .field("provisioned", &self.outputs.initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, MockQueueBroker};
    use crate::events::{CollectingEventSink, NoOpEventSink};
    use mockall::predicate::eq;

    fn attributes(fifo: bool) -> QueueAttributes {
        QueueAttributes {
            visibility_timeout: Duration::from_secs(300),
            fifo,
        }
    }

    fn provisioner(
        broker: Arc<dyn QueueBroker>,
        topology: QueueTopology,
        inputs: &[&str],
    ) -> QueueProvisioner {
        QueueProvisioner::new(
            broker,
            topology,
            attributes(false),
            inputs.iter().map(ToString::to_string).collect(),
            Duration::from_millis(10),
            Arc::new(NoOpEventSink),
        )
    }

    #[test]
    fn test_priority_filter() {
        assert!(PriorityFilter::all().contains(7));

        let filter = PriorityFilter::new(Some(1), Some(2));
        assert!(!filter.contains(0));
        assert!(filter.contains(1));
        assert!(filter.contains(2));
        assert!(!filter.contains(3));
    }

    #[tokio::test]
    async fn test_setup_creates_missing_queues() {
        let broker = Arc::new(InMemoryBroker::new());
        let topology = QueueTopology::new("shop", "resize", false, 3, false);
        let provisioner = provisioner(broker.clone(), topology, &[]);

        let handles = provisioner.setup().await.unwrap();

        assert_eq!(handles.len(), 3);
        assert_eq!(handles[0].name, "shop-resize");
        assert_eq!(handles[2].name, "shop-resize--p2");
        assert!(broker.has_queue("shop-resize--p1"));
        assert_eq!(broker.create_calls(), 3);
    }

    #[tokio::test]
    async fn test_setup_reuses_existing_queue() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.ensure_queue("shop-resize", false);
        let topology = QueueTopology::new("shop", "resize", false, 1, false);
        let provisioner = provisioner(broker.clone(), topology, &[]);

        provisioner.setup().await.unwrap();
        assert_eq!(broker.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let mut broker = MockQueueBroker::new();
        broker
            .expect_get_queue()
            .with(eq("shop-resize"))
            .times(1)
            .returning(|name| Err(BrokerError::does_not_exist(name)));
        broker
            .expect_create_queue()
            .times(1)
            .returning(|name, _| Ok(QueueHandle::new(name, format!("mock://{name}"))));

        let topology = QueueTopology::new("shop", "resize", false, 1, false);
        let provisioner = provisioner(Arc::new(broker), topology, &[]);

        provisioner.setup().await.unwrap();
        provisioner.setup().await.unwrap();

        assert_eq!(provisioner.output_queues().unwrap()[0].url, "mock://shop-resize");
    }

    #[tokio::test]
    async fn test_setup_tolerates_create_race() {
        let mut broker = MockQueueBroker::new();
        let mut seq = mockall::Sequence::new();
        broker
            .expect_get_queue()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| Err(BrokerError::does_not_exist(name)));
        broker
            .expect_create_queue()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name, _| Err(BrokerError::already_exists(name)));
        broker
            .expect_get_queue()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|name| Ok(QueueHandle::new(name, "mock://winner")));

        let topology = QueueTopology::new("shop", "resize", false, 1, false);
        let provisioner = provisioner(Arc::new(broker), topology, &[]);

        let handles = provisioner.setup().await.unwrap();
        assert_eq!(handles[0].url, "mock://winner");
    }

    #[tokio::test]
    async fn test_setup_propagates_other_errors() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_gets_with_transport(true);
        let topology = QueueTopology::new("shop", "resize", false, 1, false);
        let provisioner = provisioner(broker.clone(), topology, &[]);

        let err = provisioner.setup().await.unwrap_err();
        assert!(matches!(err, BrokerError::Transport { .. }));
        assert!(provisioner.output_queues().is_none());
        assert_eq!(broker.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_terminal_stage_provisions_nothing() {
        let broker = Arc::new(InMemoryBroker::new());
        let topology = QueueTopology::new("shop", "store", false, 3, true);
        let provisioner = provisioner(broker.clone(), topology, &[]);

        assert!(provisioner.setup().await.unwrap().is_empty());
        assert_eq!(broker.get_calls(), 0);
    }

    #[tokio::test]
    async fn test_in_queues_applies_filter() {
        let broker = Arc::new(InMemoryBroker::new());
        for name in ["up", "up--p1", "up--p2"] {
            broker.ensure_queue(name, false);
        }
        let topology = QueueTopology::new("shop", "down", false, 1, false);
        let provisioner = provisioner(broker.clone(), topology, &["up", "up--p1", "up--p2"]);
        let cancel = CancellationToken::new();

        let all = provisioner.in_queues(PriorityFilter::all(), &cancel).await.unwrap();
        let names: Vec<_> = all.iter().map(|(p, q)| (*p, q.name.as_str())).collect();
        assert_eq!(names, vec![(0, "up"), (1, "up--p1"), (2, "up--p2")]);

        let low = provisioner
            .in_queues(PriorityFilter::new(Some(1), None), &cancel)
            .await
            .unwrap();
        assert_eq!(low.len(), 2);
        assert_eq!(low[0].0, 1);

        // Second resolution is served from the cache.
        assert_eq!(broker.get_calls(), 3);
    }

    #[tokio::test]
    async fn test_in_queues_waits_for_upstream() {
        let broker = Arc::new(InMemoryBroker::new());
        let sink = Arc::new(CollectingEventSink::new());
        let provisioner = QueueProvisioner::new(
            broker.clone(),
            QueueTopology::new("shop", "down", false, 1, false),
            attributes(false),
            vec!["up".to_string()],
            Duration::from_millis(10),
            sink.clone(),
        );

        let creator = {
            let broker = broker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(35)).await;
                broker.ensure_queue("up", false);
            })
        };

        let queues = provisioner
            .in_queues(PriorityFilter::all(), &CancellationToken::new())
            .await
            .unwrap();
        creator.await.unwrap();

        assert_eq!(queues[0].1.name, "up");
        assert_eq!(sink.events_of_type(events::QUEUE_WAITING).len(), 1);
        let ready = sink.events_of_type(events::QUEUE_READY);
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1.as_ref().unwrap()["waited_ms"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_in_queues_stops_on_cancel() {
        let broker = Arc::new(InMemoryBroker::new());
        let topology = QueueTopology::new("shop", "down", false, 1, false);
        let provisioner = provisioner(broker, topology, &["never"]);
        let cancel = Arc::new(CancellationToken::new());

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(25)).await;
                cancel.cancel("shutdown");
            })
        };

        let err = provisioner
            .in_queues(PriorityFilter::all(), &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_in_queues_propagates_transport_errors() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.fail_gets_with_transport(true);
        let topology = QueueTopology::new("shop", "down", false, 1, false);
        let provisioner = provisioner(broker, topology, &["up"]);

        let err = provisioner
            .in_queues(PriorityFilter::all(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StageQueueError::Broker(BrokerError::Transport { .. })));
    }
}
