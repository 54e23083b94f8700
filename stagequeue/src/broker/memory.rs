//! In-process queue broker.

use super::{QueueAttributes, QueueBroker, QueueHandle, ReceivedMessage, SendRequest};
use crate::errors::BrokerError;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct MemoryQueue {
    attributes: QueueAttributes,
    ready: Mutex<VecDeque<String>>,
    in_flight: Mutex<HashMap<String, String>>,
    seen_dedup_ids: Mutex<HashSet<String>>,
    sent: Mutex<Vec<SendRequest>>,
}

impl MemoryQueue {
    fn new(attributes: QueueAttributes) -> Self {
        Self {
            attributes,
            ready: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            seen_dedup_ids: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
        }
    }
}

/// A broker that keeps queues in memory.
///
/// Behaves like SQS where it matters to a stage runner: missing queues are
/// reported as such, received messages stay in flight until deleted, and
/// FIFO queues drop messages whose deduplication id was already seen.
/// Also records every call for assertions and can inject failures.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: DashMap<String, Arc<MemoryQueue>>,
    get_calls: AtomicUsize,
    create_calls: AtomicUsize,
    receive_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    send_calls: AtomicUsize,
    failing_receives: AtomicUsize,
    fail_sends: AtomicBool,
    fail_gets: AtomicBool,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a queue outside the runner, e.g. to simulate another stage.
    pub fn ensure_queue(&self, name: &str, fifo: bool) {
        self.queues.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryQueue::new(QueueAttributes {
                visibility_timeout: std::time::Duration::from_secs(30),
                fifo,
            }))
        });
    }

    /// Appends a raw message body to a queue, creating it if needed.
    pub fn push(&self, name: &str, body: impl Into<String>) {
        self.ensure_queue(name, name.ends_with(".fifo"));
        if let Some(queue) = self.queues.get(name) {
            queue.ready.lock().push_back(body.into());
        }
    }

    /// Returns true if the queue exists.
    #[must_use]
    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Returns the attributes a queue was created with.
    #[must_use]
    pub fn attributes(&self, name: &str) -> Option<QueueAttributes> {
        self.queues.get(name).map(|q| q.attributes)
    }

    /// Number of messages waiting to be received.
    #[must_use]
    pub fn depth(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |q| q.ready.lock().len())
    }

    /// Number of received but not yet deleted messages.
    #[must_use]
    pub fn in_flight(&self, name: &str) -> usize {
        self.queues.get(name).map_or(0, |q| q.in_flight.lock().len())
    }

    /// Every send request accepted for a queue, in order.
    #[must_use]
    pub fn sent(&self, name: &str) -> Vec<SendRequest> {
        self.queues
            .get(name)
            .map(|q| q.sent.lock().clone())
            .unwrap_or_default()
    }

    /// Returns in-flight messages to the queue, as if their visibility
    /// timeout expired.
    pub fn expire_in_flight(&self, name: &str) -> usize {
        let Some(queue) = self.queues.get(name) else {
            return 0;
        };
        let expired: Vec<String> = queue.in_flight.lock().drain().map(|(_, body)| body).collect();
        let count = expired.len();
        queue.ready.lock().extend(expired);
        count
    }

    /// Makes the next `count` receive calls fail.
    pub fn fail_next_receives(&self, count: usize) {
        self.failing_receives.store(count, Ordering::SeqCst);
    }

    /// Makes every send call fail while set.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Makes every lookup fail with a transport error while set.
    pub fn fail_gets_with_transport(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Number of `get_queue` calls.
    #[must_use]
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    /// Number of `create_queue` calls.
    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of `receive` calls.
    #[must_use]
    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls.
    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Number of `send` calls, including failed ones.
    #[must_use]
    pub fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    fn queue(&self, name: &str) -> Result<Arc<MemoryQueue>, BrokerError> {
        self.queues
            .get(name)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| BrokerError::does_not_exist(name))
    }

    fn handle(name: &str) -> QueueHandle {
        QueueHandle::new(name, format!("memory://{name}"))
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn get_queue(&self, name: &str) -> Result<QueueHandle, BrokerError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(BrokerError::transport("get_queue", "injected failure"));
        }
        self.queue(name).map(|_| Self::handle(name))
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &QueueAttributes,
    ) -> Result<QueueHandle, BrokerError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.queues.contains_key(name) {
            return Err(BrokerError::already_exists(name));
        }
        self.queues
            .insert(name.to_string(), Arc::new(MemoryQueue::new(*attributes)));
        Ok(Self::handle(name))
    }

    async fn receive(
        &self,
        queue: &QueueHandle,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, BrokerError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_receives.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_receives.store(remaining - 1, Ordering::SeqCst);
            return Err(BrokerError::transport("receive", "injected failure"));
        }

        let stored = self.queue(&queue.name)?;
        let mut ready = stored.ready.lock();
        let mut in_flight = stored.in_flight.lock();
        let take = max.min(ready.len());

        Ok(ready
            .drain(..take)
            .map(|body| {
                let receipt_handle = uuid::Uuid::new_v4().to_string();
                in_flight.insert(receipt_handle.clone(), body.clone());
                ReceivedMessage {
                    receipt_handle,
                    body,
                }
            })
            .collect())
    }

    async fn delete(&self, queue: &QueueHandle, receipt_handle: &str) -> Result<(), BrokerError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let stored = self.queue(&queue.name)?;
        let removed = stored.in_flight.lock().remove(receipt_handle);
        removed
            .map(|_| ())
            .ok_or_else(|| BrokerError::transport("delete", format!("invalid receipt handle {receipt_handle}")))
    }

    async fn send(&self, queue: &QueueHandle, request: SendRequest) -> Result<(), BrokerError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(BrokerError::transport("send", "injected failure"));
        }

        let stored = self.queue(&queue.name)?;
        let duplicate = if stored.attributes.fifo {
            let (Some(dedup_id), Some(_)) = (&request.deduplication_id, &request.group_id) else {
                return Err(BrokerError::transport(
                    "send",
                    "FIFO queues require a deduplication id and a group id",
                ));
            };
            !stored.seen_dedup_ids.lock().insert(dedup_id.clone())
        } else {
            false
        };

        if !duplicate {
            stored.ready.lock().push_back(request.body.clone());
        }
        stored.sent.lock().push(request);
        Ok(())
    }
}
