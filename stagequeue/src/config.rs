//! Stage configuration.
//!
//! A [`StageConfig`] describes one pipeline stage: where it reads from,
//! how many priority tiers it publishes to, and how it polls. Configs are
//! usually loaded from JSON and then adjusted with the `with_*` builders.

use crate::errors::ConfigError;
use crate::queues::QueueTopology;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default visibility timeout for created queues (5 minutes).
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u32 = 300;

/// Broker-imposed upper bound on messages per receive call.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Function producing the next polling interval.
pub type IntervalFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// How long a source stage sleeps between invocations.
///
/// The interval is evaluated fresh on every iteration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollInterval {
    /// A constant interval.
    Fixed {
        /// Interval in milliseconds.
        millis: u64,
    },
    /// `base` plus a uniformly random amount up to `spread`.
    Jittered {
        /// Minimum interval in milliseconds.
        base_millis: u64,
        /// Maximum extra delay in milliseconds.
        spread_millis: u64,
    },
    /// A caller-supplied function. Not serializable.
    #[serde(skip)]
    Dynamic(IntervalFn),
}

impl PollInterval {
    /// Creates a constant interval.
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        Self::Fixed {
            millis: duration_millis(interval),
        }
    }

    /// Creates a jittered interval.
    #[must_use]
    pub fn jittered(base: Duration, spread: Duration) -> Self {
        Self::Jittered {
            base_millis: duration_millis(base),
            spread_millis: duration_millis(spread),
        }
    }

    /// Creates an interval computed by `f` on every iteration.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    /// Returns the interval to sleep for this iteration.
    #[must_use]
    pub fn next_interval(&self) -> Duration {
        match self {
            Self::Fixed { millis } => Duration::from_millis(*millis),
            Self::Jittered {
                base_millis,
                spread_millis,
            } => {
                let extra = if *spread_millis == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=*spread_millis)
                };
                Duration::from_millis(base_millis.saturating_add(extra))
            }
            Self::Dynamic(f) => f(),
        }
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self::Fixed { millis: 1000 }
    }
}

impl fmt::Debug for PollInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed { millis } => write!(f, "Fixed({millis}ms)"),
            Self::Jittered {
                base_millis,
                spread_millis,
            } => write!(f, "Jittered({base_millis}ms+{spread_millis}ms)"),
            Self::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// What to do when publishing a task's output fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishFailurePolicy {
    /// Log and treat the task as completed.
    #[default]
    BestEffort,
    /// Record the task as failed so the caller sees the publish error.
    FailTask,
}

/// Connection settings for the queue broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AWS region.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack).
    pub endpoint: Option<String>,
    /// AWS profile name.
    pub profile: Option<String>,
    /// Explicit access key; default credentials are used if unset.
    pub access_key: Option<String>,
    /// Explicit secret key.
    pub secret_key: Option<String>,
}

impl BrokerConfig {
    /// Sets the region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Sets a custom endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets explicit credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.access_key = Some(access_key.into());
        self.secret_key = Some(secret_key.into());
        self
    }
}

/// Configuration for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Namespace shared by all stages of a pipeline.
    pub domain: String,
    /// Logical stage name.
    pub name: String,
    /// Whether queues are ordered (FIFO) queues.
    pub fifo: bool,
    /// Input queue names, highest priority first. Empty for a source stage.
    pub inputs: Vec<String>,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Number of output priority tiers.
    pub priority_tiers: usize,
    /// Terminal stages publish nothing.
    pub terminal: bool,
    /// Sleep between invocations of a source stage.
    pub interval: PollInterval,
    /// Do not forward `null` results.
    pub ignore_none: bool,
    /// Visibility timeout for created queues, in seconds.
    pub visibility_timeout_secs: u32,
    /// Messages per receive call (1-10).
    pub receive_batch_size: usize,
    /// Long-poll wait per receive call, in seconds.
    pub receive_wait_secs: u32,
    /// Back-off after a failed receive call.
    pub receive_retry_delay_ms: u64,
    /// Back-off while an input queue does not exist yet.
    pub queue_wait_delay_ms: u64,
    /// Behaviour when publishing an output fails.
    pub publish_failure: PublishFailurePolicy,
    /// Wait for all tasks dispatched in an iteration before draining.
    /// When false, late results carry over to the next iteration.
    pub wait_for_batch: bool,
    /// Broker connection settings.
    pub broker: BrokerConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            name: String::new(),
            fifo: false,
            inputs: Vec::new(),
            workers: 1,
            priority_tiers: 1,
            terminal: false,
            interval: PollInterval::default(),
            ignore_none: false,
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
            receive_batch_size: MAX_RECEIVE_BATCH,
            receive_wait_secs: 1,
            receive_retry_delay_ms: 1000,
            queue_wait_delay_ms: 2000,
            publish_failure: PublishFailurePolicy::BestEffort,
            wait_for_batch: true,
            broker: BrokerConfig::default(),
        }
    }
}

impl StageConfig {
    /// Creates a config for stage `name` in `domain` with defaults.
    #[must_use]
    pub fn new(domain: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parses a JSON config.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Sets the input queues, highest priority first.
    #[must_use]
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the number of workers.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the number of output priority tiers.
    #[must_use]
    pub fn with_priority_tiers(mut self, tiers: usize) -> Self {
        self.priority_tiers = tiers;
        self
    }

    /// Marks the stage as using FIFO queues.
    #[must_use]
    pub fn fifo(mut self) -> Self {
        self.fifo = true;
        self
    }

    /// Marks the stage as terminal.
    #[must_use]
    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Sets the source polling interval.
    #[must_use]
    pub fn with_interval(mut self, interval: PollInterval) -> Self {
        self.interval = interval;
        self
    }

    /// Stops `null` results from being forwarded.
    #[must_use]
    pub fn ignore_none(mut self) -> Self {
        self.ignore_none = true;
        self
    }

    /// Sets the visibility timeout for created queues.
    #[must_use]
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout_secs = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);
        self
    }

    /// Sets the receive batch size, clamped to the broker limit.
    #[must_use]
    pub fn with_receive_batch_size(mut self, size: usize) -> Self {
        self.receive_batch_size = size.clamp(1, MAX_RECEIVE_BATCH);
        self
    }

    /// Sets the long-poll wait per receive call.
    #[must_use]
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait_secs = u32::try_from(wait.as_secs()).unwrap_or(20).min(20);
        self
    }

    /// Sets the back-off delays for receive failures and missing queues.
    #[must_use]
    pub fn with_retry_delays(mut self, receive_retry: Duration, queue_wait: Duration) -> Self {
        self.receive_retry_delay_ms = duration_millis(receive_retry);
        self.queue_wait_delay_ms = duration_millis(queue_wait);
        self
    }

    /// Sets the publish failure policy.
    #[must_use]
    pub fn with_publish_failure(mut self, policy: PublishFailurePolicy) -> Self {
        self.publish_failure = policy;
        self
    }

    /// Drains without waiting for the iteration's tasks; their results
    /// arrive with a later iteration.
    #[must_use]
    pub fn carry_over(mut self) -> Self {
        self.wait_for_batch = false;
        self
    }

    /// Sets the broker settings.
    #[must_use]
    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    /// Returns true if the stage has no input queues.
    #[must_use]
    pub fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Messages requested per receive call.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.receive_batch_size.clamp(1, MAX_RECEIVE_BATCH)
    }

    /// Back-off after a failed receive call.
    #[must_use]
    pub fn receive_retry_delay(&self) -> Duration {
        Duration::from_millis(self.receive_retry_delay_ms)
    }

    /// Back-off while an input queue does not exist.
    #[must_use]
    pub fn queue_wait_delay(&self) -> Duration {
        Duration::from_millis(self.queue_wait_delay_ms)
    }

    /// Validates the config and every queue name it produces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::invalid("domain", "cannot be empty"));
        }
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "cannot be empty"));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.receive_batch_size == 0 || self.receive_batch_size > MAX_RECEIVE_BATCH {
            return Err(ConfigError::invalid(
                "receive_batch_size",
                format!("must be between 1 and {MAX_RECEIVE_BATCH}"),
            ));
        }

        let topology = QueueTopology::from_config(self);
        topology.validate()?;
        for input in &self.inputs {
            QueueTopology::validate_name(input)?;
        }
        Ok(())
    }
}
