//! Queue name derivation for a stage.
//!
//! Names follow `{domain}-{stage}[--p{tier}][.fifo]`. Tier 0 carries no
//! priority suffix.

use crate::config::StageConfig;
use crate::errors::ConfigError;
use regex::Regex;
use std::ops::Range;
use std::sync::{LazyLock, OnceLock};

/// Suffix the broker requires on ordered queues.
pub const FIFO_SUFFIX: &str = ".fifo";

/// Longest queue name the broker accepts.
pub const MAX_QUEUE_NAME_LEN: usize = 80;

#[allow(clippy::expect_used)]
static QUEUE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+(\.fifo)?$").expect("queue name pattern is valid")
});

/// The queue names a stage reads from and publishes to.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    domain: String,
    stage: String,
    fifo: bool,
    priority_tiers: usize,
    terminal: bool,
    output_names: OnceLock<Vec<String>>,
}

impl QueueTopology {
    /// Creates a topology.
    #[must_use]
    pub fn new(
        domain: impl Into<String>,
        stage: impl Into<String>,
        fifo: bool,
        priority_tiers: usize,
        terminal: bool,
    ) -> Self {
        Self {
            domain: domain.into(),
            stage: stage.into(),
            fifo,
            priority_tiers,
            terminal,
            output_names: OnceLock::new(),
        }
    }

    /// Creates the topology described by a stage config.
    #[must_use]
    pub fn from_config(config: &StageConfig) -> Self {
        Self::new(
            config.domain.clone(),
            config.name.clone(),
            config.fifo,
            config.priority_tiers,
            config.terminal,
        )
    }

    /// Returns `{domain}-{stage}`.
    #[must_use]
    pub fn base_name(&self) -> String {
        format!("{}-{}", self.domain, self.stage)
    }

    /// Returns whether the stage uses FIFO queues.
    #[must_use]
    pub const fn is_fifo(&self) -> bool {
        self.fifo
    }

    /// Returns the queue name for a priority tier.
    #[must_use]
    pub fn queue_name(&self, priority: usize) -> String {
        let mut name = self.base_name();
        if priority > 0 {
            name.push_str("--p");
            name.push_str(&priority.to_string());
        }
        if self.fifo {
            name.push_str(FIFO_SUFFIX);
        }
        name
    }

    /// The configured priority tiers. Empty when none are configured.
    #[must_use]
    pub const fn priority_levels(&self) -> Range<usize> {
        0..self.priority_tiers
    }

    /// Number of output queues this stage publishes to.
    ///
    /// A non-terminal stage always has at least its base queue.
    #[must_use]
    pub fn tier_count(&self) -> usize {
        if self.terminal {
            0
        } else {
            self.priority_tiers.max(1)
        }
    }

    /// Output queue names indexed by tier (index 0 is tier 0).
    ///
    /// Computed on first access and memoized.
    pub fn output_queue_names(&self) -> &[String] {
        self.output_names.get_or_init(|| {
            (0..self.tier_count())
                .map(|tier| self.queue_name(tier))
                .collect()
        })
    }

    /// Checks every output queue name against the broker's naming rules.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::validate_name(&self.queue_name(0))?;
        for name in self.output_queue_names() {
            Self::validate_name(name)?;
        }
        Ok(())
    }

    /// Checks a single queue name against the broker's naming rules.
    pub fn validate_name(name: &str) -> Result<(), ConfigError> {
        if name.len() > MAX_QUEUE_NAME_LEN || !QUEUE_NAME.is_match(name) {
            return Err(ConfigError::InvalidQueueName(name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tier_zero_has_no_suffix() {
        for tiers in [0, 1, 5] {
            for fifo in [false, true] {
                let topology = QueueTopology::new("shop", "resize", fifo, tiers, false);
                let name = topology.queue_name(0);

                assert!(!name.contains("--p"), "{name}");
                assert_eq!(name.ends_with(".fifo"), fifo, "{name}");
            }
        }
    }

    #[test]
    fn test_higher_tiers_have_suffix() {
        for fifo in [false, true] {
            let topology = QueueTopology::new("shop", "resize", fifo, 5, false);
            for tier in 1..5 {
                let name = topology.queue_name(tier);

                assert!(name.contains(&format!("--p{tier}")), "{name}");
                assert_eq!(name.ends_with(".fifo"), fifo, "{name}");
            }
        }
    }

    #[test]
    fn test_output_names_indexed_by_tier() {
        let topology = QueueTopology::new("shop", "resize", false, 3, false);

        assert_eq!(
            topology.output_queue_names(),
            ["shop-resize", "shop-resize--p1", "shop-resize--p2"]
        );
    }

    #[test]
    fn test_fifo_output_names() {
        let topology = QueueTopology::new("shop", "resize", true, 2, false);

        assert_eq!(
            topology.output_queue_names(),
            ["shop-resize.fifo", "shop-resize--p1.fifo"]
        );
    }

    #[test]
    fn test_zero_tiers() {
        let topology = QueueTopology::new("shop", "resize", false, 0, false);

        assert!(topology.priority_levels().is_empty());
        assert_eq!(topology.output_queue_names(), ["shop-resize"]);
    }

    #[test]
    fn test_terminal_has_no_outputs() {
        for tiers in [0, 1, 5] {
            let topology = QueueTopology::new("shop", "store", false, tiers, true);
            assert!(topology.output_queue_names().is_empty());
            assert_eq!(topology.tier_count(), 0);
        }
    }

    #[test]
    fn test_output_names_memoized() {
        let topology = QueueTopology::new("shop", "resize", false, 2, false);
        let first = topology.output_queue_names().as_ptr();
        let second = topology.output_queue_names().as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    fn test_validate_name() {
        assert!(QueueTopology::validate_name("shop-resize--p1.fifo").is_ok());
        assert!(QueueTopology::validate_name("shop_resize").is_ok());
        assert!(QueueTopology::validate_name("shop resize").is_err());
        assert!(QueueTopology::validate_name("").is_err());
        assert!(QueueTopology::validate_name(&"x".repeat(81)).is_err());
    }
}
