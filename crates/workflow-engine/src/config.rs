//! Engine configuration
//!
//! Settings the executor applies on top of what the graph declares.
//! Stored as camelCase JSON; missing fields take their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;
use crate::loops::DEFAULT_MAX_ITERATIONS;

/// Retry settings for failed activities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts per node, the first one included (1 = no retries)
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub backoff_ms: u64,
    /// Factor applied to the delay after every retry
    pub backoff_multiplier: f64,
    /// Upper bound on the delay in milliseconds
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
            backoff_multiplier: 2.0,
            max_backoff_ms: 30000,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a node that has already been retried `retries` times may be
    /// tried again
    pub fn allows_retry(&self, retries: u32) -> bool {
        retries.saturating_add(1) < self.max_attempts
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16) as i32;
        let delay = self.backoff_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let capped = delay.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Overrides the graph's admission limit when set
    pub max_concurrent_nodes: Option<usize>,
    /// Iteration limit for loops that declare none
    pub default_max_iterations: u32,
    /// Retry settings for failed activities
    pub retry: RetryPolicy,
    /// Emit `ExecutionProgress` after every terminal transition
    pub emit_progress_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: None,
            default_max_iterations: DEFAULT_MAX_ITERATIONS,
            retry: RetryPolicy::default(),
            emit_progress_events: true,
        }
    }
}

impl EngineConfig {
    /// Parse configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file. A missing file yields the
    /// defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No engine config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).await?;
        let config = Self::from_json_str(&contents)?;
        log::info!("Loaded engine config from {:?}", path);
        Ok(config)
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the admission limit
    pub fn with_max_concurrent_nodes(mut self, max: usize) -> Self {
        self.max_concurrent_nodes = Some(max.max(1));
        self
    }
}
