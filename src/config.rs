use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_BLOCK_SIZE: u32 = 16384; // 16KB blocks
const MAX_BLOCK_SIZE: u32 = 131072;

/// Lowest first-failure backoff the engine will ever use.
pub const MIN_BACKOFF: Duration = Duration::from_millis(1000);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Exponential reconnect backoff.
///
/// `delay(0)` is zero; `delay(n)` is `base * 2^(n-1)` capped at `max`.
/// The base is never below [`MIN_BACKOFF`], even if configured lower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        let base = base.max(MIN_BACKOFF);
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Wait required after `failures` consecutive connect failures.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        // 2^31 seconds is far past any sane cap, so stop doubling there.
        let exponent = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(MIN_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

/// Tunables for one torrent's download engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on connecting + connected peers.
    pub max_connections: usize,
    /// Outstanding block requests allowed per peer.
    pub pipeline_depth: usize,
    pub block_size: u32,
    /// Minimum time between two effective orchestrator runs.
    pub tick_interval: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// How long an active piece may sit without contributors before it is abandoned.
    pub stall_threshold: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            pipeline_depth: 5,
            block_size: DEFAULT_BLOCK_SIZE,
            tick_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            stall_threshold: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_pipeline_depth(mut self, pipeline_depth: usize) -> Self {
        self.pipeline_depth = pipeline_depth;
        self
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_stall_threshold(mut self, stall_threshold: Duration) -> Self {
        self.stall_threshold = stall_threshold;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = BackoffPolicy::new(base, max);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Zero("max_connections"));
        }
        if self.pipeline_depth == 0 {
            return Err(ConfigError::Zero("pipeline_depth"));
        }
        if self.block_size == 0 {
            return Err(ConfigError::Zero("block_size"));
        }
        if self.block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::BlockTooLarge(self.block_size));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Zero("connect_timeout"));
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Zero("request_timeout"));
        }
        Ok(())
    }
}
