#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use bon::Builder;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_MAX_MISSED_PONGS: u32 = 3;
const DEFAULT_BASE_INTERVAL_DURATION: Duration = Duration::from_secs(3);
const DEFAULT_MAX_DELAY_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_RESTART_DELAY_DURATION: Duration = Duration::from_millis(100);
const DEFAULT_MIN_SEND_INTERVAL_DURATION: Duration = Duration::from_millis(100);
const DEFAULT_FLUSH_INTERVAL_DURATION: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BATCH_SIZE: usize = 10;
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;
const DEFAULT_WRITE_TIMEOUT_DURATION: Duration = Duration::from_secs(10);

/// Configuration for WebSocket client behavior.
///
/// ```
/// use std::time::Duration;
///
/// use resilient_ws::ws::config::{Config, ReconnectConfig};
///
/// let config = Config::builder()
///     .heartbeat_interval(Duration::from_secs(10))
///     .reconnect(ReconnectConfig::builder().max_attempts(3).build())
///     .build();
///
/// assert_eq!(config.max_missed_pongs, 3);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Interval for sending PING messages to keep connection alive
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat intervals without a PONG before the connection is treated as dead
    #[builder(default = DEFAULT_MAX_MISSED_PONGS)]
    pub max_missed_pongs: u32,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Outbound throttling and batching configuration
    #[builder(default)]
    pub batch: BatchConfig,
    /// Capacity of the channel fanning inbound messages out to subscribers
    #[builder(default = DEFAULT_BROADCAST_CAPACITY)]
    pub broadcast_capacity: usize,
    /// How long a single frame write may block before the connection is
    /// treated as failed
    #[builder(default = DEFAULT_WRITE_TIMEOUT_DURATION)]
    pub write_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt, and the fixed delay when
    /// `exponential` is off
    #[builder(default = DEFAULT_BASE_INTERVAL_DURATION)]
    pub base_interval: Duration,
    /// Upper bound for exponential delays
    #[builder(default = DEFAULT_MAX_DELAY_DURATION)]
    pub max_delay: Duration,
    /// Maximum number of consecutive reconnection attempts before giving up
    #[builder(default = DEFAULT_MAX_RECONNECT_ATTEMPTS)]
    pub max_attempts: u32,
    /// Double the delay on every attempt instead of using `base_interval` each time
    #[builder(default = true)]
    pub exponential: bool,
    /// Pause between the disconnect and connect halves of a manual reconnect
    #[builder(default = DEFAULT_RESTART_DELAY_DURATION)]
    pub restart_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration for outbound throttling.
///
/// Messages sent closer together than `min_send_interval` are queued, and the
/// queue is drained every `flush_interval`, at most `max_batch_size` per tick.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct BatchConfig {
    #[builder(default = DEFAULT_MIN_SEND_INTERVAL_DURATION)]
    pub min_send_interval: Duration,
    #[builder(default = DEFAULT_FLUSH_INTERVAL_DURATION)]
    pub flush_interval: Duration,
    #[builder(default = DEFAULT_MAX_BATCH_SIZE)]
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
