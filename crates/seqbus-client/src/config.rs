//! Client configuration.
//!
//! Plain builder structs; loading from files or CLI flags is out of scope
//! for this crate.

use seqbus_core::BufferConfig;
use std::time::Duration;

/// Protocol version sent on every relay request.
pub const PROTOCOL_VERSION: u16 = 4;

/// Retry and backoff settings for the puller.
///
/// Request-phase failures (could not transmit at all) and response-phase
/// failures (timeout, disconnect, malformed payload) are budgeted
/// independently; a successful full cycle resets both counters.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Initial backoff sleep once every candidate relay has been tried
    pub init_sleep: Duration,
    /// Backoff ceiling
    pub max_sleep: Duration,
    /// Multiplier applied per backoff round
    pub backoff_multiplier: f64,
    /// Jitter fraction (0.0..=1.0) applied to each sleep
    pub jitter: f64,
    /// Budget for send-side (`*RequestError`) failures
    pub max_request_retries: u32,
    /// Budget for response-side (`*ResponseError`) failures
    pub max_response_retries: u32,
    /// Timeout for `/sources` and `/register` round trips
    pub request_timeout: Duration,
    /// Timeout for a single read on the `/stream` body
    pub stream_read_timeout: Duration,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            init_sleep: Duration::from_millis(100),
            max_sleep: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: 0.25,
            max_request_retries: 10,
            max_response_retries: 10,
            request_timeout: Duration::from_secs(10),
            stream_read_timeout: Duration::from_secs(30),
        }
    }
}

/// Dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Budget for consumer callbacks returning ERROR, independent of the
    /// puller's network budgets
    pub max_consumer_retries: u32,
    /// Delay before re-invoking a failed callback
    pub consumer_retry_delay: Duration,
    /// Persist the checkpoint every N completed windows
    pub checkpoint_interval: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_consumer_retries: 5,
            consumer_retry_delay: Duration::from_millis(50),
            checkpoint_interval: 1,
        }
    }
}

/// `/stream` request parameters.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Requested response size in bytes (`size` query parameter)
    pub fetch_size: usize,
    /// Ask the relay to start from its most recent window when the
    /// checkpoint is flexible
    pub stream_from_latest_scn: bool,
    /// Highest event version this client understands
    pub max_event_version: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fetch_size: 1024 * 1024,
            stream_from_latest_scn: false,
            max_event_version: 2,
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Pull/retry settings
    pub pull: PullConfig,
    /// Dispatch settings
    pub dispatch: DispatchConfig,
    /// `/stream` request settings
    pub stream: StreamConfig,
    /// Staging buffer limits
    pub buffer: BufferConfig,
}

impl ClientConfig {
    /// Create a builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Initial backoff sleep.
    pub fn init_sleep(mut self, d: Duration) -> Self {
        self.config.pull.init_sleep = d;
        self
    }

    /// Backoff ceiling.
    pub fn max_sleep(mut self, d: Duration) -> Self {
        self.config.pull.max_sleep = d;
        self
    }

    /// Send-side retry budget.
    pub fn max_request_retries(mut self, n: u32) -> Self {
        self.config.pull.max_request_retries = n;
        self
    }

    /// Response-side retry budget.
    pub fn max_response_retries(mut self, n: u32) -> Self {
        self.config.pull.max_response_retries = n;
        self
    }

    /// Timeout for `/sources` and `/register` round trips.
    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.config.pull.request_timeout = d;
        self
    }

    /// Timeout for a single read on the `/stream` body.
    pub fn stream_read_timeout(mut self, d: Duration) -> Self {
        self.config.pull.stream_read_timeout = d;
        self
    }

    /// Consumer-callback retry budget.
    pub fn max_consumer_retries(mut self, n: u32) -> Self {
        self.config.dispatch.max_consumer_retries = n;
        self
    }

    /// Checkpoint persistence interval in windows.
    pub fn checkpoint_interval(mut self, windows: u32) -> Self {
        self.config.dispatch.checkpoint_interval = windows;
        self
    }

    /// Requested `/stream` response size in bytes.
    pub fn fetch_size(mut self, bytes: usize) -> Self {
        self.config.stream.fetch_size = bytes;
        self
    }

    /// Stream from the relay's most recent window when the checkpoint is
    /// flexible.
    pub fn stream_from_latest_scn(mut self, v: bool) -> Self {
        self.config.stream.stream_from_latest_scn = v;
        self
    }

    /// Maximum undelivered events staged in the buffer.
    pub fn max_staged_events(mut self, n: usize) -> Self {
        self.config.buffer.max_staged_events = n;
        self
    }

    /// Finish the builder.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}
