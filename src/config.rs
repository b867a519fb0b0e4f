//! Runtime configuration for flow applications
//!
//! `FlowConfig` and `RpcConfig` follow a builder style with sensible
//! defaults, and can be overlaid from environment variables.

use std::time::Duration;

/// Default byte limit for mirrored log events (512 KiB)
pub const DEFAULT_MAX_EVENT_SIZE_BYTES: usize = 512 * 1024;

/// How `destroy` ends the hosting process
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExitMode {
    /// Never exit the process; used by tests and embedding hosts
    #[default]
    Embedded,
    /// Call `std::process::exit` once cleanup is complete
    Process,
}

/// Configuration for a flow application
#[derive(Clone, Debug)]
pub struct FlowConfig {
    /// Serialized size above which the mirrored log copy of an event is truncated
    pub max_event_size_bytes: usize,
    /// Backlog size that triggers a warning (and every further multiple of it)
    pub backlog_size_threshold: usize,
    /// Time without progress that triggers a latency warning (escalating)
    pub backlog_latency_threshold: Duration,
    /// How often the backlog watchdog checks for latency warnings
    pub backlog_check_interval: Duration,
    /// Wait before closing the transport on destroy, so log events can flush
    pub shutdown_grace: Duration,
    /// Whether destroy exits the process
    pub exit_mode: ExitMode,
    /// Capacity of the broadcast channel backing event taps
    pub tap_capacity: usize,
    /// Whether lifecycle notifications are published
    pub lifecycle_events: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_event_size_bytes: DEFAULT_MAX_EVENT_SIZE_BYTES,
            backlog_size_threshold: 1000,
            backlog_latency_threshold: Duration::from_secs(30),
            backlog_check_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_millis(250),
            exit_mode: ExitMode::Embedded,
            tap_capacity: 1024,
            lifecycle_events: true,
        }
    }
}

impl FlowConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay values from `FLOW_*` environment variables onto the defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("FLOW_MAX_EVENT_SIZE_BYTES") {
            config.max_event_size_bytes = v;
        }
        if let Some(v) = env_parse::<usize>("FLOW_BACKLOG_SIZE_THRESHOLD") {
            config.backlog_size_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("FLOW_BACKLOG_LATENCY_MS") {
            config.backlog_latency_threshold = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("FLOW_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(v);
        }
        if let Some(true) = env_parse::<bool>("FLOW_EXIT_ON_DESTROY") {
            config.exit_mode = ExitMode::Process;
        }
        config
    }

    /// Set the mirrored event size limit
    pub fn max_event_size_bytes(mut self, bytes: usize) -> Self {
        self.max_event_size_bytes = bytes;
        self
    }

    /// Set the backlog size warning threshold (minimum 1)
    pub fn backlog_size_threshold(mut self, size: usize) -> Self {
        self.backlog_size_threshold = size.max(1);
        self
    }

    /// Set the backlog latency warning threshold
    pub fn backlog_latency_threshold(mut self, threshold: Duration) -> Self {
        self.backlog_latency_threshold = threshold;
        self
    }

    /// Set the backlog watchdog interval
    pub fn backlog_check_interval(mut self, interval: Duration) -> Self {
        self.backlog_check_interval = interval;
        self
    }

    /// Set the shutdown grace period
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the exit mode
    pub fn exit_mode(mut self, mode: ExitMode) -> Self {
        self.exit_mode = mode;
        self
    }

    /// Set the event tap capacity
    pub fn tap_capacity(mut self, capacity: usize) -> Self {
        self.tap_capacity = capacity.max(1);
        self
    }

    /// Enable or disable lifecycle notifications
    pub fn lifecycle_events(mut self, enabled: bool) -> Self {
        self.lifecycle_events = enabled;
        self
    }
}

/// Configuration for the RPC bridge
#[derive(Clone, Debug, Default)]
pub struct RpcConfig {
    /// Reject calls whose serialized arguments exceed this size
    pub max_message_size: Option<usize>,
    /// Warn about calls whose serialized arguments exceed this size
    pub warn_message_size: Option<usize>,
    /// Give up on a call after this long
    pub call_timeout: Option<Duration>,
}

impl RpcConfig {
    /// Create a config without size guards or timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `MAX_RPC_MSG_SIZE_BYTES`, `WARN_RPC_MSG_SIZE_BYTES` and `RPC_CALL_TIMEOUT_MS`
    pub fn from_env() -> Self {
        Self {
            max_message_size: env_parse("MAX_RPC_MSG_SIZE_BYTES"),
            warn_message_size: env_parse("WARN_RPC_MSG_SIZE_BYTES"),
            call_timeout: env_parse::<u64>("RPC_CALL_TIMEOUT_MS").map(Duration::from_millis),
        }
    }

    /// Set the hard size limit
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = Some(bytes);
        self
    }

    /// Set the warning size limit
    pub fn warn_message_size(mut self, bytes: usize) -> Self {
        self.warn_message_size = Some(bytes);
        self
    }

    /// Set the call timeout
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
