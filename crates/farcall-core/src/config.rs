//! Centralized configuration for farcall.
//!
//! Compile-time defaults live on unit structs as associated constants; the
//! option structs below carry the values that callers may tune at runtime.

use std::time::Duration;

/// Wire framing parameters.
pub struct ProtocolConfig;

impl ProtocolConfig {
    pub const START_MARKER: [u8; 4] = [0x46, 0x43, 0x52, 0x50]; // "FCRP"
    pub const VERSION: u16 = 0x0001;
    pub const MAX_PACKET_SIZE: usize = 1024 * 1024; // 1 MiB
    pub const READ_BUFFER_SIZE: usize = 64 * 1024;
}

/// Request/response handler timing.
pub struct HandlerConfig;

impl HandlerConfig {
    pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(15);
    /// Bounded wait used whenever teardown must wait for a task to finish.
    pub const DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CANCEL_SEND_TIMEOUT: Duration = Duration::from_secs(1);
    pub const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Channel state machine and reconnection defaults.
pub struct ChannelConfig;

impl ChannelConfig {
    pub const REOPEN_INTERVAL: Duration = Duration::from_secs(5);
    pub const EVENT_CAPACITY: usize = 64;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Service host limits.
pub struct HostConfig;

impl HostConfig {
    pub const MAX_CONNECTIONS: usize = 256;
}

/// Options for an [`RpcHandler`](crate::handler::RpcHandler).
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    /// How long `request` waits for a matching reply.
    pub answer_timeout: Duration,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            answer_timeout: HandlerConfig::ANSWER_TIMEOUT,
        }
    }
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.answer_timeout = timeout;
        self
    }
}

/// Options for a [`RestorableChannel`](crate::channel::RestorableChannel).
#[derive(Debug, Clone)]
pub struct RestorableOptions {
    /// Reconnect automatically when the underlying channel faults.
    pub auto_reopen: bool,
    /// Delay between full passes over the factory list while reconnecting.
    pub reopen_interval: Duration,
    /// Start every connection pass from the first factory instead of the
    /// factory that connected last.
    pub reset_on_success: bool,
}

impl Default for RestorableOptions {
    fn default() -> Self {
        Self {
            auto_reopen: true,
            reopen_interval: ChannelConfig::REOPEN_INTERVAL,
            reset_on_success: true,
        }
    }
}

impl RestorableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_reopen(mut self, auto_reopen: bool) -> Self {
        self.auto_reopen = auto_reopen;
        self
    }

    pub fn with_reopen_interval(mut self, interval: Duration) -> Self {
        self.reopen_interval = interval;
        self
    }

    pub fn with_reset_on_success(mut self, reset: bool) -> Self {
        self.reset_on_success = reset;
        self
    }
}

/// Options for an [`RpcClient`](crate::client::RpcClient).
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub handler: HandlerOptions,
    pub restorable: RestorableOptions,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answer_timeout(mut self, timeout: Duration) -> Self {
        self.handler.answer_timeout = timeout;
        self
    }

    pub fn with_auto_reopen(mut self, auto_reopen: bool) -> Self {
        self.restorable.auto_reopen = auto_reopen;
        self
    }

    pub fn with_reopen_interval(mut self, interval: Duration) -> Self {
        self.restorable.reopen_interval = interval;
        self
    }

    pub fn with_reset_on_success(mut self, reset: bool) -> Self {
        self.restorable.reset_on_success = reset;
        self
    }
}
