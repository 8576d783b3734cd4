use std::time::Duration;

use stp_frame::FrameConfig;

use crate::handshake::HandshakeConfig;

/// Runtime tunables for a connection.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Frame size limits. Read/write timeouts are ignored by the reactor,
    /// which runs the socket non-blocking.
    pub frame: FrameConfig,
    /// Service negotiation settings.
    pub handshake: HandshakeConfig,
    /// Deadline for calls that do not pass an explicit timeout.
    pub default_timeout: Duration,
    /// TCP connect timeout per resolved address.
    pub connect_timeout: Duration,
    /// Upper bound on calls waiting for a response at once.
    pub max_pending_calls: usize,
    /// Capacity of the queue between the reactor and the event thread.
    /// Events arriving while it is full are dropped with a warning.
    pub event_queue_capacity: usize,
    /// Handlers running longer than this are reported.
    pub event_handler_budget: Duration,
    /// Bytes read from the socket per `read` call.
    pub read_chunk_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            handshake: HandshakeConfig::default(),
            default_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_pending_calls: 4096,
            event_queue_capacity: 1024,
            event_handler_budget: Duration::from_millis(50),
            read_chunk_size: 16 * 1024,
        }
    }
}

impl RuntimeConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.frame.max_frame_size = max;
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity.max(1);
        self
    }
}
