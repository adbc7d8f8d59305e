use crate::connection::ConnectionConfig;
use crate::frame::DEFAULT_MAX_FRAME_LENGTH;

/// Configuration for the RPC server.
#[derive(Debug, Clone)]
pub struct RpcServerConfig {
    /// Messages each call buffers from its client before the client must wait
    /// for credit.
    pub window: u32,

    /// Messages a handler may queue ahead of the connection before `send`
    /// suspends.
    pub outbound_capacity: usize,

    /// Upper bound for a single frame on the wire.
    pub max_frame_length: usize,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            window: 16,
            outbound_capacity: 16,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl RpcServerConfig {
    /// Set the per-call receive window.
    pub fn with_window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }

    /// Set the per-call outbound queue capacity.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    /// Set the maximum frame length.
    pub fn with_max_frame_length(mut self, length: usize) -> Self {
        self.max_frame_length = length;
        self
    }

    pub(crate) fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            window: self.window,
            outbound_capacity: self.outbound_capacity,
            max_frame_length: self.max_frame_length,
            ..ConnectionConfig::default()
        }
    }
}
