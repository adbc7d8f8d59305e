use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::frame::DEFAULT_MAX_FRAME_LENGTH;

/// Configuration for the RPC client.
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Server address, `host:port`.
    pub endpoint: String,

    /// Messages each call buffers from the server before the server must wait
    /// for credit.
    pub window: u32,

    /// Messages a call may queue ahead of the connection before `send`
    /// suspends.
    pub outbound_capacity: usize,

    /// Upper bound for a single frame on the wire.
    pub max_frame_length: usize,

    /// Deadline applied to every call. `None` means calls never time out.
    pub timeout: Option<Duration>,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:50051".to_string(),
            window: 16,
            outbound_capacity: 16,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            timeout: None,
        }
    }
}

impl RpcClientConfig {
    /// Create a new config for the given endpoint.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

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

    /// Set the deadline applied to every call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
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
