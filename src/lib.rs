pub mod gateway;
pub mod proto;
pub mod service;
pub mod validation;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

pub const RPC_LISTEN_ADDR: &str = "0.0.0.0:50051";
pub const GRPC_SERVER_ENDPOINT: &str = "127.0.0.1:50051";
pub const GATEWAY_LISTEN_ADDR: &str = "0.0.0.0:16081";

/// Read `name` from the environment, falling back to `default`.
pub fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}
