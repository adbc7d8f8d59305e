use anyhow::Result;
use delivery_rpc::gateway::delivery_gateway;
use delivery_rpc::{GATEWAY_LISTEN_ADDR, GRPC_SERVER_ENDPOINT, env_or, init_tracing};
use rpcmux::client::{RpcClient, RpcClientConfig};
use rpcmux::gateway::{GatewayConfig, StreamFormat};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let endpoint = env_or("GRPC_SERVER_ENDPOINT", GRPC_SERVER_ENDPOINT);
    let listen_addr = env_or("GATEWAY_LISTEN_ADDR", GATEWAY_LISTEN_ADDR);
    let stream_format = match env_or("GATEWAY_STREAM_FORMAT", "array").as_str() {
        "ndjson" => StreamFormat::NewlineDelimited,
        _ => StreamFormat::JsonArray,
    };

    let client = RpcClient::connect(RpcClientConfig::new(endpoint)).await?;
    let config = GatewayConfig::new(listen_addr).with_stream_format(stream_format);
    let listener = TcpListener::bind(&config.listen_addr).await?;

    delivery_gateway(client, config)?.serve(listener).await?;
    Ok(())
}
