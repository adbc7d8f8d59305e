use std::time::Duration;

use anyhow::Result;
use delivery_rpc::proto::{
    ADD_PACKAGES, GET_NEW_PACKAGES, GET_PACKAGE_INFO, GET_PACKAGES, GetPackageInfoRequest, Package,
};
use delivery_rpc::{GRPC_SERVER_ENDPOINT, env_or, init_tracing};
use rpcmux::client::{RpcClient, RpcClientConfig};
use rpcmux::interceptor::{InterceptorChain, LoggingInterceptor};
use tracing::info;

const CLIENT_STREAM_PACING: Duration = Duration::from_millis(500);
const BIDI_PACING: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let endpoint = env_or("GRPC_SERVER_ENDPOINT", GRPC_SERVER_ENDPOINT);

    let client = RpcClient::connect(RpcClientConfig::new(endpoint))
        .await?
        .with_interceptors(InterceptorChain::new().unary(LoggingInterceptor::new()));

    unary(&client).await?;
    server_streaming(&client).await?;
    client_streaming(&client).await?;
    bidi_streaming(&client).await?;
    Ok(())
}

async fn unary(client: &RpcClient) -> Result<()> {
    info!("Unary RPC: GetPackageInfo");
    let response = client
        .unary(&GET_PACKAGE_INFO, GetPackageInfoRequest { id: 42 })
        .await?;
    info!(package = ?response.package, "Response");
    Ok(())
}

async fn server_streaming(client: &RpcClient) -> Result<()> {
    info!("Server streaming RPC: GetNewPackages");
    let mut packages = client
        .server_streaming(&GET_NEW_PACKAGES, GetPackageInfoRequest { id: 100 })
        .await?;
    while let Some(package) = packages.message().await? {
        info!(?package, "Received");
    }
    Ok(())
}

async fn client_streaming(client: &RpcClient) -> Result<()> {
    info!("Client streaming RPC: AddPackages");
    let mut call = client.client_streaming(&ADD_PACKAGES).await?;
    for i in 1..=3 {
        let package = Package {
            id: i,
            description: "Client-streamed package".to_string(),
            weight_kg: i as f32 * 1.1,
            ..Default::default()
        };
        info!(?package, "Sending package");
        call.send(package).await?;
        tokio::time::sleep(CLIENT_STREAM_PACING).await;
    }
    let response = call.close_and_recv().await?;
    info!(added_count = response.added_count, "AddPackages response");
    Ok(())
}

async fn bidi_streaming(client: &RpcClient) -> Result<()> {
    info!("Bidirectional streaming RPC: GetPackages");
    let (mut requests, mut responses) = client.bidi_streaming(&GET_PACKAGES).await?.split();

    let receiver = tokio::spawn(async move {
        while let Some(response) = responses.message().await? {
            info!(package = ?response.package, "Received response");
        }
        info!("Server closed the stream");
        Ok::<_, rpcmux::Status>(())
    });

    for i in 1..=3 {
        let request = GetPackageInfoRequest { id: i * 10 };
        info!(?request, "Sending request");
        requests.send(request).await?;
        tokio::time::sleep(BIDI_PACING).await;
    }
    requests.close().await?;
    receiver.await??;
    Ok(())
}
