use anyhow::Result;
use delivery_rpc::service::DeliveryService;
use delivery_rpc::{RPC_LISTEN_ADDR, env_or, init_tracing};
use rpcmux::interceptor::{InterceptorChain, LoggingInterceptor};
use rpcmux::server::{RpcServer, RpcServerConfig};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let addr = env_or("RPC_LISTEN_ADDR", RPC_LISTEN_ADDR);

    let interceptors = InterceptorChain::new()
        .unary(LoggingInterceptor::new())
        .stream(LoggingInterceptor::new());
    let mut server = RpcServer::new(RpcServerConfig::default()).with_interceptors(interceptors);
    DeliveryService::new().register(&mut server)?;

    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "Delivery server starting");

    let router = server.into_router();
    tokio::select! {
        result = router.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
