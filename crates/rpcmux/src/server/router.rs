use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::connection::{Acceptor, Connection};
use crate::error::RpcError;
use crate::frame::Open;
use crate::interceptor::InterceptorChain;
use crate::server::config::RpcServerConfig;
use crate::server::handler::ErasedHandler;
use crate::session::Role;

/// The immutable dispatch table built from an [`RpcServer`](super::RpcServer).
///
/// Serves any number of connections concurrently.
pub struct RpcRouter {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
    interceptors: Arc<InterceptorChain>,
    config: RpcServerConfig,
}

impl RpcRouter {
    pub(crate) fn new(
        handlers: HashMap<String, Arc<dyn ErasedHandler>>,
        interceptors: InterceptorChain,
        config: RpcServerConfig,
    ) -> Self {
        Self {
            handlers,
            interceptors: Arc::new(interceptors),
            config,
        }
    }

    /// Serve calls on one connection until the peer goes away. Dropping the
    /// returned future closes the connection.
    pub async fn serve_connection<IO>(self: &Arc<Self>, io: IO)
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let acceptor: Arc<dyn Acceptor> = Arc::clone(self) as Arc<dyn Acceptor>;
        let connection = Connection::spawn(io, self.config.connection(), Some(acceptor));
        let _close = connection.close_on_drop();
        connection.closed().await;
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), RpcError> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// accepted keep running until their peers disconnect.
    pub async fn serve_with_shutdown<F>(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<(), RpcError>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, methods = self.handlers.len(), "RPC server listening");
        }
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => {
                    info!("RPC server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            if let Err(err) = stream.set_nodelay(true) {
                debug!(%peer, error = %err, "Failed to set TCP_NODELAY");
            }
            info!(%peer, "Accepted connection");

            let router = Arc::clone(&self);
            tokio::spawn(async move {
                router.serve_connection(stream).await;
                info!(%peer, "Connection closed");
            });
        }
    }

    /// Check if a handler is registered for the given method path.
    pub fn has_handler(&self, path: &str) -> bool {
        self.handlers.contains_key(path)
    }

    /// Registered method paths.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl Acceptor for RpcRouter {
    fn accept(&self, connection: &Connection, stream_id: u64, open: Open) -> Result<(), Status> {
        let method = open.method.strip_prefix('/').unwrap_or(&open.method);

        let handler = self.handlers.get(method).ok_or_else(|| {
            warn!(stream_id, method, "No handler registered for method");
            Status::not_found(format!("no handler registered for '{method}'"))
        })?;

        let parts = connection.register_session(
            stream_id,
            *handler.descriptor(),
            Role::Server,
            open.window,
        )?;
        debug!(stream_id, method, "Accepted call");

        handler.spawn_handler(parts, Arc::clone(&self.interceptors));
        Ok(())
    }
}

impl std::fmt::Debug for RpcRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRouter")
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .field("interceptors", &self.interceptors)
            .field("config", &self.config)
            .finish()
    }
}
