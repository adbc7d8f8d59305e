use prost::Message;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::client::call::{BidiCall, ClientStreamingCall, single_response};
use crate::client::config::RpcClientConfig;
use crate::codec::{BoxMessage, downcast};
use crate::connection::Connection;
use crate::descriptor::{CallShape, MethodDescriptor};
use crate::error::RpcError;
use crate::interceptor::{InterceptorChain, UnaryTerminal};
use crate::session::{CallGuard, SessionShared, StreamSender, Streaming};

struct ClientInner {
    connection: Mutex<Connection>,
    // held while redialling; `None` for clients built over a caller's stream
    redial: Option<tokio::sync::Mutex<()>>,
    config: RpcClientConfig,
}

impl ClientInner {
    fn current(&self) -> Connection {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, connection: Connection) {
        *self.connection.lock().unwrap_or_else(PoisonError::into_inner) = connection;
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.current().close();
    }
}

/// A client multiplexing calls over one connection.
///
/// Cloning is cheap and clones share the connection, which closes when the
/// last clone is dropped. A client built with [`connect`](RpcClient::connect)
/// redials its endpoint on the next call once the connection has shut down.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
    interceptors: Arc<InterceptorChain>,
}

impl RpcClient {
    /// Connect to `config.endpoint` over TCP.
    pub async fn connect(config: RpcClientConfig) -> Result<Self, RpcError> {
        let connection = dial(&config).await?;
        info!(endpoint = %config.endpoint, "Connected to RPC server");
        Ok(Self::new(connection, Some(tokio::sync::Mutex::new(())), config))
    }

    /// Run the client over an already established byte stream. The client
    /// stays closed once the stream ends.
    pub fn from_io<IO>(io: IO, config: RpcClientConfig) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Connection::spawn(io, config.connection(), None);
        Self::new(connection, None, config)
    }

    fn new(
        connection: Connection,
        redial: Option<tokio::sync::Mutex<()>>,
        config: RpcClientConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connection: Mutex::new(connection),
                redial,
                config,
            }),
            interceptors: Arc::new(InterceptorChain::new()),
        }
    }

    /// Wrap every unary call in the unary chain of `interceptors`.
    pub fn with_interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = Arc::new(interceptors);
        self
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.inner.config
    }

    /// Whether the current connection has shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.current().is_closed()
    }

    /// Resolves once the current connection has shut down.
    pub async fn closed(&self) {
        self.inner.current().closed().await
    }

    /// Issue a unary call.
    pub async fn unary<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        request: Req,
    ) -> Result<Resp, Status>
    where
        Req: Message + fmt::Debug + 'static,
        Resp: Message + fmt::Debug + Default + 'static,
    {
        let terminal: UnaryTerminal<'_> = Box::new(move |request| {
            Box::pin(async move {
                let request: Req = downcast(request)?;
                let (mut requests, mut responses) = self.open(method, CallShape::Unary).await?;
                requests.send(request).await?;
                requests.close().await?;
                let response = single_response(&mut responses).await?;
                Ok(Box::new(response) as BoxMessage)
            })
        });
        let response = self
            .interceptors
            .run_unary(method.descriptor(), Box::new(request), terminal)
            .await?;
        downcast(response)
    }

    /// Issue a server-streaming call. The request is sent and half-closed
    /// before this returns.
    pub async fn server_streaming<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        request: Req,
    ) -> Result<Streaming<Resp>, Status>
    where
        Req: Message,
    {
        let (mut requests, responses) = self.open(method, CallShape::ServerStreaming).await?;
        requests.send(request).await?;
        requests.close().await?;
        Ok(responses)
    }

    /// Open a client-streaming call.
    pub async fn client_streaming<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
    ) -> Result<ClientStreamingCall<Req, Resp>, Status> {
        let (requests, response) = self.open(method, CallShape::ClientStreaming).await?;
        Ok(ClientStreamingCall::new(requests, response))
    }

    /// Open a bidirectional-streaming call.
    pub async fn bidi_streaming<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
    ) -> Result<BidiCall<Req, Resp>, Status> {
        let (requests, responses) = self.open(method, CallShape::BidiStreaming).await?;
        Ok(BidiCall::new(requests, responses))
    }

    async fn open<Req, Resp>(
        &self,
        method: &MethodDescriptor<Req, Resp>,
        shape: CallShape,
    ) -> Result<(StreamSender<Req>, Streaming<Resp>), Status> {
        let descriptor = *method.descriptor();
        if descriptor.shape != shape {
            return Err(Status::internal(format!(
                "method '{}' is {:?}, not {:?}",
                descriptor.path, descriptor.shape, shape
            )));
        }

        let parts = self.connection().await?.open_call(descriptor).await?;
        if let Some(timeout) = self.inner.config.timeout {
            spawn_deadline(Arc::clone(&parts.shared), timeout);
        }

        let guard = CallGuard::new(Arc::clone(&parts.shared));
        let (responses, requests) = parts.into_halves::<Resp, Req>();
        Ok((
            requests.with_call_guard(Arc::clone(&guard)),
            responses.with_call_guard(guard),
        ))
    }
}

impl RpcClient {
    /// The live connection, redialled first if it has shut down and this
    /// client knows its endpoint.
    async fn connection(&self) -> Result<Connection, RpcError> {
        let current = self.inner.current();
        let Some(redial) = &self.inner.redial else {
            return Ok(current);
        };
        if !current.is_closed() {
            return Ok(current);
        }

        let _dialing = redial.lock().await;
        let current = self.inner.current();
        if !current.is_closed() {
            return Ok(current);
        }
        let endpoint = &self.inner.config.endpoint;
        let connection = dial(&self.inner.config).await.inspect_err(|err| {
            warn!(%endpoint, error = %err, "Failed to reconnect to RPC server");
        })?;
        info!(%endpoint, "Reconnected to RPC server");
        self.inner.replace(connection.clone());
        Ok(connection)
    }
}

async fn dial(config: &RpcClientConfig) -> Result<Connection, RpcError> {
    let stream = TcpStream::connect(&config.endpoint).await?;
    stream.set_nodelay(true)?;
    Ok(Connection::spawn(stream, config.connection(), None))
}

fn spawn_deadline(shared: Arc<SessionShared>, timeout: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if shared.fail(Status::cancelled("deadline exceeded")) {
                    debug!(
                        stream_id = shared.id(),
                        method = shared.descriptor().path,
                        ?timeout,
                        "Call deadline exceeded"
                    );
                }
            }
            _ = shared.terminated().cancelled() => {}
        }
    });
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("endpoint", &self.inner.config.endpoint)
            .field("connection", &self.inner.current())
            .field("interceptors", &self.interceptors)
            .finish()
    }
}
