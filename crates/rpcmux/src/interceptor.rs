//! Interceptor middleware.
//!
//! Interceptors wrap every call with pre/post hooks. A chain is built once
//! and shared read-only by all calls:
//!
//! ```ignore
//! let interceptors = InterceptorChain::new()
//!     .unary(LoggingInterceptor::new())
//!     .stream(LoggingInterceptor::new());
//! ```
//!
//! Hooks run outer-to-inner in the order they were added on the way in and
//! inner-to-outer on the way out. Each hook receives a `next` value it may
//! proceed with at most once; `proceed` consumes it. A hook that never calls
//! `proceed` short-circuits the call with its own result.

use futures::FutureExt;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tonic::Status;

use crate::codec::BoxMessage;
use crate::descriptor::CallDescriptor;
use crate::error::RpcError;
use crate::session::SessionHandle;

/// A hook around unary calls.
pub trait UnaryInterceptor: Send + Sync + 'static {
    fn intercept<'a>(
        &'a self,
        descriptor: &'a CallDescriptor,
        request: BoxMessage,
        next: UnaryNext<'a>,
    ) -> BoxFuture<'a, Result<BoxMessage, Status>>;
}

/// A hook around streaming calls. Sees the session, not individual messages.
pub trait StreamInterceptor: Send + Sync + 'static {
    fn intercept<'a>(
        &'a self,
        session: &'a SessionHandle,
        next: StreamNext<'a>,
    ) -> BoxFuture<'a, Result<(), Status>>;
}

pub(crate) type UnaryTerminal<'a> =
    Box<dyn FnOnce(BoxMessage) -> BoxFuture<'a, Result<BoxMessage, Status>> + Send + 'a>;

pub(crate) type StreamTerminal<'a> =
    Box<dyn FnOnce() -> BoxFuture<'a, Result<(), Status>> + Send + 'a>;

/// The rest of a unary chain, ending in the call itself.
pub struct UnaryNext<'a> {
    rest: &'a [Arc<dyn UnaryInterceptor>],
    descriptor: &'a CallDescriptor,
    terminal: UnaryTerminal<'a>,
}

impl<'a> UnaryNext<'a> {
    /// Continue with the next interceptor, or the call if none remain.
    pub fn proceed(self, request: BoxMessage) -> BoxFuture<'a, Result<BoxMessage, Status>> {
        match self.rest.split_first() {
            Some((first, rest)) => first.intercept(
                self.descriptor,
                request,
                UnaryNext {
                    rest,
                    descriptor: self.descriptor,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(request),
        }
    }
}

/// The rest of a stream chain, ending in the handler.
pub struct StreamNext<'a> {
    rest: &'a [Arc<dyn StreamInterceptor>],
    session: &'a SessionHandle,
    terminal: StreamTerminal<'a>,
}

impl<'a> StreamNext<'a> {
    pub fn proceed(self) -> BoxFuture<'a, Result<(), Status>> {
        match self.rest.split_first() {
            Some((first, rest)) => first.intercept(
                self.session,
                StreamNext {
                    rest,
                    session: self.session,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(),
        }
    }
}

/// An ordered, immutable list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    unary: Vec<Arc<dyn UnaryInterceptor>>,
    stream: Vec<Arc<dyn StreamInterceptor>>,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("unary", &format!("[{} interceptors]", self.unary.len()))
            .field("stream", &format!("[{} interceptors]", self.stream.len()))
            .finish()
    }
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a unary interceptor. The first one added is the outermost.
    #[must_use]
    pub fn unary<I: UnaryInterceptor>(mut self, interceptor: I) -> Self {
        self.unary.push(Arc::new(interceptor));
        self
    }

    /// Append a stream interceptor. The first one added is the outermost.
    #[must_use]
    pub fn stream<I: StreamInterceptor>(mut self, interceptor: I) -> Self {
        self.stream.push(Arc::new(interceptor));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.unary.is_empty() && self.stream.is_empty()
    }

    /// Run a unary call through the chain. Panics inside the chain become
    /// `Internal`.
    pub(crate) async fn run_unary<'a>(
        &'a self,
        descriptor: &'a CallDescriptor,
        request: BoxMessage,
        terminal: UnaryTerminal<'a>,
    ) -> Result<BoxMessage, Status> {
        let next = UnaryNext {
            rest: &self.unary,
            descriptor,
            terminal,
        };
        AssertUnwindSafe(async move { next.proceed(request).await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_status(descriptor, panic)))
    }

    /// Run a streaming call through the chain. Panics inside the chain become
    /// `Internal`.
    pub(crate) async fn run_stream<'a>(
        &'a self,
        session: &'a SessionHandle,
        terminal: StreamTerminal<'a>,
    ) -> Result<(), Status> {
        let next = StreamNext {
            rest: &self.stream,
            session,
            terminal,
        };
        AssertUnwindSafe(async move { next.proceed().await })
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_status(session.descriptor(), panic)))
    }
}

fn panic_status(descriptor: &CallDescriptor, panic: Box<dyn Any + Send>) -> Status {
    let message = if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    };
    tracing::error!(method = descriptor.path, panic = %message, "Call panicked");
    RpcError::HandlerPanic(message).into()
}

/// Logs every call with its payloads, outcome and duration.
///
/// Never short-circuits.
#[derive(Debug, Clone, Default)]
pub struct LoggingInterceptor {
    _priv: (),
}

impl LoggingInterceptor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UnaryInterceptor for LoggingInterceptor {
    fn intercept<'a>(
        &'a self,
        descriptor: &'a CallDescriptor,
        request: BoxMessage,
        next: UnaryNext<'a>,
    ) -> BoxFuture<'a, Result<BoxMessage, Status>> {
        Box::pin(async move {
            let started = Instant::now();
            tracing::info!(method = descriptor.path, request = ?request, "--> unary call");

            let result = next.proceed(request).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(response) => tracing::info!(
                    method = descriptor.path,
                    response = ?response,
                    elapsed_ms,
                    "<-- unary call"
                ),
                Err(status) => tracing::warn!(
                    method = descriptor.path,
                    code = ?status.code(),
                    message = status.message(),
                    elapsed_ms,
                    "<-- unary call failed"
                ),
            }
            result
        })
    }
}

impl StreamInterceptor for LoggingInterceptor {
    fn intercept<'a>(
        &'a self,
        session: &'a SessionHandle,
        next: StreamNext<'a>,
    ) -> BoxFuture<'a, Result<(), Status>> {
        Box::pin(async move {
            let descriptor = session.descriptor();
            tracing::info!(
                method = descriptor.path,
                stream_id = session.id(),
                client_stream = descriptor.shape.is_client_stream(),
                server_stream = descriptor.shape.is_server_stream(),
                "--> stream call"
            );

            let result = next.proceed().await;
            let elapsed_ms = session.elapsed().as_millis() as u64;
            match &result {
                Ok(()) => tracing::info!(
                    method = descriptor.path,
                    stream_id = session.id(),
                    elapsed_ms,
                    "<-- stream call"
                ),
                Err(status) => tracing::warn!(
                    method = descriptor.path,
                    stream_id = session.id(),
                    code = ?status.code(),
                    message = status.message(),
                    elapsed_ms,
                    "<-- stream call failed"
                ),
            }
            result
        })
    }
}
