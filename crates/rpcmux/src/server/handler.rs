use futures::FutureExt;
use futures::future::BoxFuture;
use prost::Message;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::{Code, Status};

use crate::codec::{BoxMessage, downcast};
use crate::descriptor::CallDescriptor;
use crate::error::{RpcError, handler_status};
use crate::frame::Frame;
use crate::interceptor::{InterceptorChain, StreamTerminal, UnaryTerminal};
use crate::server::request::Request;
use crate::session::{Outbound, SessionHandle, SessionParts, SessionShared, StreamSender, Streaming};
use crate::validate::Validate;

/// A type-erased handler that can be stored in a HashMap.
///
/// This trait allows us to store handlers with different message types in a
/// single registry.
pub(crate) trait ErasedHandler: Send + Sync {
    fn descriptor(&self) -> &CallDescriptor;

    /// Spawn a task that serves one accepted call.
    fn spawn_handler(&self, parts: SessionParts, interceptors: Arc<InterceptorChain>);
}

pub(crate) type UnaryFn<Req, Resp> =
    Arc<dyn Fn(Request<Req>) -> BoxFuture<'static, Result<Resp, Status>> + Send + Sync>;

pub(crate) type ServerStreamingFn<Req, Resp> = Arc<
    dyn Fn(Request<Req>, StreamSender<Resp>) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

pub(crate) type ClientStreamingFn<Req, Resp> =
    Arc<dyn Fn(Streaming<Req>) -> BoxFuture<'static, Result<Resp, Status>> + Send + Sync>;

pub(crate) type BidiStreamingFn<Req, Resp> = Arc<
    dyn Fn(Streaming<Req>, StreamSender<Resp>) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

/// The user's handler, one variant per call shape.
pub(crate) enum HandlerFn<Req, Resp> {
    Unary(UnaryFn<Req, Resp>),
    ServerStreaming(ServerStreamingFn<Req, Resp>),
    ClientStreaming(ClientStreamingFn<Req, Resp>),
    BidiStreaming(BidiStreamingFn<Req, Resp>),
}

impl<Req, Resp> Clone for HandlerFn<Req, Resp> {
    fn clone(&self) -> Self {
        match self {
            HandlerFn::Unary(f) => HandlerFn::Unary(Arc::clone(f)),
            HandlerFn::ServerStreaming(f) => HandlerFn::ServerStreaming(Arc::clone(f)),
            HandlerFn::ClientStreaming(f) => HandlerFn::ClientStreaming(Arc::clone(f)),
            HandlerFn::BidiStreaming(f) => HandlerFn::BidiStreaming(Arc::clone(f)),
        }
    }
}

pub(crate) fn unary_fn<Req, Resp, F, Fut>(f: F) -> UnaryFn<Req, Resp>
where
    F: Fn(Request<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    Arc::new(move |request| f(request).boxed())
}

pub(crate) fn server_streaming_fn<Req, Resp, F, Fut>(f: F) -> ServerStreamingFn<Req, Resp>
where
    F: Fn(Request<Req>, StreamSender<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Arc::new(move |request, sender| f(request, sender).boxed())
}

pub(crate) fn client_streaming_fn<Req, Resp, F, Fut>(f: F) -> ClientStreamingFn<Req, Resp>
where
    F: Fn(Streaming<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
{
    Arc::new(move |requests| f(requests).boxed())
}

pub(crate) fn bidi_streaming_fn<Req, Resp, F, Fut>(f: F) -> BidiStreamingFn<Req, Resp>
where
    F: Fn(Streaming<Req>, StreamSender<Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Arc::new(move |requests, sender| f(requests, sender).boxed())
}

/// A typed handler bound to its method descriptor.
pub(crate) struct TypedHandler<Req, Resp> {
    descriptor: CallDescriptor,
    handler: HandlerFn<Req, Resp>,
}

impl<Req, Resp> TypedHandler<Req, Resp> {
    pub fn new(descriptor: CallDescriptor, handler: HandlerFn<Req, Resp>) -> Self {
        Self {
            descriptor,
            handler,
        }
    }
}

impl<Req, Resp> ErasedHandler for TypedHandler<Req, Resp>
where
    Req: Message + fmt::Debug + Default + Validate + 'static,
    Resp: Message + fmt::Debug + 'static,
{
    fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    fn spawn_handler(&self, parts: SessionParts, interceptors: Arc<InterceptorChain>) {
        let handler = self.handler.clone();
        let descriptor = self.descriptor;

        tokio::spawn(async move {
            let shared = Arc::clone(&parts.shared);
            let session = parts.handle();
            let outbound = parts.outbound.clone();

            // the client may not send until it is granted our window
            let grant = Frame::credit(session.id(), parts.window);
            if parts.writer.send(grant).await.is_err() {
                shared.fail_from_peer(RpcError::ConnectionClosed.into());
                return;
            }

            let (requests, sender) = parts.into_halves::<Req, Resp>();
            let result = dispatch(
                handler,
                &descriptor,
                &session,
                requests,
                sender,
                &interceptors,
            )
            .await;

            finish(&shared, &outbound, result).await;
        });
    }
}

async fn dispatch<Req, Resp>(
    handler: HandlerFn<Req, Resp>,
    descriptor: &CallDescriptor,
    session: &SessionHandle,
    mut requests: Streaming<Req>,
    mut sender: StreamSender<Resp>,
    interceptors: &InterceptorChain,
) -> Result<(), Status>
where
    Req: Message + fmt::Debug + Default + Validate + 'static,
    Resp: Message + fmt::Debug + 'static,
{
    match handler {
        HandlerFn::Unary(f) => {
            let request = read_request(&mut requests).await?;
            let terminal: UnaryTerminal<'_> = Box::new(move |request| {
                Box::pin(async move {
                    let request: Req = downcast(request)?;
                    validate(&request)?;
                    let response = f(Request::new(request, session.clone())).await?;
                    Ok(Box::new(response) as BoxMessage)
                })
            });
            let response = interceptors
                .run_unary(descriptor, Box::new(request), terminal)
                .await?;
            sender.send(downcast::<Resp>(response)?).await
        }
        HandlerFn::ServerStreaming(f) => {
            let terminal: StreamTerminal<'_> = Box::new(move || {
                Box::pin(async move {
                    let request = read_request(&mut requests).await?;
                    validate(&request)?;
                    f(Request::new(request, session.clone()), sender).await
                })
            });
            interceptors.run_stream(session, terminal).await
        }
        HandlerFn::ClientStreaming(f) => {
            let terminal: StreamTerminal<'_> = Box::new(move || {
                Box::pin(async move {
                    let response = f(requests.with_validation()).await?;
                    sender.send(response).await
                })
            });
            interceptors.run_stream(session, terminal).await
        }
        HandlerFn::BidiStreaming(f) => {
            let terminal: StreamTerminal<'_> =
                Box::new(move || f(requests.with_validation(), sender));
            interceptors.run_stream(session, terminal).await
        }
    }
}

async fn read_request<Req>(requests: &mut Streaming<Req>) -> Result<Req, Status>
where
    Req: Message + Default,
{
    requests
        .message()
        .await?
        .ok_or_else(|| Status::invalid_argument("missing request message"))
}

fn validate<Req: Validate>(request: &Req) -> Result<(), Status> {
    request.validate().map_err(|err| {
        tracing::debug!(error = %err, "Request failed validation");
        RpcError::Validation(err).into()
    })
}

async fn finish(
    shared: &SessionShared,
    outbound: &mpsc::Sender<Outbound>,
    result: Result<(), Status>,
) {
    let descriptor = shared.descriptor();
    let status = match result {
        Ok(()) => {
            tracing::debug!(
                stream_id = shared.id(),
                method = descriptor.path,
                "Handler completed"
            );
            Status::new(Code::Ok, "")
        }
        Err(status) if status.code() == Code::Cancelled => {
            tracing::debug!(
                stream_id = shared.id(),
                method = descriptor.path,
                "Call cancelled"
            );
            status
        }
        Err(status) => {
            tracing::warn!(
                stream_id = shared.id(),
                method = descriptor.path,
                code = ?status.code(),
                message = status.message(),
                "Handler failed"
            );
            handler_status(status)
        }
    };

    // a failed session reports its own status from the send loop
    if shared.is_failed() {
        return;
    }
    tokio::select! {
        biased;
        _ = shared.failed().cancelled() => {}
        _ = outbound.send(Outbound::Status(status)) => {}
    }
}
