//! Server-side types.
//!
//! Handlers are registered per method descriptor, one registration method
//! per call shape. The server is then turned into an immutable
//! [`RpcRouter`] that serves connections.
//!
//! # Example
//!
//! ```ignore
//! use rpcmux::server::{RpcServer, RpcServerConfig};
//!
//! let mut server = RpcServer::new(RpcServerConfig::default())
//!     .with_interceptors(InterceptorChain::new().unary(LoggingInterceptor::new()));
//!
//! server
//!     .unary(&GET_PACKAGE_INFO, |request| async move {
//!         Ok(GetPackageInfoResponse { package: Some(lookup(request.get_ref().id)) })
//!     })?
//!     .bidi_streaming(&GET_PACKAGES, |mut requests, mut responses| async move {
//!         while let Some(request) = requests.message().await? {
//!             responses.send(answer(request)).await?;
//!         }
//!         Ok(())
//!     })?;
//!
//! server.serve(TcpListener::bind("0.0.0.0:50051").await?).await?;
//! ```

mod config;
mod handler;
mod request;
mod router;

use prost::Message;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tonic::Status;
use tracing::info;

use crate::descriptor::{CallShape, MethodDescriptor};
use crate::error::{RpcError, RpcServerError};
use crate::interceptor::InterceptorChain;
use crate::path::MethodPath;
use crate::session::{StreamSender, Streaming};
use crate::validate::Validate;

pub use config::RpcServerConfig;
pub use request::Request;
pub use router::RpcRouter;

use handler::{
    ErasedHandler, HandlerFn, TypedHandler, bidi_streaming_fn, client_streaming_fn,
    server_streaming_fn, unary_fn,
};

/// Collects handlers before serving.
pub struct RpcServer {
    handlers: HashMap<String, Arc<dyn ErasedHandler>>,
    interceptors: InterceptorChain,
    config: RpcServerConfig,
}

impl RpcServer {
    pub fn new(config: RpcServerConfig) -> Self {
        Self {
            handlers: HashMap::new(),
            interceptors: InterceptorChain::new(),
            config,
        }
    }

    /// Wrap every call in `interceptors`: the unary chain around unary calls,
    /// the stream chain around the three streaming shapes.
    pub fn with_interceptors(mut self, interceptors: InterceptorChain) -> Self {
        self.interceptors = interceptors;
        self
    }

    /// Register a unary handler.
    pub fn unary<Req, Resp, F, Fut>(
        &mut self,
        method: &MethodDescriptor<Req, Resp>,
        handler: F,
    ) -> Result<&mut Self, RpcServerError>
    where
        Req: Message + fmt::Debug + Default + Validate + 'static,
        Resp: Message + fmt::Debug + 'static,
        F: Fn(Request<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.register(method, CallShape::Unary, HandlerFn::Unary(unary_fn(handler)))
    }

    /// Register a server-streaming handler. The handler returns once it has
    /// sent everything; its result becomes the call's status.
    pub fn server_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: &MethodDescriptor<Req, Resp>,
        handler: F,
    ) -> Result<&mut Self, RpcServerError>
    where
        Req: Message + fmt::Debug + Default + Validate + 'static,
        Resp: Message + fmt::Debug + 'static,
        F: Fn(Request<Req>, StreamSender<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register(
            method,
            CallShape::ServerStreaming,
            HandlerFn::ServerStreaming(server_streaming_fn(handler)),
        )
    }

    /// Register a client-streaming handler. Every request is validated as the
    /// handler pulls it.
    pub fn client_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: &MethodDescriptor<Req, Resp>,
        handler: F,
    ) -> Result<&mut Self, RpcServerError>
    where
        Req: Message + fmt::Debug + Default + Validate + 'static,
        Resp: Message + fmt::Debug + 'static,
        F: Fn(Streaming<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        self.register(
            method,
            CallShape::ClientStreaming,
            HandlerFn::ClientStreaming(client_streaming_fn(handler)),
        )
    }

    /// Register a bidirectional-streaming handler.
    pub fn bidi_streaming<Req, Resp, F, Fut>(
        &mut self,
        method: &MethodDescriptor<Req, Resp>,
        handler: F,
    ) -> Result<&mut Self, RpcServerError>
    where
        Req: Message + fmt::Debug + Default + Validate + 'static,
        Resp: Message + fmt::Debug + 'static,
        F: Fn(Streaming<Req>, StreamSender<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        self.register(
            method,
            CallShape::BidiStreaming,
            HandlerFn::BidiStreaming(bidi_streaming_fn(handler)),
        )
    }

    fn register<Req, Resp>(
        &mut self,
        method: &MethodDescriptor<Req, Resp>,
        shape: CallShape,
        handler: HandlerFn<Req, Resp>,
    ) -> Result<&mut Self, RpcServerError>
    where
        Req: Message + fmt::Debug + Default + Validate + 'static,
        Resp: Message + fmt::Debug + 'static,
    {
        let descriptor = *method.descriptor();
        let path = MethodPath::parse(descriptor.path)?.full_path();

        if descriptor.shape != shape {
            return Err(RpcServerError::ShapeMismatch {
                path,
                declared: descriptor.shape,
                registered: shape,
            });
        }
        if self.handlers.contains_key(&path) {
            return Err(RpcServerError::DuplicateHandler(path));
        }

        info!(method = %path, ?shape, "Registered RPC handler");
        self.handlers
            .insert(path, Arc::new(TypedHandler::new(descriptor, handler)));
        Ok(self)
    }

    /// Freeze the registered handlers into a router.
    pub fn into_router(self) -> Arc<RpcRouter> {
        Arc::new(RpcRouter::new(
            self.handlers,
            self.interceptors,
            self.config,
        ))
    }

    /// Serve on `listener` until it fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), RpcError> {
        self.into_router().serve(listener).await
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new(RpcServerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RpcClient, RpcClientConfig};
    use crate::codec::{BoxMessage, downcast};
    use crate::descriptor::CallDescriptor;
    use crate::interceptor::{
        LoggingInterceptor, StreamInterceptor, StreamNext, UnaryInterceptor, UnaryNext,
    };
    use crate::session::{SessionHandle, SessionState};
    use crate::validate::{ValidationOutcome, Validator};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Notify, mpsc};
    use tonic::Code;

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct Ping {
        #[prost(int32, tag = "1")]
        id: i32,
        #[prost(string, tag = "2")]
        text: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct Pong {
        #[prost(int32, tag = "1")]
        id: i32,
        #[prost(string, tag = "2")]
        text: String,
    }

    impl Validate for Ping {
        fn validate(&self) -> ValidationOutcome {
            Validator::new().int_gt("id", self.id.into(), 0).finish()
        }
    }

    const ECHO: MethodDescriptor<Ping, Pong> = MethodDescriptor::new(
        "test.EchoService/Echo",
        CallShape::Unary,
        "test.Ping",
        "test.Pong",
    );

    const COUNTDOWN: MethodDescriptor<Ping, Pong> = MethodDescriptor::new(
        "test.EchoService/Countdown",
        CallShape::ServerStreaming,
        "test.Ping",
        "test.Pong",
    );

    const COLLECT: MethodDescriptor<Ping, Pong> = MethodDescriptor::new(
        "test.EchoService/Collect",
        CallShape::ClientStreaming,
        "test.Ping",
        "test.Pong",
    );

    const CHAT: MethodDescriptor<Ping, Pong> = MethodDescriptor::new(
        "test.EchoService/Chat",
        CallShape::BidiStreaming,
        "test.Ping",
        "test.Pong",
    );

    const MISSING: MethodDescriptor<Ping, Pong> = MethodDescriptor::new(
        "test.EchoService/Missing",
        CallShape::Unary,
        "test.Ping",
        "test.Pong",
    );

    fn ping(id: i32) -> Ping {
        Ping {
            id,
            text: format!("ping {id}"),
        }
    }

    fn pong(ping: Ping) -> Pong {
        Pong {
            id: ping.id,
            text: ping.text.replace("ping", "pong"),
        }
    }

    fn connect(server: RpcServer, config: RpcClientConfig) -> RpcClient {
        let router = server.into_router();
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move { router.serve_connection(server_io).await });
        RpcClient::from_io(client_io, config)
    }

    fn echo_server() -> RpcServer {
        let mut server = RpcServer::default();
        server
            .unary(&ECHO, |request: Request<Ping>| async move {
                Ok(pong(request.into_inner()))
            })
            .unwrap()
            .server_streaming(&COUNTDOWN, |request: Request<Ping>, mut responses| async move {
                for id in (1..=request.get_ref().id).rev() {
                    responses.send(pong(ping(id))).await?;
                }
                Ok(())
            })
            .unwrap()
            .client_streaming(&COLLECT, |mut requests: Streaming<Ping>| async move {
                let mut count = 0;
                while requests.message().await?.is_some() {
                    count += 1;
                }
                Ok(Pong {
                    id: count,
                    text: "collected".into(),
                })
            })
            .unwrap()
            .bidi_streaming(&CHAT, |mut requests: Streaming<Ping>, mut responses| async move {
                while let Some(request) = requests.message().await? {
                    responses.send(pong(request)).await?;
                }
                // the response direction outlives the request direction
                responses
                    .send(Pong {
                        id: 0,
                        text: "bye".into(),
                    })
                    .await
            })
            .unwrap();
        server
    }

    async fn explode(_request: Request<Ping>) -> Result<Pong, Status> {
        panic!("boom")
    }

    struct Deny;

    impl UnaryInterceptor for Deny {
        fn intercept<'a>(
            &'a self,
            _descriptor: &'a CallDescriptor,
            _request: BoxMessage,
            _next: UnaryNext<'a>,
        ) -> BoxFuture<'a, Result<BoxMessage, Status>> {
            Box::pin(async { Err(Status::invalid_argument("denied by interceptor")) })
        }
    }

    struct Tag;

    impl UnaryInterceptor for Tag {
        fn intercept<'a>(
            &'a self,
            _descriptor: &'a CallDescriptor,
            request: BoxMessage,
            next: UnaryNext<'a>,
        ) -> BoxFuture<'a, Result<BoxMessage, Status>> {
            Box::pin(async move {
                let mut ping: Ping = downcast(request)?;
                ping.text.push_str(" tagged");
                next.proceed(Box::new(ping)).await
            })
        }
    }

    struct RejectStreams;

    impl StreamInterceptor for RejectStreams {
        fn intercept<'a>(
            &'a self,
            session: &'a SessionHandle,
            _next: StreamNext<'a>,
        ) -> BoxFuture<'a, Result<(), Status>> {
            Box::pin(async move {
                Err(Status::not_found(format!(
                    "{} is switched off",
                    session.descriptor().path
                )))
            })
        }
    }

    #[tokio::test]
    async fn test_unary_round_trip() {
        let client = connect(echo_server(), RpcClientConfig::default());

        let response = client.unary(&ECHO, ping(7)).await.unwrap();
        assert_eq!(response.id, 7);
        assert_eq!(response.text, "pong 7");
    }

    #[tokio::test]
    async fn test_unary_handler_error_is_the_only_outcome() {
        let mut server = RpcServer::default();
        server
            .unary(&ECHO, |_request: Request<Ping>| async move {
                Err::<Pong, _>(Status::not_found("no such ping"))
            })
            .unwrap();
        let client = connect(server, RpcClientConfig::default());

        let status = client.unary(&ECHO, ping(1)).await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "no such ping");
    }

    #[tokio::test]
    async fn test_foreign_status_code_becomes_internal() {
        let mut server = RpcServer::default();
        server
            .unary(&ECHO, |_request: Request<Ping>| async move {
                Err::<Pong, _>(Status::permission_denied("not yours"))
            })
            .unwrap();
        let client = connect(server, RpcClientConfig::default());

        let status = client.unary(&ECHO, ping(1)).await.unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "not yours");
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_found() {
        let client = connect(echo_server(), RpcClientConfig::default());

        let status = client.unary(&MISSING, ping(1)).await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("test.EchoService/Missing"));

        // the connection survives
        assert_eq!(client.unary(&ECHO, ping(2)).await.unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_invalid_unary_request_never_reaches_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut server = RpcServer::default();
        let counter = Arc::clone(&calls);
        server
            .unary(&ECHO, move |request: Request<Ping>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(pong(request.into_inner())) }
            })
            .unwrap();
        let client = connect(server, RpcClientConfig::default());

        let status = client.unary(&ECHO, ping(0)).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("id"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        client.unary(&ECHO, ping(1)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_streaming_order_then_end() {
        let client = connect(echo_server(), RpcClientConfig::default());

        let mut responses = client.server_streaming(&COUNTDOWN, ping(5)).await.unwrap();
        let mut ids = Vec::new();
        while let Some(response) = responses.message().await.unwrap() {
            ids.push(response.id);
        }
        assert_eq!(ids, vec![5, 4, 3, 2, 1]);

        // end of stream is sticky and distinct from an error
        assert!(responses.message().await.unwrap().is_none());
        assert_eq!(responses.session().closed().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_server_streaming_error_after_messages() {
        let mut server = RpcServer::default();
        server
            .server_streaming(&COUNTDOWN, |_request: Request<Ping>, mut responses| async move {
                responses.send(pong(ping(1))).await?;
                responses.send(pong(ping(2))).await?;
                Err(Status::not_found("ran out of pings"))
            })
            .unwrap();
        let client = connect(server, RpcClientConfig::default());

        let mut responses = client.server_streaming(&COUNTDOWN, ping(1)).await.unwrap();
        assert_eq!(responses.message().await.unwrap().unwrap().id, 1);
        assert_eq!(responses.message().await.unwrap().unwrap().id, 2);
        let status = responses.message().await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(responses.session().state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_client_streaming_counts_requests() {
        let client = connect(echo_server(), RpcClientConfig::default());

        let mut call = client.client_streaming(&COLLECT).await.unwrap();
        for id in 1..=3 {
            call.send(ping(id)).await.unwrap();
        }
        let response = call.close_and_recv().await.unwrap();
        assert_eq!(response.id, 3);
    }

    #[tokio::test]
    async fn test_client_streaming_without_requests() {
        let client = connect(echo_server(), RpcClientConfig::default());

        let call = client.client_streaming(&COLLECT).await.unwrap();
        assert_eq!(call.close_and_recv().await.unwrap().id, 0);
    }

    #[tokio::test]
    async fn test_invalid_message_mid_stream_fails_call() {
        let client = connect(echo_server(), RpcClientConfig::default());

        let mut call = client.client_streaming(&COLLECT).await.unwrap();
        call.send(ping(1)).await.unwrap();
        call.send(ping(0)).await.unwrap();
        let status = call.close_and_recv().await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_bidi_directions_are_independent() {
        let client = connect(echo_server(), RpcClientConfig::default());

        let mut call = client.bidi_streaming(&CHAT).await.unwrap();
        for id in 1..=3 {
            call.send(ping(id)).await.unwrap();
        }
        call.close_send().await.unwrap();

        let mut texts = Vec::new();
        while let Some(response) = call.message().await.unwrap() {
            texts.push(response.text);
        }
        assert_eq!(texts, vec!["pong 1", "pong 2", "pong 3", "bye"]);
        assert!(matches!(
            call.send(ping(4)).await,
            Err(status) if status.code() == Code::Internal
        ));
    }

    #[tokio::test]
    async fn test_server_half_close_reaches_client() {
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let mut server = RpcServer::default();
        server
            .bidi_streaming(
                &CHAT,
                move |mut requests: Streaming<Ping>, mut responses: StreamSender<Pong>| {
                    let seen_tx = seen_tx.clone();
                    async move {
                        responses.send(pong(ping(1))).await?;
                        responses.close().await?;
                        while let Some(request) = requests.message().await? {
                            let _ = seen_tx.send(request.id);
                        }
                        Ok::<_, Status>(())
                    }
                },
            )
            .unwrap();
        let client = connect(server, RpcClientConfig::default());

        let mut call = client.bidi_streaming(&CHAT).await.unwrap();
        assert_eq!(call.message().await.unwrap().unwrap().text, "pong 1");
        let end = tokio::time::timeout(Duration::from_millis(500), call.message())
            .await
            .expect("end of responses was not delivered");
        assert!(end.unwrap().is_none());
        assert_eq!(call.session().state(), SessionState::SendOpenRecvClosed);

        // the request direction is still open
        for id in 2..=4 {
            call.send(ping(id)).await.unwrap();
        }
        call.close_send().await.unwrap();
        assert_eq!(call.session().closed().await, SessionState::Closed);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(seen.recv().await.unwrap());
        }
        assert_eq!(ids, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_close_after_early_response_keeps_it() {
        let mut server = RpcServer::default();
        server
            .client_streaming(&COLLECT, |mut requests: Streaming<Ping>| async move {
                let first = requests.message().await?.unwrap_or_default();
                Ok::<_, Status>(pong(first))
            })
            .unwrap();
        let client = connect(server, RpcClientConfig::default());

        let mut call = client.client_streaming(&COLLECT).await.unwrap();
        call.send(ping(9)).await.unwrap();
        assert_eq!(call.session().closed().await, SessionState::Closed);
        assert!(matches!(
            call.send(ping(10)).await,
            Err(status) if status.code() == Code::Internal
        ));

        let response = call.close_and_recv().await.unwrap();
        assert_eq!(response.id, 9);
        assert_eq!(response.text, "pong 9");
    }

    #[tokio::test]
    async fn test_bidi_interleaved_from_separate_tasks() {
        let client = connect(echo_server(), RpcClientConfig::default());

        let (mut requests, mut responses) = client.bidi_streaming(&CHAT).await.unwrap().split();
        let producer = tokio::spawn(async move {
            for id in 1..=50 {
                requests.send(ping(id)).await?;
            }
            requests.close().await
        });

        let mut ids = Vec::new();
        while let Some(response) = responses.message().await.unwrap() {
            ids.push(response.id);
        }
        producer.await.unwrap().unwrap();

        let mut expected: Vec<i32> = (1..=50).collect();
        expected.push(0);
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_slow_consumer_blocks_producer() {
        let gate = Arc::new(Notify::new());
        let mut server = RpcServer::new(RpcServerConfig::default().with_window(2));
        let handler_gate = Arc::clone(&gate);
        server
            .client_streaming(&COLLECT, move |mut requests: Streaming<Ping>| {
                let gate = Arc::clone(&handler_gate);
                async move {
                    gate.notified().await;
                    let mut count = 0;
                    while requests.message().await?.is_some() {
                        count += 1;
                    }
                    Ok(Pong {
                        id: count,
                        text: "collected".into(),
                    })
                }
            })
            .unwrap();
        let client = connect(
            server,
            RpcClientConfig::default().with_outbound_capacity(1),
        );

        let mut call = client.client_streaming(&COLLECT).await.unwrap();
        // two on the wire, one waiting for credit, one queued
        for id in 1..=4 {
            tokio::time::timeout(Duration::from_secs(1), call.send(ping(id)))
                .await
                .expect("send within the window should not block")
                .unwrap();
        }
        let blocked = tokio::time::timeout(Duration::from_millis(200), call.send(ping(5))).await;
        assert!(blocked.is_err(), "producer should be suspended");

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(1), call.send(ping(5)))
            .await
            .expect("credit should be granted once the handler reads")
            .unwrap();
        assert_eq!(call.close_and_recv().await.unwrap().id, 5);
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_recv() {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let mut server = RpcServer::default();
        server
            .bidi_streaming(&CHAT, move |mut requests: Streaming<Ping>, _responses| {
                let report = report_tx.clone();
                async move {
                    let result = requests.message().await;
                    let _ = report.send(result.as_ref().err().map(|status| status.code()));
                    result.map(|_| ())
                }
            })
            .unwrap();
        let client = connect(server, RpcClientConfig::default());

        let call = client.bidi_streaming(&CHAT).await.unwrap();
        let session = call.session();
        let (_requests, mut responses) = call.split();
        let receiver = tokio::spawn(async move { responses.message().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        session.cancel();

        let status = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("cancel should wake the receiver")
            .unwrap()
            .unwrap_err();
        assert_eq!(status.code(), Code::Cancelled);

        // the server side observes the cancellation too
        let seen = tokio::time::timeout(Duration::from_secs(1), report_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, Some(Code::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_wakes_blocked_send() {
        let mut server = RpcServer::new(RpcServerConfig::default().with_window(1));
        server
            .client_streaming(&COLLECT, |requests: Streaming<Ping>| async move {
                requests.session().cancelled().await;
                Err::<Pong, _>(Status::cancelled("stopped"))
            })
            .unwrap();
        let client = connect(
            server,
            RpcClientConfig::default().with_outbound_capacity(1),
        );

        let mut call = client.client_streaming(&COLLECT).await.unwrap();
        let session = call.session();
        let producer = tokio::spawn(async move {
            let mut id = 1;
            loop {
                if let Err(status) = call.send(ping(id)).await {
                    return status;
                }
                id += 1;
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!producer.is_finished());
        session.cancel();

        let status = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("cancel should wake the producer")
            .unwrap();
        assert_eq!(status.code(), Code::Cancelled);
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_cancels_call() {
        let mut server = RpcServer::default();
        server
            .unary(&ECHO, |request: Request<Ping>| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(pong(request.into_inner()))
            })
            .unwrap();
        let client = connect(
            server,
            RpcClientConfig::default().with_timeout(Duration::from_millis(100)),
        );

        let status = tokio::time::timeout(Duration::from_secs(1), client.unary(&ECHO, ping(1)))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(status.code(), Code::Cancelled);
        assert_eq!(status.message(), "deadline exceeded");
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal() {
        let mut server = RpcServer::default();
        server.unary(&ECHO, explode).unwrap();
        server
            .server_streaming(&COUNTDOWN, |request: Request<Ping>, mut responses| async move {
                responses.send(pong(request.into_inner())).await?;
                Ok(())
            })
            .unwrap();
        let client = connect(server, RpcClientConfig::default());

        let status = client.unary(&ECHO, ping(1)).await.unwrap_err();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("boom"));

        // other calls on the connection are unaffected
        let mut responses = client.server_streaming(&COUNTDOWN, ping(3)).await.unwrap();
        assert_eq!(responses.message().await.unwrap().unwrap().id, 3);
    }

    #[tokio::test]
    async fn test_client_interceptor_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut server = RpcServer::default();
        let counter = Arc::clone(&calls);
        server
            .unary(&ECHO, move |request: Request<Ping>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(pong(request.into_inner())) }
            })
            .unwrap();
        let client = connect(server, RpcClientConfig::default())
            .with_interceptors(InterceptorChain::new().unary(Deny));

        let status = client.unary(&ECHO, ping(1)).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "denied by interceptor");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_server_interceptor_rewrites_request() {
        let server = echo_server().with_interceptors(
            InterceptorChain::new()
                .unary(LoggingInterceptor::new())
                .unary(Tag)
                .stream(LoggingInterceptor::new()),
        );
        let client = connect(server, RpcClientConfig::default());

        let response = client.unary(&ECHO, ping(3)).await.unwrap();
        assert_eq!(response.text, "pong 3 tagged");

        let mut responses = client.server_streaming(&COUNTDOWN, ping(2)).await.unwrap();
        assert_eq!(responses.message().await.unwrap().unwrap().id, 2);
    }

    #[tokio::test]
    async fn test_stream_interceptor_rejects_call() {
        let server = echo_server()
            .with_interceptors(InterceptorChain::new().stream(RejectStreams));
        let client = connect(server, RpcClientConfig::default());

        let mut responses = client.server_streaming(&COUNTDOWN, ping(2)).await.unwrap();
        let status = responses.message().await.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert!(status.message().contains("Countdown"));

        // unary calls are not wrapped by the stream chain
        assert_eq!(client.unary(&ECHO, ping(1)).await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_dropping_call_cancels_server() {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let mut server = RpcServer::default();
        server
            .bidi_streaming(&CHAT, move |mut requests: Streaming<Ping>, mut responses| {
                let report = report_tx.clone();
                async move {
                    let outcome = loop {
                        match requests.message().await {
                            Ok(Some(request)) => responses.send(pong(request)).await?,
                            Ok(None) => break Ok(()),
                            Err(status) => break Err(status),
                        }
                    };
                    let _ = report.send(outcome.as_ref().err().map(|status| status.code()));
                    outcome
                }
            })
            .unwrap();
        let client = connect(server, RpcClientConfig::default());

        let mut call = client.bidi_streaming(&CHAT).await.unwrap();
        call.send(ping(1)).await.unwrap();
        assert_eq!(call.message().await.unwrap().unwrap().id, 1);
        drop(call);

        let seen = tokio::time::timeout(Duration::from_secs(1), report_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, Some(Code::Cancelled));
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_connection() {
        let client = connect(echo_server(), RpcClientConfig::default());

        let calls = (1..=50).map(|id| {
            let client = client.clone();
            async move { client.unary(&ECHO, ping(id)).await }
        });
        let responses = futures::future::join_all(calls).await;

        for (expected, response) in (1..=50).zip(responses) {
            assert_eq!(response.unwrap().id, expected);
        }
    }

    #[test]
    fn test_register_rejects_shape_mismatch() {
        let mut server = RpcServer::default();
        let err = server
            .server_streaming(&ECHO, |_request: Request<Ping>, _responses| async move { Ok(()) })
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RpcServerError::ShapeMismatch {
                declared: CallShape::Unary,
                registered: CallShape::ServerStreaming,
                ..
            }
        ));
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let mut server = echo_server();
        let err = server
            .unary(&ECHO, |request: Request<Ping>| async move {
                Ok(pong(request.into_inner()))
            })
            .err()
            .unwrap();
        assert!(matches!(err, RpcServerError::DuplicateHandler(path) if path == "test.EchoService/Echo"));
    }

    #[test]
    fn test_register_rejects_bad_path() {
        const BAD: MethodDescriptor<Ping, Pong> =
            MethodDescriptor::new("Echo", CallShape::Unary, "test.Ping", "test.Pong");

        let mut server = RpcServer::default();
        let err = server
            .unary(&BAD, |request: Request<Ping>| async move {
                Ok(pong(request.into_inner()))
            })
            .err()
            .unwrap();
        assert!(matches!(err, RpcServerError::Path(_)));

        let router = echo_server().into_router();
        assert!(router.has_handler("test.EchoService/Chat"));
        assert_eq!(router.methods().count(), 4);
    }
}
