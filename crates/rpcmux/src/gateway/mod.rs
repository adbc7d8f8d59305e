//! HTTP/JSON gateway in front of an RPC server.
//!
//! A static table of [`GatewayRoute`]s maps `METHOD /path/{param}` onto
//! unary and server-streaming RPC methods. For each HTTP request the gateway
//! builds the request message from the body, path variables and query
//! parameters, issues the call through an ordinary [`RpcClient`] and
//! marshals the result back to JSON.
//!
//! ```ignore
//! let gateway = Gateway::new(client, GatewayConfig::default())
//!     .route(
//!         GatewayRoute::unary(Method::GET, "/v1/packages/{id}", &GET_PACKAGE_INFO)?
//!             .path_param("id", FieldKind::Integer),
//!     )?;
//! gateway.serve(TcpListener::bind("0.0.0.0:16081").await?).await?;
//! ```
//!
//! Call status codes map onto HTTP: OK is 200, `InvalidArgument` 400,
//! `NotFound` 404, anything else 500, with a `{"code", "message"}` body.

mod error;
mod route;
mod template;
mod translate;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::{Value, json};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::client::RpcClient;

pub use error::{GatewayError, HttpError, http_status};
pub use route::{BodyMapping, FieldBinding, FieldKind, GatewayRoute};
pub use template::PathTemplate;

use route::{Invoker, JsonStream};

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// How server-streaming results are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamFormat {
    /// Collect every message into one JSON array.
    #[default]
    JsonArray,
    /// One `{"result": ..}` line per message, streamed as it arrives. A
    /// failure after the first message becomes a final `{"error": ..}` line.
    NewlineDelimited,
}

/// Configuration for the HTTP gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to listen on, `host:port`.
    pub listen_addr: String,
    pub stream_format: StreamFormat,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:16081".to_string(),
            stream_format: StreamFormat::default(),
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    pub fn with_stream_format(mut self, format: StreamFormat) -> Self {
        self.stream_format = format;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}

/// Translates HTTP requests into RPC calls.
#[derive(Debug)]
pub struct Gateway {
    routes: Vec<GatewayRoute>,
    client: RpcClient,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(client: RpcClient, config: GatewayConfig) -> Self {
        Self {
            routes: Vec::new(),
            client,
            config,
        }
    }

    /// Add a route. Routes are tried in the order they were added.
    pub fn route(mut self, route: GatewayRoute) -> Result<Self, GatewayError> {
        route.check()?;
        let duplicate = self.routes.iter().any(|existing| {
            existing.method() == route.method() && existing.template() == route.template()
        });
        if duplicate {
            return Err(GatewayError::DuplicateRoute(route.to_string()));
        }
        info!(route = %route, rpc = route.descriptor().path, "Registered gateway route");
        self.routes.push(route);
        Ok(self)
    }

    pub fn routes(&self) -> &[GatewayRoute] {
        &self.routes
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Answer one HTTP request.
    pub async fn handle(&self, method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> Response {
        let start = Instant::now();
        let request_id = request_id(headers);

        let mut response = match self.dispatch(method, uri, body).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        };

        info!(
            request_id = request_id.to_str().unwrap_or_default(),
            method = %method,
            path = uri.path(),
            status = response.status().as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Gateway request"
        );
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
        response
    }

    async fn dispatch(&self, method: &Method, uri: &Uri, body: Bytes) -> Result<Response, HttpError> {
        let (route, captures) = self
            .routes
            .iter()
            .filter(|route| route.method() == method)
            .find_map(|route| route.template().matches(uri.path()).map(|captures| (route, captures)))
            .ok_or_else(|| HttpError::not_found(format!("no route for {method} {}", uri.path())))?;

        let request = translate::build_request(route, captures, uri.query(), &body)?;
        debug!(route = %route, rpc = route.descriptor().path, %request, "Invoking RPC");

        match route.invoker() {
            Invoker::Unary(invoke) => {
                let response = invoke(self.client.clone(), request).await?;
                Ok(json_response(&response))
            }
            Invoker::ServerStreaming(invoke) => {
                let responses = invoke(self.client.clone(), request).await?;
                match self.config.stream_format {
                    StreamFormat::JsonArray => collect_array(responses).await,
                    StreamFormat::NewlineDelimited => ndjson(responses).await,
                }
            }
        }
    }

    /// Build the axum router serving every route.
    pub fn into_router(self) -> Router {
        let limit = self.config.max_body_bytes;
        Router::new()
            .fallback(handle_http)
            .layer(DefaultBodyLimit::max(limit))
            .with_state(Arc::new(self))
    }

    /// Serve HTTP on `listener` until it fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), GatewayError> {
        let addr = listener.local_addr()?;
        info!(%addr, routes = self.routes.len(), "Gateway listening");
        axum::serve(listener, self.into_router()).await?;
        Ok(())
    }
}

async fn handle_http(
    State(gateway): State<Arc<Gateway>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    gateway.handle(&method, &uri, &headers, body).await
}

// echo a well-formed client id, otherwise mint one
fn request_id(headers: &HeaderMap) -> HeaderValue {
    headers
        .get(&REQUEST_ID_HEADER)
        .filter(|value| !value.is_empty() && value.to_str().is_ok())
        .cloned()
        .unwrap_or_else(|| {
            HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
        })
}

fn json_response(value: &Value) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        value.to_string(),
    )
        .into_response()
}

async fn collect_array(mut responses: JsonStream) -> Result<Response, HttpError> {
    let mut items = Vec::new();
    while let Some(item) = responses.next().await {
        items.push(item?);
    }
    Ok(json_response(&Value::Array(items)))
}

async fn ndjson(mut responses: JsonStream) -> Result<Response, HttpError> {
    // an error before the first message still gets a proper status code
    let first = match responses.next().await {
        Some(item) => Some(item?),
        None => None,
    };

    let lines = async_stream::stream! {
        if let Some(first) = first {
            yield Ok::<_, Infallible>(line(&json!({ "result": first })));
            while let Some(item) = responses.next().await {
                match item {
                    Ok(value) => yield Ok(line(&json!({ "result": value }))),
                    Err(status) => {
                        warn!(code = ?status.code(), message = status.message(), "Stream failed mid-response");
                        yield Ok(line(&json!({ "error": HttpError::from(status) })));
                        break;
                    }
                }
            }
        }
    };

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"))],
        Body::from_stream(lines),
    )
        .into_response())
}

fn line(value: &Value) -> Bytes {
    let mut line = value.to_string();
    line.push('\n');
    Bytes::from(line)
}
