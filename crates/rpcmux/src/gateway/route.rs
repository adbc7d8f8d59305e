use axum::http::Method;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tonic::Status;

use crate::client::RpcClient;
use crate::descriptor::{CallDescriptor, CallShape, MethodDescriptor};
use crate::gateway::error::GatewayError;
use crate::gateway::template::{PathTemplate, is_field_path};

/// How a textual path or query value is converted before it is stored in
/// the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldKind {
    #[default]
    String,
    Integer,
    Float,
    Bool,
}

impl FieldKind {
    pub(crate) fn convert(self, raw: &str) -> Result<Value, String> {
        match self {
            FieldKind::String => Ok(Value::String(raw.to_owned())),
            FieldKind::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("'{raw}' is not an integer")),
            FieldKind::Float => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{raw}' is not a finite number")),
            FieldKind::Bool => match raw {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(format!("'{raw}' is not a boolean")),
            },
        }
    }
}

/// Binds a query parameter to a request field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldBinding {
    /// Dotted path of the target field.
    pub field: String,
    pub kind: FieldKind,
}

/// Where the HTTP body goes in the request message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BodyMapping {
    /// The route takes no body.
    #[default]
    None,
    /// The body is the whole request object (`body: "*"`).
    Whole,
    /// The body is the value of one request field.
    Field(String),
}

pub(crate) type UnaryInvoker =
    Arc<dyn Fn(RpcClient, Value) -> BoxFuture<'static, Result<Value, Status>> + Send + Sync>;

pub(crate) type JsonStream = BoxStream<'static, Result<Value, Status>>;

pub(crate) type StreamInvoker =
    Arc<dyn Fn(RpcClient, Value) -> BoxFuture<'static, Result<JsonStream, Status>> + Send + Sync>;

/// The call a route makes, with its message types erased to JSON.
#[derive(Clone)]
pub(crate) enum Invoker {
    Unary(UnaryInvoker),
    ServerStreaming(StreamInvoker),
}

/// One HTTP route mapped onto an RPC method.
///
/// ```ignore
/// let route = GatewayRoute::unary(Method::GET, "/v1/packages/{id}", &GET_PACKAGE_INFO)?
///     .path_param("id", FieldKind::Integer);
/// ```
#[derive(Clone)]
pub struct GatewayRoute {
    method: Method,
    template: PathTemplate,
    descriptor: CallDescriptor,
    path_params: HashMap<String, FieldKind>,
    query_params: HashMap<String, FieldBinding>,
    body: BodyMapping,
    invoker: Invoker,
}

impl GatewayRoute {
    /// Route `method template` to a unary RPC method.
    pub fn unary<Req, Resp>(
        method: Method,
        template: &str,
        descriptor: &MethodDescriptor<Req, Resp>,
    ) -> Result<Self, GatewayError>
    where
        Req: Message + fmt::Debug + DeserializeOwned + 'static,
        Resp: Message + fmt::Debug + Default + Serialize + 'static,
    {
        let rpc = *descriptor;
        let invoker: UnaryInvoker = Arc::new(move |client: RpcClient, json: Value| {
            async move {
                let request: Req = from_json(json)?;
                let response = client.unary(&rpc, request).await?;
                to_json(&response)
            }
            .boxed()
        });
        Self::new(method, template, descriptor, CallShape::Unary, Invoker::Unary(invoker))
    }

    /// Route `method template` to a server-streaming RPC method.
    pub fn server_streaming<Req, Resp>(
        method: Method,
        template: &str,
        descriptor: &MethodDescriptor<Req, Resp>,
    ) -> Result<Self, GatewayError>
    where
        Req: Message + fmt::Debug + DeserializeOwned + 'static,
        Resp: Message + fmt::Debug + Default + Serialize + 'static,
    {
        let rpc = *descriptor;
        let invoker: StreamInvoker = Arc::new(move |client: RpcClient, json: Value| {
            async move {
                let request: Req = from_json(json)?;
                let responses = client.server_streaming(&rpc, request).await?;
                let stream = responses
                    .into_stream()
                    .map(|item| item.and_then(|response| to_json(&response)))
                    .boxed();
                Ok::<_, Status>(stream)
            }
            .boxed()
        });
        Self::new(
            method,
            template,
            descriptor,
            CallShape::ServerStreaming,
            Invoker::ServerStreaming(invoker),
        )
    }

    fn new<Req, Resp>(
        method: Method,
        template: &str,
        descriptor: &MethodDescriptor<Req, Resp>,
        shape: CallShape,
        invoker: Invoker,
    ) -> Result<Self, GatewayError> {
        let descriptor = *descriptor.descriptor();
        if descriptor.shape != shape {
            return Err(GatewayError::UnsupportedShape {
                path: descriptor.path,
                shape: descriptor.shape,
            });
        }
        Ok(Self {
            method,
            template: PathTemplate::parse(template)?,
            descriptor,
            path_params: HashMap::new(),
            query_params: HashMap::new(),
            body: BodyMapping::None,
            invoker,
        })
    }

    /// Set how the path variable `variable` is converted. Variables without
    /// an explicit kind are strings.
    #[must_use]
    pub fn path_param(mut self, variable: &str, kind: FieldKind) -> Self {
        self.path_params.insert(variable.to_owned(), kind);
        self
    }

    /// Accept the query parameter `name`, storing it in `field`.
    #[must_use]
    pub fn query_param(mut self, name: &str, field: &str, kind: FieldKind) -> Self {
        self.query_params.insert(
            name.to_owned(),
            FieldBinding {
                field: field.to_owned(),
                kind,
            },
        );
        self
    }

    #[must_use]
    pub fn body(mut self, mapping: BodyMapping) -> Self {
        self.body = mapping;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    pub fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    pub(crate) fn path_kind(&self, variable: &str) -> FieldKind {
        self.path_params.get(variable).copied().unwrap_or_default()
    }

    pub(crate) fn query_binding(&self, name: &str) -> Option<&FieldBinding> {
        self.query_params.get(name)
    }

    pub(crate) fn body_mapping(&self) -> &BodyMapping {
        &self.body
    }

    pub(crate) fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    /// Checks the bindings against the template.
    pub(crate) fn check(&self) -> Result<(), GatewayError> {
        for variable in self.path_params.keys() {
            if !self.template.has_variable(variable) {
                return Err(GatewayError::UnknownPathVariable {
                    route: self.to_string(),
                    variable: variable.clone(),
                });
            }
        }
        let invalid_field = self
            .query_params
            .values()
            .map(|binding| binding.field.as_str())
            .chain(match &self.body {
                BodyMapping::Field(field) => Some(field.as_str()),
                BodyMapping::None | BodyMapping::Whole => None,
            })
            .find(|field| !is_field_path(field));
        if let Some(field) = invalid_field {
            return Err(GatewayError::InvalidTemplate {
                template: self.template.to_string(),
                reason: format!("invalid field path '{field}'"),
            });
        }
        Ok(())
    }
}

impl fmt::Display for GatewayRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

impl fmt::Debug for GatewayRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRoute")
            .field("method", &self.method)
            .field("template", &self.template.as_str())
            .field("rpc", &self.descriptor.path)
            .field("path_params", &self.path_params)
            .field("query_params", &self.query_params)
            .field("body", &self.body)
            .finish()
    }
}

fn from_json<Req: DeserializeOwned>(json: Value) -> Result<Req, Status> {
    serde_json::from_value(json)
        .map_err(|err| Status::invalid_argument(format!("invalid request: {err}")))
}

fn to_json<Resp: Serialize>(response: &Resp) -> Result<Value, Status> {
    serde_json::to_value(response)
        .map_err(|err| Status::internal(format!("failed to encode response as JSON: {err}")))
}
