//! Error types for the HTTP gateway.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use tonic::{Code, Status};

use crate::descriptor::CallShape;

/// Errors raised while building or serving a gateway.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("invalid path template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },

    /// Only unary and server-streaming methods can be exposed over HTTP.
    #[error("method '{path}' is {shape:?} and cannot be routed over HTTP")]
    UnsupportedShape { path: &'static str, shape: CallShape },

    #[error("route {route} binds unknown path variable '{variable}'")]
    UnknownPathVariable { route: String, variable: String },

    #[error("route {0} is already registered")]
    DuplicateRoute(String),

    #[error("gateway I/O error")]
    Io(#[from] std::io::Error),
}

/// An error answered to an HTTP client.
///
/// Serialized as `{"code": <status code>, "message": <text>}` with the HTTP
/// status derived from the code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HttpError {
    pub code: i32,
    pub message: String,
}

impl HttpError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::from(Status::invalid_argument(message.into()))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::from(Status::not_found(message.into()))
    }

    pub fn code(&self) -> Code {
        Code::from(self.code)
    }

    pub fn http_status(&self) -> StatusCode {
        http_status(self.code())
    }

    pub(crate) fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"code":13,"message":"failed to encode error"}"#.to_vec()
        })
    }
}

impl From<Status> for HttpError {
    fn from(status: Status) -> Self {
        Self {
            code: status.code() as i32,
            message: status.message().to_owned(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (
            self.http_status(),
            [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
            self.to_json_bytes(),
        )
            .into_response()
    }
}

/// Maps a call status code onto the HTTP status the gateway answers with.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
