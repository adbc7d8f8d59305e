use thiserror::Error;
use tonic::{Code, Status};

use crate::validate::ValidationError;

/// Errors that can occur while parsing RPC method paths.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcPathError {
    #[error("invalid RPC path: {0}")]
    Invalid(String),
}

/// Errors that can occur while registering handlers on an `RpcServer`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcServerError {
    /// The method path of a descriptor could not be parsed.
    #[error(transparent)]
    Path(#[from] RpcPathError),

    /// A handler was registered with a descriptor of a different call shape.
    #[error("method '{path}' is declared {declared:?} but was registered as {registered:?}")]
    ShapeMismatch {
        path: String,
        declared: crate::CallShape,
        registered: crate::CallShape,
    },

    /// A handler is already registered for this method.
    #[error("handler already registered for '{0}'")]
    DuplicateHandler(String),
}

/// Errors raised by the runtime while moving a call across the wire.
///
/// Every variant maps onto a [`Status`] through `From<RpcError> for Status`,
/// which is what callers and peers observe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RpcError {
    /// The underlying byte stream failed.
    #[error("transport error")]
    Transport(#[from] std::io::Error),

    /// The peer sent a frame that breaks the framing protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The connection carrying the session has gone away.
    #[error("connection closed")]
    ConnectionClosed,

    /// Failed to encode a protobuf message.
    #[error("protobuf encode error")]
    Encode(#[from] prost::EncodeError),

    /// Failed to decode a protobuf message.
    #[error("protobuf decode error")]
    Decode(#[from] prost::DecodeError),

    /// An inbound message failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The session was cancelled.
    #[error("call cancelled")]
    Cancelled,

    /// A handler or interceptor panicked.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Validation(e) => Status::invalid_argument(e.to_string()),
            RpcError::Cancelled => Status::cancelled("call cancelled"),
            RpcError::Encode(e) => Status::internal(format!("failed to encode message: {e}")),
            RpcError::Decode(e) => Status::internal(format!("failed to decode message: {e}")),
            RpcError::HandlerPanic(msg) => Status::internal(format!("handler panicked: {msg}")),
            RpcError::Transport(e) => Status::unknown(format!("transport error: {e}")),
            RpcError::Protocol(msg) => Status::unknown(format!("protocol violation: {msg}")),
            RpcError::ConnectionClosed => Status::unknown("connection closed"),
        }
    }
}

/// Returns true for the codes that travel on the wire unchanged.
pub fn is_wire_code(code: Code) -> bool {
    matches!(
        code,
        Code::Ok
            | Code::Cancelled
            | Code::Unknown
            | Code::InvalidArgument
            | Code::NotFound
            | Code::Internal
    )
}

/// Normalizes a status produced by a handler before it is sent to the peer.
///
/// Codes outside the wire set are reported as `Internal`, keeping the
/// original message.
pub fn handler_status(status: Status) -> Status {
    if is_wire_code(status.code()) {
        status
    } else {
        Status::internal(status.message().to_owned())
    }
}

/// Reads a numeric status code received from the peer.
pub fn code_from_wire(code: i32) -> Code {
    let code = Code::from(code);
    if is_wire_code(code) {
        code
    } else {
        Code::Unknown
    }
}
