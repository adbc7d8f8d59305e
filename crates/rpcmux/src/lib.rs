//! A multiplexed RPC runtime with streaming sessions, interceptors, request
//! validation and an HTTP/JSON gateway.
//!
//! # Architecture
//!
//! ```text
//! HTTP client ──▶ gateway ──┐
//!                           ▼
//!                       RpcClient ══ one TCP connection, many calls ══▶ RpcRouter ──▶ handlers
//! ```
//!
//! Every call is a session on the connection, identified by a stream id.
//! Calls come in four shapes (see [`CallShape`]); each session has a
//! [`Streaming`] receive half and a [`StreamSender`] send half with bounded
//! queues and credit-based flow control, so a slow consumer suspends the
//! remote producer instead of growing memory.
//!
//! Messages are `prost` types. Methods are described once as `const`
//! [`MethodDescriptor`]s shared by the server, the client and the gateway.

mod codec;
mod connection;
mod descriptor;
mod error;
pub mod frame;
mod path;
mod session;
mod validate;

pub mod client;
pub mod gateway;
pub mod interceptor;
pub mod server;

pub use codec::{AnyMessage, BoxMessage, decode, downcast, downcast_ref, encode};
pub use descriptor::{CallDescriptor, CallShape, MethodDescriptor};
pub use error::{RpcError, RpcPathError, RpcServerError};
pub use path::MethodPath;
pub use session::{SessionHandle, SessionState, StreamSender, Streaming};
pub use validate::{Validate, ValidationError, ValidationOutcome, Validator, Violation};

pub use tonic::{Code, Status};
