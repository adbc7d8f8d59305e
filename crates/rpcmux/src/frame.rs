//! Wire frames multiplexing many calls over one byte stream.
//!
//! Every frame is a protobuf [`Frame`] preceded by a 4-byte big-endian length.
//! A call is a sequence of frames sharing a `stream_id`:
//!
//! ```text
//! client                                   server
//!   Open{method, window}  ───────────────▶
//!                         ◀───────────────  Credit{window}
//!   Message*              ───────────────▶
//!                         ◀───────────────  Message*
//!   HalfClose             ───────────────▶
//!                         ◀───────────────  HalfClose (optional)
//!                         ◀───────────────  Status{code, message}
//! ```
//!
//! `Credit` frames flow against the message direction and grant the sender
//! permission for more messages. A client may abandon a call with `Cancel`.

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use tonic::Status;

use crate::error::{RpcError, code_from_wire};

/// A single frame on the connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    /// The call this frame belongs to.
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(oneof = "frame::Kind", tags = "2, 3, 4, 5, 6, 7")]
    pub kind: ::core::option::Option<frame::Kind>,
}
pub mod frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        /// Opens a call.
        #[prost(message, tag = "2")]
        Open(super::Open),
        /// One encoded message.
        #[prost(bytes = "bytes", tag = "3")]
        Message(::prost::bytes::Bytes),
        /// The sender will send no more messages on this call.
        #[prost(message, tag = "4")]
        HalfClose(super::HalfClose),
        /// Final outcome of the call, sent by the server.
        #[prost(message, tag = "5")]
        Status(super::StatusFrame),
        /// The client abandons the call.
        #[prost(message, tag = "6")]
        Cancel(super::Cancel),
        /// Flow-control grant.
        #[prost(message, tag = "7")]
        Credit(super::Credit),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Open {
    /// Method path, `{package}.{service}/{method}`.
    #[prost(string, tag = "1")]
    pub method: ::prost::alloc::string::String,
    /// Number of messages the opener is willing to buffer before granting
    /// more credit.
    #[prost(uint32, tag = "2")]
    pub window: u32,
}
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct HalfClose {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusFrame {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Cancel {}
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Credit {
    #[prost(uint32, tag = "1")]
    pub count: u32,
}

impl Frame {
    fn with_kind(stream_id: u64, kind: frame::Kind) -> Self {
        Self {
            stream_id,
            kind: Some(kind),
        }
    }

    pub fn open(stream_id: u64, method: impl Into<String>, window: u32) -> Self {
        Self::with_kind(
            stream_id,
            frame::Kind::Open(Open {
                method: method.into(),
                window,
            }),
        )
    }

    pub fn message(stream_id: u64, payload: Bytes) -> Self {
        Self::with_kind(stream_id, frame::Kind::Message(payload))
    }

    pub fn half_close(stream_id: u64) -> Self {
        Self::with_kind(stream_id, frame::Kind::HalfClose(HalfClose {}))
    }

    pub fn status(stream_id: u64, status: &Status) -> Self {
        Self::with_kind(
            stream_id,
            frame::Kind::Status(StatusFrame {
                code: status.code() as i32,
                message: status.message().to_owned(),
            }),
        )
    }

    pub fn cancel(stream_id: u64) -> Self {
        Self::with_kind(stream_id, frame::Kind::Cancel(Cancel {}))
    }

    pub fn credit(stream_id: u64, count: u32) -> Self {
        Self::with_kind(stream_id, frame::Kind::Credit(Credit { count }))
    }
}

impl StatusFrame {
    pub fn to_status(&self) -> Status {
        Status::new(code_from_wire(self.code), self.message.clone())
    }
}

/// Default upper bound for a single frame, 4 MiB.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Length-delimited protobuf framing for [`Frame`]s.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RpcError> {
        match self.inner.decode(src)? {
            Some(buf) => Ok(Some(Frame::decode(buf.freeze())?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = RpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), RpcError> {
        let mut buf = BytesMut::with_capacity(frame.encoded_len());
        frame.encode(&mut buf)?;
        self.inner.encode(buf.freeze(), dst)?;
        Ok(())
    }
}
