//! Message encoding at the boundary between typed handlers and the wire.
//!
//! Protobuf encoding itself is delegated to `prost`. This module adds the
//! pieces the runtime needs around it: conversion to `Bytes` for framing and
//! a type-erased message box so interceptors can see every call regardless of
//! its message types.

use std::any::Any;
use std::fmt;

use bytes::{Bytes, BytesMut};
use prost::Message;
use tonic::Status;

use crate::error::RpcError;

/// Encode a message into a contiguous buffer.
pub fn encode<M: Message>(message: &M) -> Result<Bytes, RpcError> {
    let mut buf = BytesMut::with_capacity(message.encoded_len());
    message.encode(&mut buf)?;
    Ok(buf.freeze())
}

/// Decode a message. Unknown fields are skipped and dropped.
pub fn decode<M: Message + Default>(bytes: Bytes) -> Result<M, RpcError> {
    Ok(M::decode(bytes)?)
}

/// A message whose concrete type has been erased.
pub trait AnyMessage: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> AnyMessage for T
where
    T: Any + fmt::Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Owned, type-erased message as seen by interceptors.
pub type BoxMessage = Box<dyn AnyMessage>;

/// Recover the concrete message type from a [`BoxMessage`].
///
/// Fails with `Internal` if an interceptor replaced the message with one of a
/// different type.
pub fn downcast<M: Any>(message: BoxMessage) -> Result<M, Status> {
    message.into_any().downcast::<M>().map(|m| *m).map_err(|_| {
        Status::internal(format!(
            "message is not a {}",
            std::any::type_name::<M>()
        ))
    })
}

/// Borrow the concrete message type from a [`BoxMessage`].
pub fn downcast_ref<M: Any>(message: &BoxMessage) -> Option<&M> {
    (**message).as_any().downcast_ref::<M>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct Record {
        #[prost(int32, tag = "1")]
        id: i32,
        #[prost(string, tag = "2")]
        label: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    struct RecordV2 {
        #[prost(int32, tag = "1")]
        id: i32,
        #[prost(string, tag = "2")]
        label: String,
        #[prost(uint64, tag = "9")]
        added_later: u64,
    }

    #[test]
    fn test_encode_decode() {
        let record = Record {
            id: 7,
            label: "seven".into(),
        };
        let bytes = encode(&record).unwrap();
        let decoded: Record = decode(bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_unknown_fields_are_skipped() {
        let newer = RecordV2 {
            id: 1,
            label: "one".into(),
            added_later: 99,
        };
        let decoded: Record = decode(encode(&newer).unwrap()).unwrap();
        assert_eq!(decoded.id, 1);
        assert_eq!(decoded.label, "one");
    }

    #[test]
    fn test_truncated_input_fails() {
        let bytes = encode(&Record {
            id: 1,
            label: "truncated".into(),
        })
        .unwrap();
        let result: Result<Record, _> = decode(bytes.slice(..bytes.len() - 3));
        assert!(matches!(result, Err(RpcError::Decode(_))));
    }

    #[test]
    fn test_downcast() {
        let boxed: BoxMessage = Box::new(Record {
            id: 3,
            label: String::new(),
        });
        assert_eq!(downcast_ref::<Record>(&boxed).map(|p| p.id), Some(3));
        assert!(downcast_ref::<RecordV2>(&boxed).is_none());

        let record: Record = downcast(boxed).unwrap();
        assert_eq!(record.id, 3);

        let boxed: BoxMessage = Box::new(Record::default());
        let err = downcast::<RecordV2>(boxed).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }

    fn erase<M: Message + fmt::Debug + 'static>(message: M) -> BoxMessage {
        Box::new(message)
    }

    #[test]
    fn test_erased_message_keeps_debug_output() {
        let boxed = erase(Record {
            id: 5,
            label: "five".into(),
        });
        let rendered = format!("{boxed:?}");
        assert!(rendered.contains("Record"));
        assert!(rendered.contains("id: 5"));
        assert!(rendered.contains("\"five\""));
    }
}
