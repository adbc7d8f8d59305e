use async_stream::stream;
use futures::Stream;
use prost::Message;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::Status;

use crate::error::RpcError;
use crate::frame::Frame;
use crate::session::state::{Role, SessionShared};
use crate::session::{CallGuard, Inbound, SessionHandle};
use crate::validate::{Validate, ValidationOutcome};

/// The receive half of a session: a typed stream of inbound messages.
///
/// [`message`](Streaming::message) yields `Ok(Some(msg))` for every message,
/// `Ok(None)` once the peer has finished sending, and `Err(status)` if the
/// session failed or was cancelled.
pub struct Streaming<T> {
    shared: Arc<SessionShared>,
    inbound: mpsc::Receiver<Inbound>,
    writer: mpsc::Sender<Frame>,
    credit_threshold: u32,
    consumed: u32,
    finished: bool,
    validator: Option<fn(&T) -> ValidationOutcome>,
    _call: Option<Arc<CallGuard>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Streaming<T> {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        inbound: mpsc::Receiver<Inbound>,
        writer: mpsc::Sender<Frame>,
        window: u32,
    ) -> Self {
        Self {
            shared,
            inbound,
            writer,
            credit_threshold: (window / 2).max(1),
            consumed: 0,
            finished: false,
            validator: None,
            _call: None,
            _marker: PhantomData,
        }
    }

    /// Run `T`'s validation rules on every message before it is yielded.
    pub(crate) fn with_validation(mut self) -> Self
    where
        T: Validate,
    {
        self.validator = Some(<T as Validate>::validate);
        self
    }

    pub(crate) fn with_call_guard(mut self, guard: Arc<CallGuard>) -> Self {
        self._call = Some(guard);
        self
    }

    /// The session this stream belongs to.
    pub fn session(&self) -> SessionHandle {
        SessionHandle::new(Arc::clone(&self.shared))
    }

    /// Receive the next message.
    pub async fn message(&mut self) -> Result<Option<T>, Status>
    where
        T: Message + Default,
    {
        if self.finished {
            return Ok(None);
        }

        let item = tokio::select! {
            biased;
            _ = self.shared.failed().cancelled() => match self.queued_before_failure() {
                Some(item) => Some(item),
                None => return Err(self.shared.failure()),
            },
            item = self.inbound.recv() => item,
        };

        match item {
            Some(Inbound::Message(bytes)) => {
                self.consume().await;

                let message = match T::decode(bytes) {
                    Ok(message) => message,
                    Err(err) => {
                        let status = self.decode_failure(err);
                        self.shared.fail(status.clone());
                        return Err(status);
                    }
                };

                if let Some(validate) = self.validator {
                    if let Err(err) = validate(&message) {
                        tracing::debug!(
                            stream_id = self.shared.id(),
                            method = self.shared.descriptor().path,
                            error = %err,
                            "Inbound message failed validation"
                        );
                        let status = Status::from(RpcError::Validation(err));
                        self.shared.fail(status.clone());
                        return Err(status);
                    }
                }

                Ok(Some(message))
            }
            Some(Inbound::End) => {
                self.finished = true;
                Ok(None)
            }
            None if self.shared.is_failed() => Err(self.shared.failure()),
            None => Err(RpcError::ConnectionClosed.into()),
        }
    }

    /// Convert into a `futures::Stream`. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<T, Status>> + Send + 'static
    where
        T: Message + Default + Send + 'static,
    {
        stream! {
            let mut inner = self;
            loop {
                match inner.message().await {
                    Ok(Some(message)) => yield Ok(message),
                    Ok(None) => break,
                    Err(status) => {
                        yield Err(status);
                        break;
                    }
                }
            }
        }
    }

    fn queued_before_failure(&mut self) -> Option<Inbound> {
        if self.shared.ended_by_final_status() {
            self.inbound.try_recv().ok()
        } else {
            None
        }
    }

    // Each consumed message frees a slot in the inbound queue; hand the slots
    // back to the peer in batches.
    async fn consume(&mut self) {
        self.consumed += 1;
        if self.consumed < self.credit_threshold || self.shared.state().is_terminal() {
            return;
        }
        let count = std::mem::take(&mut self.consumed);
        // a closed writer means the connection is gone and the reader fails the session
        let _ = self
            .writer
            .send(Frame::credit(self.shared.id(), count))
            .await;
    }

    fn decode_failure(&self, err: prost::DecodeError) -> Status {
        let descriptor = self.shared.descriptor();
        tracing::warn!(
            stream_id = self.shared.id(),
            method = descriptor.path,
            error = %err,
            "Failed to decode inbound message"
        );
        match self.shared.role() {
            Role::Server => Status::invalid_argument(format!(
                "failed to decode {}: {err}",
                descriptor.request_type
            )),
            Role::Client => Status::internal(format!(
                "failed to decode {}: {err}",
                descriptor.response_type
            )),
        }
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("session", &self.shared)
            .field("finished", &self.finished)
            .finish()
    }
}
