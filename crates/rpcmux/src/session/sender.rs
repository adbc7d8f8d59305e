use prost::Message;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tonic::{Code, Status};

use crate::codec;
use crate::error::{RpcError, handler_status};
use crate::frame::Frame;
use crate::session::state::{Role, SessionShared, SessionState};
use crate::session::{CallGuard, Outbound, SessionGuard, SessionHandle};

/// The send half of a session.
///
/// `send` suspends while the outbound queue is full, which happens once the
/// peer has stopped granting credit. Every operation fails with the session's
/// status once the session has failed.
pub struct StreamSender<T> {
    shared: Arc<SessionShared>,
    outbound: mpsc::Sender<Outbound>,
    closed: bool,
    _call: Option<Arc<CallGuard>>,
    _marker: PhantomData<fn(T)>,
}

impl<T> StreamSender<T> {
    pub(crate) fn new(shared: Arc<SessionShared>, outbound: mpsc::Sender<Outbound>) -> Self {
        Self {
            shared,
            outbound,
            closed: false,
            _call: None,
            _marker: PhantomData,
        }
    }

    pub(crate) fn with_call_guard(mut self, guard: Arc<CallGuard>) -> Self {
        self._call = Some(guard);
        self
    }

    /// The session this sender belongs to.
    pub fn session(&self) -> SessionHandle {
        SessionHandle::new(Arc::clone(&self.shared))
    }

    /// Whether [`close`](StreamSender::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue one message for the peer.
    pub async fn send(&mut self, message: T) -> Result<(), Status>
    where
        T: Message,
    {
        if self.shared.is_failed() {
            return Err(self.shared.failure());
        }
        if self.closed {
            return Err(Status::internal("send after the stream was closed"));
        }
        if self.shared.state().is_terminal() {
            return Err(Status::internal("send after the call completed"));
        }
        let bytes = codec::encode(&message)?;
        self.enqueue(Outbound::Message(bytes)).await
    }

    /// Half-close: tell the peer no more messages follow. Idempotent.
    ///
    /// Closing a call that already completed successfully is a no-op.
    pub async fn close(&mut self) -> Result<(), Status> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.shared.state() == SessionState::Closed {
            return Ok(());
        }
        match self.enqueue(Outbound::HalfClose).await {
            // completed while the half-close was queued
            Err(_) if self.shared.state() == SessionState::Closed => Ok(()),
            result => result,
        }
    }

    async fn enqueue(&self, item: Outbound) -> Result<(), Status> {
        tokio::select! {
            biased;
            _ = self.shared.failed().cancelled() => Err(self.shared.failure()),
            sent = self.outbound.send(item) => sent.map_err(|_| {
                if self.shared.is_failed() {
                    self.shared.failure()
                } else {
                    Status::internal("send after the call completed")
                }
            }),
        }
    }
}

impl<T> fmt::Debug for StreamSender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSender")
            .field("session", &self.shared)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Start the task that moves one session's outbound queue onto the
/// connection.
///
/// The task owns the session's registry guard. It exits once the session is
/// terminal, telling the peer about a local failure on the way out: a client
/// sends `Cancel`, a server sends the failure status.
pub(crate) fn spawn_send_loop(
    shared: Arc<SessionShared>,
    outbound: mpsc::Receiver<Outbound>,
    credits: Arc<Semaphore>,
    writer: mpsc::Sender<Frame>,
    guard: SessionGuard,
) -> JoinHandle<()> {
    tokio::spawn(send_loop(shared, outbound, credits, writer, guard))
}

async fn send_loop(
    shared: Arc<SessionShared>,
    mut outbound: mpsc::Receiver<Outbound>,
    credits: Arc<Semaphore>,
    writer: mpsc::Sender<Frame>,
    guard: SessionGuard,
) {
    let _guard = guard;
    let id = shared.id();

    loop {
        let item = tokio::select! {
            biased;
            _ = shared.terminated().cancelled() => break,
            item = outbound.recv() => item,
        };

        match item {
            Some(Outbound::Message(bytes)) => {
                let permit = tokio::select! {
                    biased;
                    _ = shared.terminated().cancelled() => break,
                    permit = credits.acquire() => permit,
                };
                match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => {
                        shared.fail_from_peer(RpcError::ConnectionClosed.into());
                        break;
                    }
                }
                if !write(&writer, &shared, Frame::message(id, bytes)).await {
                    break;
                }
            }
            Some(Outbound::HalfClose) => {
                if !write(&writer, &shared, Frame::half_close(id)).await {
                    break;
                }
                shared.close_send();
            }
            Some(Outbound::Status(status)) => {
                if !write(&writer, &shared, Frame::status(id, &status)).await {
                    break;
                }
                shared.mark_peer_notified();
                if status.code() == Code::Ok {
                    shared.complete();
                } else {
                    shared.fail(status);
                }
                break;
            }
            None => {
                match shared.role() {
                    // every sender dropped without closing: treat as half-close
                    Role::Client if shared.state().can_send() => {
                        if write(&writer, &shared, Frame::half_close(id)).await {
                            shared.close_send();
                        }
                    }
                    Role::Client => {}
                    Role::Server => {
                        shared.fail(Status::internal("handler finished without a status"));
                    }
                }
                break;
            }
        }
    }

    shared.terminated().cancelled().await;

    if shared.is_failed() && shared.take_peer_notice() {
        let frame = match shared.role() {
            Role::Client => Frame::cancel(id),
            Role::Server => Frame::status(id, &handler_status(shared.failure())),
        };
        let _ = writer.send(frame).await;
    }

    tracing::debug!(
        stream_id = id,
        method = shared.descriptor().path,
        state = ?shared.state(),
        "Session finished"
    );
}

async fn write(writer: &mpsc::Sender<Frame>, shared: &SessionShared, frame: Frame) -> bool {
    if writer.send(frame).await.is_ok() {
        return true;
    }
    shared.fail_from_peer(RpcError::ConnectionClosed.into());
    false
}
