//! One multiplexed connection.
//!
//! A connection owns a reader task, a writer task and the registry of live
//! sessions. The reader demultiplexes inbound frames by stream id and never
//! blocks on a slow session: messages go into a bounded per-session queue
//! sized to the window this end announced, so a full queue means the peer
//! ignored flow control. The writer serializes frames from every session's
//! send loop onto the byte stream.

use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::descriptor::CallDescriptor;
use crate::error::RpcError;
use crate::frame::{DEFAULT_MAX_FRAME_LENGTH, Frame, FrameCodec, Open, frame::Kind};
use crate::session::{
    Inbound, Role, SessionEntry, SessionMap, SessionParts, SessionShared, spawn_send_loop,
};

/// Accepts calls opened by the peer. Implemented by the server's router.
pub(crate) trait Acceptor: Send + Sync + 'static {
    /// Start serving a call. An error is sent back as the call's final status.
    fn accept(&self, connection: &Connection, stream_id: u64, open: Open) -> Result<(), Status>;
}

/// Tuning shared by client and server connections.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionConfig {
    /// Messages each session buffers inbound before the peer must wait for
    /// credit.
    pub window: u32,
    /// Messages each session queues outbound before `send` suspends.
    pub outbound_capacity: usize,
    /// Frames queued for the writer task.
    pub writer_capacity: usize,
    pub max_frame_length: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            window: 16,
            outbound_capacity: 16,
            writer_capacity: 64,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

struct ConnectionInner {
    sessions: Arc<SessionMap>,
    writer: mpsc::Sender<Frame>,
    closed: CancellationToken,
    next_stream_id: AtomicU64,
    config: ConnectionConfig,
}

/// A handle on a running connection. Cloning is cheap.
#[derive(Clone)]
pub(crate) struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Start the reader and writer tasks over `io`.
    ///
    /// Server connections pass an acceptor for inbound `Open` frames; client
    /// connections pass `None` and treat an inbound `Open` as a protocol
    /// violation.
    pub fn spawn<IO>(io: IO, config: ConnectionConfig, acceptor: Option<Arc<dyn Acceptor>>) -> Self
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let (writer, frames) = mpsc::channel(config.writer_capacity.max(1));

        let reader = FramedRead::new(read_half, FrameCodec::new(config.max_frame_length));
        let sink = FramedWrite::new(write_half, FrameCodec::new(config.max_frame_length));

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                sessions: Arc::new(SessionMap::new()),
                writer,
                closed: CancellationToken::new(),
                next_stream_id: AtomicU64::new(1),
                config,
            }),
        };

        tokio::spawn(write_loop(sink, frames, connection.inner.closed.clone()));
        tokio::spawn(read_loop(reader, connection.clone(), acceptor));

        connection
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Close the connection. Every live session fails with `Unknown`.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// A guard that closes the connection when dropped.
    pub fn close_on_drop(&self) -> DropGuard {
        self.inner.closed.clone().drop_guard()
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Register a session and start its send loop.
    ///
    /// `send_credits` is the number of messages the peer has already agreed
    /// to buffer.
    pub fn register_session(
        &self,
        stream_id: u64,
        descriptor: CallDescriptor,
        role: Role,
        send_credits: u32,
    ) -> Result<SessionParts, RpcError> {
        let config = &self.inner.config;
        let window = config.window.max(1);
        let shared = Arc::new(SessionShared::new(stream_id, descriptor, role));

        // one slot past the window for the end-of-stream marker
        let (inbound_tx, inbound) = mpsc::channel(window as usize + 1);
        let credits = Arc::new(Semaphore::new(send_credits as usize));
        let guard = self.inner.sessions.try_create(
            stream_id,
            SessionEntry {
                inbound: inbound_tx,
                credits: Arc::clone(&credits),
                shared: Arc::clone(&shared),
            },
        )?;

        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        spawn_send_loop(
            Arc::clone(&shared),
            outbound_rx,
            credits,
            self.inner.writer.clone(),
            guard,
        );

        Ok(SessionParts {
            shared,
            inbound,
            outbound,
            writer: self.inner.writer.clone(),
            window,
        })
    }

    /// Open a new call towards the peer.
    pub async fn open_call(&self, descriptor: CallDescriptor) -> Result<SessionParts, RpcError> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let stream_id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let parts = self.register_session(stream_id, descriptor, Role::Client, 0)?;
        self.send_frame(Frame::open(stream_id, descriptor.path, parts.window))
            .await?;
        debug!(stream_id, method = descriptor.path, "Opened call");
        Ok(parts)
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        self.inner
            .writer
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    async fn dispatch(&self, frame: Frame, acceptor: Option<&dyn Acceptor>) -> Result<(), RpcError> {
        let stream_id = frame.stream_id;
        let Some(kind) = frame.kind else {
            return Err(RpcError::Protocol(format!(
                "frame for stream {stream_id} carries no payload"
            )));
        };

        if let Kind::Open(open) = kind {
            let Some(acceptor) = acceptor else {
                return Err(RpcError::Protocol(format!(
                    "peer opened stream {stream_id} on a client connection"
                )));
            };
            if self.inner.sessions.contains(stream_id) {
                return Err(RpcError::Protocol(format!(
                    "stream id {stream_id} is already in use"
                )));
            }
            if let Err(status) = acceptor.accept(self, stream_id, open) {
                self.send_frame(Frame::status(stream_id, &status)).await?;
            }
            return Ok(());
        }

        let Some(entry) = self.inner.sessions.get(stream_id) else {
            debug!(stream_id, "Ignoring frame for unknown stream");
            return Ok(());
        };
        let role = entry.shared.role();

        match kind {
            Kind::Open(_) => {}
            Kind::Message(bytes) => match entry.inbound.try_send(Inbound::Message(bytes)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(stream_id, "Peer exceeded its flow-control window");
                    entry.shared.fail(
                        RpcError::Protocol("peer exceeded its flow-control window".into()).into(),
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(stream_id, "Dropping message for a stream nobody reads");
                }
            },
            Kind::HalfClose(_) => {
                if entry.shared.state().can_recv() {
                    let state = entry.shared.close_recv();
                    let _ = entry.inbound.try_send(Inbound::End);
                    debug!(stream_id, ?role, ?state, "Peer half-closed");
                } else {
                    debug!(stream_id, "Ignoring repeated half-close");
                }
            }
            Kind::Status(status) => match role {
                Role::Client => {
                    let status = status.to_status();
                    if status.code() == Code::Ok {
                        if entry.shared.state().can_recv() {
                            let _ = entry.inbound.try_send(Inbound::End);
                        }
                        entry.shared.complete();
                    } else {
                        debug!(
                            stream_id,
                            code = ?status.code(),
                            message = status.message(),
                            "Call failed on the server"
                        );
                        entry.shared.fail_with_final_status(status);
                    }
                }
                Role::Server => warn!(stream_id, "Ignoring status frame sent by a client"),
            },
            Kind::Cancel(_) => match role {
                Role::Server => {
                    if entry
                        .shared
                        .fail_from_peer(Status::cancelled("call cancelled by client"))
                    {
                        debug!(stream_id, "Call cancelled by client");
                    }
                }
                Role::Client => warn!(stream_id, "Ignoring cancel frame sent by a server"),
            },
            Kind::Credit(credit) => {
                let room = Semaphore::MAX_PERMITS - entry.credits.available_permits();
                entry.credits.add_permits((credit.count as usize).min(room));
            }
        }

        Ok(())
    }

    fn shutdown(&self, reason: &RpcError) {
        match reason {
            RpcError::ConnectionClosed => debug!("Connection closed"),
            other => warn!(error = %other, "Connection failed"),
        }
        self.inner.closed.cancel();

        let status = Status::from(RpcError::ConnectionClosed);
        for entry in self.inner.sessions.entries() {
            entry.shared.fail_from_peer(status.clone());
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("sessions", &self.inner.sessions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    connection: Connection,
    acceptor: Option<Arc<dyn Acceptor>>,
) where
    R: AsyncRead + Unpin,
{
    let closed = connection.inner.closed.clone();
    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => break RpcError::ConnectionClosed,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                if let Err(err) = connection.dispatch(frame, acceptor.as_deref()).await {
                    break err;
                }
            }
            Some(Err(err)) => break err,
            None => break RpcError::ConnectionClosed,
        }
    };
    connection.shutdown(&reason);
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut frames: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = frames.recv() => frame,
            _ = closed.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        if let Err(err) = sink.send(frame).await {
            warn!(error = %err, "Failed to write frame");
            break;
        }
    }
    closed.cancel();
}
