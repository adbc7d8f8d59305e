//! The per-call session engine.
//!
//! Every call on a connection is a session with two directional halves: a
//! [`Streaming`] that yields inbound messages and a [`StreamSender`] that
//! queues outbound ones. A dedicated send loop per session drains the outbound
//! queue onto the connection, spending one peer credit per message. The
//! inbound half grants credits back as the application consumes messages.
//!
//! Failure, cancellation and deadline expiry all funnel through
//! [`SessionShared::fail`]; every suspended operation on either half wakes up
//! and reports the recorded status.

mod registry;
mod sender;
mod state;
mod streaming;

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::Status;

use crate::frame::Frame;

pub(crate) use registry::{SessionEntry, SessionGuard, SessionMap};
pub(crate) use sender::spawn_send_loop;
pub use sender::StreamSender;
pub(crate) use state::{Role, SessionShared};
pub use state::{SessionHandle, SessionState};
pub use streaming::Streaming;

/// Items the connection reader pushes into a session.
#[derive(Debug)]
pub(crate) enum Inbound {
    Message(Bytes),
    /// The peer finished its send direction successfully.
    End,
}

/// Items the application side queues for the send loop.
#[derive(Debug)]
pub(crate) enum Outbound {
    Message(Bytes),
    HalfClose,
    /// Final status. Only servers send one.
    Status(Status),
}

/// The untyped pieces of a freshly registered session.
#[derive(Debug)]
pub(crate) struct SessionParts {
    pub shared: Arc<SessionShared>,
    pub inbound: mpsc::Receiver<Inbound>,
    pub outbound: mpsc::Sender<Outbound>,
    pub writer: mpsc::Sender<Frame>,
    /// Receive window this end announced to the peer.
    pub window: u32,
}

impl SessionParts {
    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(Arc::clone(&self.shared))
    }

    /// Split into typed halves. `Rx` is what this end receives.
    pub fn into_halves<Rx, Tx>(self) -> (Streaming<Rx>, StreamSender<Tx>) {
        let streaming = Streaming::new(
            Arc::clone(&self.shared),
            self.inbound,
            self.writer,
            self.window,
        );
        let sender = StreamSender::new(self.shared, self.outbound);
        (streaming, sender)
    }
}

/// Cancels a client call once every half of it has been dropped before the
/// call reached a terminal state.
#[derive(Debug)]
pub(crate) struct CallGuard {
    shared: Arc<SessionShared>,
}

impl CallGuard {
    pub fn new(shared: Arc<SessionShared>) -> Arc<Self> {
        Arc::new(Self { shared })
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if self.shared.fail(Status::cancelled("call dropped by client")) {
            tracing::debug!(
                stream_id = self.shared.id(),
                method = self.shared.descriptor().path,
                "Call dropped before completion"
            );
        }
    }
}
