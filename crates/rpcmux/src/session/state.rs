use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::descriptor::CallDescriptor;

/// Lifecycle of one end of a call.
///
/// "Send" is this end's outbound direction, "recv" its inbound direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    OpenBoth,
    SendOpenRecvClosed,
    SendClosedRecvOpen,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn can_send(self) -> bool {
        matches!(self, SessionState::OpenBoth | SessionState::SendOpenRecvClosed)
    }

    pub fn can_recv(self) -> bool {
        matches!(self, SessionState::OpenBoth | SessionState::SendClosedRecvOpen)
    }

    fn close_send(self) -> Self {
        match self {
            SessionState::OpenBoth => SessionState::SendClosedRecvOpen,
            SessionState::SendOpenRecvClosed => SessionState::Closed,
            other => other,
        }
    }

    fn close_recv(self) -> Self {
        match self {
            SessionState::OpenBoth => SessionState::SendOpenRecvClosed,
            SessionState::SendClosedRecvOpen => SessionState::Closed,
            other => other,
        }
    }
}

/// Which end of the call this session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// State shared by every piece of one session: both directional halves, the
/// send loop, and any [`SessionHandle`]s given out.
pub(crate) struct SessionShared {
    id: u64,
    descriptor: CallDescriptor,
    role: Role,
    started_at: Instant,
    state: watch::Sender<SessionState>,
    failure: OnceLock<Status>,
    // fires on Failed only; every suspended send/recv waits on it
    failed: CancellationToken,
    // fires on Closed or Failed
    terminated: CancellationToken,
    peer_notified: AtomicBool,
    // set when the failure is the peer's final status; messages it sent
    // before that status are still delivered
    final_status: AtomicBool,
}

impl SessionShared {
    pub(crate) fn new(id: u64, descriptor: CallDescriptor, role: Role) -> Self {
        let (state, _) = watch::channel(SessionState::OpenBoth);
        Self {
            id,
            descriptor,
            role,
            started_at: Instant::now(),
            state,
            failure: OnceLock::new(),
            failed: CancellationToken::new(),
            terminated: CancellationToken::new(),
            peer_notified: AtomicBool::new(false),
            final_status: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn failed(&self) -> &CancellationToken {
        &self.failed
    }

    pub(crate) fn terminated(&self) -> &CancellationToken {
        &self.terminated
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// The status every operation reports once the session has failed.
    pub(crate) fn failure(&self) -> Status {
        self.failure
            .get()
            .cloned()
            .unwrap_or_else(|| Status::cancelled("call cancelled"))
    }

    fn transition(&self, f: impl FnOnce(SessionState) -> SessionState) -> SessionState {
        let mut next = SessionState::Failed;
        self.state.send_if_modified(|state| {
            next = f(*state);
            if next == *state {
                false
            } else {
                *state = next;
                true
            }
        });
        if next.is_terminal() {
            self.terminated.cancel();
        }
        next
    }

    pub(crate) fn close_send(&self) -> SessionState {
        self.transition(SessionState::close_send)
    }

    pub(crate) fn close_recv(&self) -> SessionState {
        self.transition(SessionState::close_recv)
    }

    /// Marks the call as finished successfully, whatever directions are still
    /// open. Used when the final status has been exchanged.
    pub(crate) fn complete(&self) -> SessionState {
        self.transition(|state| {
            if state.is_terminal() {
                state
            } else {
                SessionState::Closed
            }
        })
    }

    /// Fails the session. The first failure wins; returns whether this call
    /// recorded it.
    pub(crate) fn fail(&self, status: Status) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        let recorded = self.failure.set(status).is_ok();
        if recorded {
            self.transition(|_| SessionState::Failed);
            self.failed.cancel();
        }
        recorded
    }

    /// Fails the session because of something the peer told us; the peer
    /// needs no notification.
    pub(crate) fn fail_from_peer(&self, status: Status) -> bool {
        self.peer_notified.store(true, Ordering::SeqCst);
        self.fail(status)
    }

    /// Fails the session with the error status that ended the call on the
    /// server. Unlike other failures, inbound messages queued before it are
    /// still yielded.
    pub(crate) fn fail_with_final_status(&self, status: Status) -> bool {
        self.final_status.store(true, Ordering::SeqCst);
        let recorded = self.fail_from_peer(status);
        if !recorded {
            self.final_status.store(false, Ordering::SeqCst);
        }
        recorded
    }

    pub(crate) fn ended_by_final_status(&self) -> bool {
        self.final_status.load(Ordering::SeqCst) && self.is_failed()
    }

    pub(crate) fn mark_peer_notified(&self) {
        self.peer_notified.store(true, Ordering::SeqCst);
    }

    /// Returns true exactly once, for whoever gets to tell the peer about a
    /// local failure.
    pub(crate) fn take_peer_notice(&self) -> bool {
        !self.peer_notified.swap(true, Ordering::SeqCst)
    }

    pub(crate) async fn wait_terminal(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

impl fmt::Debug for SessionShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionShared")
            .field("id", &self.id)
            .field("method", &self.descriptor.path)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

/// A handle on one in-flight call.
///
/// Handed to stream interceptors and available from both directional halves.
/// Cloning is cheap; all clones observe the same session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    /// Stream id of the call on its connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn descriptor(&self) -> &CallDescriptor {
        &self.shared.descriptor
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn started_at(&self) -> Instant {
        self.shared.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.shared.started_at.elapsed()
    }

    /// Cancel the call. Pending and future sends and receives on either half
    /// return `Cancelled`, and the peer is told.
    pub fn cancel(&self) {
        if self.shared.fail(Status::cancelled("call cancelled")) {
            tracing::debug!(
                stream_id = self.shared.id,
                method = self.shared.descriptor.path,
                "Session cancelled locally"
            );
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_failed()
    }

    /// Resolves once the session has failed or been cancelled.
    pub async fn cancelled(&self) {
        self.shared.failed.cancelled().await
    }

    /// The failure status, if the session has failed.
    pub fn failure(&self) -> Option<Status> {
        self.shared.failure.get().cloned()
    }

    /// Waits until both directions are done, returning the terminal state.
    pub async fn closed(&self) -> SessionState {
        self.shared.wait_terminal().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::CallShape;
    use tonic::Code;

    const DESCRIPTOR: CallDescriptor = CallDescriptor {
        path: "test.EchoService/Chat",
        shape: CallShape::BidiStreaming,
        request_type: "test.Ping",
        response_type: "test.Pong",
    };

    fn session() -> SessionShared {
        SessionShared::new(1, DESCRIPTOR, Role::Client)
    }

    #[test]
    fn test_send_then_recv_close() {
        let s = session();
        assert_eq!(s.close_send(), SessionState::SendClosedRecvOpen);
        assert!(!s.terminated().is_cancelled());
        assert_eq!(s.close_recv(), SessionState::Closed);
        assert!(s.terminated().is_cancelled());
        assert!(!s.is_failed());
    }

    #[test]
    fn test_recv_then_send_close() {
        let s = session();
        assert_eq!(s.close_recv(), SessionState::SendOpenRecvClosed);
        assert!(s.state().can_send());
        assert!(!s.state().can_recv());
        assert_eq!(s.close_send(), SessionState::Closed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let s = session();
        s.close_send();
        assert_eq!(s.close_send(), SessionState::SendClosedRecvOpen);
    }

    #[test]
    fn test_first_failure_wins() {
        let s = session();
        assert!(s.fail(Status::invalid_argument("bad")));
        assert!(!s.fail(Status::internal("later")));
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(s.failure().code(), Code::InvalidArgument);
        assert!(s.failed().is_cancelled());
        assert!(s.terminated().is_cancelled());
    }

    #[test]
    fn test_closed_session_cannot_fail() {
        let s = session();
        s.complete();
        assert!(!s.fail(Status::cancelled("too late")));
        assert_eq!(s.state(), SessionState::Closed);
        assert!(!s.failed().is_cancelled());
    }

    #[test]
    fn test_peer_notice_taken_once() {
        let s = session();
        assert!(s.take_peer_notice());
        assert!(!s.take_peer_notice());

        let s = session();
        s.fail_from_peer(Status::cancelled("peer went away"));
        assert!(!s.take_peer_notice());
    }

    #[tokio::test]
    async fn test_handle_waits_for_terminal_state() {
        let shared = Arc::new(session());
        let handle = SessionHandle::new(Arc::clone(&shared));

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.closed().await }
        });

        shared.close_send();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        shared.close_recv();
        assert_eq!(waiter.await.unwrap(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_handle_cancel() {
        let handle = SessionHandle::new(Arc::new(session()));
        handle.cancel();
        handle.cancelled().await;
        assert!(handle.is_cancelled());
        assert_eq!(handle.failure().unwrap().code(), Code::Cancelled);
        assert_eq!(handle.closed().await, SessionState::Failed);
    }
}
