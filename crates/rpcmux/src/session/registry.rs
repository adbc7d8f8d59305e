use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};

use crate::error::RpcError;
use crate::session::Inbound;
use crate::session::state::SessionShared;

/// What the connection reader needs to route frames into one session.
#[derive(Debug, Clone)]
pub(crate) struct SessionEntry {
    pub inbound: mpsc::Sender<Inbound>,
    pub credits: Arc<Semaphore>,
    pub shared: Arc<SessionShared>,
}

/// Tracks the live sessions of one connection, keyed by stream id.
///
/// Only one session may use a stream id at a time. Creating a session hands
/// back a guard that removes the entry when dropped.
#[derive(Debug)]
pub(crate) struct SessionMap {
    sessions: DashMap<u64, SessionEntry, ahash::RandomState>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::default(),
        }
    }

    /// Try to register a session. Returns a guard that removes it on drop.
    ///
    /// Fails if the stream id is already in use.
    pub fn try_create(
        self: &Arc<Self>,
        stream_id: u64,
        entry: SessionEntry,
    ) -> Result<SessionGuard, RpcError> {
        use dashmap::mapref::entry::Entry;

        match self.sessions.entry(stream_id) {
            Entry::Occupied(_) => Err(RpcError::Protocol(format!(
                "stream id {stream_id} is already in use"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(SessionGuard {
                    stream_id,
                    map: Arc::clone(self),
                })
            }
        }
    }

    pub fn get(&self, stream_id: u64) -> Option<SessionEntry> {
        self.sessions.get(&stream_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, stream_id: u64) -> bool {
        self.sessions.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every live session.
    pub fn entries(&self) -> Vec<SessionEntry> {
        self.sessions.iter().map(|entry| entry.clone()).collect()
    }

    fn remove(&self, stream_id: u64) {
        self.sessions.remove(&stream_id);
    }
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a session registered. When dropped, the session is removed and
/// further frames for its stream id are ignored.
pub(crate) struct SessionGuard {
    stream_id: u64,
    map: Arc<SessionMap>,
}

impl SessionGuard {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.map.remove(self.stream_id);
    }
}

impl fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionGuard")
            .field("stream_id", &self.stream_id)
            .finish()
    }
}
