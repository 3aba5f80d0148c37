//! Connection registry
//!
//! Maps a live client connection to the session it negotiated. Entries are
//! added once request decoding succeeds and removed when the connection goes
//! inactive. The map is sharded (`DashMap`), so unrelated connections never
//! contend on one lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::debug;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::common::{ProxyError, Result};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an accepted client connection
///
/// Unique per accepted socket within the process and stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next connection identity
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How the client asked to be proxied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    /// Opaque byte stream (HTTP CONNECT, SOCKS5 CONNECT)
    Tunnel,
    /// Plain HTTP request with an absolute URI, replayed verbatim
    Web,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Tunnel => write!(f, "tunnel"),
            ProxyType::Web => write!(f, "web"),
        }
    }
}

/// Session metadata for one accepted client connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub proxy_type: ProxyType,
    /// Requested destination as `host:port`
    pub target: String,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        proxy_type: ProxyType,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            proxy_type,
            target: target.into(),
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} ({})",
            self.id, self.remote_addr, self.target, self.proxy_type
        )
    }
}

/// Process-wide table of live sessions
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<ConnectionId, Session>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session for a connection
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::DuplicateSession` if the connection already has a
    /// live session. The existing entry is left untouched.
    pub fn add(&self, session: Session) -> Result<()> {
        match self.sessions.entry(session.id) {
            Entry::Occupied(_) => Err(ProxyError::DuplicateSession(session.id)),
            Entry::Vacant(slot) => {
                debug!("Registered session {}", session);
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Look up the session of a connection
    pub fn get(&self, id: ConnectionId) -> Option<Session> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Remove the session of a connection
    ///
    /// Removing an absent entry is a no-op, so every teardown path may call it.
    pub fn remove(&self, id: ConnectionId) -> Option<Session> {
        let removed = self.sessions.remove(&id).map(|(_, session)| session);
        if let Some(session) = &removed {
            debug!("Removed session {}", session);
        }
        removed
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Insert a session and tie its removal to the returned guard
    pub fn register(self: &Arc<Self>, session: Session) -> Result<SessionGuard> {
        let id = session.id;
        self.add(session)?;
        Ok(SessionGuard {
            registry: Arc::clone(self),
            id,
        })
    }
}

/// Removes a session from its registry when dropped
///
/// Owned by the task driving the connection, so the entry disappears on every
/// exit path: clean close, I/O error, or upstream failure.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl SessionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
