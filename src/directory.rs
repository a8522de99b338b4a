//! Identity to connection mapping with one live connection per identity.
//!
//! Both indices live behind a single mutex so every operation observes and
//! leaves them in agreement: each identity maps to at most one connection and
//! each connection maps back to at most one identity.

use crate::error::{NotifyError, Result};
use crate::session::{ConnectionHandle, ConnectionId};
use chrono::{DateTime, Utc};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Stable user key, the authenticated user's email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(String);

impl Identity {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(NotifyError::Protocol("identity must not be empty".into()));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Identity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
struct SessionEntry {
    handle: ConnectionHandle,
    registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Indices {
    by_identity: HashMap<Identity, SessionEntry>,
    by_connection: HashMap<ConnectionId, Identity>,
}

/// What a `register` call displaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// Older connection that was bound to the same identity
    pub evicted: Option<ConnectionId>,
    /// Different identity that this connection was bound to before
    pub previous_identity: Option<Identity>,
}

#[derive(Debug, Default)]
pub struct SessionDirectory {
    indices: Mutex<Indices>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Indices> {
        // Every mutation keeps both maps consistent before it can panic,
        // so a poisoned guard still holds valid indices.
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `identity` to `handle`, evicting whatever either side was bound to.
    pub fn register(&self, identity: Identity, handle: ConnectionHandle) -> Registration {
        let mut idx = self.lock();
        let id = handle.id();

        let previous_identity = match idx.by_connection.remove(&id) {
            Some(old) if old != identity => {
                if idx.by_identity.get(&old).is_some_and(|e| e.handle.id() == id) {
                    idx.by_identity.remove(&old);
                }
                Some(old)
            }
            _ => None,
        };

        let evicted = match idx.by_identity.remove(&identity) {
            Some(entry) if entry.handle.id() != id => {
                idx.by_connection.remove(&entry.handle.id());
                Some(entry.handle.id())
            }
            _ => None,
        };

        idx.by_connection.insert(id, identity.clone());
        idx.by_identity.insert(
            identity,
            SessionEntry {
                handle,
                registered_at: Utc::now(),
            },
        );

        Registration {
            evicted,
            previous_identity,
        }
    }

    /// Removes the entry for `connection`. Returns the identity it was bound
    /// to, or `None` if the connection was never registered or already gone.
    pub fn unregister(&self, connection: ConnectionId) -> Option<Identity> {
        let mut idx = self.lock();
        let identity = idx.by_connection.remove(&connection)?;
        if idx
            .by_identity
            .get(&identity)
            .is_some_and(|e| e.handle.id() == connection)
        {
            idx.by_identity.remove(&identity);
        }
        Some(identity)
    }

    pub fn lookup(&self, identity: &str) -> Option<ConnectionHandle> {
        self.lock().by_identity.get(identity).map(|e| e.handle.clone())
    }

    /// Runs `f` against the live handle for `identity` while holding the
    /// directory lock, so the binding cannot change underneath it.
    pub fn with_handle<R>(&self, identity: &str, f: impl FnOnce(&ConnectionHandle) -> R) -> Option<R> {
        let idx = self.lock();
        idx.by_identity.get(identity).map(|e| f(&e.handle))
    }

    pub fn identity_of(&self, connection: ConnectionId) -> Option<Identity> {
        self.lock().by_connection.get(&connection).cloned()
    }

    pub fn registered_at(&self, identity: &str) -> Option<DateTime<Utc>> {
        self.lock().by_identity.get(identity).map(|e| e.registered_at)
    }

    pub fn len(&self) -> usize {
        self.lock().by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let idx = self.lock();
        assert_eq!(idx.by_identity.len(), idx.by_connection.len());
        for (identity, entry) in &idx.by_identity {
            assert_eq!(idx.by_connection.get(&entry.handle.id()), Some(identity));
        }
        for (conn, identity) in &idx.by_connection {
            assert_eq!(idx.by_identity.get(identity).map(|e| e.handle.id()), Some(*conn));
        }
    }
}
