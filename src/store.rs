//! # Session Persistence
//!
//! When an established session leaves the table with a connection ID (idle
//! expiry, `close_all`), the engine serializes it to a [`StoredSession`]
//! and hands it to the [`SessionStore`] keyed by the own-CID bytes. A node
//! receiving a CID-carrying record for an unknown address asks the store
//! for that CID and resurrects the session in place.
//!
//! The crypto blob inside a [`StoredSession`] is fully opaque to this
//! crate; only the backend that produced it can interpret it.
//!
//! ## Encoding
//!
//! [`StoredSession`] serializes with bincode under a hard size limit, so a
//! corrupt or hostile store entry cannot balloon a deserialization buffer.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use bincode::Options;
use lru::LruCache;
use serde::{Deserialize, Serialize};

/// Maximum encoded size of a stored session (crypto blob + auth context).
/// SECURITY: bounds the deserialization buffer for store entries.
pub const MAX_STORED_SESSION_SIZE: u64 = 64 * 1024;

/// Default capacity of [`MemoryStore`].
pub const DEFAULT_MEMORY_STORE_CAPACITY: usize = 10_000;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_STORED_SESSION_SIZE)
        .with_fixint_encoding()
}

/// A session evicted from the table, sufficient to resurrect it later.
///
/// Keyed externally by the session's own-CID bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    /// Opaque serialized crypto context from the backend.
    pub session_blob: Vec<u8>,
    /// Application-level key/value annotations attached while the session
    /// was live.
    pub authentication_context: HashMap<String, String>,
    /// Wall-clock session start, unix milliseconds.
    pub session_start_unix_ms: u64,
}

impl StoredSession {
    pub fn new(
        session_blob: Vec<u8>,
        authentication_context: HashMap<String, String>,
        session_start: SystemTime,
    ) -> Self {
        let session_start_unix_ms = session_start
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            session_blob,
            authentication_context,
            session_start_unix_ms,
        }
    }

    /// The session start as a [`SystemTime`].
    pub fn session_start(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.session_start_unix_ms)
    }

    /// Encode for an external byte-oriented store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode_options().serialize(self)
    }

    /// Decode with the size limit enforced.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode_options().deserialize(bytes)
    }
}

/// External key-value store for evicted sessions, keyed by own-CID.
///
/// `store_session` is called at most once per session end and its errors
/// are logged and swallowed by the engine; the session is closed either
/// way. `load_session` is the read-through used when a CID-carrying record
/// arrives for an unknown address.
pub trait SessionStore: Send + Sync {
    fn store_session(&self, cid: &[u8], session: StoredSession) -> Result<()>;

    fn load_session(&self, cid: &[u8]) -> Result<Option<StoredSession>>;
}

/// Bounded in-memory store.
///
/// Oldest entries are evicted when at capacity, so a node that never prunes
/// externally still cannot grow without bound.
pub struct MemoryStore {
    sessions: Mutex<LruCache<Vec<u8>, StoredSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_STORE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is non-zero");
        Self {
            sessions: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemoryStore {
    fn store_session(&self, cid: &[u8], session: StoredSession) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        sessions.put(cid.to_vec(), session);
        Ok(())
    }

    fn load_session(&self, cid: &[u8]) -> Result<Option<StoredSession>> {
        let mut sessions = self.sessions.lock().expect("store lock poisoned");
        Ok(sessions.get(cid).cloned())
    }
}
