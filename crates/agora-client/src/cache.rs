//! Client-side read cache shared by the REST client, the turn transport and
//! the message poller.
//!
//! Collections are stored as raw JSON values so rollback can restore the
//! exact pre-mutation bytes. Every key carries a read generation: bumping it
//! cancels in-flight reads, whose results are then discarded on completion.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::http::current_unix_timestamp_ms;
use crate::AgoraError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Identifies one cached collection.
pub enum CacheKey {
    Rooms,
    Agents,
    RoomAgents { room_id: String },
    RoomSessions { room_id: String },
    SessionMessages { session_id: String },
    SessionTurns { session_id: String },
}

impl CacheKey {
    pub fn room_agents(room_id: impl Into<String>) -> Self {
        Self::RoomAgents {
            room_id: room_id.into(),
        }
    }

    pub fn room_sessions(room_id: impl Into<String>) -> Self {
        Self::RoomSessions {
            room_id: room_id.into(),
        }
    }

    pub fn session_messages(session_id: impl Into<String>) -> Self {
        Self::SessionMessages {
            session_id: session_id.into(),
        }
    }

    pub fn session_turns(session_id: impl Into<String>) -> Self {
        Self::SessionTurns {
            session_id: session_id.into(),
        }
    }

    /// REST path that lists this collection.
    pub fn collection_path(&self) -> String {
        match self {
            CacheKey::Rooms => "/rooms".to_string(),
            CacheKey::Agents => "/agents".to_string(),
            CacheKey::RoomAgents { room_id } => format!("/rooms/{room_id}/agents"),
            CacheKey::RoomSessions { room_id } => format!("/rooms/{room_id}/sessions"),
            CacheKey::SessionMessages { session_id } => {
                format!("/sessions/{session_id}/messages")
            }
            CacheKey::SessionTurns { session_id } => format!("/sessions/{session_id}/turns"),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Rooms => f.write_str("rooms"),
            CacheKey::Agents => f.write_str("agents"),
            CacheKey::RoomAgents { room_id } => write!(f, "room_agents:{room_id}"),
            CacheKey::RoomSessions { room_id } => write!(f, "room_sessions:{room_id}"),
            CacheKey::SessionMessages { session_id } => write!(f, "session_messages:{session_id}"),
            CacheKey::SessionTurns { session_id } => write!(f, "session_turns:{session_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Handle for one in-flight read of a key.
pub struct ReadTicket {
    key: CacheKey,
    generation: u64,
}

impl ReadTicket {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of handing a finished read back to the cache.
pub enum ReadOutcome {
    Applied,
    /// The key is suspended; nothing was written.
    Suspended,
    /// The read was cancelled after it started; nothing was written.
    Superseded,
}

#[derive(Debug, Default)]
struct CacheEntry {
    data: Option<Vec<Value>>,
    stale: bool,
    generation: u64,
    suspended: bool,
    updated_at_ms: u64,
}

#[derive(Debug, Default)]
/// Public struct `QueryCache` used across Agora components.
pub struct QueryCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    mutation_locks: Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<Value>> {
        lock_or_recover(&self.entries)
            .get(key)
            .and_then(|entry| entry.data.clone())
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<Vec<T>>, AgoraError> {
        self.get(key)
            .map(|items| decode_collection(&items))
            .transpose()
    }

    pub fn set(&self, key: &CacheKey, data: Vec<Value>) {
        let mut entries = lock_or_recover(&self.entries);
        let entry = entries.entry(key.clone()).or_default();
        entry.data = Some(data);
        entry.stale = false;
        entry.updated_at_ms = current_unix_timestamp_ms();
    }

    /// Puts back an exact earlier state, including "never loaded".
    pub fn restore(&self, key: &CacheKey, snapshot: Option<Vec<Value>>) {
        let mut entries = lock_or_recover(&self.entries);
        let entry = entries.entry(key.clone()).or_default();
        entry.data = snapshot;
        entry.updated_at_ms = current_unix_timestamp_ms();
    }

    pub fn update<F>(&self, key: &CacheKey, transform: F)
    where
        F: FnOnce(Vec<Value>) -> Vec<Value>,
    {
        let mut entries = lock_or_recover(&self.entries);
        let entry = entries.entry(key.clone()).or_default();
        let current = entry.data.take().unwrap_or_default();
        entry.data = Some(transform(current));
        entry.updated_at_ms = current_unix_timestamp_ms();
    }

    pub fn begin_read(&self, key: &CacheKey) -> ReadTicket {
        let mut entries = lock_or_recover(&self.entries);
        let entry = entries.entry(key.clone()).or_default();
        ReadTicket {
            key: key.clone(),
            generation: entry.generation,
        }
    }

    pub fn complete_read(&self, ticket: ReadTicket, data: Vec<Value>) -> ReadOutcome {
        let mut entries = lock_or_recover(&self.entries);
        let Some(entry) = entries.get_mut(&ticket.key) else {
            tracing::debug!(cache_key = %ticket.key, "discarding read for removed key");
            return ReadOutcome::Superseded;
        };
        if entry.suspended {
            tracing::debug!(cache_key = %ticket.key, "discarding read for suspended key");
            return ReadOutcome::Suspended;
        }
        if entry.generation != ticket.generation {
            tracing::debug!(cache_key = %ticket.key, "discarding superseded read");
            return ReadOutcome::Superseded;
        }
        entry.data = Some(data);
        entry.stale = false;
        entry.updated_at_ms = current_unix_timestamp_ms();
        ReadOutcome::Applied
    }

    pub fn cancel_reads(&self, key: &CacheKey) {
        let mut entries = lock_or_recover(&self.entries);
        let entry = entries.entry(key.clone()).or_default();
        entry.generation = entry.generation.wrapping_add(1);
    }

    pub fn invalidate(&self, key: &CacheKey) {
        let mut entries = lock_or_recover(&self.entries);
        entries.entry(key.clone()).or_default().stale = true;
    }

    /// True when the key was never loaded or has been invalidated since.
    pub fn is_stale(&self, key: &CacheKey) -> bool {
        lock_or_recover(&self.entries)
            .get(key)
            .map(|entry| entry.stale || entry.data.is_none())
            .unwrap_or(true)
    }

    pub fn updated_at_ms(&self, key: &CacheKey) -> Option<u64> {
        lock_or_recover(&self.entries)
            .get(key)
            .filter(|entry| entry.data.is_some())
            .map(|entry| entry.updated_at_ms)
    }

    /// Blocks background reads of `key` and cancels the ones already running.
    pub fn suspend(&self, key: &CacheKey) {
        let mut entries = lock_or_recover(&self.entries);
        let entry = entries.entry(key.clone()).or_default();
        entry.suspended = true;
        entry.generation = entry.generation.wrapping_add(1);
    }

    pub fn resume(&self, key: &CacheKey) {
        let mut entries = lock_or_recover(&self.entries);
        if let Some(entry) = entries.get_mut(key) {
            entry.suspended = false;
        }
    }

    pub fn is_suspended(&self, key: &CacheKey) -> bool {
        lock_or_recover(&self.entries)
            .get(key)
            .map(|entry| entry.suspended)
            .unwrap_or(false)
    }

    /// Forgets `key` entirely. Reads still in flight are discarded and an
    /// idle mutation lock is released; a held lock stays until its
    /// transaction ends.
    pub fn remove(&self, key: &CacheKey) {
        lock_or_recover(&self.entries).remove(key);
        let mut locks = lock_or_recover(&self.mutation_locks);
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }

    /// Serialises mutations on one key; held for a whole transaction.
    pub async fn lock_mutations(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = lock_or_recover(&self.mutation_locks);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

pub(crate) fn decode_collection<T: DeserializeOwned>(items: &[Value]) -> Result<Vec<T>, AgoraError> {
    items
        .iter()
        .map(|item| T::deserialize(item).map_err(AgoraError::from))
        .collect()
}

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
