//! In-process stream store.
//!
//! Mirrors the Redis stream semantics the queue depends on: per-group cursors,
//! a pending entries list (PEL) per member with delivery counters that grow on
//! every replay, blocking reads woken by appends, and set-if-absent keys.
//! Nothing is persisted; the store lives as long as its last clone.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Result, StoreError, StreamEntry, StreamStore};
use crate::types::AckToken;

#[derive(Debug)]
struct StoredEntry {
    id: AckToken,
    fields: Vec<(String, String)>,
}

impl StoredEntry {
    fn to_entry(&self) -> StreamEntry {
        StreamEntry {
            id: self.id.clone(),
            fields: self.fields.iter().cloned().collect(),
        }
    }
}

#[derive(Debug)]
struct Pending {
    consumer: String,
    deliveries: i64,
}

#[derive(Debug, Default)]
struct Group {
    /// Index of the next entry never delivered to this group.
    next_index: usize,
    /// Delivered but unacknowledged entries, keyed by entry index.
    pending: BTreeMap<usize, Pending>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: Vec<StoredEntry>,
    index: HashMap<AckToken, usize>,
    groups: HashMap<String, Group>,
    last_id: (i64, u64),
}

impl Stream {
    fn next_id(&mut self) -> AckToken {
        let now = Utc::now().timestamp_millis();
        let (last_ms, last_seq) = self.last_id;
        self.last_id = if now > last_ms {
            (now, 0)
        } else {
            (last_ms, last_seq + 1)
        };
        AckToken(format!("{}-{}", self.last_id.0, self.last_id.1))
    }
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, Stream>,
    keys: HashMap<String, String>,
}

impl State {
    fn group_mut(
        &mut self,
        stream: &str,
        group: &str,
    ) -> Result<(&mut Vec<StoredEntry>, &mut Group)> {
        let no_group = || StoreError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let s = self.streams.get_mut(stream).ok_or_else(no_group)?;
        let g = s.groups.get_mut(group).ok_or_else(no_group)?;
        Ok((&mut s.entries, g))
    }

    fn claim_pending(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<StreamEntry>> {
        let (entries, g) = self.group_mut(stream, group)?;
        let claimed = g
            .pending
            .iter_mut()
            .find(|(_, p)| p.consumer == consumer)
            .map(|(idx, p)| {
                p.deliveries += 1;
                *idx
            });
        Ok(claimed.map(|idx| entries[idx].to_entry()))
    }

    fn claim_new(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<StreamEntry>> {
        let (entries, g) = self.group_mut(stream, group)?;
        if g.next_index >= entries.len() {
            return Ok(None);
        }
        let idx = g.next_index;
        g.next_index += 1;
        g.pending.insert(
            idx,
            Pending {
                consumer: consumer.to_string(),
                deliveries: 1,
            },
        );
        Ok(Some(entries[idx].to_entry()))
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    appended: Notify,
}

/// An in-memory [`StreamStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of entries in a stream, acknowledged or not.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state().streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// Number of entries pending for a group, across all members.
    pub fn pending_len(&self, stream: &str, group: &str) -> usize {
        self.state()
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.len())
    }

    /// Returns the value stored under `key`.
    pub fn get_key(&self, key: &str) -> Option<String> {
        self.state().keys.get(key).cloned()
    }
}

impl StreamStore for MemoryStore {
    async fn append(&self, stream: &str, fields: &[(&str, &str)]) -> Result<AckToken> {
        let id = {
            let mut state = self.state();
            let s = state.streams.entry(stream.to_string()).or_default();
            let id = s.next_id();
            s.index.insert(id.clone(), s.entries.len());
            s.entries.push(StoredEntry {
                id: id.clone(),
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            });
            id
        };
        self.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut state = self.state();
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<StreamEntry>> {
        self.state().claim_pending(stream, group, consumer)
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<StreamEntry>> {
        // Saturate absurd timeouts instead of overflowing.
        let deadline = Instant::now()
            .checked_add(block)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        loop {
            // Register interest before checking so an append between the
            // check and the wait still wakes us.
            let appended = self.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let claimed = self.state().claim_new(stream, group, consumer)?;
            if claimed.is_some() {
                return Ok(claimed);
            }
            if block.is_zero() || tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &AckToken) -> Result<()> {
        let mut state = self.state();
        let Some(s) = state.streams.get_mut(stream) else {
            return Ok(());
        };
        if let (Some(idx), Some(g)) = (s.index.get(id), s.groups.get_mut(group)) {
            g.pending.remove(idx);
        }
        Ok(())
    }

    async fn delivery_count(&self, stream: &str, group: &str, id: &AckToken) -> Result<i64> {
        let state = self.state();
        let count = state.streams.get(stream).and_then(|s| {
            let idx = s.index.get(id)?;
            s.groups.get(group)?.pending.get(idx).map(|p| p.deliveries)
        });
        Ok(count.unwrap_or(0))
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut state = self.state();
        if state.keys.contains_key(key) {
            return Ok(false);
        }
        state.keys.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn range(&self, stream: &str) -> Result<Vec<StreamEntry>> {
        let state = self.state();
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.iter().map(StoredEntry::to_entry).collect())
            .unwrap_or_default())
    }
}
