//! Durable stream store abstraction.
//!
//! The queue needs only a handful of primitives from its backing store:
//!
//! - append an entry to a stream, letting the store assign the entry ID
//! - create a named consumer group (a no-op if it already exists)
//! - replay one member's delivered-but-unacknowledged entries without blocking
//! - read a new entry for a member, blocking for a bounded time
//! - acknowledge an entry
//! - ask how many times an entry has been delivered
//! - set a key if it is absent, with no expiry
//! - read a whole stream (for operator inspection)
//!
//! [`RedisStore`] maps these onto Redis/Valkey stream commands. [`MemoryStore`]
//! keeps the same semantics in process and backs the tests.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::types::AckToken;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Errors from the backing store.
///
/// These are transient from the queue's point of view: callers log them and
/// retry rather than dropping data.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Error talking to Redis/Valkey.
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A group-scoped command referenced a group that was never created.
    #[error("no consumer group '{group}' on stream '{stream}'")]
    NoGroup { stream: String, group: String },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Store-assigned entry ID.
    pub id: AckToken,

    /// Field/value pairs as written by the producer.
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    /// Returns the value of a field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Primitives the queue requires from a durable stream store.
///
/// Implementations are cheap to clone; a clone shares the underlying
/// connection or state.
pub trait StreamStore: Clone + Send + Sync + 'static {
    /// Appends an entry and returns the store-assigned ID.
    fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
    ) -> impl Future<Output = Result<AckToken>> + Send;

    /// Creates a consumer group reading from the start of the stream,
    /// creating the stream if needed. Succeeds if the group already exists.
    fn create_group(&self, stream: &str, group: &str) -> impl Future<Output = Result<()>> + Send;

    /// Returns the oldest entry already delivered to `consumer` but not yet
    /// acknowledged, without blocking. Each call counts as a redelivery.
    fn read_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> impl Future<Output = Result<Option<StreamEntry>>> + Send;

    /// Delivers the next never-delivered entry to `consumer`, waiting up to
    /// `block` for one to arrive. A zero `block` does not wait.
    fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> impl Future<Output = Result<Option<StreamEntry>>> + Send;

    /// Acknowledges an entry. Acknowledging an unknown or already
    /// acknowledged entry is a no-op.
    fn ack(&self, stream: &str, group: &str, id: &AckToken)
    -> impl Future<Output = Result<()>> + Send;

    /// Returns how many times a pending entry has been delivered, or 0 if it
    /// is not pending.
    fn delivery_count(
        &self,
        stream: &str,
        group: &str,
        id: &AckToken,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Sets `key` to `value` unless it already exists. Returns whether the key
    /// was set. Keys never expire.
    fn set_if_absent(&self, key: &str, value: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Reads every entry of a stream in order. A missing stream is empty.
    fn range(&self, stream: &str) -> impl Future<Output = Result<Vec<StreamEntry>>> + Send;
}
