//! Appending reports to the live stream.

use tracing::{info, instrument};

use super::alloc::{Clock, IdAllocator, SystemClock};
use super::{QueueError, Result, STREAM_NAME, fields};
use crate::config::ConfigError;
use crate::store::StreamStore;
use crate::types::{Report, ReportId};

/// Writes reports into the queue on behalf of one node.
#[derive(Debug, Clone)]
pub struct ReportWriter<S, C = SystemClock> {
    store: S,
    allocator: IdAllocator<S, C>,
}

impl<S: StreamStore> ReportWriter<S> {
    /// Creates a writer for `node_id`.
    ///
    /// `node_id` must be unique among the nodes whose stores are drained
    /// together, or their IDs may collide.
    pub fn new(store: S, node_id: u32) -> std::result::Result<Self, ConfigError> {
        let allocator = IdAllocator::new(store.clone(), node_id)?;
        Ok(ReportWriter { store, allocator })
    }
}

impl<S: StreamStore, C: Clock> ReportWriter<S, C> {
    /// Creates a writer around an existing allocator.
    pub fn with_allocator(store: S, allocator: IdAllocator<S, C>) -> Self {
        ReportWriter { store, allocator }
    }

    /// Enqueues a report and returns its allocated ID.
    ///
    /// If the append fails after the ID was claimed, the ID is burned: it is
    /// never reused and no report carries it.
    pub async fn add_report(
        &self,
        sender: &str,
        timestamp: &str,
        report: &Report,
    ) -> Result<ReportId> {
        let payload = serde_json::to_string(report).map_err(QueueError::Encode)?;
        self.append(sender, timestamp, &payload).await
    }

    /// Enqueues a report that is already serialized, keeping its exact bytes.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Decode` if `json` is not a valid report; nothing
    /// is allocated in that case.
    pub async fn add_raw_report(&self, sender: &str, timestamp: &str, json: &str) -> Result<ReportId> {
        serde_json::from_str::<Report>(json).map_err(|e| QueueError::Decode {
            token: "<unsubmitted>".to_string(),
            reason: e.to_string(),
            raw: None,
        })?;
        self.append(sender, timestamp, json).await
    }

    #[instrument(skip(self, payload), fields(sender = %sender))]
    async fn append(&self, sender: &str, timestamp: &str, payload: &str) -> Result<ReportId> {
        let id = self.allocator.allocate().await?;
        let id_str = id.to_string();
        let token = self
            .store
            .append(
                STREAM_NAME,
                &[
                    (fields::ID, id_str.as_str()),
                    (fields::SENDER, sender),
                    (fields::REPORT, payload),
                    (fields::TIMESTAMP, timestamp),
                ],
            )
            .await?;
        info!(report_id = %id, ack_token = %token, "Report enqueued");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::FixedClock;
    use crate::types::{RepoRef, Subject};

    fn writer(store: &MemoryStore) -> ReportWriter<MemoryStore, FixedClock> {
        let alloc = IdAllocator::with_clock(store.clone(), 4, FixedClock(1_700_000_000)).unwrap();
        ReportWriter::with_allocator(store.clone(), alloc)
    }

    #[tokio::test]
    async fn add_report_appends_all_fields() {
        let store = MemoryStore::new();
        let report = Report {
            subject: Some(Subject::RepoRef(RepoRef {
                did: "did:example:bob".to_string(),
                extra: Default::default(),
            })),
            ..Report::with_reason_type("spam")
        };

        let id = writer(&store)
            .add_report("did:example:alice", "2024-01-01T00:00:00Z", &report)
            .await
            .unwrap();

        let entries = store.range(STREAM_NAME).await.unwrap();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.field("id"), Some(id.to_string().as_str()));
        assert_eq!(entry.field("sender"), Some("did:example:alice"));
        assert_eq!(entry.field("timestamp"), Some("2024-01-01T00:00:00Z"));
        let stored: Report = serde_json::from_str(entry.field("report").unwrap()).unwrap();
        assert_eq!(stored, report);
    }

    #[tokio::test]
    async fn each_report_gets_a_new_id() {
        let store = MemoryStore::new();
        let w = writer(&store);
        let report = Report::with_reason_type("spam");
        let a = w.add_report("did:example:a", "t", &report).await.unwrap();
        let b = w.add_report("did:example:a", "t", &report).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.stream_len(STREAM_NAME), 2);
    }

    #[tokio::test]
    async fn raw_report_is_stored_verbatim() {
        let store = MemoryStore::new();
        let json = r#"{"reasonType":"spam","reason":"x","clientHint":42}"#;
        writer(&store)
            .add_raw_report("did:example:alice", "t", json)
            .await
            .unwrap();
        let entries = store.range(STREAM_NAME).await.unwrap();
        assert_eq!(entries[0].field("report"), Some(json));
    }

    #[tokio::test]
    async fn invalid_raw_report_is_rejected_before_allocation() {
        let store = MemoryStore::new();
        let w = writer(&store);
        let err = w
            .add_raw_report("did:example:alice", "t", "{not json")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Decode { .. }));
        assert_eq!(store.stream_len(STREAM_NAME), 0);

        // The first slot is still free.
        let id = w
            .add_raw_report("did:example:alice", "t", "{}")
            .await
            .unwrap();
        assert_eq!(id, super::super::alloc::candidate_id(1_700_000_000, 4));
    }

    #[test]
    fn rejects_out_of_range_node() {
        assert!(ReportWriter::new(MemoryStore::new(), 4096).is_err());
    }
}
