//! Consumer-group reads from the live stream.
//!
//! A [`ReportConsumer`] is one member of a consumer group; the member name is
//! the group name, so each group has exactly one member per store. Delivery
//! is at-least-once:
//!
//! - an entry read but not acknowledged stays on the member's pending list
//! - the next read replays the oldest pending entry before looking at new ones
//! - every replay bumps the entry's delivery count, which the pool uses to
//!   decide when to give up and quarantine it

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{
    DEFAULT_READ_BLOCK, QUARANTINE_STREAM_NAME, QueueError, Result, STREAM_NAME, fields,
};
use crate::store::{StreamEntry, StreamStore};
use crate::types::{AckToken, QuarantinedReport, QueueEntry, Report};

/// Reads, acknowledges and quarantines reports for one consumer group.
#[derive(Debug, Clone)]
pub struct ReportConsumer<S> {
    store: S,
    name: String,
    read_block: Duration,
}

impl<S: StreamStore> ReportConsumer<S> {
    /// Joins (creating if needed) the consumer group `name` on the live
    /// stream. A new group starts from the beginning of the stream.
    pub async fn new(store: S, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        store.create_group(STREAM_NAME, &name).await?;
        debug!(group = %name, "Joined consumer group");
        Ok(ReportConsumer {
            store,
            name,
            read_block: DEFAULT_READ_BLOCK,
        })
    }

    /// Sets how long each blocking read waits before trying again.
    pub fn with_read_block(mut self, block: Duration) -> Self {
        self.read_block = block;
        self
    }

    /// The consumer group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Returns the next entry to process, waiting as long as it takes.
    ///
    /// Entries already delivered to this member but not acknowledged come
    /// first, oldest first.
    pub async fn next_report(&self) -> Result<QueueEntry> {
        loop {
            if let Some(entry) = self.try_next_report(self.read_block).await? {
                return Ok(entry);
            }
        }
    }

    /// Like [`next_report`](Self::next_report), but waits at most `block`
    /// for a new entry and returns `None` if none arrived.
    #[instrument(skip(self), fields(group = %self.name))]
    pub async fn try_next_report(&self, block: Duration) -> Result<Option<QueueEntry>> {
        if let Some(raw) = self
            .store
            .read_pending(STREAM_NAME, &self.name, &self.name)
            .await?
        {
            debug!(ack_token = %raw.id, "Replaying pending entry");
            return decode_entry(&raw).map(Some);
        }

        match self
            .store
            .read_new(STREAM_NAME, &self.name, &self.name, block)
            .await?
        {
            Some(raw) => {
                debug!(ack_token = %raw.id, "Received new entry");
                decode_entry(&raw).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Marks an entry as done. Unknown and already acknowledged tokens are
    /// ignored.
    pub async fn ack(&self, token: &AckToken) -> Result<()> {
        self.store.ack(STREAM_NAME, &self.name, token).await?;
        Ok(())
    }

    /// How many times the entry has been delivered, or 0 if it is not
    /// pending.
    pub async fn attempt_count(&self, token: &AckToken) -> Result<i64> {
        Ok(self
            .store
            .delivery_count(STREAM_NAME, &self.name, token)
            .await?)
    }

    /// Copies an entry to the quarantine stream, then acknowledges it. The
    /// report is written exactly as it was read.
    ///
    /// The copy comes first: a crash in between leaves the entry pending and
    /// it may be quarantined twice, but it is never lost.
    #[instrument(skip(self, entry), fields(group = %self.name, ack_token = %entry.ack_token))]
    pub async fn quarantine(&self, entry: &QueueEntry) -> Result<()> {
        let report = entry.report_json().map_err(QueueError::Encode)?;
        let id = self
            .store
            .append(
                QUARANTINE_STREAM_NAME,
                &[
                    (fields::QUEUE_KEY, entry.ack_token.as_str()),
                    (fields::ID, entry.id.as_str()),
                    (fields::SENDER, entry.reported_by.as_str()),
                    (fields::TIMESTAMP, entry.timestamp.as_str()),
                    (fields::REPORT, &*report),
                ],
            )
            .await?;
        info!(report_id = %entry.id, quarantine_token = %id, "Report quarantined");
        self.ack(&entry.ack_token).await
    }

    /// Copies an entry that could not be decoded to the quarantine stream,
    /// field for field, then acknowledges it. `reason` is stored alongside.
    #[instrument(skip(self, raw), fields(group = %self.name, ack_token = %raw.id))]
    pub async fn quarantine_malformed(&self, raw: &StreamEntry, reason: &str) -> Result<()> {
        let mut values: Vec<(&str, &str)> = vec![
            (fields::QUEUE_KEY, raw.id.as_str()),
            (fields::ERROR, reason),
        ];
        let mut rest: Vec<(&str, &str)> = raw
            .fields
            .iter()
            .filter(|(k, _)| k.as_str() != fields::QUEUE_KEY && k.as_str() != fields::ERROR)
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        rest.sort_unstable();
        values.extend(rest);

        let id = self.store.append(QUARANTINE_STREAM_NAME, &values).await?;
        info!(quarantine_token = %id, "Malformed entry quarantined");
        self.ack(&raw.id).await
    }

    /// Reads the quarantine stream, oldest first.
    ///
    /// Entries whose report cannot be decoded (those written by
    /// [`quarantine_malformed`](Self::quarantine_malformed)) are logged and
    /// left out.
    pub async fn quarantined_reports(&self) -> Result<Vec<QuarantinedReport>> {
        let mut reports = Vec::new();
        for raw in self.store.range(QUARANTINE_STREAM_NAME).await? {
            match decode_quarantined(&raw) {
                Ok(report) => reports.push(report),
                Err(QueueError::Decode { reason, .. }) => {
                    warn!(quarantine_token = %raw.id, %reason, "Skipping undecodable quarantine entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(reports)
    }
}

fn decode_fields(token: &AckToken, values: &HashMap<String, String>) -> Result<QueueEntry> {
    let get = |name: &str| values.get(name).cloned().unwrap_or_default();

    let raw = values.get(fields::REPORT).ok_or_else(|| QueueError::Decode {
        token: token.to_string(),
        reason: "missing report field".to_string(),
        raw: None,
    })?;
    let report: Report = serde_json::from_str(raw).map_err(|e| QueueError::Decode {
        token: token.to_string(),
        reason: e.to_string(),
        raw: None,
    })?;

    Ok(QueueEntry {
        ack_token: token.clone(),
        id: get(fields::ID),
        reported_by: get(fields::SENDER),
        timestamp: get(fields::TIMESTAMP),
        report,
        raw_report: raw.clone(),
    })
}

/// Turns a live-stream entry into a [`QueueEntry`]. Unknown fields are
/// ignored.
///
/// A decode error carries a copy of `raw`.
pub fn decode_entry(raw: &StreamEntry) -> Result<QueueEntry> {
    decode_fields(&raw.id, &raw.fields).map_err(|e| match e {
        QueueError::Decode { token, reason, .. } => QueueError::Decode {
            token,
            reason,
            raw: Some(Box::new(raw.clone())),
        },
        other => other,
    })
}

/// Turns a quarantine-stream entry into a [`QuarantinedReport`].
pub fn decode_quarantined(raw: &StreamEntry) -> Result<QuarantinedReport> {
    let original = raw
        .field(fields::QUEUE_KEY)
        .ok_or_else(|| QueueError::Decode {
            token: raw.id.to_string(),
            reason: "missing queue_key field".to_string(),
            raw: None,
        })?;
    let entry = decode_fields(&AckToken::new(original), &raw.fields).map_err(|e| match e {
        QueueError::Decode { reason, .. } => QueueError::Decode {
            token: raw.id.to_string(),
            reason,
            raw: None,
        },
        other => other,
    })?;
    Ok(QuarantinedReport {
        quarantine_token: raw.id.clone(),
        entry,
    })
}
