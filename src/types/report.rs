//! Report payloads and queue entries.
//!
//! The queue never interprets a [`Report`]; it only has to carry one from the
//! producer to the consumer without losing anything. Fields the queue does not
//! know about are kept in `extra` maps, and subjects of unknown type are kept
//! as raw JSON, so that a report survives the round trip through the stream.
//! The exact stored text travels with each [`QueueEntry`] as well.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{AckToken, ReportId};

/// A moderation report as submitted by a reporting client.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Report {
    /// Reason code, e.g. `com.atproto.moderation.defs#reasonSpam`.
    #[serde(rename = "reasonType", default, skip_serializing_if = "Option::is_none")]
    pub reason_type: Option<String>,

    /// Optional free-text explanation from the reporter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// What is being reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Report {
    /// Creates a report with only a reason code set.
    pub fn with_reason_type(reason_type: impl Into<String>) -> Self {
        Report {
            reason_type: Some(reason_type.into()),
            ..Report::default()
        }
    }

    /// Returns the URI or DID the report is about, if there is a subject.
    pub fn subject_ref(&self) -> Option<&str> {
        match &self.subject {
            Some(Subject::StrongRef(r)) => Some(&r.uri),
            Some(Subject::RepoRef(r)) => Some(&r.did),
            Some(Subject::Other(v)) => v
                .get("uri")
                .or_else(|| v.get("did"))
                .and_then(Value::as_str),
            None => None,
        }
    }
}

const TYPE_KEY: &str = "$type";
const STRONG_REF_TYPE: &str = "com.atproto.repo.strongRef";
const REPO_REF_TYPE: &str = "com.atproto.admin.defs#repoRef";

/// The subject of a report, discriminated by its `$type` field.
///
/// Anything that is not a well-formed strong ref or repo ref, including
/// subjects with no `$type` at all, is carried as [`Subject::Other`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum Subject {
    /// A specific record, pinned to a content hash.
    StrongRef(StrongRef),

    /// A whole account.
    RepoRef(RepoRef),

    /// Any other subject, as received.
    Other(Value),
}

/// `value` without its `$type` key.
fn untyped(value: &Value) -> Value {
    let mut value = value.clone();
    if let Some(map) = value.as_object_mut() {
        map.remove(TYPE_KEY);
    }
    value
}

impl From<Value> for Subject {
    fn from(value: Value) -> Self {
        let known = match value.get(TYPE_KEY).and_then(Value::as_str) {
            Some(STRONG_REF_TYPE) => serde_json::from_value(untyped(&value))
                .ok()
                .map(Subject::StrongRef),
            Some(REPO_REF_TYPE) => serde_json::from_value(untyped(&value))
                .ok()
                .map(Subject::RepoRef),
            _ => None,
        };
        known.unwrap_or(Subject::Other(value))
    }
}

impl From<Subject> for Value {
    fn from(subject: Subject) -> Self {
        let (kind, mut map) = match subject {
            Subject::StrongRef(r) => {
                let mut map = r.extra;
                map.insert("uri".to_string(), Value::from(r.uri));
                map.insert("cid".to_string(), Value::from(r.cid));
                (STRONG_REF_TYPE, map)
            }
            Subject::RepoRef(r) => {
                let mut map = r.extra;
                map.insert("did".to_string(), Value::from(r.did));
                (REPO_REF_TYPE, map)
            }
            Subject::Other(value) => return value,
        };
        map.insert(TYPE_KEY.to_string(), Value::from(kind));
        Value::Object(map)
    }
}

/// Reference to a record by URI and content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    pub cid: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reference to an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoRef {
    pub did: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A report as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
    /// Stream entry ID of this delivery.
    pub ack_token: AckToken,

    /// Decimal form of the allocated report ID.
    pub id: String,

    /// Identifier of the reporting principal.
    pub reported_by: String,

    /// Caller-supplied enqueue time. Opaque to the queue.
    pub timestamp: String,

    pub report: Report,

    /// The `report` field exactly as stored. Empty for entries built in
    /// memory rather than read from a stream.
    #[serde(skip)]
    pub raw_report: String,
}

impl QueueEntry {
    /// The report as JSON: the stored text when there is one, otherwise
    /// `report` re-encoded.
    pub fn report_json(&self) -> serde_json::Result<Cow<'_, str>> {
        if self.raw_report.is_empty() {
            serde_json::to_string(&self.report).map(Cow::Owned)
        } else {
            Ok(Cow::Borrowed(&self.raw_report))
        }
    }

    /// Parses the decimal `id` field back into a [`ReportId`].
    ///
    /// Returns `None` if the producer wrote something that isn't a `u64`.
    pub fn report_id(&self) -> Option<ReportId> {
        self.id.parse().ok()
    }
}

/// An entry read back from the quarantine stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarantinedReport {
    /// ID of the entry in the quarantine stream itself.
    pub quarantine_token: AckToken,

    /// The quarantined entry. Its `ack_token` is the original live-stream
    /// token, recovered from the `queue_key` field.
    pub entry: QueueEntry,
}
