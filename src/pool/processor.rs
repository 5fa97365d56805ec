//! The per-report processing callback.

use std::fmt::Display;
use std::future::Future;
use std::io::{self, Write};

use crate::types::QueueEntry;

/// Handles one dequeued report.
///
/// The pool calls `process` for one entry at a time across all remotes, so
/// implementations need no internal locking. An `Err` means "try again
/// later"; the pool retries the entry until its delivery count crosses the
/// retry limit, then quarantines it.
pub trait ReportProcessor: Send + 'static {
    /// Error type, only ever logged.
    type Error: Display + Send;

    fn process(
        &mut self,
        entry: &QueueEntry,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Writes each report as one line of JSON.
#[derive(Debug)]
pub struct JsonLinesProcessor<W> {
    out: W,
}

impl<W: Write + Send + 'static> JsonLinesProcessor<W> {
    pub fn new(out: W) -> Self {
        JsonLinesProcessor { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send + 'static> ReportProcessor for JsonLinesProcessor<W> {
    type Error = io::Error;

    async fn process(&mut self, entry: &QueueEntry) -> Result<(), io::Error> {
        serde_json::to_writer(&mut self.out, entry)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AckToken, Report};

    #[tokio::test]
    async fn writes_one_line_per_entry() {
        let mut p = JsonLinesProcessor::new(Vec::new());
        let entry = QueueEntry {
            ack_token: AckToken::new("1-0"),
            id: "1024".to_string(),
            reported_by: "did:example:alice".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            report: Report::with_reason_type("spam"),
            raw_report: String::new(),
        };
        p.process(&entry).await.unwrap();
        p.process(&entry).await.unwrap();

        let out = String::from_utf8(p.into_inner()).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["ack_token"], "1-0");
        assert_eq!(value["reported_by"], "did:example:alice");
        assert_eq!(value["report"]["reasonType"], "spam");
    }
}
