//! Core domain types for the report queue.
//!
//! Identifiers and payloads shared by the producer, the consumer and the
//! worker pool.

pub mod ids;
pub mod report;

// Re-export commonly used types at the module level
pub use ids::{AckToken, ReportId};
pub use report::{QuarantinedReport, QueueEntry, RepoRef, Report, StrongRef, Subject};
