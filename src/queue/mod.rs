//! The moderation report queue.
//!
//! Reports flow through two streams in the backing store:
//!
//! - `automod:reports` holds every accepted report. Entries are never
//!   deleted; acknowledging one only removes it from the consumer group's
//!   pending list.
//! - `automod:reports:quarantine` holds copies of entries that failed
//!   processing too many times, for an operator to inspect.
//!
//! Every entry carries a report ID from [`IdAllocator`]. IDs are unique
//! across nodes without a central sequencer: each node owns a 10-bit slice of
//! the ID space and claims one ID per second of wall-clock time through an
//! atomic set-if-absent in the store.
//!
//! # Module Structure
//!
//! - [`alloc`]: report ID allocation
//! - [`producer`]: appending reports to the live stream
//! - [`consumer`]: consumer-group reads, acks, quarantine

use std::time::Duration;

use thiserror::Error;

use crate::store::{StoreError, StreamEntry};

pub mod alloc;
pub mod consumer;
pub mod producer;

pub use alloc::{Clock, IdAllocator, SystemClock};
pub use consumer::ReportConsumer;
pub use producer::ReportWriter;

/// The live report stream.
pub const STREAM_NAME: &str = "automod:reports";

/// Where entries go after exhausting their retries.
pub const QUARANTINE_STREAM_NAME: &str = "automod:reports:quarantine";

/// Total width of a report ID.
pub const REPORT_ID_BITS: u32 = 48;

/// Bits of a report ID taken from the allocation timestamp.
pub const REPORT_ID_LOCAL_BITS: u32 = REPORT_ID_BITS - NODE_ID_BITS;

/// Bits of a report ID identifying the allocating node.
pub const NODE_ID_BITS: u32 = 10;

/// Largest node ID that fits in [`NODE_ID_BITS`].
pub const MAX_NODE_ID: u32 = (1 << NODE_ID_BITS) - 1;

/// Size of the report ID space.
pub const REPORT_ID_RANGE_LEN: u64 = 1 << REPORT_ID_BITS;

/// Start of the top-of-`u64` range reserved for queue-allocated report IDs.
///
/// Not currently added to allocated IDs. See DESIGN.md.
pub const REPORT_ID_RANGE_START: u64 = u64::MAX - REPORT_ID_RANGE_LEN + 1;

/// Claims attempted per allocation before giving up.
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 50;

/// Consumer group (and member) name used when none is configured.
pub const DEFAULT_CONSUMER_GROUP: &str = "report-processor";

/// How long one blocking read waits for a new entry.
pub const DEFAULT_READ_BLOCK: Duration = Duration::from_secs(60 * 60);

/// Stream entry field names.
pub(crate) mod fields {
    pub const ID: &str = "id";
    pub const SENDER: &str = "sender";
    pub const TIMESTAMP: &str = "timestamp";
    pub const REPORT: &str = "report";
    pub const QUEUE_KEY: &str = "queue_key";
    pub const ERROR: &str = "error";
}

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Every candidate ID in the attempt window was already claimed.
    #[error("no free report ID after {attempts} attempts")]
    AllocationExhausted { attempts: u32 },

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stream entry could not be turned into a report.
    ///
    /// `raw` holds the entry as read when it came from the live stream, so
    /// that it can be quarantined as-is.
    #[error("malformed entry {token}: {reason}")]
    Decode {
        token: String,
        reason: String,
        raw: Option<Box<StreamEntry>>,
    },

    /// A report could not be serialized.
    #[error("failed to encode report: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_layout_fits_in_width() {
        assert_eq!(REPORT_ID_LOCAL_BITS + NODE_ID_BITS, REPORT_ID_BITS);
        assert_eq!(MAX_NODE_ID, 1023);

        let largest = (((1u64 << REPORT_ID_LOCAL_BITS) - 1) << NODE_ID_BITS) | MAX_NODE_ID as u64;
        assert!(largest < 1 << REPORT_ID_BITS);
    }

    #[test]
    fn reserved_range_is_top_of_u64() {
        assert_eq!(REPORT_ID_RANGE_START.wrapping_add(REPORT_ID_RANGE_LEN), 0);
        assert_eq!(REPORT_ID_RANGE_START.trailing_zeros(), REPORT_ID_BITS);

        // Raw allocations never overlap it.
        let largest = (1u64 << REPORT_ID_BITS) - 1;
        assert!(largest < REPORT_ID_RANGE_START);
    }

    #[test]
    fn stream_names_are_distinct() {
        assert_ne!(STREAM_NAME, QUARANTINE_STREAM_NAME);
        assert!(QUARANTINE_STREAM_NAME.starts_with(STREAM_NAME));
    }
}
