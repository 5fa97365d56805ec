//! Report ID allocation.
//!
//! An ID is `(unix_seconds mod 2^38) << 10 | node_id`. Each candidate is
//! claimed by setting `report:<id>` in the store if absent, so two allocators
//! sharing a store (or a restarted allocator) never hand out the same ID. A
//! node gets at most one ID per second; a burst borrows upcoming seconds, and
//! a burst of more than [`MAX_ALLOCATION_ATTEMPTS`] in one second fails.

use tracing::{debug, instrument, warn};

use super::{
    MAX_ALLOCATION_ATTEMPTS, MAX_NODE_ID, NODE_ID_BITS, QueueError, REPORT_ID_LOCAL_BITS, Result,
};
use crate::config::ConfigError;
use crate::store::StreamStore;
use crate::types::ReportId;

const LOCAL_MASK: u64 = (1 << REPORT_ID_LOCAL_BITS) - 1;

/// Source of wall-clock time, in whole unix seconds.
pub trait Clock: Send + Sync + 'static {
    fn now_unix(&self) -> u64;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        // Clamp pre-epoch clocks rather than wrapping.
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
    }
}

/// Builds the candidate ID for a timestamp and node.
pub fn candidate_id(unix_secs: u64, node_id: u32) -> ReportId {
    ReportId(((unix_secs & LOCAL_MASK) << NODE_ID_BITS) | u64::from(node_id))
}

/// The store key that records a claimed ID.
pub fn claim_key(id: ReportId) -> String {
    format!("report:{id}")
}

/// Allocates report IDs for one node.
#[derive(Debug, Clone)]
pub struct IdAllocator<S, C = SystemClock> {
    store: S,
    node_id: u32,
    clock: C,
}

impl<S: StreamStore> IdAllocator<S> {
    /// Creates an allocator using the system clock.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NodeIdOutOfRange` if `node_id` exceeds
    /// [`MAX_NODE_ID`].
    pub fn new(store: S, node_id: u32) -> std::result::Result<Self, ConfigError> {
        Self::with_clock(store, node_id, SystemClock)
    }
}

impl<S: StreamStore, C: Clock> IdAllocator<S, C> {
    /// Creates an allocator with a custom time source.
    pub fn with_clock(
        store: S,
        node_id: u32,
        clock: C,
    ) -> std::result::Result<Self, ConfigError> {
        if node_id > MAX_NODE_ID {
            return Err(ConfigError::NodeIdOutOfRange {
                node_id,
                max: MAX_NODE_ID,
            });
        }
        Ok(IdAllocator {
            store,
            node_id,
            clock,
        })
    }

    /// The node this allocator allocates for.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Claims the next free ID.
    ///
    /// # Errors
    ///
    /// - `QueueError::AllocationExhausted` if every candidate in the window
    ///   is taken
    /// - `QueueError::Store` if the store fails; the claim is not retried
    #[instrument(skip(self), fields(node_id = self.node_id))]
    pub async fn allocate(&self) -> Result<ReportId> {
        let mut t = self.clock.now_unix();
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let candidate = candidate_id(t, self.node_id);
            let claimed_at = self.clock.now_unix().to_string();
            if self
                .store
                .set_if_absent(&claim_key(candidate), &claimed_at)
                .await?
            {
                debug!(report_id = %candidate, "Allocated report ID");
                return Ok(candidate);
            }
            t = t.wrapping_add(1);
        }

        warn!(
            attempts = MAX_ALLOCATION_ATTEMPTS,
            "Report ID space exhausted for this second"
        );
        Err(QueueError::AllocationExhausted {
            attempts: MAX_ALLOCATION_ATTEMPTS,
        })
    }
}
