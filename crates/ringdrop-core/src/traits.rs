//! Trait interfaces for the Ringdrop protocol.
//!
//! - [`EpochStore`](crate::epoch_store::EpochStore): sealed-epoch persistence
//!   (memory here, RocksDB in ringdrop-node)
//! - [`RingLedgerClient`]: the publish side of the ring ledger as seen by
//!   the backlog publisher

use crate::error::PublishError;
use crate::types::{ChannelId, Hash256};

/// Submits a Publish transition to a ring ledger.
///
/// Implemented in-process by [`LedgerPublisher`](crate::ledger::LedgerPublisher);
/// remote ledgers map their transport failures to [`PublishError::Transport`].
pub trait RingLedgerClient: Send + Sync {
    /// Publish `root` for `epoch_id` with `claim_count` allocations.
    ///
    /// The publisher decides success-equivalence via
    /// [`PublishError::is_success_equivalent`].
    fn publish(&self, channel: &ChannelId, epoch_id: u64, root: &Hash256, claim_count: u32) -> Result<(), PublishError>;
}
