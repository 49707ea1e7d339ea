//! Sealed-epoch storage interface and in-memory implementation.
//!
//! Provides the [`EpochStore`] trait the sealer writes through and the
//! backlog publisher drains. [`MemoryEpochStore`] is suitable for testing;
//! the node uses RocksDB (ringdrop-node).
//!
//! Stores enforce the per-channel monotonic `epoch_id` rule inside
//! [`EpochStore::insert_sealed`] so that the check and the write happen as one
//! step, even with several sealers running at once.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::types::{Allocation, ChannelId, EpochKey, EpochRecord};

/// Persistent store of sealed epochs and their allocations.
///
/// Methods take `&self`; implementations provide their own interior
/// synchronization.
pub trait EpochStore: Send + Sync {
    /// Highest epoch sealed for `channel`, or `None` if none has been.
    fn last_sealed_epoch(&self, channel: &ChannelId) -> Result<Option<u64>, StoreError>;

    /// Persist a freshly sealed epoch and all of its allocations atomically.
    ///
    /// # Errors
    ///
    /// - [`StoreError::EpochNotIncreasing`] if `epoch.epoch_id` is not strictly
    ///   greater than the last sealed epoch for the channel. Nothing is written.
    fn insert_sealed(&self, epoch: &EpochRecord, allocations: &[Allocation]) -> Result<(), StoreError>;

    /// Look up an epoch row.
    fn get_epoch(&self, key: &EpochKey) -> Result<Option<EpochRecord>, StoreError>;

    /// Look up a single allocation row.
    fn get_allocation(&self, key: &EpochKey, index: u32) -> Result<Option<Allocation>, StoreError>;

    /// All allocations of an epoch in index order.
    fn allocations(&self, key: &EpochKey) -> Result<Vec<Allocation>, StoreError>;

    /// Every epoch with `published == false`, oldest epoch first
    /// (ties broken by channel name).
    fn unpublished(&self) -> Result<Vec<EpochRecord>, StoreError>;

    /// Flip `published` to true.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if the epoch was never sealed
    fn mark_published(&self, key: &EpochKey) -> Result<(), StoreError>;

    /// All sealed epochs of a channel, in epoch order.
    fn channel_epochs(&self, channel: &ChannelId) -> Result<Vec<EpochRecord>, StoreError>;
}

/// Sort epochs oldest-first, ties broken by channel name.
pub fn sort_backlog(epochs: &mut [EpochRecord]) {
    epochs.sort_by(|a, b| {
        a.epoch_id
            .cmp(&b.epoch_id)
            .then_with(|| a.channel.cmp(&b.channel))
    });
}

#[derive(Default)]
struct MemoryInner {
    /// Epoch rows keyed for ordered iteration per channel.
    epochs: BTreeMap<EpochKey, EpochRecord>,
    /// Allocation rows by epoch, in index order.
    allocations: HashMap<EpochKey, Vec<Allocation>>,
    /// Highest sealed epoch per channel.
    last_sealed: HashMap<ChannelId, u64>,
}

/// In-memory epoch store for testing.
///
/// A single `RwLock` guards all maps, which makes `insert_sealed` trivially
/// atomic. No persistence.
#[derive(Default)]
pub struct MemoryEpochStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryEpochStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sealed epochs across all channels.
    pub fn epoch_count(&self) -> usize {
        self.inner.read().epochs.len()
    }
}

impl EpochStore for MemoryEpochStore {
    fn last_sealed_epoch(&self, channel: &ChannelId) -> Result<Option<u64>, StoreError> {
        Ok(self.inner.read().last_sealed.get(channel).copied())
    }

    fn insert_sealed(&self, epoch: &EpochRecord, allocations: &[Allocation]) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(&last) = inner.last_sealed.get(&epoch.channel_id) {
            if epoch.epoch_id <= last {
                return Err(StoreError::EpochNotIncreasing {
                    last,
                    requested: epoch.epoch_id,
                });
            }
        }

        let key = epoch.key();
        inner.epochs.insert(key, epoch.clone());
        inner.allocations.insert(key, allocations.to_vec());
        inner.last_sealed.insert(epoch.channel_id, epoch.epoch_id);
        Ok(())
    }

    fn get_epoch(&self, key: &EpochKey) -> Result<Option<EpochRecord>, StoreError> {
        Ok(self.inner.read().epochs.get(key).cloned())
    }

    fn get_allocation(&self, key: &EpochKey, index: u32) -> Result<Option<Allocation>, StoreError> {
        Ok(self
            .inner
            .read()
            .allocations
            .get(key)
            .and_then(|rows| rows.get(index as usize))
            .cloned())
    }

    fn allocations(&self, key: &EpochKey) -> Result<Vec<Allocation>, StoreError> {
        Ok(self
            .inner
            .read()
            .allocations
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    fn unpublished(&self) -> Result<Vec<EpochRecord>, StoreError> {
        let mut pending: Vec<EpochRecord> = self
            .inner
            .read()
            .epochs
            .values()
            .filter(|e| !e.published)
            .cloned()
            .collect();
        sort_backlog(&mut pending);
        Ok(pending)
    }

    fn mark_published(&self, key: &EpochKey) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        match inner.epochs.get_mut(key) {
            Some(epoch) => {
                epoch.published = true;
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("epoch {key}"))),
        }
    }

    fn channel_epochs(&self, channel: &ChannelId) -> Result<Vec<EpochRecord>, StoreError> {
        let start = EpochKey { channel_id: *channel, epoch_id: 0 };
        let end = EpochKey { channel_id: *channel, epoch_id: u64::MAX };
        Ok(self
            .inner
            .read()
            .epochs
            .range(start..=end)
            .map(|(_, e)| e.clone())
            .collect())
    }
}
