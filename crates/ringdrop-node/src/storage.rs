//! RocksDB-backed persistent epoch storage.
//!
//! Implements [`EpochStore`] using column families for epoch rows,
//! allocation rows, per-channel seal metadata and ledger ring snapshots.
//! Keys are big-endian composites so that RocksDB's byte order matches
//! `(channel, epoch, index)` order. A seal is one [`WriteBatch`].

use std::path::Path;

use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};

use ringdrop_core::epoch_store::{EpochStore, sort_backlog};
use ringdrop_core::error::StoreError;
use ringdrop_core::ledger::ChannelRing;
use ringdrop_core::types::{Allocation, ChannelId, EpochKey, EpochRecord, allocation_key};

// --- Column family names ---

const CF_EPOCHS: &str = "epochs";
const CF_ALLOCATIONS: &str = "allocations";
const CF_CHANNELS: &str = "channels";
const CF_RINGS: &str = "rings";

/// All column family names.
const ALL_CFS: &[&str] = &[CF_EPOCHS, CF_ALLOCATIONS, CF_CHANNELS, CF_RINGS];

fn backend(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(value, bincode::config::standard()).map_err(|e| StoreError::Codec(e.to_string()))
}

fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StoreError::Codec(e.to_string()))
}

/// RocksDB-backed epoch store.
///
/// The `channels` family records the last sealed epoch per channel (8 bytes,
/// big-endian). `insert_sealed` reads it and writes the batch under
/// `seal_lock`, so concurrent sealers cannot both pass the monotonic check.
pub struct RocksEpochStore {
    db: DB,
    seal_lock: Mutex<()>,
}

impl RocksEpochStore {
    /// Open or create a database at `path`, creating missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors).map_err(backend)?;
        tracing::debug!(path = %path.as_ref().display(), "opened epoch store");

        Ok(Self {
            db,
            seal_lock: Mutex::new(()),
        })
    }

    fn cf_handle(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Backend(format!("missing column family: {name}")))
    }

    /// Flush all in-memory buffers to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend)
    }

    /// Persist a ledger ring snapshot, replacing any previous one.
    pub fn put_ring(&self, ring: &ChannelRing) -> Result<(), StoreError> {
        let cf = self.cf_handle(CF_RINGS)?;
        self.db
            .put_cf(cf, ring.channel_id.as_bytes(), encode(ring)?)
            .map_err(backend)
    }

    /// Load one channel's ring snapshot.
    pub fn get_ring(&self, channel: &ChannelId) -> Result<Option<ChannelRing>, StoreError> {
        let cf = self.cf_handle(CF_RINGS)?;
        match self.db.get_cf(cf, channel.as_bytes()).map_err(backend)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Every persisted ring snapshot.
    pub fn rings(&self) -> Result<Vec<ChannelRing>, StoreError> {
        let cf = self.cf_handle(CF_RINGS)?;
        self.db
            .iterator_cf(cf, IteratorMode::Start)
            .map(|item| {
                let (_, value) = item.map_err(backend)?;
                decode(&value)
            })
            .collect()
    }

    /// Decode every value in `cf` whose key starts with `prefix`, in key order.
    fn scan_prefix<T: bincode::Decode<()>>(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<T>, StoreError> {
        let cf = self.cf_handle(cf_name)?;
        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(backend)?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push(decode(&value)?);
        }
        Ok(out)
    }
}

impl EpochStore for RocksEpochStore {
    fn last_sealed_epoch(&self, channel: &ChannelId) -> Result<Option<u64>, StoreError> {
        let cf = self.cf_handle(CF_CHANNELS)?;
        match self.db.get_cf(cf, channel.as_bytes()).map_err(backend)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Codec("invalid last-sealed value length".into()))?;
                Ok(Some(u64::from_be_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn insert_sealed(&self, epoch: &EpochRecord, allocations: &[Allocation]) -> Result<(), StoreError> {
        let _guard = self.seal_lock.lock();

        if let Some(last) = self.last_sealed_epoch(&epoch.channel_id)? {
            if epoch.epoch_id <= last {
                return Err(StoreError::EpochNotIncreasing {
                    last,
                    requested: epoch.epoch_id,
                });
            }
        }

        let cf_epochs = self.cf_handle(CF_EPOCHS)?;
        let cf_allocs = self.cf_handle(CF_ALLOCATIONS)?;
        let cf_channels = self.cf_handle(CF_CHANNELS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_epochs, epoch.key().to_bytes(), encode(epoch)?);
        for allocation in allocations {
            batch.put_cf(cf_allocs, allocation.key_bytes(), encode(allocation)?);
        }
        batch.put_cf(cf_channels, epoch.channel_id.as_bytes(), epoch.epoch_id.to_be_bytes());
        self.db.write(batch).map_err(backend)?;

        tracing::debug!(
            channel = %epoch.channel,
            epoch_id = epoch.epoch_id,
            rows = allocations.len(),
            "sealed epoch written"
        );
        Ok(())
    }

    fn get_epoch(&self, key: &EpochKey) -> Result<Option<EpochRecord>, StoreError> {
        let cf = self.cf_handle(CF_EPOCHS)?;
        match self.db.get_cf(cf, key.to_bytes()).map_err(backend)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn get_allocation(&self, key: &EpochKey, index: u32) -> Result<Option<Allocation>, StoreError> {
        let cf = self.cf_handle(CF_ALLOCATIONS)?;
        let row_key = allocation_key(&key.channel_id, key.epoch_id, index);
        match self.db.get_cf(cf, row_key).map_err(backend)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn allocations(&self, key: &EpochKey) -> Result<Vec<Allocation>, StoreError> {
        self.scan_prefix(CF_ALLOCATIONS, &key.to_bytes())
    }

    fn unpublished(&self) -> Result<Vec<EpochRecord>, StoreError> {
        let cf = self.cf_handle(CF_EPOCHS)?;
        let mut pending = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item.map_err(backend)?;
            let epoch: EpochRecord = decode(&value)?;
            if !epoch.published {
                pending.push(epoch);
            }
        }
        sort_backlog(&mut pending);
        Ok(pending)
    }

    fn mark_published(&self, key: &EpochKey) -> Result<(), StoreError> {
        let mut epoch = self
            .get_epoch(key)?
            .ok_or_else(|| StoreError::NotFound(format!("epoch {key}")))?;
        if epoch.published {
            return Ok(());
        }
        epoch.published = true;

        let cf = self.cf_handle(CF_EPOCHS)?;
        self.db
            .put_cf(cf, key.to_bytes(), encode(&epoch)?)
            .map_err(backend)
    }

    fn channel_epochs(&self, channel: &ChannelId) -> Result<Vec<EpochRecord>, StoreError> {
        self.scan_prefix(CF_EPOCHS, channel.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringdrop_core::ledger::{FeeSchedule, LedgerConfig, RingLedger};
    use ringdrop_core::sealer::{EpochSealer, Participant};
    use ringdrop_core::types::{Channel, Hash256, OwnerId};
    use std::sync::Arc;

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Create a temporary RocksEpochStore.
    fn temp_store() -> (Arc<RocksEpochStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksEpochStore::open(dir.path().join("epochs")).unwrap();
        (Arc::new(store), dir)
    }

    fn participants(n: u8) -> Vec<Participant> {
        (1..=n)
            .map(|i| Participant::new(OwnerId([i; 32]), u64::from(i) * 10))
            .collect()
    }

    // ------------------------------------------------------------------
    // Sealing
    // ------------------------------------------------------------------

    #[test]
    fn sealed_epoch_reads_back() {
        let (store, _dir) = temp_store();
        let sealer = EpochSealer::new(Arc::clone(&store));
        let channel = Channel::new("x").unwrap();
        let sealed = sealer.seal_at(&channel, 10, &participants(5), 1_000).unwrap();

        let key = sealed.record.key();
        assert_eq!(store.get_epoch(&key).unwrap(), Some(sealed.record.clone()));
        assert_eq!(store.allocations(&key).unwrap(), sealed.allocations);
        assert_eq!(store.get_allocation(&key, 3).unwrap(), Some(sealed.allocations[3].clone()));
        assert_eq!(store.get_allocation(&key, 5).unwrap(), None);
        assert_eq!(store.last_sealed_epoch(&channel.id()).unwrap(), Some(10));
    }

    #[test]
    fn allocations_do_not_leak_across_epochs() {
        let (store, _dir) = temp_store();
        let sealer = EpochSealer::new(Arc::clone(&store));
        let channel = Channel::new("x").unwrap();
        sealer.seal_at(&channel, 1, &participants(3), 0).unwrap();
        let second = sealer.seal_at(&channel, 2, &participants(2), 0).unwrap();

        let rows = store.allocations(&second.record.key()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|a| a.epoch_id == 2));
    }

    #[test]
    fn duplicate_epoch_rejected_and_prior_untouched() {
        let (store, _dir) = temp_store();
        let sealer = EpochSealer::new(Arc::clone(&store));
        let channel = Channel::new("x").unwrap();
        let first = sealer.seal_at(&channel, 5, &participants(2), 0).unwrap();

        let mut dup = first.record.clone();
        dup.root = Hash256([0xEE; 32]);
        assert_eq!(
            store.insert_sealed(&dup, &[]),
            Err(StoreError::EpochNotIncreasing { last: 5, requested: 5 })
        );
        assert_eq!(store.get_epoch(&first.record.key()).unwrap().unwrap().root, first.root());
    }

    #[test]
    fn epochs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epochs");
        let channel = Channel::new("x").unwrap();
        let root = {
            let store = Arc::new(RocksEpochStore::open(&path).unwrap());
            let sealed = EpochSealer::new(Arc::clone(&store))
                .seal_at(&channel, 7, &participants(4), 0)
                .unwrap();
            store.flush().unwrap();
            sealed.root()
        };

        let store = RocksEpochStore::open(&path).unwrap();
        let epochs = store.channel_epochs(&channel.id()).unwrap();
        assert_eq!(epochs.len(), 1);
        assert_eq!(epochs[0].root, root);
        assert_eq!(store.last_sealed_epoch(&channel.id()).unwrap(), Some(7));
    }

    // ------------------------------------------------------------------
    // Backlog
    // ------------------------------------------------------------------

    #[test]
    fn backlog_oldest_first_then_marked() {
        let (store, _dir) = temp_store();
        let sealer = EpochSealer::new(Arc::clone(&store));
        let b = Channel::new("b").unwrap();
        let a = Channel::new("a").unwrap();
        sealer.seal_at(&b, 20, &participants(1), 0).unwrap();
        sealer.seal_at(&a, 20, &participants(1), 0).unwrap();
        sealer.seal_at(&b, 30, &participants(1), 0).unwrap();
        sealer.seal_at(&a, 5, &participants(1), 0).unwrap_err();

        let order: Vec<(String, u64)> = store
            .unpublished()
            .unwrap()
            .into_iter()
            .map(|e| (e.channel, e.epoch_id))
            .collect();
        assert_eq!(order, vec![("a".into(), 20), ("b".into(), 20), ("b".into(), 30)]);

        store.mark_published(&EpochKey { channel_id: b.id(), epoch_id: 20 }).unwrap();
        assert_eq!(store.unpublished().unwrap().len(), 2);
    }

    #[test]
    fn mark_published_unknown_is_not_found() {
        let (store, _dir) = temp_store();
        let key = EpochKey {
            channel_id: ChannelId::derive("x"),
            epoch_id: 1,
        };
        assert!(matches!(store.mark_published(&key), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn channel_epochs_scoped_to_channel() {
        let (store, _dir) = temp_store();
        let sealer = EpochSealer::new(Arc::clone(&store));
        let x = Channel::new("x").unwrap();
        let y = Channel::new("y").unwrap();
        for epoch in [1, 256, 70_000] {
            sealer.seal_at(&x, epoch, &participants(1), 0).unwrap();
        }
        sealer.seal_at(&y, 2, &participants(1), 0).unwrap();

        let epochs: Vec<u64> = store
            .channel_epochs(&x.id())
            .unwrap()
            .iter()
            .map(|e| e.epoch_id)
            .collect();
        assert_eq!(epochs, vec![1, 256, 70_000]);
    }

    // ------------------------------------------------------------------
    // Ring snapshots
    // ------------------------------------------------------------------

    #[test]
    fn ring_snapshot_roundtrip() {
        let (store, _dir) = temp_store();
        let admin = OwnerId([0xAD; 32]);
        let ledger = RingLedger::new(LedgerConfig {
            admin,
            fees: FeeSchedule::zero(),
            ..LedgerConfig::default()
        })
        .unwrap();
        let channel = ChannelId::derive("x");
        ledger.publish_at(&admin, &channel, 3, Hash256([3; 32]), 130, 99).unwrap();

        let ring = ledger.snapshot(&channel).unwrap();
        store.put_ring(&ring).unwrap();
        assert_eq!(store.get_ring(&channel).unwrap(), Some(ring.clone()));
        assert_eq!(store.rings().unwrap(), vec![ring]);
        assert_eq!(store.get_ring(&ChannelId::derive("y")).unwrap(), None);
    }
}
