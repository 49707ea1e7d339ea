//! Distributor service: sealer, ring ledger and backlog publisher wired to
//! RocksDB.
//!
//! The ledger lives in memory and is written through to the `rings` column
//! family after every successful Publish or Claim. Snapshot and write happen
//! under one lock, so the last write always carries the newest ring.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use ringdrop_core::epoch_store::EpochStore;
use ringdrop_core::error::{PublishError, RingdropError, StoreError};
use ringdrop_core::ledger::{ClaimRequest, RingLedger, SlotStatus, TransferAuthorization};
use ringdrop_core::publisher::{BacklogPublisher, PublishReport};
use ringdrop_core::sealer::{EpochSealer, Participant, SealedEpoch};
use ringdrop_core::traits::RingLedgerClient;
use ringdrop_core::types::{Allocation, Channel, ChannelId, Hash256, OwnerId};

use crate::config::NodeConfig;
use crate::storage::RocksEpochStore;

/// Ledger handle that persists the channel ring before confirming a publish.
///
/// The publisher marks an epoch published only after this returns, so the
/// store never records an epoch as published while the persisted ring lacks it.
pub struct DurableLedger {
    ledger: Arc<RingLedger>,
    store: Arc<RocksEpochStore>,
    signer: OwnerId,
    write_lock: Arc<Mutex<()>>,
}

impl DurableLedger {
    fn persist(&self, channel: &ChannelId) -> Result<(), StoreError> {
        match self.ledger.snapshot(channel) {
            Some(ring) => self.store.put_ring(&ring),
            None => Ok(()),
        }
    }
}

impl RingLedgerClient for DurableLedger {
    fn publish(&self, channel: &ChannelId, epoch_id: u64, root: &Hash256, claim_count: u32) -> Result<(), PublishError> {
        let _guard = self.write_lock.lock();
        let outcome = self
            .ledger
            .publish(&self.signer, channel, epoch_id, *root, claim_count);
        // A success-equivalent answer may cover an epoch whose earlier
        // persist failed, so the ring is written for it too.
        let settled = match &outcome {
            Ok(()) => true,
            Err(e) => e.is_success_equivalent(epoch_id),
        };
        if !settled {
            return outcome;
        }
        self.persist(channel).map_err(|e| {
            error!(channel = %channel, epoch_id, "ring not persisted: {e}");
            PublishError::Transport(e.to_string())
        })?;
        outcome
    }
}

/// One sealed epoch as seen by `status`.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct EpochStatus {
    pub epoch_id: u64,
    pub root: Hash256,
    pub participant_count: u32,
    pub total_amount: u64,
    pub published: bool,
    pub slot: SlotStatus,
}

/// Sealing and ledger state of one channel.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ChannelStatus {
    pub channel: String,
    pub channel_id: ChannelId,
    pub last_sealed: Option<u64>,
    pub latest_published: u64,
    pub epochs: Vec<EpochStatus>,
}

/// The distributor node.
pub struct Distributor {
    store: Arc<RocksEpochStore>,
    ledger: Arc<RingLedger>,
    sealer: EpochSealer<RocksEpochStore>,
    publisher: BacklogPublisher<RocksEpochStore, DurableLedger>,
    write_lock: Arc<Mutex<()>>,
    config: NodeConfig,
}

impl Distributor {
    /// Open storage, build the ledger and restore persisted rings.
    pub fn open(config: NodeConfig) -> Result<Arc<Self>, RingdropError> {
        config.validate()?;

        let store = Arc::new(RocksEpochStore::open(config.db_path())?);
        let ledger = Arc::new(RingLedger::new(config.ledger_config())?);

        let rings = store.rings()?;
        let restored = rings.len();
        for ring in rings {
            ledger.restore(ring)?;
        }

        let write_lock = Arc::new(Mutex::new(()));
        let client = DurableLedger {
            ledger: Arc::clone(&ledger),
            store: Arc::clone(&store),
            signer: config.signer(),
            write_lock: Arc::clone(&write_lock),
        };

        let sealer = EpochSealer::with_max_claims(Arc::clone(&store), config.max_claims_per_epoch);
        let publisher = BacklogPublisher::new(Arc::clone(&store), Arc::new(client), config.publisher_config());

        info!(
            path = %config.db_path().display(),
            restored_rings = restored,
            ring_capacity = config.ring_capacity,
            "distributor opened"
        );

        Ok(Arc::new(Self {
            store,
            ledger,
            sealer,
            publisher,
            write_lock,
            config,
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<RingLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<RocksEpochStore> {
        &self.store
    }

    /// Seal an epoch for `channel`.
    pub fn seal(&self, channel: &str, epoch_id: u64, participants: &[Participant]) -> Result<SealedEpoch, RingdropError> {
        let channel = Channel::new(channel)?;
        Ok(self.sealer.seal(&channel, epoch_id, participants)?)
    }

    /// One publisher pass over the backlog.
    pub fn publish_backlog(&self) -> Result<PublishReport, RingdropError> {
        Ok(self.publisher.run_once()?)
    }

    /// Stored allocation with proof.
    pub fn proof(&self, channel: &str, epoch_id: u64, index: u32) -> Result<Allocation, RingdropError> {
        let channel = Channel::new(channel)?;
        Ok(self.sealer.proof(&channel, epoch_id, index)?)
    }

    /// Rebuild an epoch's proofs from stored rows, checking the sealed root.
    pub fn regenerate(&self, channel: &str, epoch_id: u64) -> Result<SealedEpoch, RingdropError> {
        let channel = Channel::new(channel)?;
        Ok(self.sealer.regenerate(&channel, epoch_id)?)
    }

    /// Claim transition, persisted before the authorization is returned.
    /// If the ring cannot be written the claim is rolled back.
    pub fn claim(&self, request: &ClaimRequest) -> Result<TransferAuthorization, RingdropError> {
        let _guard = self.write_lock.lock();
        self.ledger.claim_and_commit(request, |ring| {
            self.store.put_ring(ring).map_err(|e| {
                error!(
                    channel = %request.channel_id,
                    epoch_id = request.epoch_id,
                    index = request.index,
                    "claim not persisted: {e}"
                );
                RingdropError::from(e)
            })
        })
    }

    /// Claim using the stored allocation for `(channel, epoch_id, index)`.
    pub fn claim_stored(&self, channel: &str, epoch_id: u64, index: u32) -> Result<TransferAuthorization, RingdropError> {
        let allocation = self.proof(channel, epoch_id, index)?;
        self.claim(&ClaimRequest::from_allocation(&allocation))
    }

    /// Sealing and slot state for every sealed epoch of `channel`.
    pub fn status(&self, channel: &str) -> Result<ChannelStatus, RingdropError> {
        let channel = Channel::new(channel)?;
        let id = channel.id();
        let epochs = self
            .store
            .channel_epochs(&id)?
            .into_iter()
            .map(|e| EpochStatus {
                slot: self.ledger.slot_status(&id, e.epoch_id),
                epoch_id: e.epoch_id,
                root: e.root,
                participant_count: e.participant_count,
                total_amount: e.total_amount,
                published: e.published,
            })
            .collect();

        Ok(ChannelStatus {
            channel: channel.name().to_string(),
            channel_id: id,
            last_sealed: self.store.last_sealed_epoch(&id)?,
            latest_published: self.ledger.latest_epoch(&id),
            epochs,
        })
    }

    /// Run the publisher every `publish_interval_secs` until `shutdown`
    /// resolves. The first pass runs immediately.
    pub async fn run<F>(self: &Arc<Self>, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let period = Duration::from_secs(self.config.publish_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = period.as_secs(), "publisher loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("publisher loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let node = Arc::clone(self);
                    match tokio::task::spawn_blocking(move || node.publish_backlog()).await {
                        Ok(Ok(report)) if report.failed > 0 => {
                            warn!(%report, "publisher run had failures");
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => warn!("publisher run aborted: {e}"),
                        Err(e) => error!("publisher task panicked: {e}"),
                    }
                }
            }
        }

        if let Err(e) = self.store.flush() {
            warn!("flush on shutdown failed: {e}");
        }
    }
}
