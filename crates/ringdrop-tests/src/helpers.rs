//! Shared fixtures for E2E and adversarial tests.

use std::sync::Arc;

use ringdrop_core::epoch_store::MemoryEpochStore;
use ringdrop_core::ledger::{EvictionPolicy, FeeSchedule, LedgerConfig, LedgerPublisher, RingLedger};
use ringdrop_core::publisher::{BacklogPublisher, PublisherConfig};
use ringdrop_core::sealer::{EpochSealer, Participant};
use ringdrop_core::types::OwnerId;

/// Ledger admin used by every fixture.
pub const ADMIN: OwnerId = OwnerId([0xAD; 32]);

/// Owner id from a seed byte.
pub fn owner(seed: u8) -> OwnerId {
    OwnerId([seed; 32])
}

/// `n` participants with distinct owners and amounts `100, 200, ...`.
pub fn participants(n: u8) -> Vec<Participant> {
    (1..=n)
        .map(|i| Participant::new(owner(i), u64::from(i) * 100))
        .collect()
}

/// Sealer, ledger and publisher sharing one in-memory store.
pub struct Harness {
    pub store: Arc<MemoryEpochStore>,
    pub ledger: Arc<RingLedger>,
    pub sealer: EpochSealer<MemoryEpochStore>,
    pub publisher: BacklogPublisher<MemoryEpochStore, LedgerPublisher>,
}

impl Harness {
    /// Zero-fee harness with `Expire` eviction.
    pub fn new(ring_capacity: usize) -> Self {
        Self::with_config(LedgerConfig {
            ring_capacity,
            fees: FeeSchedule::zero(),
            eviction: EvictionPolicy::Expire,
            admin: ADMIN,
            ..LedgerConfig::default()
        })
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        let store = Arc::new(MemoryEpochStore::new());
        let ledger = Arc::new(RingLedger::new(config).expect("valid ledger config"));
        let client = Arc::new(LedgerPublisher::new(Arc::clone(&ledger), ADMIN));
        Self {
            sealer: EpochSealer::new(Arc::clone(&store)),
            publisher: BacklogPublisher::new(Arc::clone(&store), client, PublisherConfig::default()),
            store,
            ledger,
        }
    }
}
