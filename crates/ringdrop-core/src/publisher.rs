//! Backlog publisher: push sealed-but-unpublished epochs to the ring ledger.
//!
//! Each run walks the backlog oldest-first. Epochs below the liveness floor
//! are reported as ineligible and left for a later run. Idempotent races
//! (another publisher got there first, or the slot already moved past the
//! epoch) count as success. An epoch is marked published only after the
//! ledger confirmed it or reported one of those races; any other failure is
//! confined to that epoch.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::DEFAULT_MIN_PARTICIPANTS;
use crate::epoch_store::EpochStore;
use crate::error::{PublishError, StoreError};
use crate::traits::RingLedgerClient;
use crate::types::{Channel, EpochRecord};

/// Liveness and scope policy for a publisher run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct PublisherConfig {
    /// Epochs with fewer participants are skipped.
    pub min_participants: u32,
    /// When set, only these channels are published. Names are normalized
    /// the same way channel names are at seal time.
    pub allowlist: Option<Vec<String>>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            min_participants: DEFAULT_MIN_PARTICIPANTS,
            allowlist: None,
        }
    }
}

/// What happened to one backlog epoch.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published,
    /// The ledger already held this epoch with this root.
    AlreadyPublished,
    /// The slot had advanced to `current`; this epoch can never be published.
    Superseded { current: u64 },
    /// Below the liveness floor; not marked published.
    Ineligible { participants: u32, floor: u32 },
    Failed { reason: String },
}

impl PublishOutcome {
    /// Whether the epoch was marked published.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PublishOutcome::Published | PublishOutcome::AlreadyPublished | PublishOutcome::Superseded { .. }
        )
    }
}

/// One line of a [`PublishReport`].
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct EpochOutcome {
    pub channel: String,
    pub epoch_id: u64,
    #[serde(flatten)]
    pub outcome: PublishOutcome,
}

/// Result of one publisher run.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub epochs: Vec<EpochOutcome>,
    pub published: usize,
    pub already_published: usize,
    pub superseded: usize,
    pub ineligible: usize,
    pub failed: usize,
}

impl PublishReport {
    fn record(&mut self, epoch: &EpochRecord, outcome: PublishOutcome) {
        match &outcome {
            PublishOutcome::Published => self.published += 1,
            PublishOutcome::AlreadyPublished => self.already_published += 1,
            PublishOutcome::Superseded { .. } => self.superseded += 1,
            PublishOutcome::Ineligible { .. } => self.ineligible += 1,
            PublishOutcome::Failed { .. } => self.failed += 1,
        }
        self.epochs.push(EpochOutcome {
            channel: epoch.channel.clone(),
            epoch_id: epoch.epoch_id,
            outcome,
        });
    }

    /// Epochs marked published during this run.
    pub fn settled(&self) -> usize {
        self.published + self.already_published + self.superseded
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

impl fmt::Display for PublishReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "published={} already={} superseded={} ineligible={} failed={}",
            self.published, self.already_published, self.superseded, self.ineligible, self.failed
        )
    }
}

/// Drains the unpublished backlog of an [`EpochStore`] into a ring ledger.
pub struct BacklogPublisher<S: EpochStore, L: RingLedgerClient> {
    store: Arc<S>,
    ledger: Arc<L>,
    min_participants: u32,
    allowlist: Option<HashSet<String>>,
}

impl<S: EpochStore, L: RingLedgerClient> BacklogPublisher<S, L> {
    pub fn new(store: Arc<S>, ledger: Arc<L>, config: PublisherConfig) -> Self {
        let allowlist = config
            .allowlist
            .map(|names| names.iter().map(|n| Channel::normalize(n)).collect());
        Self {
            store,
            ledger,
            min_participants: config.min_participants,
            allowlist,
        }
    }

    fn allowed(&self, epoch: &EpochRecord) -> bool {
        self.allowlist
            .as_ref()
            .is_none_or(|names| names.contains(&epoch.channel))
    }

    /// Run one pass over the backlog.
    ///
    /// # Errors
    ///
    /// Only a failure to read the backlog aborts the run. Per-epoch ledger
    /// or store failures are reported as [`PublishOutcome::Failed`].
    pub fn run_once(&self) -> Result<PublishReport, StoreError> {
        let backlog = self.store.unpublished()?;
        let mut report = PublishReport::default();

        for epoch in backlog.iter().filter(|e| self.allowed(e)) {
            let outcome = self.publish_epoch(epoch);
            report.record(epoch, outcome);
        }

        if report.is_empty() {
            debug!("publish backlog empty");
        } else {
            info!(%report, "publisher run complete");
        }
        Ok(report)
    }

    fn publish_epoch(&self, epoch: &EpochRecord) -> PublishOutcome {
        if epoch.participant_count < self.min_participants {
            debug!(
                channel = %epoch.channel,
                epoch_id = epoch.epoch_id,
                participants = epoch.participant_count,
                floor = self.min_participants,
                "epoch below liveness floor, skipping"
            );
            return PublishOutcome::Ineligible {
                participants: epoch.participant_count,
                floor: self.min_participants,
            };
        }

        let outcome = match self
            .ledger
            .publish(&epoch.channel_id, epoch.epoch_id, &epoch.root, epoch.participant_count)
        {
            Ok(()) => PublishOutcome::Published,
            Err(e) if e.is_success_equivalent(epoch.epoch_id) => match e {
                PublishError::NotIncreasing { current, .. } => PublishOutcome::Superseded { current },
                _ => PublishOutcome::AlreadyPublished,
            },
            Err(e) => {
                warn!(
                    channel = %epoch.channel,
                    epoch_id = epoch.epoch_id,
                    "publish failed: {e}"
                );
                return PublishOutcome::Failed { reason: e.to_string() };
            }
        };

        if let Err(e) = self.store.mark_published(&epoch.key()) {
            // The ledger holds the epoch; the next run sees AlreadyPublished.
            warn!(
                channel = %epoch.channel,
                epoch_id = epoch.epoch_id,
                "failed to mark epoch published: {e}"
            );
            return PublishOutcome::Failed { reason: e.to_string() };
        }

        info!(
            channel = %epoch.channel,
            epoch_id = epoch.epoch_id,
            root = %epoch.root,
            outcome = ?outcome,
            "epoch settled"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch_store::MemoryEpochStore;
    use crate::types::{ChannelId, Hash256};
    use parking_lot::Mutex;

    /// Ledger double that replays scripted responses and records calls.
    #[derive(Default)]
    struct ScriptedLedger {
        responses: Mutex<Vec<Result<(), PublishError>>>,
        calls: Mutex<Vec<u64>>,
    }

    impl ScriptedLedger {
        fn with(responses: Vec<Result<(), PublishError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                calls: Mutex::default(),
            }
        }
    }

    impl RingLedgerClient for ScriptedLedger {
        fn publish(&self, _: &ChannelId, epoch_id: u64, _: &Hash256, _: u32) -> Result<(), PublishError> {
            self.calls.lock().push(epoch_id);
            self.responses.lock().pop().unwrap_or(Ok(()))
        }
    }

    fn record(channel: &str, epoch_id: u64, participants: u32) -> EpochRecord {
        EpochRecord {
            channel: channel.to_string(),
            channel_id: ChannelId::derive(channel),
            epoch_id,
            root: Hash256([epoch_id as u8; 32]),
            participant_count: participants,
            total_amount: 100,
            sealed_at: 0,
            published: false,
        }
    }

    fn store_with(records: &[EpochRecord]) -> Arc<MemoryEpochStore> {
        let store = Arc::new(MemoryEpochStore::new());
        for r in records {
            store.insert_sealed(r, &[]).unwrap();
        }
        store
    }

    fn publisher(
        store: &Arc<MemoryEpochStore>,
        ledger: &Arc<ScriptedLedger>,
        config: PublisherConfig,
    ) -> BacklogPublisher<MemoryEpochStore, ScriptedLedger> {
        BacklogPublisher::new(Arc::clone(store), Arc::clone(ledger), config)
    }

    #[test]
    fn publishes_oldest_first_and_marks() {
        let store = store_with(&[record("x", 2, 3), record("x", 1, 3)]);
        let ledger = Arc::new(ScriptedLedger::default());
        let report = publisher(&store, &ledger, PublisherConfig::default()).run_once().unwrap();

        assert_eq!(*ledger.calls.lock(), vec![1, 2]);
        assert_eq!(report.published, 2);
        assert!(store.unpublished().unwrap().is_empty());
    }

    #[test]
    fn success_equivalent_races_are_marked() {
        let store = store_with(&[record("x", 1, 3), record("x", 2, 3)]);
        let ledger = Arc::new(ScriptedLedger::with(vec![
            Err(PublishError::AlreadyPublished { epoch_id: 1 }),
            Err(PublishError::NotIncreasing { current: 12, requested: 2 }),
        ]));
        let report = publisher(&store, &ledger, PublisherConfig::default()).run_once().unwrap();

        assert_eq!(report.already_published, 1);
        assert_eq!(report.superseded, 1);
        assert_eq!(report.epochs[1].outcome, PublishOutcome::Superseded { current: 12 });
        assert!(store.unpublished().unwrap().is_empty());
    }

    #[test]
    fn failure_is_confined_to_one_epoch() {
        let store = store_with(&[record("x", 1, 3), record("x", 2, 3)]);
        let ledger = Arc::new(ScriptedLedger::with(vec![
            Err(PublishError::Transport("connection reset".into())),
            Ok(()),
        ]));
        let report = publisher(&store, &ledger, PublisherConfig::default()).run_once().unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.published, 1);
        let left: Vec<u64> = store.unpublished().unwrap().iter().map(|e| e.epoch_id).collect();
        assert_eq!(left, vec![1]);
    }

    #[test]
    fn ineligible_epochs_stay_in_backlog() {
        let store = store_with(&[record("x", 1, 1), record("x", 2, 5)]);
        let ledger = Arc::new(ScriptedLedger::default());
        let config = PublisherConfig {
            min_participants: 2,
            allowlist: None,
        };
        let report = publisher(&store, &ledger, config).run_once().unwrap();

        assert_eq!(*ledger.calls.lock(), vec![2]);
        assert_eq!(
            report.epochs[0].outcome,
            PublishOutcome::Ineligible { participants: 1, floor: 2 }
        );
        assert!(!report.epochs[0].outcome.is_settled());
        assert_eq!(store.unpublished().unwrap().len(), 1);
    }

    #[test]
    fn allowlist_restricts_channels() {
        let store = store_with(&[record("x", 1, 3), record("y", 1, 3)]);
        let ledger = Arc::new(ScriptedLedger::default());
        let config = PublisherConfig {
            min_participants: 1,
            allowlist: Some(vec!["  Y ".into()]),
        };
        let report = publisher(&store, &ledger, config).run_once().unwrap();

        assert_eq!(report.epochs.len(), 1);
        assert_eq!(report.epochs[0].channel, "y");
        let left: Vec<String> = store.unpublished().unwrap().into_iter().map(|e| e.channel).collect();
        assert_eq!(left, vec!["x".to_string()]);
    }

    #[test]
    fn root_conflict_is_a_failure() {
        let store = store_with(&[record("x", 1, 3)]);
        let ledger = Arc::new(ScriptedLedger::with(vec![Err(PublishError::RootConflict { epoch_id: 1 })]));
        let report = publisher(&store, &ledger, PublisherConfig::default()).run_once().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(store.unpublished().unwrap().len(), 1);
    }

    #[test]
    fn report_serializes_flat() {
        let mut report = PublishReport::default();
        report.record(&record("x", 4, 1), PublishOutcome::Superseded { current: 14 });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["epochs"][0]["outcome"], "superseded");
        assert_eq!(json["epochs"][0]["current"], 14);
        assert_eq!(json["superseded"], 1);
    }
}
