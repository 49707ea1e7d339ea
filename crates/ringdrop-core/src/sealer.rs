//! Epoch sealing: freeze a channel's participant list into a Merkle root.
//!
//! Participants are stable-sorted by [`OwnerId::sort_key`] and indexed
//! `0..n`, so sealing the same raw input always yields the same indices and
//! root. The sealed artifact (epoch row plus one allocation row per
//! participant, proofs materialized) is written through an [`EpochStore`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::{DEFAULT_MAX_CLAIMS_PER_EPOCH, MAX_ID_BYTES, MAX_PROOF_NODES};
use crate::epoch_store::EpochStore;
use crate::error::SealError;
use crate::merkle::{self, MerkleTree};
use crate::types::{Allocation, Channel, EpochKey, EpochRecord, Hash256, OwnerId};

/// One entry of a frozen snapshot, as supplied by the weighting system.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Participant {
    pub owner: OwnerId,
    pub amount: u64,
}

impl Participant {
    pub fn new(owner: OwnerId, amount: u64) -> Self {
        Self { owner, amount }
    }
}

/// A sealed epoch: the persisted epoch row and its allocations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedEpoch {
    pub record: EpochRecord,
    pub allocations: Vec<Allocation>,
}

impl SealedEpoch {
    pub fn root(&self) -> Hash256 {
        self.record.root
    }

    pub fn participant_count(&self) -> u32 {
        self.record.participant_count
    }
}

/// Build allocations and the Merkle root for a participant list.
///
/// Pure: does not touch storage or check epoch monotonicity. Validates
/// everything that depends only on the input.
pub fn build_allocations(
    channel: &Channel,
    epoch_id: u64,
    participants: &[Participant],
    max_claims: u32,
) -> Result<(Hash256, Vec<Allocation>), SealError> {
    if epoch_id == 0 {
        return Err(SealError::InvalidEpoch);
    }
    if participants.is_empty() {
        return Err(SealError::EmptyParticipants);
    }
    if participants.len() > max_claims as usize {
        return Err(SealError::CapacityExceeded {
            count: participants.len(),
            max: max_claims,
        });
    }

    let id = channel.claim_id(epoch_id);
    if id.len() > MAX_ID_BYTES {
        return Err(SealError::IdTooLong {
            len: id.len(),
            max: MAX_ID_BYTES,
        });
    }

    // Stable: participants sharing a sort key keep their input order.
    let mut ordered: Vec<&Participant> = participants.iter().collect();
    ordered.sort_by_cached_key(|p| p.owner.sort_key());

    let leaves: Vec<Hash256> = ordered
        .iter()
        .enumerate()
        .map(|(index, p)| merkle::leaf_hash(&p.owner, index as u32, p.amount, &id))
        .collect();

    let tree = MerkleTree::from_leaves(&leaves);
    if tree.depth() > MAX_PROOF_NODES {
        return Err(SealError::ProofTooDeep {
            depth: tree.depth(),
            max: MAX_PROOF_NODES,
        });
    }

    let allocations = ordered
        .into_iter()
        .zip(tree.proofs())
        .enumerate()
        .map(|(index, (p, proof))| Allocation {
            channel: channel.name().to_string(),
            channel_id: channel.id(),
            epoch_id,
            index: index as u32,
            owner: p.owner,
            amount: p.amount,
            id: id.clone(),
            proof,
        })
        .collect();

    Ok((tree.root(), allocations))
}

/// Seals epochs into an [`EpochStore`].
pub struct EpochSealer<S: EpochStore> {
    store: Arc<S>,
    max_claims_per_epoch: u32,
}

impl<S: EpochStore> EpochSealer<S> {
    /// Create a sealer with the default capacity limit.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_max_claims(store, DEFAULT_MAX_CLAIMS_PER_EPOCH)
    }

    /// Create a sealer that rejects epochs with more than `max_claims_per_epoch`
    /// participants.
    pub fn with_max_claims(store: Arc<S>, max_claims_per_epoch: u32) -> Self {
        Self {
            store,
            max_claims_per_epoch,
        }
    }

    /// Seal an epoch at the current wall-clock time.
    pub fn seal(
        &self,
        channel: &Channel,
        epoch_id: u64,
        participants: &[Participant],
    ) -> Result<SealedEpoch, SealError> {
        self.seal_at(channel, epoch_id, participants, chrono::Utc::now().timestamp())
    }

    /// Seal an epoch with an explicit `sealed_at` timestamp (unix seconds).
    ///
    /// # Errors
    ///
    /// - [`SealError::EpochNotIncreasing`] if `epoch_id` is not above the
    ///   channel's last sealed epoch; the stored artifact is left unchanged
    /// - [`SealError::EmptyParticipants`], [`SealError::InvalidEpoch`],
    ///   [`SealError::CapacityExceeded`] and friends for invalid input
    pub fn seal_at(
        &self,
        channel: &Channel,
        epoch_id: u64,
        participants: &[Participant],
        sealed_at: i64,
    ) -> Result<SealedEpoch, SealError> {
        // Cheap early rejection; the store re-checks atomically on insert.
        if let Some(last) = self.store.last_sealed_epoch(&channel.id())? {
            if epoch_id <= last {
                return Err(SealError::EpochNotIncreasing {
                    last,
                    requested: epoch_id,
                });
            }
        }

        let (root, allocations) =
            build_allocations(channel, epoch_id, participants, self.max_claims_per_epoch)?;

        let total_amount = allocations
            .iter()
            .try_fold(0u64, |acc, a| acc.checked_add(a.amount))
            .ok_or(SealError::AmountOverflow)?;

        let record = EpochRecord {
            channel: channel.name().to_string(),
            channel_id: channel.id(),
            epoch_id,
            root,
            participant_count: allocations.len() as u32,
            total_amount,
            sealed_at,
            published: false,
        };

        self.store.insert_sealed(&record, &allocations)?;

        info!(
            channel = %channel,
            epoch_id,
            participants = record.participant_count,
            total_amount,
            %root,
            "sealed epoch"
        );

        Ok(SealedEpoch {
            record,
            allocations,
        })
    }

    /// Stored allocation (with proof) for one participant.
    pub fn proof(&self, channel: &Channel, epoch_id: u64, index: u32) -> Result<Allocation, SealError> {
        let key = EpochKey {
            channel_id: channel.id(),
            epoch_id,
        };
        self.store
            .get_allocation(&key, index)?
            .ok_or(SealError::UnknownAllocation { epoch_id, index })
    }

    /// Rebuild the tree from stored allocations and check it against the
    /// sealed root. Returns the epoch with freshly computed proofs.
    ///
    /// # Errors
    ///
    /// - [`SealError::UnknownEpoch`] if the epoch was never sealed
    /// - [`SealError::RootMismatch`] if stored rows no longer reproduce the root
    pub fn regenerate(&self, channel: &Channel, epoch_id: u64) -> Result<SealedEpoch, SealError> {
        let key = EpochKey {
            channel_id: channel.id(),
            epoch_id,
        };
        let record = self
            .store
            .get_epoch(&key)?
            .ok_or_else(|| SealError::UnknownEpoch {
                channel: channel.name().to_string(),
                epoch_id,
            })?;

        let mut allocations = self.store.allocations(&key)?;
        let leaves: Vec<Hash256> = allocations.iter().map(Allocation::leaf).collect();
        let tree = MerkleTree::from_leaves(&leaves);

        if tree.root() != record.root {
            return Err(SealError::RootMismatch {
                sealed: record.root,
                recomputed: tree.root(),
            });
        }

        for (allocation, proof) in allocations.iter_mut().zip(tree.proofs()) {
            allocation.proof = proof;
        }

        debug!(channel = %channel, epoch_id, "regenerated proofs");

        Ok(SealedEpoch {
            record,
            allocations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch_store::MemoryEpochStore;
    use crate::merkle::verify_proof;
    use proptest::prelude::*;

    fn owner(byte: u8) -> OwnerId {
        OwnerId([byte; 32])
    }

    fn sealer() -> (EpochSealer<MemoryEpochStore>, Arc<MemoryEpochStore>) {
        let store = Arc::new(MemoryEpochStore::new());
        (EpochSealer::new(Arc::clone(&store)), store)
    }

    fn channel(name: &str) -> Channel {
        Channel::new(name).unwrap()
    }

    #[test]
    fn seal_two_participants() {
        let (sealer, _) = sealer();
        let participants = vec![Participant::new(owner(0xA), 100), Participant::new(owner(0xB), 50)];
        let sealed = sealer.seal_at(&channel("x"), 10, &participants, 1_000).unwrap();

        assert_eq!(sealed.participant_count(), 2);
        assert_eq!(sealed.record.total_amount, 150);
        assert!(!sealed.record.published);
        for a in &sealed.allocations {
            assert_eq!(a.id, "10-x");
            assert_eq!(a.proof.len(), 1);
            assert!(verify_proof(&a.leaf(), &a.proof, &sealed.root()));
        }
    }

    #[test]
    fn indices_follow_sort_key() {
        let (sealer, _) = sealer();
        let participants: Vec<Participant> =
            (1..=6).map(|i| Participant::new(owner(i), u64::from(i))).collect();
        let sealed = sealer.seal_at(&channel("x"), 1, &participants, 0).unwrap();

        let keys: Vec<[u8; 32]> = sealed.allocations.iter().map(|a| a.owner.sort_key()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        for (i, a) in sealed.allocations.iter().enumerate() {
            assert_eq!(a.index as usize, i);
        }
    }

    #[test]
    fn single_participant_root_is_leaf() {
        let (sealer, _) = sealer();
        let sealed = sealer
            .seal_at(&channel("solo"), 3, &[Participant::new(owner(1), 7)], 0)
            .unwrap();
        let only = &sealed.allocations[0];
        assert_eq!(sealed.root(), only.leaf());
        assert!(only.proof.is_empty());
    }

    #[test]
    fn empty_participants_rejected() {
        let (sealer, store) = sealer();
        assert_eq!(
            sealer.seal_at(&channel("x"), 1, &[], 0),
            Err(SealError::EmptyParticipants)
        );
        assert_eq!(store.epoch_count(), 0);
    }

    #[test]
    fn epoch_zero_rejected() {
        let (sealer, _) = sealer();
        assert_eq!(
            sealer.seal_at(&channel("x"), 0, &[Participant::new(owner(1), 1)], 0),
            Err(SealError::InvalidEpoch)
        );
    }

    #[test]
    fn duplicate_epoch_rejected_without_root_drift() {
        let (sealer, store) = sealer();
        let ch = channel("x");
        let first = sealer
            .seal_at(&ch, 10, &[Participant::new(owner(1), 100)], 0)
            .unwrap();

        let err = sealer
            .seal_at(&ch, 10, &[Participant::new(owner(1), 999)], 0)
            .unwrap_err();
        assert_eq!(err, SealError::EpochNotIncreasing { last: 10, requested: 10 });

        let stored = store.get_epoch(&first.record.key()).unwrap().unwrap();
        assert_eq!(stored.root, first.root());
    }

    #[test]
    fn older_epoch_rejected() {
        let (sealer, _) = sealer();
        let ch = channel("x");
        sealer.seal_at(&ch, 10, &[Participant::new(owner(1), 1)], 0).unwrap();
        assert!(matches!(
            sealer.seal_at(&ch, 9, &[Participant::new(owner(1), 1)], 0),
            Err(SealError::EpochNotIncreasing { last: 10, requested: 9 })
        ));
    }

    #[test]
    fn capacity_exceeded_is_caught_at_seal_time() {
        let store = Arc::new(MemoryEpochStore::new());
        let sealer = EpochSealer::with_max_claims(Arc::clone(&store), 3);
        let participants: Vec<Participant> = (0..4).map(|i| Participant::new(owner(i), 1)).collect();
        assert_eq!(
            sealer.seal_at(&channel("x"), 1, &participants, 0),
            Err(SealError::CapacityExceeded { count: 4, max: 3 })
        );
        assert_eq!(store.epoch_count(), 0);
    }

    #[test]
    fn amount_overflow_rejected() {
        let (sealer, _) = sealer();
        let participants = vec![
            Participant::new(owner(1), u64::MAX),
            Participant::new(owner(2), 1),
        ];
        assert_eq!(
            sealer.seal_at(&channel("x"), 1, &participants, 0),
            Err(SealError::AmountOverflow)
        );
    }

    #[test]
    fn duplicate_owners_keep_input_order() {
        let (sealer, _) = sealer();
        let participants = vec![
            Participant::new(owner(1), 5),
            Participant::new(owner(1), 6),
        ];
        let sealed = sealer.seal_at(&channel("x"), 1, &participants, 0).unwrap();
        assert_eq!(sealed.allocations[0].amount, 5);
        assert_eq!(sealed.allocations[1].amount, 6);
        assert_ne!(sealed.allocations[0].leaf(), sealed.allocations[1].leaf());
    }

    #[test]
    fn proof_lookup() {
        let (sealer, _) = sealer();
        let ch = channel("x");
        let sealed = sealer
            .seal_at(&ch, 4, &[Participant::new(owner(1), 1), Participant::new(owner(2), 2)], 0)
            .unwrap();
        assert_eq!(sealer.proof(&ch, 4, 1).unwrap(), sealed.allocations[1]);
        assert_eq!(
            sealer.proof(&ch, 4, 2),
            Err(SealError::UnknownAllocation { epoch_id: 4, index: 2 })
        );
    }

    #[test]
    fn regenerate_reproduces_root_and_proofs() {
        let (sealer, _) = sealer();
        let ch = channel("x");
        let participants: Vec<Participant> =
            (0..9).map(|i| Participant::new(owner(i), u64::from(i) * 3)).collect();
        let sealed = sealer.seal_at(&ch, 2, &participants, 0).unwrap();
        let regenerated = sealer.regenerate(&ch, 2).unwrap();
        assert_eq!(regenerated, sealed);
    }

    #[test]
    fn regenerate_unknown_epoch() {
        let (sealer, _) = sealer();
        assert!(matches!(
            sealer.regenerate(&channel("x"), 2),
            Err(SealError::UnknownEpoch { epoch_id: 2, .. })
        ));
    }

    proptest! {
        #[test]
        fn resealing_same_input_is_deterministic(
            amounts in proptest::collection::vec(1u64..1_000_000, 1..64),
            epoch in 1u64..1_000,
        ) {
            let participants: Vec<Participant> = amounts
                .iter()
                .enumerate()
                .map(|(i, &a)| Participant::new(OwnerId(blake3::hash(&i.to_le_bytes()).into()), a))
                .collect();
            let ch = channel("det");

            let (a, _) = sealer();
            let (b, _) = sealer();
            let first = a.seal_at(&ch, epoch, &participants, 0).unwrap();
            let mut reversed = participants.clone();
            reversed.reverse();
            let second = b.seal_at(&ch, epoch, &reversed, 0).unwrap();

            prop_assert_eq!(first.root(), second.root());
            prop_assert_eq!(first.allocations, second.allocations);
        }
    }
}
