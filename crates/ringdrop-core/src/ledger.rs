//! Ring ledger state machine.
//!
//! Each channel owns a fixed array of [`RingSlot`]s. Epoch `e` lives in slot
//! `e mod N`; a slot's epoch strictly increases across publishes, and
//! publishing a newer epoch into an occupied slot discards the old epoch's
//! claim bitmap. All mutation goes through two transitions:
//!
//! - [`ChannelRing::publish`]: install a sealed epoch's root and a zeroed
//!   bitmap sized to its claim count.
//! - [`ChannelRing::claim`]: verify a Merkle proof against the slot and set
//!   the claimed bit, producing one [`TransferAuthorization`].
//!
//! [`RingLedger`] hosts the rings of all channels. Each channel entry is
//! mutated under its map-entry lock, standing in for the host ledger's
//! single-writer-per-account execution; the transitions themselves take no
//! locks.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{
    BPS_DENOMINATOR, DEFAULT_EVICTION_GRACE_SECS, DEFAULT_FEE_BASIS_POINTS, DEFAULT_MAX_CLAIMS_PER_EPOCH,
    DEFAULT_MAX_FEE, DEFAULT_RING_CAPACITY, MAX_EPOCH_CLAIMS, MAX_FEE_BASIS_POINTS, MAX_ID_BYTES,
    MAX_PROOF_NODES, MAX_RING_CAPACITY,
};
use crate::error::{ClaimError, LedgerError, PublishError};
use crate::merkle;
use crate::traits::RingLedgerClient;
use crate::types::{Allocation, ChannelId, Hash256, OwnerId};

// --- Bitmap ---

/// One bit per allocation index of a slot's current epoch.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct ClaimBitmap {
    words: Vec<u64>,
    len: u32,
}

impl ClaimBitmap {
    /// An all-zero bitmap of `len` bits.
    pub fn with_len(len: u32) -> Self {
        Self {
            words: vec![0; (len as usize).div_ceil(64)],
            len,
        }
    }

    /// Number of addressable bits.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether bit `index` is set. Out-of-range indices read as unset;
    /// callers bound-check before relying on this.
    pub fn is_set(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        let (word, bit) = (index as usize / 64, index % 64);
        self.words.get(word).is_some_and(|w| w & (1u64 << bit) != 0)
    }

    /// Set bit `index`. Returns `false` if it was already set or is out of
    /// range (including a word missing from a malformed decode).
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len || self.is_set(index) {
            return false;
        }
        let (word, bit) = (index as usize / 64, index % 64);
        match self.words.get_mut(word) {
            Some(w) => {
                *w |= 1u64 << bit;
                true
            }
            None => false,
        }
    }

    /// Clear bit `index`. Used to roll back a claim whose commit failed.
    pub fn clear(&mut self, index: u32) {
        if index >= self.len {
            return;
        }
        let (word, bit) = (index as usize / 64, index % 64);
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1u64 << bit);
        }
    }

    /// Number of set bits.
    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }
}

// --- Slot ---

/// One ring slot: the commitment and claim state of the epoch occupying it.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct RingSlot {
    /// Occupying epoch; 0 when the slot is empty.
    pub epoch_id: u64,
    pub root: Hash256,
    /// Valid indices are `0..claim_count`.
    pub claim_count: u32,
    /// Unix seconds of the publish that installed this epoch.
    pub published_at: i64,
    pub claimed: ClaimBitmap,
}

impl RingSlot {
    pub fn is_empty(&self) -> bool {
        self.epoch_id == 0
    }

    /// Allocations of the occupying epoch not yet claimed.
    pub fn unclaimed(&self) -> u32 {
        self.claim_count.saturating_sub(self.claimed.count_set())
    }
}

// --- Policy & fees ---

/// What happens to an occupied slot whose epoch still has unclaimed
/// allocations when a newer epoch maps onto it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Overwrite unconditionally; unclaimed allocations expire.
    #[default]
    Expire,
    /// Refuse to overwrite while allocations remain unclaimed, until
    /// `grace_secs` after the occupying epoch was published.
    Protect { grace_secs: u64 },
}

impl EvictionPolicy {
    /// `Protect` with the default seven-day grace.
    pub fn protect_default() -> Self {
        EvictionPolicy::Protect {
            grace_secs: DEFAULT_EVICTION_GRACE_SECS,
        }
    }

    /// Whether `slot` may be overwritten at time `now`.
    fn permits_eviction(&self, slot: &RingSlot, now: i64) -> bool {
        match self {
            EvictionPolicy::Expire => true,
            EvictionPolicy::Protect { grace_secs } => {
                slot.is_empty()
                    || slot.unclaimed() == 0
                    || now >= slot
                        .published_at
                        .saturating_add(i64::try_from(*grace_secs).unwrap_or(i64::MAX))
            }
        }
    }
}

/// Protocol fee deducted from each claim: `min(amount * bps / 10_000, max_fee)`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeSchedule {
    pub basis_points: u16,
    pub max_fee: u64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            basis_points: DEFAULT_FEE_BASIS_POINTS,
            max_fee: DEFAULT_MAX_FEE,
        }
    }
}

impl FeeSchedule {
    /// A schedule that charges nothing.
    pub fn zero() -> Self {
        Self {
            basis_points: 0,
            max_fee: 0,
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.basis_points > MAX_FEE_BASIS_POINTS {
            return Err(LedgerError::FeeTooHigh {
                bps: self.basis_points,
                max: MAX_FEE_BASIS_POINTS,
            });
        }
        Ok(())
    }

    /// Fee for a claim of `amount`. Never exceeds `amount`.
    pub fn fee_for(&self, amount: u64) -> u64 {
        let raw = u128::from(amount) * u128::from(self.basis_points) / u128::from(BPS_DENOMINATOR);
        // bps <= 10_000 keeps raw <= amount, so the narrowing is lossless.
        (raw as u64).min(self.max_fee)
    }
}

/// Authorization for the external transfer layer to pay out one claim.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TransferAuthorization {
    pub channel_id: ChannelId,
    pub epoch_id: u64,
    pub index: u32,
    pub recipient: OwnerId,
    /// Allocation amount committed in the leaf.
    pub gross_amount: u64,
    pub fee: u64,
    /// `gross_amount - fee`.
    pub net_amount: u64,
}

/// A claim submitted by an end user.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClaimRequest {
    pub channel_id: ChannelId,
    pub epoch_id: u64,
    pub index: u32,
    pub owner: OwnerId,
    pub amount: u64,
    pub id: String,
    pub proof: Vec<Hash256>,
}

impl ClaimRequest {
    /// Build a request from a stored allocation.
    pub fn from_allocation(allocation: &Allocation) -> Self {
        Self {
            channel_id: allocation.channel_id,
            epoch_id: allocation.epoch_id,
            index: allocation.index,
            owner: allocation.owner,
            amount: allocation.amount,
            id: allocation.id.clone(),
            proof: allocation.proof.clone(),
        }
    }
}

/// Where an epoch stands relative to its ring slot.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SlotStatus {
    /// The epoch occupies its slot and can be claimed against.
    Active { claimed: u32, claim_count: u32 },
    /// A newer epoch has overwritten the slot.
    Evicted { current: u64 },
    /// The slot has not reached this epoch yet (or the channel is unknown).
    NotPublished,
}

// --- Channel ring ---

/// The per-channel account: `N` slots plus the highest published epoch.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct ChannelRing {
    pub channel_id: ChannelId,
    pub latest_epoch: u64,
    pub slots: Vec<RingSlot>,
}

/// Limits applied by [`ChannelRing`] transitions.
#[derive(Clone, Copy, Debug)]
pub struct RingRules {
    pub max_claims_per_epoch: u32,
    pub eviction: EvictionPolicy,
}

impl RingRules {
    /// Input checks of the Publish transition that do not depend on slot state.
    pub fn check_publish(&self, epoch_id: u64, claim_count: u32) -> Result<(), PublishError> {
        if epoch_id == 0 {
            return Err(PublishError::InvalidEpoch);
        }
        if claim_count == 0 {
            return Err(PublishError::EmptyEpoch);
        }
        if claim_count > self.max_claims_per_epoch {
            return Err(PublishError::ClaimCountTooLarge {
                count: claim_count,
                max: self.max_claims_per_epoch,
            });
        }
        Ok(())
    }
}

impl ChannelRing {
    /// A ring of `capacity` empty slots.
    pub fn new(channel_id: ChannelId, capacity: usize) -> Self {
        Self {
            channel_id,
            latest_epoch: 0,
            slots: vec![RingSlot::default(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slot index for `epoch_id`: `epoch_id mod N`.
    pub fn slot_index(&self, epoch_id: u64) -> usize {
        (epoch_id % self.slots.len() as u64) as usize
    }

    pub fn slot(&self, epoch_id: u64) -> &RingSlot {
        &self.slots[self.slot_index(epoch_id)]
    }

    /// Publish transition.
    ///
    /// # Errors
    ///
    /// - [`PublishError::AlreadyPublished`] if the slot already holds this
    ///   epoch with this root
    /// - [`PublishError::RootConflict`] if it holds this epoch with another root
    /// - [`PublishError::NotIncreasing`] if the slot holds a newer epoch
    /// - [`PublishError::SlotStillLive`] if the eviction policy protects the
    ///   occupying epoch
    pub fn publish(
        &mut self,
        epoch_id: u64,
        root: Hash256,
        claim_count: u32,
        now: i64,
        rules: &RingRules,
    ) -> Result<(), PublishError> {
        rules.check_publish(epoch_id, claim_count)?;

        let index = self.slot_index(epoch_id);
        let slot = &mut self.slots[index];

        if slot.epoch_id == epoch_id {
            return if slot.root == root {
                Err(PublishError::AlreadyPublished { epoch_id })
            } else {
                Err(PublishError::RootConflict { epoch_id })
            };
        }
        if slot.epoch_id > epoch_id {
            return Err(PublishError::NotIncreasing {
                current: slot.epoch_id,
                requested: epoch_id,
            });
        }
        if !rules.eviction.permits_eviction(slot, now) {
            return Err(PublishError::SlotStillLive {
                slot: index,
                epoch_id: slot.epoch_id,
                unclaimed: slot.unclaimed(),
            });
        }

        if !slot.is_empty() && slot.unclaimed() > 0 {
            warn!(
                channel = %self.channel_id,
                evicted_epoch = slot.epoch_id,
                unclaimed = slot.unclaimed(),
                "evicting epoch with unclaimed allocations"
            );
        }

        *slot = RingSlot {
            epoch_id,
            root,
            claim_count,
            published_at: now,
            claimed: ClaimBitmap::with_len(claim_count),
        };
        self.latest_epoch = self.latest_epoch.max(epoch_id);
        Ok(())
    }

    /// Claim transition. Checks run in order (epoch, index, bit, proof); the
    /// bit is set only when all pass.
    pub fn claim(&mut self, request: &ClaimRequest, fees: &FeeSchedule) -> Result<TransferAuthorization, ClaimError> {
        if request.id.len() > MAX_ID_BYTES {
            return Err(ClaimError::IdTooLong {
                len: request.id.len(),
                max: MAX_ID_BYTES,
            });
        }
        if request.proof.len() > MAX_PROOF_NODES {
            return Err(ClaimError::ProofTooLong {
                len: request.proof.len(),
                max: MAX_PROOF_NODES,
            });
        }

        let index = self.slot_index(request.epoch_id);
        let slot = &mut self.slots[index];

        if slot.epoch_id != request.epoch_id {
            return Err(if slot.epoch_id > request.epoch_id {
                ClaimError::EpochEvicted {
                    requested: request.epoch_id,
                    current: slot.epoch_id,
                }
            } else {
                ClaimError::NotPublished {
                    requested: request.epoch_id,
                    current: slot.epoch_id,
                }
            });
        }
        if request.index >= slot.claim_count {
            return Err(ClaimError::IndexOutOfRange {
                index: request.index,
                claim_count: slot.claim_count,
            });
        }
        if slot.claimed.is_set(request.index) {
            return Err(ClaimError::AlreadyClaimed { index: request.index });
        }

        let leaf = merkle::leaf_hash(&request.owner, request.index, request.amount, &request.id);
        if !merkle::verify_proof(&leaf, &request.proof, &slot.root) {
            return Err(ClaimError::InvalidProof);
        }

        slot.claimed.set(request.index);

        let fee = fees.fee_for(request.amount);
        Ok(TransferAuthorization {
            channel_id: self.channel_id,
            epoch_id: request.epoch_id,
            index: request.index,
            recipient: request.owner,
            gross_amount: request.amount,
            fee,
            net_amount: request.amount - fee,
        })
    }

    /// Status of `epoch_id` relative to its slot.
    pub fn status(&self, epoch_id: u64) -> SlotStatus {
        let slot = self.slot(epoch_id);
        if epoch_id != 0 && slot.epoch_id == epoch_id {
            SlotStatus::Active {
                claimed: slot.claimed.count_set(),
                claim_count: slot.claim_count,
            }
        } else if slot.epoch_id > epoch_id {
            SlotStatus::Evicted {
                current: slot.epoch_id,
            }
        } else {
            SlotStatus::NotPublished
        }
    }
}

// --- Ledger ---

/// Deployment-wide ledger parameters.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Slots per channel (`N`).
    pub ring_capacity: usize,
    /// Largest claim count a publish may carry.
    pub max_claims_per_epoch: u32,
    pub fees: FeeSchedule,
    pub eviction: EvictionPolicy,
    /// May publish and administer the ledger.
    pub admin: OwnerId,
    /// Additional identity allowed to publish.
    pub publisher: Option<OwnerId>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_claims_per_epoch: DEFAULT_MAX_CLAIMS_PER_EPOCH,
            fees: FeeSchedule::default(),
            eviction: EvictionPolicy::default(),
            admin: OwnerId::default(),
            publisher: None,
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.ring_capacity == 0 || self.ring_capacity > MAX_RING_CAPACITY {
            return Err(LedgerError::InvalidCapacity(self.ring_capacity));
        }
        if self.max_claims_per_epoch == 0 || self.max_claims_per_epoch > MAX_EPOCH_CLAIMS {
            return Err(LedgerError::InvalidMaxClaims(self.max_claims_per_epoch));
        }
        self.fees.validate()
    }
}

/// Mutable authority state.
#[derive(Clone, Debug)]
struct Authority {
    admin: OwnerId,
    publisher: Option<OwnerId>,
    paused: bool,
}

impl Authority {
    fn may_publish(&self, signer: &OwnerId) -> bool {
        *signer == self.admin || self.publisher.as_ref() == Some(signer)
    }
}

/// Hosts every channel's ring.
pub struct RingLedger {
    rings: DashMap<ChannelId, ChannelRing>,
    authority: RwLock<Authority>,
    rules: RingRules,
    fees: FeeSchedule,
    ring_capacity: usize,
}

impl RingLedger {
    /// Create an empty ledger.
    pub fn new(config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        Ok(Self {
            rings: DashMap::new(),
            authority: RwLock::new(Authority {
                admin: config.admin,
                publisher: config.publisher,
                paused: false,
            }),
            rules: RingRules {
                max_claims_per_epoch: config.max_claims_per_epoch,
                eviction: config.eviction,
            },
            fees: config.fees,
            ring_capacity: config.ring_capacity,
        })
    }

    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    pub fn fees(&self) -> FeeSchedule {
        self.fees
    }

    /// Publish at the current wall-clock time.
    pub fn publish(
        &self,
        signer: &OwnerId,
        channel: &ChannelId,
        epoch_id: u64,
        root: Hash256,
        claim_count: u32,
    ) -> Result<(), PublishError> {
        self.publish_at(signer, channel, epoch_id, root, claim_count, chrono::Utc::now().timestamp())
    }

    /// Publish transition with an explicit clock. Creates the channel's ring
    /// on first use.
    pub fn publish_at(
        &self,
        signer: &OwnerId,
        channel: &ChannelId,
        epoch_id: u64,
        root: Hash256,
        claim_count: u32,
        now: i64,
    ) -> Result<(), PublishError> {
        {
            let authority = self.authority.read();
            if authority.paused {
                return Err(PublishError::Paused);
            }
            if !authority.may_publish(signer) {
                return Err(PublishError::Unauthorized);
            }
        }

        // Rejected input must not leave an empty ring behind.
        self.rules.check_publish(epoch_id, claim_count)?;

        let mut ring = self
            .rings
            .entry(*channel)
            .or_insert_with(|| ChannelRing::new(*channel, self.ring_capacity));
        ring.publish(epoch_id, root, claim_count, now, &self.rules)?;

        info!(
            channel = %channel,
            epoch_id,
            slot = ring.slot_index(epoch_id),
            claim_count,
            %root,
            "published epoch"
        );
        Ok(())
    }

    /// Claim transition.
    pub fn claim(&self, request: &ClaimRequest) -> Result<TransferAuthorization, ClaimError> {
        self.claim_and_commit(request, |_| Ok(()))
    }

    /// Claim transition followed by `commit` on the updated ring, both under
    /// the channel's entry lock. If `commit` fails the claimed bit is cleared
    /// again and no authorization is returned.
    pub fn claim_and_commit<E, F>(&self, request: &ClaimRequest, commit: F) -> Result<TransferAuthorization, E>
    where
        E: From<ClaimError>,
        F: FnOnce(&ChannelRing) -> Result<(), E>,
    {
        if self.authority.read().paused {
            return Err(ClaimError::Paused.into());
        }

        let mut ring = self
            .rings
            .get_mut(&request.channel_id)
            .ok_or(ClaimError::ChannelNotInitialized)?;

        let auth = match ring.claim(request, &self.fees) {
            Ok(auth) => auth,
            Err(e) => {
                debug!(
                    channel = %request.channel_id,
                    epoch_id = request.epoch_id,
                    index = request.index,
                    "claim rejected: {e}"
                );
                return Err(e.into());
            }
        };

        if let Err(e) = commit(&ring) {
            let slot = ring.slot_index(request.epoch_id);
            ring.slots[slot].claimed.clear(request.index);
            warn!(
                channel = %request.channel_id,
                epoch_id = request.epoch_id,
                index = request.index,
                "claim commit failed, bit cleared"
            );
            return Err(e);
        }

        info!(
            channel = %request.channel_id,
            epoch_id = request.epoch_id,
            index = request.index,
            recipient = %auth.recipient,
            net_amount = auth.net_amount,
            fee = auth.fee,
            "claim authorized"
        );
        Ok(auth)
    }

    /// Status of an epoch relative to its slot.
    pub fn slot_status(&self, channel: &ChannelId, epoch_id: u64) -> SlotStatus {
        self.rings
            .get(channel)
            .map_or(SlotStatus::NotPublished, |ring| ring.status(epoch_id))
    }

    /// Whether allocation `index` of `epoch_id` has been claimed. `false` if
    /// the epoch does not currently occupy its slot.
    pub fn is_claimed(&self, channel: &ChannelId, epoch_id: u64, index: u32) -> bool {
        self.rings.get(channel).is_some_and(|ring| {
            let slot = ring.slot(epoch_id);
            slot.epoch_id == epoch_id && slot.claimed.is_set(index)
        })
    }

    /// Highest epoch ever published for `channel` (0 if none).
    pub fn latest_epoch(&self, channel: &ChannelId) -> u64 {
        self.rings.get(channel).map_or(0, |ring| ring.latest_epoch)
    }

    /// Copy of a channel's ring, for persistence.
    pub fn snapshot(&self, channel: &ChannelId) -> Option<ChannelRing> {
        self.rings.get(channel).map(|ring| ring.clone())
    }

    /// Install a previously snapshotted ring.
    pub fn restore(&self, ring: ChannelRing) -> Result<(), LedgerError> {
        if ring.capacity() != self.ring_capacity {
            return Err(LedgerError::CapacityMismatch {
                got: ring.capacity(),
                expected: self.ring_capacity,
            });
        }
        self.rings.insert(ring.channel_id, ring);
        Ok(())
    }

    /// Channels with a ring.
    pub fn channels(&self) -> Vec<ChannelId> {
        self.rings.iter().map(|entry| *entry.key()).collect()
    }

    pub fn is_paused(&self) -> bool {
        self.authority.read().paused
    }

    /// Pause or resume publishes and claims. Admin only.
    pub fn set_paused(&self, signer: &OwnerId, paused: bool) -> Result<(), LedgerError> {
        let mut authority = self.authority.write();
        if *signer != authority.admin {
            return Err(LedgerError::Unauthorized);
        }
        authority.paused = paused;
        info!(paused, "ledger pause state changed");
        Ok(())
    }

    /// Hand administration to `new_admin`. Admin only.
    pub fn set_admin(&self, signer: &OwnerId, new_admin: OwnerId) -> Result<(), LedgerError> {
        let mut authority = self.authority.write();
        if *signer != authority.admin {
            return Err(LedgerError::Unauthorized);
        }
        let old_admin = std::mem::replace(&mut authority.admin, new_admin);
        info!(old_admin = %old_admin, new_admin = %new_admin, "admin transferred");
        Ok(())
    }

    /// Current administrator.
    pub fn admin(&self) -> OwnerId {
        self.authority.read().admin
    }

    /// Replace the delegated publisher. Admin only.
    pub fn set_publisher(&self, signer: &OwnerId, publisher: Option<OwnerId>) -> Result<(), LedgerError> {
        let mut authority = self.authority.write();
        if *signer != authority.admin {
            return Err(LedgerError::Unauthorized);
        }
        authority.publisher = publisher;
        info!(publisher = ?publisher.map(|p| p.to_string()), "publisher updated");
        Ok(())
    }
}

/// A [`RingLedger`] bound to a signing identity, as seen by the backlog
/// publisher.
#[derive(Clone)]
pub struct LedgerPublisher {
    ledger: Arc<RingLedger>,
    signer: OwnerId,
}

impl LedgerPublisher {
    pub fn new(ledger: Arc<RingLedger>, signer: OwnerId) -> Self {
        Self { ledger, signer }
    }
}

impl RingLedgerClient for LedgerPublisher {
    fn publish(&self, channel: &ChannelId, epoch_id: u64, root: &Hash256, claim_count: u32) -> Result<(), PublishError> {
        self.ledger
            .publish(&self.signer, channel, epoch_id, *root, claim_count)
    }
}
