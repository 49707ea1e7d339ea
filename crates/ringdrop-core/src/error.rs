//! Error types for the Ringdrop protocol.
use thiserror::Error;

use crate::types::Hash256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel name is empty")] Empty,
    #[error("channel name too long: {len} > {max} bytes")] TooLong { len: usize, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("epoch not increasing: last sealed {last}, requested {requested}")] EpochNotIncreasing { last: u64, requested: u64 },
    #[error("not found: {0}")] NotFound(String),
    #[error("codec: {0}")] Codec(String),
    #[error("backend: {0}")] Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SealError {
    #[error("empty participant set")] EmptyParticipants,
    #[error("epoch 0 is reserved")] InvalidEpoch,
    #[error("epoch not increasing: last sealed {last}, requested {requested}")] EpochNotIncreasing { last: u64, requested: u64 },
    #[error("capacity exceeded: {count} participants > max {max}")] CapacityExceeded { count: usize, max: u32 },
    #[error("claim id too long: {len} > {max} bytes")] IdTooLong { len: usize, max: usize },
    #[error("proof too deep: {depth} > {max} nodes")] ProofTooDeep { depth: usize, max: usize },
    #[error("total allocation overflows u64")] AmountOverflow,
    #[error("unknown epoch {epoch_id} for channel {channel}")] UnknownEpoch { channel: String, epoch_id: u64 },
    #[error("unknown allocation {index} in epoch {epoch_id}")] UnknownAllocation { epoch_id: u64, index: u32 },
    #[error("root mismatch: sealed {sealed}, recomputed {recomputed}")] RootMismatch { sealed: Hash256, recomputed: Hash256 },
    #[error(transparent)] Channel(#[from] ChannelError),
    #[error("store: {0}")] Store(StoreError),
}

impl From<StoreError> for SealError {
    fn from(err: StoreError) -> Self {
        match err {
            // A concurrent sealer won the race; surface it as the same
            // input-validation error a sequential caller would see.
            StoreError::EpochNotIncreasing { last, requested } => {
                SealError::EpochNotIncreasing { last, requested }
            }
            other => SealError::Store(other),
        }
    }
}

/// Rejections from the ring ledger's Publish transition.
///
/// [`AlreadyPublished`](Self::AlreadyPublished) and
/// [`NotIncreasing`](Self::NotIncreasing) are the idempotent-race outcomes;
/// every other variant is an "other" ledger failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("epoch {epoch_id} already published")] AlreadyPublished { epoch_id: u64 },
    #[error("epoch not increasing: slot holds {current}, requested {requested}")] NotIncreasing { current: u64, requested: u64 },
    #[error("epoch {epoch_id} already published with a different root")] RootConflict { epoch_id: u64 },
    #[error("epoch 0 is reserved")] InvalidEpoch,
    #[error("claim count is zero")] EmptyEpoch,
    #[error("claim count too large: {count} > {max}")] ClaimCountTooLarge { count: u32, max: u32 },
    #[error("slot {slot} still holds epoch {epoch_id} with {unclaimed} unclaimed allocations")] SlotStillLive { slot: usize, epoch_id: u64, unclaimed: u32 },
    #[error("signer is not an authorized publisher")] Unauthorized,
    #[error("ledger is paused")] Paused,
    #[error("transport: {0}")] Transport(String),
}

impl PublishError {
    /// Whether a backlog publisher may treat this outcome as success for
    /// `requested`: the epoch is already on the ledger, or the slot has
    /// moved past it.
    pub fn is_success_equivalent(&self, requested: u64) -> bool {
        match self {
            PublishError::AlreadyPublished { .. } => true,
            PublishError::NotIncreasing { current, .. } => *current > requested,
            _ => false,
        }
    }
}

/// Rejections from the ring ledger's Claim transition. None of them mutate
/// ledger state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("channel not initialized")] ChannelNotInitialized,
    #[error("epoch {requested} not published (slot holds {current})")] NotPublished { requested: u64, current: u64 },
    #[error("epoch {requested} rotated out of its slot (slot holds {current}); allocation can no longer be claimed")] EpochEvicted { requested: u64, current: u64 },
    #[error("index {index} out of range for claim count {claim_count}")] IndexOutOfRange { index: u32, claim_count: u32 },
    #[error("allocation {index} already claimed")] AlreadyClaimed { index: u32 },
    #[error("merkle proof does not verify")] InvalidProof,
    #[error("claim id too long: {len} > {max} bytes")] IdTooLong { len: usize, max: usize },
    #[error("proof too long: {len} > {max} nodes")] ProofTooLong { len: usize, max: usize },
    #[error("ledger is paused")] Paused,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("signer is not the ledger admin")] Unauthorized,
    #[error("invalid ring capacity {0}")] InvalidCapacity(usize),
    #[error("invalid max claims per epoch {0}")] InvalidMaxClaims(u32),
    #[error("fee too high: {bps} bps > {max} bps")] FeeTooHigh { bps: u16, max: u16 },
    #[error("ring capacity mismatch: snapshot has {got}, ledger expects {expected}")] CapacityMismatch { got: usize, expected: usize },
}

#[derive(Error, Debug)]
pub enum RingdropError {
    #[error(transparent)] Channel(#[from] ChannelError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Seal(#[from] SealError),
    #[error(transparent)] Publish(#[from] PublishError),
    #[error(transparent)] Claim(#[from] ClaimError),
    #[error(transparent)] Ledger(#[from] LedgerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_published_is_success_equivalent() {
        let err = PublishError::AlreadyPublished { epoch_id: 7 };
        assert!(err.is_success_equivalent(7));
    }

    #[test]
    fn not_increasing_past_request_is_success_equivalent() {
        let err = PublishError::NotIncreasing { current: 17, requested: 7 };
        assert!(err.is_success_equivalent(7));
    }

    #[test]
    fn other_publish_errors_are_failures() {
        assert!(!PublishError::Unauthorized.is_success_equivalent(7));
        assert!(!PublishError::RootConflict { epoch_id: 7 }.is_success_equivalent(7));
        assert!(!PublishError::Paused.is_success_equivalent(7));
    }

    #[test]
    fn store_race_maps_to_seal_validation_error() {
        let err: SealError = StoreError::EpochNotIncreasing { last: 5, requested: 5 }.into();
        assert_eq!(err, SealError::EpochNotIncreasing { last: 5, requested: 5 });
    }

    #[test]
    fn evicted_message_is_distinct_from_bad_proof() {
        let evicted = ClaimError::EpochEvicted { requested: 1, current: 11 }.to_string();
        let proof = ClaimError::InvalidProof.to_string();
        let claimed = ClaimError::AlreadyClaimed { index: 0 }.to_string();
        assert!(evicted.contains("rotated out"));
        assert_ne!(evicted, proof);
        assert_ne!(proof, claimed);
    }
}
