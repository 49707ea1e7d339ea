//! Protocol constants. Amounts are in base units of the distributed asset.

/// Domain tag prepended to the lowercase channel name when deriving a
/// [`ChannelId`](crate::types::ChannelId).
pub const CHANNEL_ID_DOMAIN: &[u8] = b"channel:";

/// Maximum length of a normalized channel name, in bytes.
pub const MAX_CHANNEL_NAME_BYTES: usize = 32;

/// Maximum length of an allocation `id` string, in bytes.
///
/// Claims carrying a longer id are rejected before any hashing happens.
pub const MAX_ID_BYTES: usize = 64;

/// Maximum number of sibling hashes accepted in a claim proof.
///
/// A depth of 20 covers trees of up to 2^20 leaves, which is above
/// [`MAX_EPOCH_CLAIMS`].
pub const MAX_PROOF_NODES: usize = 20;

/// Hard ceiling on the number of allocations in a single epoch.
///
/// Deployments configure a lower `max_claims_per_epoch`; this bounds what
/// they are allowed to configure.
pub const MAX_EPOCH_CLAIMS: u32 = 1_000_000;

/// Default per-deployment cap on allocations per epoch.
pub const DEFAULT_MAX_CLAIMS_PER_EPOCH: u32 = MAX_EPOCH_CLAIMS;

/// Default number of ring slots per channel.
pub const DEFAULT_RING_CAPACITY: usize = 10;

/// Largest ring capacity a deployment may configure.
pub const MAX_RING_CAPACITY: usize = 4096;

/// Basis-point denominator for fee computation.
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Maximum protocol fee in basis points (10%).
pub const MAX_FEE_BASIS_POINTS: u16 = 1_000;

/// Default protocol fee in basis points (0.1%).
pub const DEFAULT_FEE_BASIS_POINTS: u16 = 10;

/// Default absolute cap on the protocol fee charged for one claim.
pub const DEFAULT_MAX_FEE: u64 = 1_000_000_000_000;

/// Default grace period before a slot with unclaimed allocations may be
/// evicted under [`EvictionPolicy::Protect`](crate::ledger::EvictionPolicy).
pub const DEFAULT_EVICTION_GRACE_SECS: u64 = 7 * 24 * 60 * 60;

/// Default minimum participant count for an epoch to be published.
pub const DEFAULT_MIN_PARTICIPANTS: u32 = 1;

/// Default interval between backlog publisher runs, in seconds.
pub const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 60;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_depth_covers_max_claims() {
        assert!(1u64 << MAX_PROOF_NODES >= u64::from(MAX_EPOCH_CLAIMS));
    }

    #[test]
    fn default_fee_within_cap() {
        assert!(DEFAULT_FEE_BASIS_POINTS <= MAX_FEE_BASIS_POINTS);
        assert!(u64::from(MAX_FEE_BASIS_POINTS) <= BPS_DENOMINATOR);
    }

    #[test]
    fn longest_claim_id_fits() {
        // "<u64::MAX>-<longest channel name>"
        let longest = u64::MAX.to_string().len() + 1 + MAX_CHANNEL_NAME_BYTES;
        assert!(longest <= MAX_ID_BYTES);
    }
}
