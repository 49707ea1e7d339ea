//! Core protocol types: hashes, identities, channels, epochs, allocations.
//!
//! Hashes and identities are fixed 32-byte values. Their serde form is a
//! string (hex for hashes and channel ids, base58 for owners) so that sealed
//! artifacts and claim payloads read naturally as JSON; their bincode form is
//! the raw bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

use crate::constants::{CHANNEL_ID_DOMAIN, MAX_CHANNEL_NAME_BYTES};
use crate::error::ChannelError;

/// Keccak-256 over the concatenation of `parts`.
pub fn keccak_hashv(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Error parsing a 32-byte value from its text form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid 32-byte value: {0}")]
pub struct ParseBytesError(String);

fn parse_hex32(s: &str) -> Result<[u8; 32], ParseBytesError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| ParseBytesError(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| ParseBytesError(format!("expected 32 bytes, got {}", v.len())))
}

/// A 32-byte hash value (Merkle leaves, internal nodes and roots).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes). Root of an empty slot.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Hash256 {
    type Err = ParseBytesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex32(s).map(Self)
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Identity of a claimant (a wallet public key, raw 32 bytes).
///
/// Displayed as base58; parsed from base58 or `0x`-prefixed hex.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct OwnerId(pub [u8; 32]);

impl OwnerId {
    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Stable sort key used to assign allocation indices at seal time.
    pub fn sort_key(&self) -> [u8; 32] {
        blake3::hash(&self.0).into()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl FromStr for OwnerId {
    type Err = ParseBytesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("0x") {
            return parse_hex32(s).map(Self);
        }
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| ParseBytesError(e.to_string()))?;
        bytes
            .try_into()
            .map(Self)
            .map_err(|v: Vec<u8>| ParseBytesError(format!("expected 32 bytes, got {}", v.len())))
    }
}

impl From<[u8; 32]> for OwnerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Stable 32-byte subject identifier of a channel.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    /// Derive the id of a channel: `keccak256("channel:" || normalized(name))`,
    /// normalized as in [`Channel::normalize`].
    ///
    /// Callers normally go through [`Channel::new`], which also validates the name.
    pub fn derive(name: &str) -> Self {
        let name = Channel::normalize(name);
        Self(keccak_hashv(&[CHANNEL_ID_DOMAIN, name.as_bytes()]))
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ChannelId {
    type Err = ParseBytesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex32(s).map(Self)
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(Hash256);
string_serde!(OwnerId);
string_serde!(ChannelId);

/// A named reward stream.
///
/// The name is trimmed and ASCII-lowercased on construction; two names that
/// differ only in case are the same channel.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
pub struct Channel {
    name: String,
    id: ChannelId,
}

impl Channel {
    /// Validate and normalize a channel name.
    pub fn new(name: &str) -> Result<Self, ChannelError> {
        let name = Self::normalize(name);
        if name.is_empty() {
            return Err(ChannelError::Empty);
        }
        if name.len() > MAX_CHANNEL_NAME_BYTES {
            return Err(ChannelError::TooLong {
                len: name.len(),
                max: MAX_CHANNEL_NAME_BYTES,
            });
        }
        let id = ChannelId::derive(&name);
        Ok(Self { name, id })
    }

    /// Normalized form of a channel name (trimmed, ASCII lowercase).
    pub fn normalize(name: &str) -> String {
        name.trim().to_ascii_lowercase()
    }

    /// Normalized channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Derived subject identifier.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// The per-claim `id` string bound into every leaf of an epoch:
    /// `"<epoch_id>-<channel name>"`.
    pub fn claim_id(&self, epoch_id: u64) -> String {
        format!("{epoch_id}-{}", self.name)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Address of one epoch: `(channel, epoch_id)`.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct EpochKey {
    pub channel_id: ChannelId,
    pub epoch_id: u64,
}

impl EpochKey {
    /// Storage key: `channel_id || epoch_id(BE)`, ordered by channel then epoch.
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut key = [0u8; 40];
        key[..32].copy_from_slice(self.channel_id.as_bytes());
        key[32..].copy_from_slice(&self.epoch_id.to_be_bytes());
        key
    }
}

impl fmt::Display for EpochKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.epoch_id)
    }
}

/// One sealed snapshot of a channel. Append-only: the root never changes
/// after sealing; only `published` flips.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct EpochRecord {
    /// Normalized channel name.
    pub channel: String,
    pub channel_id: ChannelId,
    pub epoch_id: u64,
    /// Merkle root over all allocations.
    pub root: Hash256,
    pub participant_count: u32,
    /// Sum of all allocation amounts.
    pub total_amount: u64,
    /// Unix seconds.
    pub sealed_at: i64,
    pub published: bool,
}

impl EpochRecord {
    pub fn key(&self) -> EpochKey {
        EpochKey {
            channel_id: self.channel_id,
            epoch_id: self.epoch_id,
        }
    }
}

/// One participant's allocation: the preimage of a Merkle leaf plus its proof.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Allocation {
    pub channel: String,
    pub channel_id: ChannelId,
    pub epoch_id: u64,
    /// Dense 0-based index assigned at seal time.
    pub index: u32,
    pub owner: OwnerId,
    pub amount: u64,
    /// Per-claim disambiguating tag, see [`Channel::claim_id`].
    pub id: String,
    /// Sibling hashes from the leaf level upward.
    pub proof: Vec<Hash256>,
}

impl Allocation {
    /// Storage key: `channel_id || epoch_id(BE) || index(BE)`.
    pub fn key_bytes(&self) -> [u8; 44] {
        allocation_key(&self.channel_id, self.epoch_id, self.index)
    }

    /// The Merkle leaf committed for this allocation.
    pub fn leaf(&self) -> Hash256 {
        crate::merkle::leaf_hash(&self.owner, self.index, self.amount, &self.id)
    }
}

/// Storage key for one allocation row.
pub fn allocation_key(channel_id: &ChannelId, epoch_id: u64, index: u32) -> [u8; 44] {
    let mut key = [0u8; 44];
    key[..32].copy_from_slice(channel_id.as_bytes());
    key[32..40].copy_from_slice(&epoch_id.to_be_bytes());
    key[40..].copy_from_slice(&index.to_be_bytes());
    key
}
