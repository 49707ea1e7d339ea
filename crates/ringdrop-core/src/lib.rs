//! # ringdrop-core
//! Protocol types and state machines for Ringdrop epoch drops: the Keccak
//! Merkle codec, the epoch sealer, the per-channel ring ledger and the
//! backlog publisher.

pub mod constants;
pub mod epoch_store;
pub mod error;
pub mod ledger;
pub mod merkle;
pub mod publisher;
pub mod sealer;
pub mod traits;
pub mod types;
