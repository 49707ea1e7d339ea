//! End-to-end and adversarial test suite for Ringdrop.
//!
//! Integration tests drive the sealer, ring ledger and backlog publisher
//! together and try to break the claim invariants: one payout per
//! allocation, no claims against rotated-out epochs, no forged leaves.

pub mod helpers;
