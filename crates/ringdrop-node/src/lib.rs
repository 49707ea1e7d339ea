//! # ringdrop-node
//! Distributor node backed by RocksDB.
//!
//! Composes the Ringdrop core into a running distributor:
//! - [`storage::RocksEpochStore`]: persistent sealed epochs and ring snapshots
//! - [`distributor::Distributor`]: sealer, ledger and publisher loop
//! - [`config::NodeConfig`]: layered node configuration

pub mod config;
pub mod distributor;
pub mod storage;

pub use self::config::NodeConfig;
pub use distributor::Distributor;
pub use storage::RocksEpochStore;
