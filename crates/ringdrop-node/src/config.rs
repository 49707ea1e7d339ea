//! Node configuration for the Ringdrop distributor.
//!
//! [`NodeConfig`] carries defaults for every setting. [`NodeConfig::load`]
//! layers an optional TOML file under `RINGDROP_*` environment variables
//! (nested keys separated by `__`, e.g. `RINGDROP_FEES__BASIS_POINTS`).
//! Command-line flags are applied on top by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use ringdrop_core::constants::{
    DEFAULT_MAX_CLAIMS_PER_EPOCH, DEFAULT_MIN_PARTICIPANTS, DEFAULT_PUBLISH_INTERVAL_SECS, DEFAULT_RING_CAPACITY,
};
use ringdrop_core::error::LedgerError;
use ringdrop_core::ledger::{EvictionPolicy, FeeSchedule, LedgerConfig};
use ringdrop_core::publisher::PublisherConfig;
use ringdrop_core::types::OwnerId;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RINGDROP";

/// Configuration for a distributor node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Log level filter string (e.g. "info", "debug", "ringdrop_core=trace").
    pub log_level: String,
    /// Seconds between publisher runs in `run` mode.
    pub publish_interval_secs: u64,
    /// Ring slots per channel.
    pub ring_capacity: usize,
    /// Largest participant count per sealed epoch.
    pub max_claims_per_epoch: u32,
    /// Liveness floor for publishing.
    pub min_participants: u32,
    /// Channels the publisher is restricted to; `None` publishes all.
    pub allowlist: Option<Vec<String>>,
    pub fees: FeeSchedule,
    pub eviction: EvictionPolicy,
    /// Ledger administrator.
    pub admin: OwnerId,
    /// Delegated publisher, in addition to the admin.
    pub publisher: Option<OwnerId>,
    /// Identity this node publishes as. Defaults to `admin`.
    pub signer: Option<OwnerId>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ringdrop");

        Self {
            data_dir,
            log_level: "info".to_string(),
            publish_interval_secs: DEFAULT_PUBLISH_INTERVAL_SECS,
            ring_capacity: DEFAULT_RING_CAPACITY,
            max_claims_per_epoch: DEFAULT_MAX_CLAIMS_PER_EPOCH,
            min_participants: DEFAULT_MIN_PARTICIPANTS,
            allowlist: None,
            fees: FeeSchedule::default(),
            eviction: EvictionPolicy::default(),
            admin: OwnerId::default(),
            publisher: None,
            signer: None,
        }
    }
}

impl NodeConfig {
    /// Load configuration from an optional file plus the environment.
    ///
    /// A missing `path` means defaults plus environment only. A `path` that
    /// does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Path to the RocksDB epoch database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("epochs")
    }

    /// Identity used when submitting publishes.
    pub fn signer(&self) -> OwnerId {
        self.signer.unwrap_or(self.admin)
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            ring_capacity: self.ring_capacity,
            max_claims_per_epoch: self.max_claims_per_epoch,
            fees: self.fees,
            eviction: self.eviction,
            admin: self.admin,
            publisher: self.publisher,
        }
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            min_participants: self.min_participants,
            allowlist: self.allowlist.clone(),
        }
    }

    /// Check ledger parameters before anything is opened.
    pub fn validate(&self) -> Result<(), LedgerError> {
        self.ledger_config().validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.ring_capacity, 10);
        assert_eq!(cfg.max_claims_per_epoch, 1_000_000);
        assert_eq!(cfg.min_participants, 1);
        assert_eq!(cfg.publish_interval_secs, 60);
        assert_eq!(cfg.fees.basis_points, 10);
        assert_eq!(cfg.eviction, EvictionPolicy::Expire);
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn default_data_dir_ends_with_ringdrop() {
        let cfg = NodeConfig::default();
        assert!(cfg.data_dir.ends_with("ringdrop"), "data_dir: {:?}", cfg.data_dir);
    }

    #[test]
    fn db_path_appends_epochs() {
        let cfg = NodeConfig {
            data_dir: PathBuf::from("/tmp/ringdrop-test"),
            ..NodeConfig::default()
        };
        assert_eq!(cfg.db_path(), PathBuf::from("/tmp/ringdrop-test/epochs"));
    }

    #[test]
    fn signer_defaults_to_admin() {
        let admin = OwnerId([7; 32]);
        let cfg = NodeConfig {
            admin,
            ..NodeConfig::default()
        };
        assert_eq!(cfg.signer(), admin);

        let other = OwnerId([8; 32]);
        let cfg = NodeConfig {
            signer: Some(other),
            ..cfg
        };
        assert_eq!(cfg.signer(), other);
    }

    #[test]
    fn loads_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ringdrop.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
ring_capacity = 16
min_participants = 3
allowlist = ["coolstreamer"]
admin = "0x{admin}"

[fees]
basis_points = 25
max_fee = 500

[eviction]
mode = "protect"
grace_secs = 3600
"#,
            admin = "ab".repeat(32)
        )
        .unwrap();

        let cfg = NodeConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.ring_capacity, 16);
        assert_eq!(cfg.min_participants, 3);
        assert_eq!(cfg.allowlist, Some(vec!["coolstreamer".to_string()]));
        assert_eq!(cfg.admin, OwnerId([0xAB; 32]));
        assert_eq!(cfg.fees, FeeSchedule { basis_points: 25, max_fee: 500 });
        assert_eq!(cfg.eviction, EvictionPolicy::Protect { grace_secs: 3600 });
        // Untouched keys keep their defaults.
        assert_eq!(cfg.max_claims_per_epoch, 1_000_000);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(NodeConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn invalid_fee_fails_validation() {
        let cfg = NodeConfig {
            fees: FeeSchedule {
                basis_points: 5_000,
                max_fee: 0,
            },
            ..NodeConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(LedgerError::FeeTooHigh { .. })));
    }
}
