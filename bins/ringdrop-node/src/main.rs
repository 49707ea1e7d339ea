//! Ringdrop distributor node binary.
//!
//! Seals channel epochs into Merkle commitments, publishes them to the ring
//! ledger, and serves proofs and claims from the local RocksDB store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ringdrop_core::ledger::ClaimRequest;
use ringdrop_core::sealer::Participant;
use ringdrop_node_lib::{Distributor, NodeConfig};
use serde::Serialize;
use tracing::info;

/// Ringdrop distributor node.
#[derive(Parser, Debug)]
#[command(
    name = "ringdrop-node",
    version,
    about = "Seal, publish and claim ring-buffered epoch drops"
)]
struct Cli {
    /// TOML configuration file (layered under RINGDROP_* env vars)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for epoch storage
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, global = true, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seal an epoch from a participant file.
    Seal(SealArgs),
    /// Run one publisher pass over the unpublished backlog.
    Publish,
    /// Run the publisher on its configured interval until Ctrl+C.
    Run,
    /// Print the stored allocation and proof for one participant.
    Proof(AllocationArgs),
    /// Claim an allocation and print the transfer authorization.
    Claim(ClaimArgs),
    /// Rebuild an epoch's proofs and check them against the sealed root.
    Regenerate(EpochArgs),
    /// Show sealing and ring-slot state for a channel.
    Status(ChannelArgs),
}

#[derive(Args, Debug)]
struct ChannelArgs {
    /// Channel name (case-insensitive)
    #[arg(long)]
    channel: String,
}

#[derive(Args, Debug)]
struct EpochArgs {
    #[arg(long)]
    channel: String,

    #[arg(long)]
    epoch: u64,
}

#[derive(Args, Debug)]
struct SealArgs {
    #[arg(long)]
    channel: String,

    #[arg(long)]
    epoch: u64,

    /// JSON array of {"owner": "<base58 or 0x-hex>", "amount": <u64>}
    #[arg(long)]
    participants: PathBuf,
}

#[derive(Args, Debug)]
struct AllocationArgs {
    #[arg(long)]
    channel: String,

    #[arg(long)]
    epoch: u64,

    #[arg(long)]
    index: u32,
}

#[derive(Args, Debug)]
struct ClaimArgs {
    #[arg(long, required_unless_present = "request")]
    channel: Option<String>,

    #[arg(long, required_unless_present = "request")]
    epoch: Option<u64>,

    #[arg(long, required_unless_present = "request")]
    index: Option<u32>,

    /// JSON claim request to submit instead of a stored allocation
    #[arg(long, conflicts_with_all = ["channel", "epoch", "index"])]
    request: Option<PathBuf>,
}

impl Cli {
    /// Load file and environment configuration, then apply CLI overrides.
    fn load_config(&self) -> Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref()).context("failed to load configuration")?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    init_logging(&config.log_level, &cli.log_format);

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data_dir {}", config.data_dir.display()))?;

    let node = Distributor::open(config).context("failed to open distributor")?;

    match cli.command {
        Commands::Seal(args) => {
            let participants = read_participants(&args.participants)?;
            let sealed = node
                .seal(&args.channel, args.epoch, &participants)
                .with_context(|| format!("failed to seal epoch {} of {}", args.epoch, args.channel))?;
            print_json(&sealed.record)
        }
        Commands::Publish => {
            let report = node.publish_backlog().context("publisher run failed")?;
            print_json(&report)
        }
        Commands::Run => {
            info!("Ringdrop node v{}", env!("CARGO_PKG_VERSION"));
            info!("data_dir: {:?}", node.config().data_dir);
            info!("publishing every {}s (Ctrl+C to stop)", node.config().publish_interval_secs);

            let shutdown_signal = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("failed to listen for Ctrl+C: {e}");
                }
                info!("received Ctrl+C, shutting down...");
            };
            node.run(shutdown_signal).await;
            info!("Ringdrop node shutdown complete");
            Ok(())
        }
        Commands::Proof(args) => {
            let allocation = node
                .proof(&args.channel, args.epoch, args.index)
                .context("proof lookup failed")?;
            print_json(&allocation)
        }
        Commands::Claim(args) => {
            let auth = match (args.request, args.channel, args.epoch, args.index) {
                (Some(path), ..) => {
                    let request: ClaimRequest = read_json(&path)?;
                    node.claim(&request)
                }
                (None, Some(channel), Some(epoch), Some(index)) => node.claim_stored(&channel, epoch, index),
                _ => anyhow::bail!("either --request or --channel/--epoch/--index is required"),
            }
            .context("claim rejected")?;
            print_json(&auth)
        }
        Commands::Regenerate(args) => {
            let sealed = node
                .regenerate(&args.channel, args.epoch)
                .context("regeneration failed")?;
            print_json(&sealed.allocations)
        }
        Commands::Status(args) => {
            let status = node.status(&args.channel).context("status lookup failed")?;
            print_json(&status)
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

fn read_participants(path: &Path) -> Result<Vec<Participant>> {
    read_json(path)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text. Logs go to stderr so that command output
/// on stdout stays machine-readable.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true).with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "ringdrop-node",
            "status",
            "--channel",
            "x",
            "--data-dir",
            "/tmp/rd",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/rd")));
        assert_eq!(cli.log_format, "json");
        assert!(matches!(cli.command, Commands::Status(ChannelArgs { ref channel }) if channel == "x"));
    }

    #[test]
    fn claim_accepts_stored_allocation() {
        let cli = Cli::parse_from(["ringdrop-node", "claim", "--channel", "x", "--epoch", "10", "--index", "1"]);
        match cli.command {
            Commands::Claim(args) => {
                assert_eq!(args.channel.as_deref(), Some("x"));
                assert_eq!((args.epoch, args.index), (Some(10), Some(1)));
                assert!(args.request.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn claim_request_conflicts_with_stored_allocation() {
        let result = Cli::try_parse_from(["ringdrop-node", "claim", "--request", "r.json", "--index", "1"]);
        assert!(result.is_err());
        assert!(Cli::try_parse_from(["ringdrop-node", "claim", "--channel", "x"]).is_err());
    }

    #[test]
    fn participants_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("participants.json");
        let hex = format!("0x{}", "01".repeat(32));
        std::fs::write(&path, format!(r#"[{{"owner": "{hex}", "amount": 100}}]"#)).unwrap();

        let participants = read_participants(&path).unwrap();
        assert_eq!(participants.len(), 1);
        assert_eq!(participants[0].amount, 100);
        assert_eq!(participants[0].owner.as_bytes(), &[1u8; 32]);
    }
}
