//! # CLI Interface
//!
//! Defines the command-line argument structure for `conclave-node` using
//! `clap` derive. Supports four subcommands: `run`, `init`, `status`,
//! and `version`.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// Conclave consensus-core node.
///
/// Runs the consensus engine for an intelligent-contract network:
/// transaction ingress, per-contract scheduling, validator committees,
/// the commit–reveal state machine, appeals, and finalization. Serves
/// the JSON-RPC/WS API and exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "conclave-node",
    about = "Conclave consensus-core node",
    version,
    propagate_version = true
)]
pub struct ConclaveNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the consensus node.
    Run(RunArgs),
    /// Initialize a new node — creates the data directory layout.
    Init(InitArgs),
    /// Query the status of a running node via its RPC endpoint.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node data directory where the store lives.
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "CONCLAVE_DATA_DIR", default_value = "~/.conclave")]
    pub data_dir: PathBuf,

    /// Listen address for the JSON-RPC/WS/REST API.
    #[arg(long, env = "CONCLAVE_RPC_ADDR", default_value = "127.0.0.1:9851")]
    pub rpc_addr: String,

    /// Listen address for the Prometheus metrics endpoint.
    #[arg(long, env = "CONCLAVE_METRICS_ADDR", default_value = "127.0.0.1:9852")]
    pub metrics_addr: String,

    /// URL of the validator-executor service the core invokes.
    ///
    /// Ignored under `--dev`, which runs against the built-in mock
    /// executor instead.
    #[arg(long, env = "CONCLAVE_EXECUTOR_URL", default_value = "http://127.0.0.1:9860")]
    pub executor_url: String,

    /// Dev mode: temporary in-memory store, seeded validator set, short
    /// finality window, mock executor. Reset on every start, no promises,
    /// no survivors.
    #[arg(long)]
    pub dev: bool,

    /// Number of deterministic dev validators to seed (dev mode only).
    #[arg(long, default_value_t = 5)]
    pub dev_validators: u8,

    /// Shared secret required by admin RPC methods (`set_finality_window`,
    /// registry mutation). Unset means admin methods are open — fine on a
    /// laptop, negligent anywhere else.
    #[arg(long, env = "CONCLAVE_ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Maximum JSON-RPC requests per second before -32029 kicks in.
    #[arg(long, env = "CONCLAVE_RPC_RATE_LIMIT", default_value_t = 500)]
    pub rpc_rate_limit: u32,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, env = "CONCLAVE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "CONCLAVE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Path to the data directory to initialize.
    #[arg(long, short = 'd', env = "CONCLAVE_DATA_DIR", default_value = "~/.conclave")]
    pub data_dir: PathBuf,

    /// Overwrite an existing data directory.
    #[arg(long)]
    pub force: bool,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// RPC endpoint of the running node.
    #[arg(long, default_value = "http://127.0.0.1:9851")]
    pub rpc_url: String,
}

/// Expands a leading `~` to the user's home directory.
pub fn resolve_data_dir(raw: &Path) -> PathBuf {
    let raw_str = raw.to_string_lossy();
    if let Some(rest) = raw_str.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    raw.to_path_buf()
}

/// Validates a log level string against the levels tracing understands.
pub fn validate_log_level(level: &str) -> bool {
    matches!(
        level.to_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        ConclaveNodeCli::command().debug_assert();
    }

    #[test]
    fn data_dir_tilde_expansion() {
        std::env::set_var("HOME", "/home/operator");
        let resolved = resolve_data_dir(Path::new("~/.conclave"));
        assert_eq!(resolved, PathBuf::from("/home/operator/.conclave"));

        // Absolute paths pass through untouched.
        let absolute = resolve_data_dir(Path::new("/var/lib/conclave"));
        assert_eq!(absolute, PathBuf::from("/var/lib/conclave"));
    }

    #[test]
    fn log_level_validation() {
        assert!(validate_log_level("info"));
        assert!(validate_log_level("DEBUG"));
        assert!(!validate_log_level("verbose"));
    }
}
