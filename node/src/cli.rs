//! # CLI Interface
//!
//! Command-line argument structure for `umbra-node` using `clap`
//! derive. Three subcommands: `run`, `init`, and `version`. Every
//! configurable value has a matching environment variable so container
//! entrypoints don't need a wall of flags.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// UMBRA node.
///
/// The coordination engine of a permissioned, privacy-preserving
/// ledger network: assembles private transactions, collects
/// endorsements from peer nodes, and dispatches public transactions to
/// the shared base ledger.
#[derive(Parser, Debug)]
#[command(
    name = "umbra-node",
    about = "UMBRA privacy ledger node",
    version,
    propagate_version = true
)]
pub struct UmbraNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the UMBRA node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Initialize a new node — creates the data directory and generates
    /// the signing root seed.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Path to the node data directory (store, keys).
    ///
    /// Created on first run if it does not exist.
    #[arg(long, short = 'd', env = "UMBRA_DATA_DIR", default_value = "~/.umbra")]
    pub data_dir: PathBuf,

    /// This node's name, as peers address it through the registry.
    #[arg(long, env = "UMBRA_NODE_NAME", default_value = "node1")]
    pub node_name: String,

    /// Path to a JSON configuration document (partial documents are
    /// fine; anything unspecified keeps its default).
    #[arg(long, short = 'c', env = "UMBRA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run in development mode: temporary store and an in-process
    /// auto-confirming base ledger. Useful for local hacking — never
    /// for a real network.
    #[arg(long)]
    pub dev: bool,

    /// Log verbosity level: trace, debug, info, warn, error.
    #[arg(long, env = "UMBRA_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: pretty or json.
    #[arg(long, env = "UMBRA_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct InitArgs {
    /// Path to the data directory to initialize.
    #[arg(long, short = 'd', env = "UMBRA_DATA_DIR", default_value = "~/.umbra")]
    pub data_dir: PathBuf,

    /// Overwrite an existing seed file. This destroys the node's key
    /// material — every derived key changes.
    #[arg(long)]
    pub force: bool,
}

/// Resolves the data directory path, expanding the `~` prefix to the
/// user's home directory. Returns the path unchanged otherwise.
pub fn resolve_data_dir(path: &std::path::Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    if path_str.starts_with("~/") || path_str == "~" {
        if let Some(home) = dirs_home() {
            return home.join(path_str.strip_prefix("~/").unwrap_or(""));
        }
    }
    path.to_path_buf()
}

/// Returns the user's home directory, or `None` if it cannot be determined.
fn dirs_home() -> Option<PathBuf> {
    #[cfg(unix)]
    {
        std::env::var_os("HOME").map(PathBuf::from)
    }
    #[cfg(windows)]
    {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    }
    #[cfg(not(any(unix, windows)))]
    {
        None
    }
}

/// Validates that the given log level string is recognized.
pub fn validate_log_level(level: &str) -> bool {
    matches!(
        level.to_lowercase().as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        UmbraNodeCli::command().debug_assert();
    }

    #[test]
    fn run_subcommand_defaults() {
        let args = UmbraNodeCli::parse_from(["umbra-node", "run"]);
        match args.command {
            Commands::Run(run) => {
                assert_eq!(run.node_name, "node1");
                assert!(!run.dev);
                assert_eq!(run.log_level, "info");
                assert_eq!(run.log_format, "pretty");
                assert!(run.config.is_none());
            }
            _ => panic!("expected Run subcommand"),
        }
    }

    #[test]
    fn run_subcommand_custom_values() {
        let args = UmbraNodeCli::parse_from([
            "umbra-node",
            "run",
            "--dev",
            "--node-name",
            "node7",
            "--data-dir",
            "/tmp/umbra-test",
            "--log-level",
            "debug",
            "--log-format",
            "json",
        ]);
        match args.command {
            Commands::Run(run) => {
                assert!(run.dev);
                assert_eq!(run.node_name, "node7");
                assert_eq!(run.data_dir, PathBuf::from("/tmp/umbra-test"));
                assert_eq!(run.log_level, "debug");
                assert_eq!(run.log_format, "json");
            }
            _ => panic!("expected Run subcommand"),
        }
    }

    #[test]
    fn init_subcommand_force_flag() {
        let args = UmbraNodeCli::parse_from(["umbra-node", "init", "--force"]);
        match args.command {
            Commands::Init(init) => assert!(init.force),
            _ => panic!("expected Init subcommand"),
        }
    }

    #[test]
    fn version_subcommand_parses() {
        let args = UmbraNodeCli::parse_from(["umbra-node", "version"]);
        assert!(matches!(args.command, Commands::Version));
    }

    #[test]
    fn resolve_data_dir_expands_tilde() {
        let path = PathBuf::from("~/.umbra");
        let resolved = resolve_data_dir(&path);
        assert!(
            !resolved.to_string_lossy().starts_with('~'),
            "tilde should have been expanded: {:?}",
            resolved
        );
    }

    #[test]
    fn resolve_data_dir_absolute_unchanged() {
        let path = PathBuf::from("/tmp/umbra-data");
        let resolved = resolve_data_dir(&path);
        assert_eq!(resolved, path);
    }

    #[test]
    fn validate_log_level_rules() {
        assert!(validate_log_level("trace"));
        assert!(validate_log_level("INFO")); // case-insensitive
        assert!(!validate_log_level("verbose"));
        assert!(!validate_log_level(""));
    }
}
