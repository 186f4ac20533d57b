// Copyright (c) 2026 Umbra Labs. MIT License.
// See LICENSE for details.

//! # UMBRA Node
//!
//! Entry point for the `umbra-node` binary. Parses CLI arguments,
//! initializes logging, wires the coordination engine, and runs it
//! until SIGINT/SIGTERM.
//!
//! The binary supports three subcommands:
//!
//! - `run`     — start the node
//! - `init`    — initialize the data directory and root seed
//! - `version` — print build version information

mod cli;
mod logging;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rand::RngCore;
use tokio::signal;

use umbra_core::config::{CoreConfig, ENGINE_NAME, ENGINE_VERSION};
use umbra_core::domains::notes::{NotesConfig, NotesDomain};
use umbra_core::publictx::DevChain;
use umbra_core::Node;

use cli::{Commands, UmbraNodeCli};
use logging::LogFormat;

/// Seed file inside the data directory. 32 bytes of hex; everything
/// the node signs with derives from it.
const SEED_FILE: &str = "node.seed";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = UmbraNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Builds the engine configuration from the config document (if any)
/// plus the CLI overrides.
fn load_config(args: &cli::RunArgs) -> Result<CoreConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => CoreConfig::default(),
    };
    config.node_name = args.node_name.clone();

    let data_dir = cli::resolve_data_dir(&args.data_dir);
    if args.dev {
        config.data_dir = None; // temporary store
    } else {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;
        config.data_dir = Some(data_dir.join("db"));

        // The signing seed comes from the data directory unless the
        // config document pins one.
        if config.signer.seed.is_none() {
            let seed_path = data_dir.join(SEED_FILE);
            let seed = std::fs::read_to_string(&seed_path).with_context(|| {
                format!(
                    "failed to read {} (run `umbra-node init` first)",
                    seed_path.display()
                )
            })?;
            config.signer.seed = Some(seed.trim().to_string());
        }
    }
    Ok(config)
}

/// Starts the node and runs until a shutdown signal.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    if !cli::validate_log_level(&args.log_level) {
        anyhow::bail!("unrecognized log level {:?}", args.log_level);
    }
    logging::init_logging(
        &format!("umbra_node={0},umbra_core={0}", args.log_level),
        LogFormat::from_str_lossy(&args.log_format),
    );

    let config = load_config(&args)?;
    tracing::info!(
        node = %config.node_name,
        dev = args.dev,
        data_dir = ?config.data_dir,
        "starting umbra-node"
    );

    // The base-ledger client is an external collaborator. Dev mode
    // brings an in-process auto-confirming chain; anything else needs
    // a real client wired in by the embedding deployment.
    if !args.dev {
        anyhow::bail!(
            "no base-ledger client configured; run with --dev for the in-process dev chain"
        );
    }
    let ledger = DevChain::new();

    let node = Node::start(config, ledger)
        .await
        .context("engine startup failed")?;

    // Dev mode ships the reference notes domain pre-loaded, so the
    // node is immediately usable.
    node.register_domain(
        Arc::new(NotesDomain::new("noto", NotesConfig::default())),
        &serde_json::json!({}),
    )
    .await
    .context("failed to register notes domain")?;

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    node.stop().await;
    tracing::info!("umbra-node stopped");
    Ok(())
}

/// Initializes a new node data directory and generates the root seed.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("umbra_node=info", LogFormat::Pretty);

    let data_dir = cli::resolve_data_dir(&args.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

    let seed_path = data_dir.join(SEED_FILE);
    if seed_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (pass --force to overwrite and destroy existing keys)",
            seed_path.display()
        );
    }

    let mut seed = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut seed);
    std::fs::write(&seed_path, format!("0x{}\n", hex::encode(seed)))
        .with_context(|| format!("failed to write seed to {}", seed_path.display()))?;

    // Restrict permissions on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&seed_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(seed_path = %seed_path.display(), "root seed generated");
    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Seed file      : {}", seed_path.display());
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("umbra-node {}", env!("CARGO_PKG_VERSION"));
    println!("{}  {}", ENGINE_NAME, ENGINE_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
