//! swapsig-node — headless daemon hosting the swap coordination core.
//!
//! # Usage
//!
//! ```bash
//! swapsig-node --config /path/to/swapsig-node.toml
//! swapsig-node --validate   # Validate config and exit
//! ```

mod config;
mod daemon;

use anyhow::{Context, Result};
use std::path::PathBuf;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("/config/swapsig-node.toml");
    let mut validate_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--validate" => {
                validate_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("swapsig-node {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("unknown argument: {}", other);
            }
        }
        i += 1;
    }

    let mut node_config = config::NodeConfig::from_file(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    node_config.apply_env_overrides();
    node_config.validate().context("configuration validation failed")?;

    std::env::set_var("RUST_LOG", &node_config.node.log_level);
    env_logger::init();

    if validate_only {
        println!("configuration is valid.");
        println!("  network:     {}", node_config.bitcoin.network);
        println!("  data dir:    {}", node_config.node.data_dir.display());
        println!(
            "  pool bounds: {}..={} participants",
            node_config.pool.min_participants, node_config.pool.max_participants
        );
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new().context("failed to create tokio runtime")?;
    let result = rt.block_on(async {
        let node = daemon::Node::start(&node_config).await?;
        tokio::select! {
            result = node.run_event_loop() => result,
            _ = tokio::signal::ctrl_c() => {
                log::info!("received shutdown signal, exiting");
                Ok(())
            }
        }
    });

    if let Err(e) = result {
        log::error!("node error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"swapsig-node — decentralized swap coordination daemon

USAGE:
    swapsig-node [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: /config/swapsig-node.toml)
    --validate            Validate config file and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    SWAPSIG_DATA_DIR          Data directory path
    SWAPSIG_LOG_LEVEL         Log level (error/warn/info/debug/trace)
    SWAPSIG_POLL_INTERVAL     Confirmation poll interval in seconds
    SWAPSIG_NETWORK           Bitcoin network (bitcoin/testnet/signet/regtest)
    SWAPSIG_MIN_PARTICIPANTS  Minimum participants for a locally-created pool
    SWAPSIG_MAX_PARTICIPANTS  Maximum participants for a locally-created pool
    SWAPSIG_FEE_RATE          Default fee rate (sat) for locally-created pools
"#
    );
}
