//! termbridge-agent: connects this machine to the termbridge cloud and
//! exposes its terminal sessions for remote control.

use anyhow::Result;
use clap::{Parser, Subcommand};
use libtermbridge::system;
use std::path::PathBuf;
use termbridge_agent::config::{self, Config};
use termbridge_agent::{daemon, update};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(
    name = "termbridge-agent",
    about = "termbridge agent - remote terminal session host",
    version
)]
struct Args {
    /// Override log level (debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
    /// Path to an alternate config file.
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print version and platform information.
    Version,
    /// Check whether a newer release is available.
    CheckUpdate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| cfg.log_level.clone());

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            format!("termbridge_agent={level},libtermbridge={level}")
        }))
        .init();

    match args.command {
        Some(Cmd::Version) => {
            println!("termbridge-agent v{VERSION}");
            println!("Platform: {} / {}", system::os_ident(), system::hostname());
            Ok(())
        }
        Some(Cmd::CheckUpdate) => update::check(VERSION).await,
        None => {
            if !cfg.is_configured() {
                eprintln!("Error: agent is not configured.");
                eprintln!(
                    "Set api_key and machine_id in {}",
                    config::config_path().display()
                );
                std::process::exit(1);
            }
            daemon::run(cfg, VERSION).await
        }
    }
}
