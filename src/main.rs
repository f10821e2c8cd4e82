#![deny(dead_code)]
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use std::path::PathBuf;

mod replay;
mod utils;

use chatsync::config::{self, SyncConfig};
use chatsync::sync::identity::normalize_id;
use chatsync::sync::ChatSync;

/// Command line arguments for chatsync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatsync: chat delivery and read-receipt reconciliation.",
    long_about = "Replays scripted fetches, push events and sends through the reconciliation engine \
    and prints the resulting view as JSON."
)]
struct Args {
    /// Config file to use instead of the default location
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH", global = true)]
    log_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a JSON script of steps and print the final view
    Replay {
        script: PathBuf,
        /// Local user id, overriding the config file and the script
        #[arg(long)]
        me: Option<String>,
    },
    /// Write a config file with defaults for the given user
    InitConfig {
        #[arg(long)]
        me: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.config {
        config::set_config_path_override(path.clone());
    }
    let stored = config::load_config()?;
    let level = stored
        .as_ref()
        .map(SyncConfig::log_level_filter)
        .unwrap_or(LevelFilter::Info);
    utils::setup_logging(args.log_file.as_deref(), level)?;

    match args.command {
        Commands::InitConfig { me } => {
            let config = SyncConfig::new(me);
            config.user_chat_id()?;
            let path = config::save_config(&config)?;
            println!("Wrote {}", path.display());
        }
        Commands::Replay { script, me } => {
            let script = replay::load_script(&script)?;
            let mut config = match stored {
                Some(config) => config,
                None => SyncConfig::new(String::new()),
            };
            if let Some(me) = me {
                config.user_id = me;
            } else if config.user_id.is_empty() {
                let from_script = script
                    .me
                    .as_ref()
                    .and_then(normalize_id)
                    .ok_or_else(|| anyhow!("no user id: pass --me, run init-config, or set \"me\" in the script"))?;
                config.user_id = from_script.to_string();
            }
            let engine = ChatSync::with_config(&config)?;
            info!("Replaying {} steps as user {}", script.steps.len(), engine.me());

            let report = replay::Replay::new(engine).run(&script.steps)?;
            let output = serde_json::to_string_pretty(&report).context("failed to render view")?;
            println!("{}", output);
        }
    }

    Ok(())
}
