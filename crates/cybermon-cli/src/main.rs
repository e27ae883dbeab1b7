use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use cybermon_cli::{init_logging, setup_reload_signal, watch_reloads, Replay};
use cybermon_config::CybermonConfig;
use cybermon_lua::{CallbackDispatcher, SharedDispatcher};

#[derive(Parser)]
#[command(version = env!("VERSION_STRING"), about, long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "cybermon.toml")]
    config: PathBuf,

    /// JSON-lines event trace to replay (reads stdin if omitted)
    trace: Option<PathBuf>,

    /// Enables debug mode
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = CybermonConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let _guard = init_logging("replay", &config.logging, cli.debug)
        .context("Failed to initialise logging")?;

    info!("Starting cybermon-replay {}", env!("VERSION_STRING"));

    let dispatcher = CallbackDispatcher::from_config(&config.scripting)?;
    let shared = SharedDispatcher::new(dispatcher);

    if config.scripting.hot_reload {
        let signals = setup_reload_signal();
        tokio::spawn(watch_reloads(signals, shared.clone(), config.scripting.clone()));
    }

    let trace = cli.trace.clone();
    let stats = tokio::task::spawn_blocking(move || {
        let mut replay = Replay::new(shared);
        match trace {
            Some(path) => {
                let file = File::open(&path)
                    .with_context(|| format!("Failed to open trace {}", path.display()))?;
                replay.run(BufReader::new(file))
            }
            None => replay.run(io::stdin().lock()),
        }
    })
    .await??;

    println!("{}", stats);
    Ok(())
}
