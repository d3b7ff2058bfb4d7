mod config;
mod error;
mod event;
mod fanout;
mod filter;
mod frame;
mod ingester;
mod logging;
mod msg;
mod relay;
mod storage;
mod ws;

use clap::Parser;
use tracing::info;

use config::Config;
use relay::Relay;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "tandem", author, version, about = "Nostr relay")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "tandem.toml")]
    config: String,
}

/// Load configuration, wire the relay and serve until interrupted.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Config::load(&cli.config)?;
    match logging::init(&cfg.log) {
        Ok(()) => {}
        // a second install keeps the first subscriber
        Err(logging::LoggingError::Init(_)) => {}
        Err(err) => return Err(err.into()),
    }
    let relay = Relay::bind(&cfg).await?;
    info!(addr = %relay.local_addr(), "relay ready");
    relay
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run(Cli::parse()).await
}
