use anyhow::Result;
use clap::Parser;
use socksbridge::{
    Client, Config, Lifecycle, Role, Server,
    config::DEFAULT_CONFIG_PATH,
};
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "A SOCKS5 tunnel over TLS", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    // Initialize tracing subscriber
    let level = if args.debug || config.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    let lifecycle = Lifecycle::new();
    let grace = config.graceful_period();

    // SIGINT/SIGTERM start the drain
    let signals = lifecycle.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signals.signal_shutdown();
    });

    info!("starting {:?} role", config.role);
    let outcome = match config.role {
        Role::Server => Server::new(config, lifecycle.clone())?.run().await,
        Role::Client => Client::new(config, lifecycle.clone())?.run().await,
    };

    // A listener that failed to start never ran an accept loop
    if let Err(e) = outcome {
        lifecycle.report_fatal(e);
    }
    lifecycle.signal_shutdown();
    lifecycle.await_drain(grace).await;

    match lifecycle.take_fatal() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
