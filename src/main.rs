//! Poller binary.
//!
//! Loads configuration from `KPT_*` environment variables, bridges the
//! out-of-process challenge solver through its credential file, and runs
//! the pipeline until SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kpt_poller::{Config, FileProvider, Poller};

/// Default location of the solver-maintained credential file.
const DEFAULT_CREDENTIALS_FILE: &str = "./credentials.json";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "poller exited with error");
        std::process::exit(1);
    }
}

async fn run() -> kpt_poller::Result<()> {
    let config = Config::from_env();
    let credentials_file = std::env::var("KPT_CREDENTIALS_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CREDENTIALS_FILE));

    info!(
        credentials_file = %credentials_file.display(),
        output_dir = %config.output_dir.display(),
        "kpt-poller starting"
    );

    let provider = Arc::new(FileProvider::new(credentials_file));
    let poller = Poller::new(config, provider)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received, shutting down");
        shutdown_tx.send_replace(true);
    });

    poller.run(shutdown_rx).await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
