use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info};

use tunnelmux::{listener, logging, Config};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = listener::run(config) => {
            if let Err(e) = result {
                error!(error = %e, "listener exited");
                return ExitCode::FAILURE;
            }
        }
        _ = terminate() => {
            info!("received shutdown signal, exiting");
        }
    }

    ExitCode::SUCCESS
}

/// Resolves once on Ctrl-C, and on Unix also on `SIGTERM` so the process
/// shuts down cleanly under a process supervisor as well as interactively.
async fn terminate() {
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
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
