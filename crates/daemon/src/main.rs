//! Webterm Daemon
//!
//! PTY session multiplexing service for remote terminal clients.

use std::path::PathBuf;

use clap::Parser;
use daemon::bridge::Bridge;
use daemon::config::Config;
use daemon::session::SessionManager;

/// Webterm daemon - serves PTY-backed shell sessions to remote clients.
#[derive(Parser, Debug)]
#[command(name = "webterm-daemon")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address, overriding the configuration
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply overrides: env first, then CLI flags on top
    config.apply_env_overrides();
    if let Some(listen) = cli.listen {
        config.network.listen_addr = listen;
    }

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.clone()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config.validate()?;

    tracing::info!(
        listen_addr = %config.network.listen_addr,
        mode = ?config.session.mode,
        shell = %config.session.shell,
        "Webterm daemon starting"
    );

    let manager = SessionManager::new(&config);

    let listener = tokio::net::TcpListener::bind(&config.network.listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Listening for clients");

    let accept_manager = manager.clone();
    let cancel = manager.cancelled();
    let accept_loop = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    tracing::info!(peer = %addr, "Client connected");

                    let session = match accept_manager.get_or_create(None).await {
                        Ok(session) => session,
                        Err(e) => {
                            tracing::error!(peer = %addr, error = %e, "No session for client");
                            continue;
                        }
                    };

                    tokio::spawn(async move {
                        match Bridge::new(session).run(stream).await {
                            Ok(exit) => {
                                tracing::info!(peer = %addr, exit = ?exit, "Client disconnected")
                            }
                            Err(e) => {
                                tracing::warn!(peer = %addr, error = %e, "Bridge failed to start")
                            }
                        }
                    });
                }
            }
        }
    });

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");

    manager.shutdown().await;
    let _ = accept_loop.await;

    tracing::info!("Webterm daemon stopped");
    Ok(())
}
