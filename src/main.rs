use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ratewatch::app::App;
use ratewatch::config::RatewatchConfig;
use ratewatch::http::HttpServer;
use ratewatch::lifetime::Lifetime;

/// Counts requests over a trailing window and rate limits clients.
#[derive(Debug, Parser)]
#[command(name = "ratewatch", version, about)]
struct Cli {
    /// YAML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Port on which to start the server
    #[arg(long)]
    port: Option<u16>,

    /// Directory where state snapshots are read and written
    #[arg(long)]
    persistence: Option<PathBuf>,

    /// Requests allowed per client and window (0 disables limiting)
    #[arg(long)]
    limit: Option<i64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<RatewatchConfig> {
        let mut config = match &self.config {
            Some(path) => RatewatchConfig::from_file(path)?,
            None => RatewatchConfig::default(),
        };

        if let Some(port) = self.port {
            config.server.listen_addr.set_port(port);
        }
        if let Some(dir) = &self.persistence {
            config.persistence.dir = Some(dir.clone());
        }
        if let Some(limit) = self.limit {
            config.limiter.limit = limit;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Starting Ratewatch");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = cli.load_config()?;
    info!(
        listen_addr = %config.server.listen_addr,
        persistence = ?config.persistence.dir,
        limit = config.limiter.limit,
        "Configuration loaded"
    );

    let lifetime = Lifetime::new();
    let app = match App::start(&config, &lifetime).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Failed to start");
            lifetime.shutdown().await;
            return Err(e.into());
        }
    };

    let server = HttpServer::new(config.server.listen_addr, app.state());

    // Stop on Ctrl+C / SIGTERM, or when a background task gives up.
    let stop = lifetime.clone();
    let served = server
        .serve_with_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = stop.cancelled() => {
                    error!("Background task stopped, initiating shutdown");
                }
            }
        })
        .await;

    let failed = lifetime.is_cancelled();
    lifetime.shutdown().await;
    served?;

    if failed {
        anyhow::bail!("stopped after a background task failure");
    }

    info!("Ratewatch stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
