//! HTTP server

mod router;

pub use router::{AppState, GasQuery, create_router};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::Config;
use crate::failsafe::RateLimiter;
use crate::feeds::Aggregator;
use crate::{Error, Result};

/// How often expired snapshots are swept from the feed caches
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Feed aggregator server
pub struct Server {
    config: Config,
    aggregator: Arc<Aggregator>,
}

impl Server {
    /// Build feeds from configuration
    pub fn new(config: Config) -> Result<Self> {
        let aggregator = Arc::new(Aggregator::from_config(&config)?);
        Ok(Self { config, aggregator })
    }

    /// Router over this server's feeds, without binding a socket
    #[must_use]
    pub fn router(&self) -> axum::Router {
        create_router(Arc::new(AppState {
            aggregator: Arc::clone(&self.aggregator),
            rate_limiter: Arc::new(RateLimiter::new(&self.config.rate_limit)),
            request_timeout: self.config.server.request_timeout,
        }))
    }

    /// Serve until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("FEED AGGREGATOR v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(networks = ?self.aggregator.gas.networks(), "Gas networks");
        if self.config.rate_limit.enabled {
            info!(
                rps = self.config.rate_limit.requests_per_second,
                burst = self.config.rate_limit.burst_size,
                "Inbound rate limit enabled"
            );
        }
        info!("Endpoints:");
        for path in [
            "/health",
            "/api/v2/gas?network=all",
            "/api/v2/liquidations",
            "/api/v2/whales",
            "/api/v2/block-height",
            "/api/v2/providers",
        ] {
            info!("  GET http://{}{path}", addr);
        }
        info!("============================================================");

        // Bound how long expired snapshots are kept for stale serving
        let aggregator = Arc::clone(&self.aggregator);
        let retention = self.config.server.stale_retention;
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(EVICTION_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => aggregator.evict_stale(retention),
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}

/// Resolves on Ctrl+C or SIGTERM, then notifies background tasks
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
