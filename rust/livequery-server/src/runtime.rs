use crate::auth::PrincipalResolver;
use crate::config::ServerConfig;
use crate::engine::LiveQueryEngine;
use crate::http::{HttpServer, HttpState};
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Wait for shutdown signal (SIGINT on all platforms, SIGTERM on Unix)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

/// Runtime orchestrator: HTTP/SSE server plus the idle-subscription sweeper
pub struct Runtime {
    config: ServerConfig,
    engine: LiveQueryEngine,
    resolver: Arc<dyn PrincipalResolver>,
    shutdown: CancellationToken,
}

impl Runtime {
    pub fn new(
        config: ServerConfig,
        engine: LiveQueryEngine,
        resolver: Arc<dyn PrincipalResolver>,
    ) -> Self {
        Self {
            config,
            engine,
            resolver,
            shutdown: CancellationToken::new(),
        }
    }

    /// The running engine, for publishing to channels and reporting mutations
    pub fn engine(&self) -> &LiveQueryEngine {
        &self.engine
    }

    /// Token that stops [`Runtime::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        info!("Starting live query runtime");
        let stream = &self.config.stream;

        let sweeper_handle = self.engine.spawn_sweeper(
            stream.subscription_ttl,
            stream.sweep_interval,
            self.shutdown.clone(),
        );

        let http_server = HttpServer::new(
            stream.bind_address,
            HttpState {
                engine: self.engine.clone(),
                resolver: self.resolver.clone(),
                base_path: stream.base_path.clone(),
            },
        );
        let http_shutdown = self.shutdown.clone();
        let mut http_handle = tokio::spawn(async move { http_server.start(http_shutdown).await });

        info!("Live query runtime is running. Press Ctrl+C to stop.");

        tokio::select! {
            result = &mut http_handle => {
                match result {
                    Ok(Ok(())) => info!("HTTP server task completed"),
                    Ok(Err(e)) => error!("HTTP server error: {}", e),
                    Err(e) => error!("HTTP server task panicked: {}", e),
                }
            }
            _ = self.shutdown.cancelled() => {}
            _ = shutdown_signal() => {}
        }

        info!("Shutting down live query runtime");
        self.shutdown.cancel();

        let connections = self.engine.connections();
        let open: Vec<String> = connections.ids();
        for id in &open {
            connections.close(id);
        }
        if !open.is_empty() {
            info!("Closed {} open connection(s)", open.len());
        }

        let _ = sweeper_handle.await;
        if !http_handle.is_finished() {
            http_handle.abort();
        }
        Ok(())
    }
}
