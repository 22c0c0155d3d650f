//! HTTP server.
//!
//! Binds the assembled router and serves it until a shutdown signal. Client
//! addresses are exposed to the request lifecycle through `ConnectInfo`.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use liftoff_common::ServerSettings;

/// Server errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The bind address could not be parsed.
    #[error("Invalid bind address '{addr}': {reason}")]
    InvalidAddress {
        /// The rejected address.
        addr: String,
        /// Parse failure description.
        reason: String,
    },

    /// The listener could not be bound.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The server stopped with an I/O error.
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Listener settings taken from the `server.*` section.
///
/// The request timeout is not here: the request lifecycle enforces it.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
}

impl ServerConfig {
    /// Build from the `server.*` settings section.
    ///
    /// # Errors
    ///
    /// Returns an error if `bind_addr` is not a socket address.
    pub fn from_settings(settings: &ServerSettings) -> Result<Self, ServerError> {
        let bind_addr =
            settings
                .bind_addr
                .parse()
                .map_err(|e: std::net::AddrParseError| ServerError::InvalidAddress {
                    addr: settings.bind_addr.clone(),
                    reason: e.to_string(),
                })?;

        Ok(Self {
            bind_addr,
            graceful_shutdown: settings.graceful_shutdown,
        })
    }
}

/// Serve `router` until shutdown.
///
/// Returns once the listener has stopped and in-flight requests completed.
///
/// # Errors
///
/// Returns an error if the server cannot bind to the address.
pub async fn serve(router: Router, config: &ServerConfig) -> Result<(), ServerError> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: config.bind_addr,
            source,
        })?;

    info!(addr = %config.bind_addr, "Starting HTTP server");

    if config.graceful_shutdown {
        serve_listener(listener, router, shutdown_signal()).await?;
    } else {
        serve_listener(listener, router, std::future::pending()).await?;
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn serve_listener<S>(listener: TcpListener, router: Router, shutdown: S) -> std::io::Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let service = router.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
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
                warn!(error = %e, "SIGTERM handler unavailable");
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
}
