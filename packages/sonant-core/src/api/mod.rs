//! HTTP/WebSocket surface: application state, router and server entry.

pub mod http;
pub mod ws;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get};
use axum::Router;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::SharedConfig;
use crate::pool::{BufferPool, MemoryPressure};
use crate::quality::QualitySink;
use crate::rpc::RpcDriver;
use crate::session::registry::{CallRegistry, SessionRegistry};
use ws::UpgradeRateLimiter;

/// Errors from the server entrypoint.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind server port: {0}")]
    Bind(std::io::Error),
    #[error("Server terminated: {0}")]
    Serve(std::io::Error),
}

/// Registry of live WebSocket connections with force-close support.
///
/// Shutdown cancels every connection's token; the connection guard
/// unregisters on drop so the map never leaks entries.
pub struct WsConnectionManager {
    connections: DashMap<u64, CancellationToken>,
    next_id: AtomicU64,
}

impl WsConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers a connection, returning its guard.
    pub fn register(self: &Arc<Self>) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.connections.insert(id, token.clone());
        ConnectionGuard {
            id,
            token,
            manager: Arc::clone(self),
        }
    }

    /// Live connection count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Force-closes every connection.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().cancel();
        }
    }
}

/// RAII registration of one WebSocket connection.
pub struct ConnectionGuard {
    id: u64,
    token: CancellationToken,
    manager: Arc<WsConnectionManager>,
}

impl ConnectionGuard {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.connections.remove(&self.id);
    }
}

/// Shared application state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<SharedConfig>,
    pub registry: Arc<SessionRegistry>,
    pub calls: Arc<CallRegistry>,
    pub pool: Arc<BufferPool>,
    pub pressure: Arc<dyn MemoryPressure>,
    pub quality: Arc<dyn QualitySink>,
    pub driver: Arc<RpcDriver>,
    pub ws_manager: Arc<WsConnectionManager>,
    pub limiter: Arc<UpgradeRateLimiter>,
}

impl AppState {
    /// Wires the state from its already-constructed services.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<SharedConfig>,
        registry: Arc<SessionRegistry>,
        calls: Arc<CallRegistry>,
        pool: Arc<BufferPool>,
        pressure: Arc<dyn MemoryPressure>,
        quality: Arc<dyn QualitySink>,
        driver: Arc<RpcDriver>,
    ) -> Self {
        Self {
            config,
            registry,
            calls,
            pool,
            pressure,
            quality,
            driver,
            ws_manager: WsConnectionManager::new(),
            limiter: Arc::new(UpgradeRateLimiter::new()),
        }
    }
}

/// Builds the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/stats", get(http::stats))
        .route("/media-stream", any(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds the configured port and serves until the process stops.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let port = state.config.snapshot().server.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(ServerError::Bind)?;
    log::info!("[Server] Listening on {}", addr);

    let router = build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(ServerError::Serve)
}

/// Gracefully tears down the media plane: stops upgrades from mattering,
/// closes every session, then force-closes remaining sockets.
pub async fn shutdown(state: &AppState) {
    log::info!("[Server] Shutting down media plane");
    state.registry.shutdown();
    state.ws_manager.close_all();
    // Give socket loops a moment to observe their tokens.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_guard_unregisters_on_drop() {
        let manager = WsConnectionManager::new();
        let guard = manager.register();
        assert_eq!(manager.count(), 1);
        let id = guard.id();
        drop(guard);
        assert_eq!(manager.count(), 0);
        assert!(id >= 1);
    }

    #[test]
    fn close_all_cancels_tokens() {
        let manager = WsConnectionManager::new();
        let guard_a = manager.register();
        let guard_b = manager.register();
        manager.close_all();
        assert!(guard_a.cancel_token().is_cancelled());
        assert!(guard_b.cancel_token().is_cancelled());
    }
}
