//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to services for state.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

use crate::api::AppState;
use crate::pool::PoolStats;
use crate::protocol_constants::SERVICE_ID;

/// Health report for load balancers and the carrier webhook host.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    service: &'static str,
    version: &'static str,
    status: &'static str,
    sessions: usize,
    active_sessions: usize,
    connections: usize,
    memory_pressure: f64,
    pool: PoolStats,
}

/// `GET /health`
///
/// Reports `degraded` when the registry exceeds the configured stream
/// cap or memory pressure is critical.
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let config = state.config.snapshot();
    let sessions = state.registry.len();
    let pressure = state.pressure.pressure();

    let degraded = sessions > config.server.max_concurrent_streams
        || pressure >= config.buffer_pool.memory_pressure_threshold;

    Json(HealthReport {
        service: SERVICE_ID,
        version: env!("CARGO_PKG_VERSION"),
        status: if degraded { "degraded" } else { "ok" },
        sessions,
        active_sessions: state.registry.list_active().len(),
        connections: state.ws_manager.count(),
        memory_pressure: pressure,
        pool: state.pool.stats(),
    })
}

/// `GET /stats`
///
/// Per-session activity plus pool counters.
pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    let sessions: Vec<Value> = state
        .registry
        .list_active()
        .into_iter()
        .filter_map(|id| state.registry.get(&id))
        .map(|session| {
            json!({
                "id": session.id(),
                "active": session.is_active(),
                "queueLen": session.queue_len(),
                "droppedEvents": session.dropped_events(),
                "waitingForResponse": session.is_waiting_for_response(),
                "idleMs": session.idle_for().as_millis() as u64,
            })
        })
        .collect();

    Json(json!({
        "sessions": sessions,
        "pool": state.pool.stats(),
        "connections": state.ws_manager.count(),
    }))
}
