//! Small HTTP diagnostics surface, served on `pprofPort` when configured.
//!
//! Operators point monitoring at `/health` and `/stats`; neither endpoint
//! is reachable unless the port is explicitly enabled.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::registry::HubRegistry;

#[derive(Clone)]
pub struct DiagState {
    pub registry: Arc<HubRegistry>,
    pub started_at: Instant,
}

pub fn build_router(state: DiagState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct StatsResponse {
    online_callees: i64,
    online_callers: i64,
    active_calls: i64,
    active_pure_p2p_calls: i64,
    calls_today: i64,
    call_seconds_today: i64,
    pending_attach_tickets: usize,
    uptime_secs: u64,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn stats(State(state): State<DiagState>) -> Json<StatsResponse> {
    let (online_callees, online_callers) = state.registry.online_callee_count(true).await;
    let (_, active_calls, active_pure_p2p_calls) = state.registry.call_stats().await;
    let today = state.registry.services().ledger.today_snapshot();

    Json(StatsResponse {
        online_callees,
        online_callers,
        active_calls,
        active_pure_p2p_calls,
        calls_today: today.calls_today,
        call_seconds_today: today.call_secs_today,
        pending_attach_tickets: state.registry.pending_ticket_count().await,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

pub async fn serve(registry: Arc<HubRegistry>, port: u16) -> anyhow::Result<()> {
    let state = DiagState {
        registry,
        started_at: Instant::now(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "diagnostics endpoint running");
    axum::serve(listener, app).await?;
    Ok(())
}
