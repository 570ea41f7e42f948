use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::orchestrator::{Orchestrator, StatusSnapshot};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(CorsLayer::very_permissive())
        .with_state(AppState { orchestrator })
}

#[derive(Serialize)]
struct HealthResp {
    status: &'static str,
    accepting: bool,
    dedup_degraded: bool,
    unhealthy_sources: Vec<String>,
}

/// Liveness plus a coarse readiness verdict: 503 when the orchestrator is
/// not accepting or any source reports unhealthy.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResp>) {
    let snapshot = state.orchestrator.get_status().await;
    let unhealthy_sources: Vec<String> = snapshot
        .sources
        .iter()
        .filter(|s| !s.healthy)
        .map(|s| s.name.clone())
        .collect();

    let ok = snapshot.accepting && unhealthy_sources.is_empty();
    let resp = HealthResp {
        status: if ok { "ok" } else { "degraded" },
        accepting: snapshot.accepting,
        dedup_degraded: snapshot.dedup.degraded,
        unhealthy_sources,
    };
    let code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(resp))
}

async fn status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.orchestrator.get_status().await)
}
