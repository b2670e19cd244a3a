//! Local REST endpoints.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::environments::LOCAL_ENVIRONMENT_ID;
use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, and tunnel counts. No authentication
/// required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let connected = state.registry.all().await.len();
    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "environments": state.environments.len(),
        "connected_agents": connected,
    }))
}

/// `GET /api/environments` — configured environments plus the built-in
/// local one, with live tunnel status for edge environments.
pub async fn list_environments(State(state): State<AppState>) -> Json<Value> {
    let mut environments = vec![json!({
        "id": LOCAL_ENVIRONMENT_ID,
        "name": "local",
        "mode": "local",
        "enabled": true,
        "connected": true,
    })];
    for env in state.environments.all() {
        let connected = if env.is_edge() {
            state.registry.lookup(&env.id).await.is_some()
        } else {
            // Direct environments have no standing connection to report on.
            true
        };
        environments.push(json!({
            "id": env.id,
            "name": env.name,
            "mode": if env.is_edge() { "edge" } else { "direct" },
            "enabled": env.enabled,
            "connected": connected,
        }));
    }
    Json(json!({ "environments": environments }))
}
