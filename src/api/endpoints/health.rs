//! Liveness endpoint.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::types::ApiContext;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub corpus_version: Option<String>,
    /// True when no keyword corpus loaded; detection finds nothing.
    pub degraded: bool,
    pub delivery_enabled: bool,
    pub gateway: String,
}

/// `GET /health`: no identity required.
pub async fn check(State(ctx): State<ApiContext>) -> Json<HealthResponse> {
    let detector = ctx.core.detector();
    Json(HealthResponse {
        status: if detector.is_degraded() { "degraded" } else { "ok" },
        version: crate::config::APP_VERSION,
        corpus_version: detector.active_version().map(str::to_string),
        degraded: detector.is_degraded(),
        delivery_enabled: ctx.core.config.delivery.enabled,
        gateway: ctx.core.gateway().name().to_string(),
    })
}
