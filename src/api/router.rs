//! HTTP router.
//!
//! Returns a composable `Router` that can be mounted on any axum server.
//!
//! Middleware stack (outermost → innermost):
//! 1. CORS + `Cache-Control: no-store` → 2. Caller identity → 3. Access log

use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::api::endpoints;
use crate::api::middleware;
use crate::api::types::ApiContext;
use crate::core_state::CoreState;

/// Build the alerting API router.
///
/// Everything except `/health` requires caller identity headers.
/// Endpoint handlers use `State<ApiContext>` (provided via `with_state`).
pub fn api_router(core: Arc<CoreState>) -> Router {
    let ctx = ApiContext::new(core);

    // Layers are applied from bottom (innermost) to top (outermost).
    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    // `/notifications/stats/summary` is static and wins over `/:id/audit`.
    let protected = Router::new()
        .route("/notifications", get(endpoints::notifications::list))
        .route(
            "/notifications/stats/summary",
            get(endpoints::notifications::stats),
        )
        .route("/notifications/:id", get(endpoints::notifications::detail))
        .route(
            "/notifications/:id/acknowledge",
            post(endpoints::notifications::acknowledge),
        )
        .route(
            "/notifications/:id/retry",
            post(endpoints::notifications::retry),
        )
        .route(
            "/notifications/:id/suppress",
            post(endpoints::notifications::suppress),
        )
        .route(
            "/notifications/:id/audit",
            get(endpoints::notifications::audit),
        )
        .route("/reports/generated", post(endpoints::reports::generated))
        .route("/reports/:id", delete(endpoints::reports::delete))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(middleware::audit::log_access))
        .layer(axum::middleware::from_fn(middleware::auth::require_caller));

    let unprotected = Router::new()
        .route("/health", get(endpoints::health::check))
        .with_state(ctx);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .merge(protected)
        .merge(unprotected)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(cors)
}
