//! Access logging middleware.
//!
//! Logs every API request with caller, method, path, status and latency.
//! Runs innermost, after the identity layer has injected the `Caller`.

use std::time::Instant;

use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::api::types::Caller;
use crate::notification::service::mask_email;

pub async fn log_access(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let caller = req
        .extensions()
        .get::<Caller>()
        .map(|c| format!("{}:{}", c.role, mask_email(&c.email)))
        .unwrap_or_else(|| "anonymous".into());
    let started = Instant::now();

    let response = next.run(req).await;

    tracing::info!(
        target: "redflag_lib::api::access",
        %method,
        %path,
        %caller,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "API access"
    );
    response
}
