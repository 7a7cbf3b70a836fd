//! Caller identity middleware.
//!
//! Authentication happens upstream; the gateway in front of this service
//! forwards the verified identity as `X-User-Email` and `X-User-Role`.
//! This layer parses those headers and injects a [`Caller`] into request
//! extensions for downstream handlers.

use std::str::FromStr;

use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::{Caller, USER_EMAIL_HEADER, USER_ROLE_HEADER};
use crate::models::enums::Role;
use crate::notification::service::is_valid_email;

/// Require caller identity headers. Missing or malformed → 401.
pub async fn require_caller(mut req: Request<axum::body::Body>, next: Next) -> Response {
    let caller = match caller_from_headers(req.headers()) {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };
    req.extensions_mut().insert(caller);
    next.run(req).await
}

fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let email = header(USER_EMAIL_HEADER).ok_or(ApiError::Unauthorized)?;
    if !is_valid_email(email) {
        return Err(ApiError::Unauthorized);
    }
    let role = header(USER_ROLE_HEADER)
        .and_then(|r| Role::from_str(&r.to_ascii_lowercase()).ok())
        .ok_or(ApiError::Unauthorized)?;

    Ok(Caller::new(email, role))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(email: Option<&str>, role: Option<&str>) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(e) = email {
            map.insert(USER_EMAIL_HEADER, HeaderValue::from_str(e).unwrap());
        }
        if let Some(r) = role {
            map.insert(USER_ROLE_HEADER, HeaderValue::from_str(r).unwrap());
        }
        map
    }

    #[test]
    fn parses_and_normalizes_caller() {
        let caller = caller_from_headers(&headers(Some("Doc@Hospital.org"), Some("Doctor"))).unwrap();
        assert_eq!(caller.email, "doc@hospital.org");
        assert_eq!(caller.role, Role::Doctor);
    }

    #[test]
    fn missing_headers_rejected() {
        assert!(caller_from_headers(&headers(None, Some("admin"))).is_err());
        assert!(caller_from_headers(&headers(Some("a@b.org"), None)).is_err());
    }

    #[test]
    fn unknown_role_rejected() {
        assert!(caller_from_headers(&headers(Some("a@b.org"), Some("janitor"))).is_err());
    }

    #[test]
    fn malformed_email_rejected() {
        assert!(caller_from_headers(&headers(Some("nobody"), Some("admin"))).is_err());
    }
}
