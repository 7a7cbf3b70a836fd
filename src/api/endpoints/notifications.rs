//! Notification endpoints: recipient views, acknowledgment, admin operations.
//!
//! Every handler resolves the caller from request extensions and delegates
//! to `notification::service`, which owns role checks and transitions.

use std::str::FromStr;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::Extension;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, Caller};
use crate::models::enums::{NotificationStatus, Role, Severity};
use crate::models::{AuditEntry, Notification, StatusCounts};
use crate::notification::service::{self, ListQuery};

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid notification id: {raw}")))
}

// ═══════════════════════════════════════════
// List
// ═══════════════════════════════════════════

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub priority: Option<String>,
    pub report_id: Option<String>,
    pub limit: Option<u32>,
}

impl ListParams {
    fn into_query(self) -> Result<ListQuery, ApiError> {
        let status = self
            .status
            .map(|s| NotificationStatus::from_str(&s))
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        let priority = self
            .priority
            .map(|p| Severity::from_str(&p))
            .transpose()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        Ok(ListQuery {
            status,
            priority,
            report_id: self.report_id.filter(|r| !r.trim().is_empty()),
            limit: self.limit,
        })
    }
}

/// List row without the email bodies.
#[derive(Debug, Serialize)]
pub struct NotificationSummary {
    pub id: Uuid,
    pub report_id: String,
    pub recipient_email: String,
    pub recipient_role: Role,
    pub sent_by: Option<String>,
    pub priority: Severity,
    pub status: NotificationStatus,
    pub categories: Vec<String>,
    pub excerpt: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub delivery_attempts: u32,
    pub last_error: Option<String>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub report_deleted: bool,
}

impl From<Notification> for NotificationSummary {
    fn from(n: Notification) -> Self {
        Self {
            id: n.id,
            report_id: n.report_id,
            recipient_email: n.recipient_email,
            recipient_role: n.recipient_role,
            sent_by: n.sent_by,
            priority: n.priority,
            status: n.status,
            categories: n.categories.into_iter().collect(),
            excerpt: n.excerpt,
            created_at: n.created_at,
            sent_at: n.sent_at,
            read_at: n.read_at,
            acknowledged_at: n.acknowledged_at,
            delivery_attempts: n.delivery_attempts,
            last_error: n.last_error,
            escalated_at: n.escalated_at,
            report_deleted: n.report_deleted,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub notifications: Vec<NotificationSummary>,
    pub count: usize,
}

/// `GET /notifications`: rows visible to the caller, newest first.
pub async fn list(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let query = params.into_query()?;
    let conn = ctx.core.db()?;
    let notifications: Vec<NotificationSummary> = service::list_for(&conn, &caller, query)?
        .into_iter()
        .map(NotificationSummary::from)
        .collect();

    Ok(Json(ListResponse {
        count: notifications.len(),
        notifications,
    }))
}

// ═══════════════════════════════════════════
// Detail + acknowledge
// ═══════════════════════════════════════════

/// `GET /notifications/:id`: full row. The recipient's first view marks it read.
pub async fn detail(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Notification>, ApiError> {
    let id = parse_id(&id)?;
    let conn = ctx.core.db()?;
    let notification = service::view(&conn, &caller, &id, Utc::now())?;
    Ok(Json(notification))
}

#[derive(Debug, Default, Deserialize)]
pub struct AcknowledgeRequest {
    #[serde(default)]
    pub note: Option<String>,
}

/// `POST /notifications/:id/acknowledge`: recipient only. The body is
/// optional; an empty body acknowledges without a note.
pub async fn acknowledge(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Notification>, ApiError> {
    let id = parse_id(&id)?;
    let request: AcknowledgeRequest = optional_json(&body)?;
    let conn = ctx.core.db()?;
    let updated = service::acknowledge(&conn, &caller, &id, request.note.as_deref(), Utc::now())?;
    Ok(Json(updated))
}

fn optional_json<T: for<'de> Deserialize<'de> + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

// ═══════════════════════════════════════════
// Admin operations
// ═══════════════════════════════════════════

/// `GET /notifications/stats/summary`: admin.
pub async fn stats(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<StatusCounts>, ApiError> {
    let conn = ctx.core.db()?;
    Ok(Json(service::stats(&conn, &caller)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct RetryRequest {
    #[serde(default)]
    pub extra_attempts: Option<u32>,
}

/// `POST /notifications/:id/retry`: admin, failed → pending.
pub async fn retry(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Notification>, ApiError> {
    let id = parse_id(&id)?;
    let request: RetryRequest = optional_json(&body)?;
    let max = ctx.core.config.delivery.max_attempts;
    let extra = request.extra_attempts.unwrap_or(max);
    if !(1..=max).contains(&extra) {
        return Err(ApiError::BadRequest(format!(
            "extra_attempts must be in [1, {max}], got {extra}"
        )));
    }

    let updated = {
        let conn = ctx.core.db()?;
        service::retry(&conn, &caller, &id, extra, Utc::now())?
    };
    ctx.core.wake_delivery();
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct SuppressRequest {
    pub reason: String,
}

/// `POST /notifications/:id/suppress`: admin.
pub async fn suppress(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<SuppressRequest>,
) -> Result<Json<Notification>, ApiError> {
    let id = parse_id(&id)?;
    let conn = ctx.core.db()?;
    let updated = service::suppress(&conn, &caller, &id, &body.reason, Utc::now())?;
    Ok(Json(updated))
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub notification_id: Uuid,
    pub entries: Vec<AuditEntry>,
}

/// `GET /notifications/:id/audit`: admin.
pub async fn audit(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<AuditResponse>, ApiError> {
    let id = parse_id(&id)?;
    let conn = ctx.core.db()?;
    let entries = service::audit_trail(&conn, &caller, &id)?;
    Ok(Json(AuditResponse {
        notification_id: id,
        entries,
    }))
}
