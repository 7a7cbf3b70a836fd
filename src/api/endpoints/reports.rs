//! Report-generation hook over HTTP.
//!
//! `POST /reports/generated`: the report-generation collaborator announces a
//! saved report. Detection and row creation run before the response; the
//! email goes out from the background worker.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Extension;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, Caller};
use crate::models::enums::Role;
use crate::models::ReportMetadata;
use crate::notification::service::delete_report;
use crate::notification::{ReportGenerated, TriggerOutcome};

#[derive(Debug, Deserialize)]
pub struct ReportGeneratedRequest {
    pub report_id: String,
    pub report_text: String,
    #[serde(default)]
    pub indication: Option<String>,
    pub recipient_email: String,
    #[serde(default = "default_recipient_role")]
    pub recipient_role: Role,
    #[serde(default)]
    pub accession: Option<String>,
    #[serde(default)]
    pub patient_name: Option<String>,
}

fn default_recipient_role() -> Role {
    Role::Doctor
}

/// `POST /reports/generated`: radiologist or admin. Always 202 once the
/// request is well-formed; the body says what happened.
pub async fn generated(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<ReportGeneratedRequest>,
) -> Result<(StatusCode, Json<TriggerOutcome>), ApiError> {
    if !matches!(caller.role, Role::Radiologist | Role::Admin) {
        return Err(ApiError::Forbidden(
            "only radiologists and admins may submit reports".into(),
        ));
    }
    if body.report_id.trim().is_empty() {
        return Err(ApiError::BadRequest("report_id is required".into()));
    }
    if body.report_text.trim().is_empty() {
        return Err(ApiError::BadRequest("report_text is required".into()));
    }

    let event = ReportGenerated {
        report_id: body.report_id.trim().to_string(),
        report_text: body.report_text,
        indication: body.indication,
        recipient_email: body.recipient_email,
        recipient_role: body.recipient_role,
        sent_by: Some(caller.email.clone()),
        metadata: ReportMetadata {
            accession: body.accession,
            patient_name: body.patient_name,
            author: Some(caller.email),
        },
    };

    let outcome = ctx.core.report_generated(&event);
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

#[derive(Serialize)]
pub struct DeleteReportResponse {
    pub report_id: String,
    pub notifications_tombstoned: usize,
}

/// `DELETE /reports/:id`: admin. Tombstones the report; notifications stay.
pub async fn delete(
    State(ctx): State<ApiContext>,
    Extension(caller): Extension<Caller>,
    Path(report_id): Path<String>,
) -> Result<Json<DeleteReportResponse>, ApiError> {
    let conn = ctx.core.db()?;
    let notifications_tombstoned = delete_report(&conn, &caller, &report_id, chrono::Utc::now())?;
    Ok(Json(DeleteReportResponse {
        report_id,
        notifications_tombstoned,
    }))
}
