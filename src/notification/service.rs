//! Notification entry points: the report-generated hook and the
//! recipient/admin operations behind the HTTP API.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::composer::{compose, ReportContext};
use crate::config::AppConfig;
use crate::db::repository::{
    count_by_status, list_audit_for, list_notifications, mark_read, reject_pending,
    require_notification, retry_failed, save_report, suppress_notification, tombstone_report,
    upsert_notification, UpsertOutcome,
};
use crate::db::DatabaseError;
use crate::intelligence::{should_notify, Detector};
use crate::models::enums::{NotificationStatus, Role, Severity};
use crate::models::*;

/// Longest acknowledgment note accepted, in characters.
pub const MAX_NOTE_CHARS: usize = 2000;

/// Longest suppress reason accepted, in characters.
pub const MAX_REASON_CHARS: usize = 500;

/// Upper bound on a list page.
pub const MAX_LIST_LIMIT: u32 = 200;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

pub fn is_valid_email(address: &str) -> bool {
    EMAIL_RE.is_match(address)
}

/// `doctor@hospital.org` → `d***@hospital.org`, for logs.
pub fn mask_email(address: &str) -> String {
    match address.split_once('@') {
        Some((local, domain)) => {
            let first = local.chars().next().map(String::from).unwrap_or_default();
            format!("{first}***@{domain}")
        }
        None => "***".into(),
    }
}

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Notification not found: {0}")]
    NotFound(String),

    #[error("Not permitted: {0}")]
    Forbidden(String),

    #[error("Cannot move notification from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for LifecycleError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { id, .. } => LifecycleError::NotFound(id),
            DatabaseError::InvalidTransition { from, to } => {
                LifecycleError::InvalidTransition { from, to }
            }
            other => LifecycleError::Database(other),
        }
    }
}

impl From<rusqlite::Error> for LifecycleError {
    fn from(err: rusqlite::Error) -> Self {
        LifecycleError::Database(DatabaseError::Sqlite(err))
    }
}

// ═══════════════════════════════════════════
// Report-generated hook
// ═══════════════════════════════════════════

/// What the report-generation collaborator hands over once a report is saved.
#[derive(Debug, Clone)]
pub struct ReportGenerated {
    pub report_id: String,
    pub report_text: String,
    /// Clinical indication, scanned along with the report body.
    pub indication: Option<String>,
    pub recipient_email: String,
    pub recipient_role: Role,
    /// Address of the radiologist who produced the report.
    pub sent_by: Option<String>,
    pub metadata: ReportMetadata,
}

impl ReportGenerated {
    /// The text findings are detected in. Spans point into this string.
    pub fn scan_text(&self) -> String {
        match self.indication.as_deref().map(str::trim) {
            Some(indication) if !indication.is_empty() => {
                // Blank line so the indication never runs into the first sentence.
                format!("{indication}\n\n{}", self.report_text)
            }
            _ => self.report_text.clone(),
        }
    }
}

/// Result of the report-generated hook. Never an error: every failure is
/// folded into a variant and logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// Nothing matched. `degraded` means detection did not actually run.
    NoFindings { degraded: bool },
    /// Findings present but none qualify for an alert.
    BelowThreshold { findings: usize },
    Created { notification_id: Uuid, priority: Severity },
    Refreshed { notification_id: Uuid, priority: Severity },
    /// A row already exists past `pending`; left as is.
    AlreadyInFlight { notification_id: Uuid, status: NotificationStatus },
    /// Row created and immediately failed, e.g. undeliverable address.
    CreatedFailed { notification_id: Uuid, reason: String },
    Error { reason: String },
}

impl TriggerOutcome {
    /// A pending row was written that the delivery worker should pick up.
    pub fn has_new_work(&self) -> bool {
        matches!(self, Self::Created { .. } | Self::Refreshed { .. })
    }
}

/// Save the report row and, when the policy says so, its notification,
/// in one transaction.
pub fn save_report_with_alert(
    conn: &Connection,
    detector: &Detector,
    config: &AppConfig,
    event: &ReportGenerated,
    now: DateTime<Utc>,
) -> Result<TriggerOutcome, LifecycleError> {
    let text = event.scan_text();
    let detection = detector.detect(&text);
    let decision = should_notify(&detection.findings, &config.policy);

    let tx = conn.unchecked_transaction()?;
    save_report(&tx, &event.report_id, &event.metadata, now)?;

    let (Some(priority), Some(corpus_version)) = (decision.priority, detection.corpus_version.clone())
    else {
        tx.commit()?;
        return Ok(if detection.findings.is_empty() {
            if detection.degraded {
                tracing::warn!(report_id = %event.report_id, "Detection degraded, no alert evaluated");
            }
            TriggerOutcome::NoFindings { degraded: detection.degraded }
        } else {
            tracing::debug!(
                report_id = %event.report_id,
                findings = detection.findings.len(),
                "Findings below notification threshold"
            );
            TriggerOutcome::BelowThreshold { findings: detection.findings.len() }
        });
    };

    let message = match compose(
        &decision.reported,
        &ReportContext {
            report_id: &event.report_id,
            text: &text,
            metadata: &event.metadata,
            priority,
        },
    ) {
        Ok(message) => message,
        Err(e) => {
            // The report itself is still saved; only the alert is lost, loudly.
            tx.commit()?;
            tracing::error!(report_id = %event.report_id, error = %e, "Alert composition failed");
            return Ok(TriggerOutcome::Error { reason: e.to_string() });
        }
    };

    let recipient = event.recipient_email.trim().to_lowercase();
    let new = NewNotification {
        report_id: event.report_id.clone(),
        recipient_email: recipient.clone(),
        recipient_role: event.recipient_role,
        sent_by: event.sent_by.as_deref().map(|s| s.trim().to_lowercase()),
        priority,
        categories: message.categories,
        excerpt: message.excerpt,
        findings: detection.findings,
        corpus_version,
        email_subject: message.subject,
        email_body_html: message.body_html,
        email_body_text: message.body_text,
        attempt_limit: config.delivery.max_attempts.max(1),
    };

    let outcome = match upsert_notification(&tx, &new, now)? {
        UpsertOutcome::Created { id } if !is_valid_email(&recipient) => {
            let reason = format!("invalid recipient address {:?}", mask_email(&recipient));
            reject_pending(&tx, &id, &reason, now)?;
            tracing::error!(
                notification_id = %id,
                report_id = %event.report_id,
                recipient = %mask_email(&recipient),
                "Critical finding alert failed: invalid recipient address"
            );
            TriggerOutcome::CreatedFailed { notification_id: id, reason }
        }
        UpsertOutcome::Created { id } => {
            tracing::info!(
                notification_id = %id,
                report_id = %event.report_id,
                priority = %priority,
                recipient = %mask_email(&recipient),
                "Critical finding notification created"
            );
            TriggerOutcome::Created { notification_id: id, priority }
        }
        UpsertOutcome::Refreshed { id } => {
            tracing::info!(notification_id = %id, report_id = %event.report_id, "Pending notification refreshed");
            TriggerOutcome::Refreshed { notification_id: id, priority }
        }
        UpsertOutcome::Unchanged { id, status } => {
            tracing::debug!(notification_id = %id, %status, "Notification already past pending, left untouched");
            TriggerOutcome::AlreadyInFlight { notification_id: id, status }
        }
    };

    tx.commit()?;
    Ok(outcome)
}

/// Fire-and-forget hook for the report-generation pipeline. Never fails
/// the caller.
pub fn on_report_generated(
    conn: &Connection,
    detector: &Detector,
    config: &AppConfig,
    event: &ReportGenerated,
    now: DateTime<Utc>,
) -> TriggerOutcome {
    match save_report_with_alert(conn, detector, config, event, now) {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(
                report_id = %event.report_id,
                error = %e,
                "Report-generated hook failed, no notification created"
            );
            TriggerOutcome::Error { reason: e.to_string() }
        }
    }
}

// ═══════════════════════════════════════════
// Recipient and admin operations
// ═══════════════════════════════════════════

/// Authenticated caller, as supplied by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub email: String,
    pub role: Role,
}

impl Caller {
    pub fn new(email: &str, role: Role) -> Self {
        Self {
            email: email.trim().to_lowercase(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    fn is_recipient(&self, n: &Notification) -> bool {
        n.recipient_email.eq_ignore_ascii_case(&self.email)
    }

    fn is_sender(&self, n: &Notification) -> bool {
        n.sent_by
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(&self.email))
    }

    /// Rows this caller may list.
    pub fn scope(&self) -> ListScope {
        match self.role {
            Role::Admin => ListScope::All,
            Role::Radiologist => ListScope::Sender(self.email.clone()),
            Role::Doctor => ListScope::Recipient(self.email.clone()),
        }
    }
}

fn require_admin(caller: &Caller, action: &str) -> Result<(), LifecycleError> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(LifecycleError::Forbidden(format!("{action} requires the admin role")))
    }
}

/// Optional list filters from the caller; scope comes from the role.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub status: Option<NotificationStatus>,
    pub priority: Option<Severity>,
    pub report_id: Option<String>,
    pub limit: Option<u32>,
}

pub fn list_for(
    conn: &Connection,
    caller: &Caller,
    query: ListQuery,
) -> Result<Vec<Notification>, LifecycleError> {
    let mut filter = NotificationFilter::new(caller.scope());
    filter.status = query.status;
    filter.priority = query.priority;
    filter.report_id = query.report_id;
    if let Some(limit) = query.limit {
        if limit == 0 || limit > MAX_LIST_LIMIT {
            return Err(LifecycleError::Validation(format!(
                "limit must be between 1 and {MAX_LIST_LIMIT}"
            )));
        }
        filter.limit = limit;
    }
    Ok(list_notifications(conn, &filter)?)
}

/// Fetch one notification. The recipient's first view of a `sent` row
/// marks it read; later views change nothing.
pub fn view(
    conn: &Connection,
    caller: &Caller,
    id: &Uuid,
    now: DateTime<Utc>,
) -> Result<Notification, LifecycleError> {
    let notification = require_notification(conn, id)?;
    let recipient = caller.is_recipient(&notification);
    if !(recipient || caller.is_admin() || caller.is_sender(&notification)) {
        return Err(LifecycleError::Forbidden(
            "only the recipient, the sender or an admin may view this notification".into(),
        ));
    }

    if recipient && notification.status == NotificationStatus::Sent {
        if mark_read(conn, id, &caller.email, now)? {
            tracing::info!(notification_id = %id, "Notification read by recipient");
        }
        return Ok(require_notification(conn, id)?);
    }
    Ok(notification)
}

/// Recipient-only: sent|read → acknowledged.
pub fn acknowledge(
    conn: &Connection,
    caller: &Caller,
    id: &Uuid,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Notification, LifecycleError> {
    let note = note.map(str::trim).filter(|n| !n.is_empty());
    if let Some(note) = note {
        if note.chars().count() > MAX_NOTE_CHARS {
            return Err(LifecycleError::Validation(format!(
                "note exceeds {MAX_NOTE_CHARS} characters"
            )));
        }
    }

    let current = require_notification(conn, id)?;
    if !caller.is_recipient(&current) {
        return Err(LifecycleError::Forbidden(
            "only the recipient may acknowledge".into(),
        ));
    }

    let updated = crate::db::repository::acknowledge_notification(conn, id, &caller.email, note, now)?;
    tracing::info!(notification_id = %id, report_id = %updated.report_id, "Notification acknowledged");
    Ok(updated)
}

/// Counts by status. Admins see everything.
pub fn stats(conn: &Connection, caller: &Caller) -> Result<StatusCounts, LifecycleError> {
    require_admin(caller, "stats")?;
    Ok(count_by_status(conn, &ListScope::All)?)
}

/// Admin: failed → pending with `extra_attempts` more delivery attempts.
pub fn retry(
    conn: &Connection,
    caller: &Caller,
    id: &Uuid,
    extra_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Notification, LifecycleError> {
    require_admin(caller, "retry")?;
    let updated = retry_failed(conn, id, &caller.email, extra_attempts, now)?;
    tracing::info!(notification_id = %id, attempt_limit = updated.attempt_limit, "Manual retry queued");
    Ok(updated)
}

/// Admin: stop delivery of a pending row, or mark a failed one as
/// deliberately abandoned. Audited, never deleted.
pub fn suppress(
    conn: &Connection,
    caller: &Caller,
    id: &Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Notification, LifecycleError> {
    require_admin(caller, "suppress")?;
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(LifecycleError::Validation("a suppress reason is required".into()));
    }
    if reason.chars().count() > MAX_REASON_CHARS {
        return Err(LifecycleError::Validation(format!(
            "reason exceeds {MAX_REASON_CHARS} characters"
        )));
    }
    let updated = suppress_notification(conn, id, &caller.email, reason, now)?;
    tracing::warn!(notification_id = %id, report_id = %updated.report_id, "Notification suppressed by admin");
    Ok(updated)
}

pub fn audit_trail(
    conn: &Connection,
    caller: &Caller,
    id: &Uuid,
) -> Result<Vec<AuditEntry>, LifecycleError> {
    require_admin(caller, "audit trail")?;
    require_notification(conn, id)?;
    Ok(list_audit_for(conn, id)?)
}

/// Admin: tombstone a report. Its notifications stay queryable.
pub fn delete_report(
    conn: &Connection,
    caller: &Caller,
    report_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, LifecycleError> {
    require_admin(caller, "report deletion")?;
    let affected = tombstone_report(conn, report_id, Some(&caller.email), now)?;
    tracing::info!(report_id, affected, "Report tombstoned");
    Ok(affected)
}
