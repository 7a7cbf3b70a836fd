use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::*;
use crate::intelligence::types::Finding;

/// Durable alert for one `(report_id, recipient_email)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub report_id: String,
    pub recipient_email: String,
    pub recipient_role: Role,
    pub sent_by: Option<String>,
    pub priority: Severity,
    pub status: NotificationStatus,
    pub categories: BTreeSet<String>,
    pub excerpt: String,
    /// Every finding the detector emitted for the report, negated ones included.
    pub findings: Vec<Finding>,
    pub corpus_version: String,
    pub email_subject: String,
    pub email_body_html: String,
    pub email_body_text: String,
    pub acknowledgment_note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub delivery_attempts: u32,
    pub attempt_limit: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub escalated_to: Option<String>,
    pub escalation_reason: Option<String>,
    pub suppressed_at: Option<DateTime<Utc>>,
    /// The owning report was deleted; this row is a tombstoned reference.
    pub report_deleted: bool,
}

/// Everything needed to create a notification row.
#[derive(Debug, Clone)]
pub struct NewNotification {
    pub report_id: String,
    pub recipient_email: String,
    pub recipient_role: Role,
    pub sent_by: Option<String>,
    pub priority: Severity,
    pub categories: BTreeSet<String>,
    pub excerpt: String,
    pub findings: Vec<Finding>,
    pub corpus_version: String,
    pub email_subject: String,
    pub email_body_html: String,
    pub email_body_text: String,
    pub attempt_limit: u32,
}

/// Minimal report row owned by the report-generation collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub accession: Option<String>,
    pub patient_name: Option<String>,
    pub author: Option<String>,
}

/// Which rows a caller may see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListScope {
    All,
    Recipient(String),
    Sender(String),
}

#[derive(Debug, Clone)]
pub struct NotificationFilter {
    pub scope: ListScope,
    pub status: Option<NotificationStatus>,
    pub priority: Option<Severity>,
    pub report_id: Option<String>,
    pub limit: u32,
}

impl NotificationFilter {
    pub fn new(scope: ListScope) -> Self {
        Self {
            scope,
            status: None,
            priority: None,
            report_id: None,
            limit: 50,
        }
    }
}

/// Counts by status for operational dashboards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: u64,
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub read: u64,
    pub acknowledged: u64,
    pub escalated: u64,
    pub unacknowledged: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: NotificationStatus, count: u64) {
        match status {
            NotificationStatus::Pending => self.pending += count,
            NotificationStatus::Sent => self.sent += count,
            NotificationStatus::Failed => self.failed += count,
            NotificationStatus::Read => self.read += count,
            NotificationStatus::Acknowledged => self.acknowledged += count,
            NotificationStatus::Escalated => self.escalated += count,
        }
        self.total += count;
        self.unacknowledged = self.total - self.acknowledged;
    }
}

/// One append-only lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub notification_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub from_status: Option<NotificationStatus>,
    pub to_status: Option<NotificationStatus>,
    pub detail: Option<String>,
}
