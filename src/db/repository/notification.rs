use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{
    append_audit, fmt_ts, parse_opt_ts, parse_ts, stamp_after, NewAuditEntry, ESCALATION_ACTOR,
    SYSTEM_ACTOR, WORKER_ACTOR,
};
use crate::db::DatabaseError;
use crate::intelligence::types::Finding;
use crate::models::enums::*;
use crate::models::*;
use crate::notification::lifecycle::ensure_transition;

const SELECT_NOTIFICATION: &str = "SELECT n.id, n.report_id, n.recipient_email, n.recipient_role,
        n.sent_by, n.priority, n.status, n.categories, n.excerpt, n.findings_json,
        n.corpus_version, n.email_subject, n.email_body_html, n.email_body_text,
        n.acknowledgment_note, n.created_at, n.updated_at, n.sent_at, n.read_at,
        n.acknowledged_at, n.delivery_attempts, n.attempt_limit, n.last_error,
        n.next_attempt_at, n.escalated_at, n.escalated_to, n.escalation_reason,
        n.suppressed_at, r.deleted_at IS NOT NULL
    FROM notifications n JOIN reports r ON r.id = n.report_id";

/// Result of creating or re-triggering the notification for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created { id: Uuid },
    /// Still pending: content replaced with the re-run's.
    Refreshed { id: Uuid },
    /// Past pending: left untouched.
    Unchanged { id: Uuid, status: NotificationStatus },
}

impl UpsertOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Created { id } | Self::Refreshed { id } | Self::Unchanged { id, .. } => *id,
        }
    }
}

/// A pending row exclusively claimed by one delivery worker.
#[derive(Debug, Clone)]
pub struct ClaimedDelivery {
    pub id: Uuid,
    pub claim_token: String,
    pub recipient_email: String,
    pub priority: Severity,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    /// 1-based attempt number this claim represents.
    pub attempt: u32,
    pub attempt_limit: u32,
}

// ═══════════════════════════════════════════
// Row mapping
// ═══════════════════════════════════════════

struct NotificationRow {
    id: String,
    report_id: String,
    recipient_email: String,
    recipient_role: String,
    sent_by: Option<String>,
    priority: String,
    status: String,
    categories: String,
    excerpt: String,
    findings_json: String,
    corpus_version: String,
    email_subject: String,
    email_body_html: String,
    email_body_text: String,
    acknowledgment_note: Option<String>,
    created_at: String,
    updated_at: String,
    sent_at: Option<String>,
    read_at: Option<String>,
    acknowledged_at: Option<String>,
    delivery_attempts: u32,
    attempt_limit: u32,
    last_error: Option<String>,
    next_attempt_at: Option<String>,
    escalated_at: Option<String>,
    escalated_to: Option<String>,
    escalation_reason: Option<String>,
    suppressed_at: Option<String>,
    report_deleted: bool,
}

fn notification_row(row: &Row<'_>) -> rusqlite::Result<NotificationRow> {
    Ok(NotificationRow {
        id: row.get(0)?,
        report_id: row.get(1)?,
        recipient_email: row.get(2)?,
        recipient_role: row.get(3)?,
        sent_by: row.get(4)?,
        priority: row.get(5)?,
        status: row.get(6)?,
        categories: row.get(7)?,
        excerpt: row.get(8)?,
        findings_json: row.get(9)?,
        corpus_version: row.get(10)?,
        email_subject: row.get(11)?,
        email_body_html: row.get(12)?,
        email_body_text: row.get(13)?,
        acknowledgment_note: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        sent_at: row.get(17)?,
        read_at: row.get(18)?,
        acknowledged_at: row.get(19)?,
        delivery_attempts: row.get(20)?,
        attempt_limit: row.get(21)?,
        last_error: row.get(22)?,
        next_attempt_at: row.get(23)?,
        escalated_at: row.get(24)?,
        escalated_to: row.get(25)?,
        escalation_reason: row.get(26)?,
        suppressed_at: row.get(27)?,
        report_deleted: row.get(28)?,
    })
}

fn json_err(e: serde_json::Error) -> DatabaseError {
    DatabaseError::ConstraintViolation(format!("stored JSON: {e}"))
}

fn parse_id(raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

impl NotificationRow {
    fn into_notification(self) -> Result<Notification, DatabaseError> {
        let categories: BTreeSet<String> =
            serde_json::from_str(&self.categories).map_err(json_err)?;
        let findings: Vec<Finding> = serde_json::from_str(&self.findings_json).map_err(json_err)?;
        Ok(Notification {
            id: parse_id(&self.id)?,
            report_id: self.report_id,
            recipient_email: self.recipient_email,
            recipient_role: Role::from_str(&self.recipient_role)?,
            sent_by: self.sent_by,
            priority: Severity::from_str(&self.priority)?,
            status: NotificationStatus::from_str(&self.status)?,
            categories,
            excerpt: self.excerpt,
            findings,
            corpus_version: self.corpus_version,
            email_subject: self.email_subject,
            email_body_html: self.email_body_html,
            email_body_text: self.email_body_text,
            acknowledgment_note: self.acknowledgment_note,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            sent_at: parse_opt_ts(self.sent_at)?,
            read_at: parse_opt_ts(self.read_at)?,
            acknowledged_at: parse_opt_ts(self.acknowledged_at)?,
            delivery_attempts: self.delivery_attempts,
            attempt_limit: self.attempt_limit,
            last_error: self.last_error,
            next_attempt_at: parse_opt_ts(self.next_attempt_at)?,
            escalated_at: parse_opt_ts(self.escalated_at)?,
            escalated_to: self.escalated_to,
            escalation_reason: self.escalation_reason,
            suppressed_at: parse_opt_ts(self.suppressed_at)?,
            report_deleted: self.report_deleted,
        })
    }
}

// ═══════════════════════════════════════════
// Reads
// ═══════════════════════════════════════════

pub fn get_notification(conn: &Connection, id: &Uuid) -> Result<Option<Notification>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("{SELECT_NOTIFICATION} WHERE n.id = ?1"),
            params![id.to_string()],
            notification_row,
        )
        .optional()?;
    row.map(NotificationRow::into_notification).transpose()
}

/// Same as [`get_notification`] but a missing row is an error.
pub fn require_notification(conn: &Connection, id: &Uuid) -> Result<Notification, DatabaseError> {
    get_notification(conn, id)?.ok_or_else(|| DatabaseError::NotFound {
        entity_type: "notification".into(),
        id: id.to_string(),
    })
}

pub fn find_notification_by_key(
    conn: &Connection,
    report_id: &str,
    recipient_email: &str,
) -> Result<Option<Notification>, DatabaseError> {
    let row = conn
        .query_row(
            &format!("{SELECT_NOTIFICATION} WHERE n.report_id = ?1 AND n.recipient_email = ?2"),
            params![report_id, recipient_email],
            notification_row,
        )
        .optional()?;
    row.map(NotificationRow::into_notification).transpose()
}

/// Newest first, bounded by `filter.limit`.
pub fn list_notifications(
    conn: &Connection,
    filter: &NotificationFilter,
) -> Result<Vec<Notification>, DatabaseError> {
    let mut sql = format!("{SELECT_NOTIFICATION} WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    match &filter.scope {
        ListScope::All => {}
        ListScope::Recipient(email) => {
            params_vec.push(Box::new(email.clone()));
            sql.push_str(&format!(" AND n.recipient_email = ?{}", params_vec.len()));
        }
        ListScope::Sender(email) => {
            params_vec.push(Box::new(email.clone()));
            sql.push_str(&format!(" AND n.sent_by = ?{}", params_vec.len()));
        }
    }
    if let Some(status) = filter.status {
        params_vec.push(Box::new(status.as_str()));
        sql.push_str(&format!(" AND n.status = ?{}", params_vec.len()));
    }
    if let Some(priority) = filter.priority {
        params_vec.push(Box::new(priority.as_str()));
        sql.push_str(&format!(" AND n.priority = ?{}", params_vec.len()));
    }
    if let Some(ref report_id) = filter.report_id {
        params_vec.push(Box::new(report_id.clone()));
        sql.push_str(&format!(" AND n.report_id = ?{}", params_vec.len()));
    }

    params_vec.push(Box::new(filter.limit));
    sql.push_str(&format!(
        " ORDER BY n.created_at DESC, n.rowid DESC LIMIT ?{}",
        params_vec.len()
    ));

    let param_refs: Vec<&dyn rusqlite::types::ToSql> =
        params_vec.iter().map(|p| p.as_ref()).collect();

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(param_refs.as_slice(), notification_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(NotificationRow::into_notification).collect()
}

pub fn count_by_status(conn: &Connection, scope: &ListScope) -> Result<StatusCounts, DatabaseError> {
    let (sql, param): (&str, Option<&str>) = match scope {
        ListScope::All => (
            "SELECT status, COUNT(*) FROM notifications GROUP BY status",
            None,
        ),
        ListScope::Recipient(email) => (
            "SELECT status, COUNT(*) FROM notifications WHERE recipient_email = ?1 GROUP BY status",
            Some(email.as_str()),
        ),
        ListScope::Sender(email) => (
            "SELECT status, COUNT(*) FROM notifications WHERE sent_by = ?1 GROUP BY status",
            Some(email.as_str()),
        ),
    };

    let mut stmt = conn.prepare(sql)?;
    let map = |row: &Row<'_>| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?));
    let rows = match param {
        Some(p) => stmt.query_map(params![p], map)?.collect::<Result<Vec<_>, _>>()?,
        None => stmt.query_map([], map)?.collect::<Result<Vec<_>, _>>()?,
    };

    let mut counts = StatusCounts::default();
    for (status, count) in rows {
        counts.add(NotificationStatus::from_str(&status)?, count.max(0) as u64);
    }
    Ok(counts)
}

/// Earliest moment an unclaimed pending row becomes due, if any.
pub fn next_due_at(conn: &Connection) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    let raw: Option<String> = conn.query_row(
        "SELECT MIN(COALESCE(next_attempt_at, updated_at)) FROM notifications
         WHERE status = 'pending' AND claim_token IS NULL AND delivery_attempts < attempt_limit",
        [],
        |row| row.get(0),
    )?;
    parse_opt_ts(raw)
}

fn load_status(conn: &Connection, id: &Uuid) -> Result<NotificationStatus, DatabaseError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT status FROM notifications WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => NotificationStatus::from_str(&s),
        None => Err(DatabaseError::NotFound {
            entity_type: "notification".into(),
            id: id.to_string(),
        }),
    }
}

// ═══════════════════════════════════════════
// Creation
// ═══════════════════════════════════════════

/// Create the notification for `(report_id, recipient_email)`, or refresh
/// it if it is still pending. Later-stage rows are never touched.
///
/// Runs on the caller's connection without its own transaction so it can
/// share the report-save transaction.
pub fn upsert_notification(
    conn: &Connection,
    new: &NewNotification,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, DatabaseError> {
    let categories = serde_json::to_string(&new.categories).map_err(json_err)?;
    let findings = serde_json::to_string(&new.findings).map_err(json_err)?;
    let ts = fmt_ts(&now);
    let id = Uuid::new_v4();

    let inserted = conn.execute(
        "INSERT INTO notifications
            (id, report_id, recipient_email, recipient_role, sent_by, priority, status,
             categories, excerpt, findings_json, corpus_version, email_subject,
             email_body_html, email_body_text, created_at, updated_at, attempt_limit)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14, ?15)
         ON CONFLICT(report_id, recipient_email) DO NOTHING",
        params![
            id.to_string(),
            new.report_id,
            new.recipient_email,
            new.recipient_role.as_str(),
            new.sent_by,
            new.priority.as_str(),
            categories,
            new.excerpt,
            findings,
            new.corpus_version,
            new.email_subject,
            new.email_body_html,
            new.email_body_text,
            ts,
            new.attempt_limit,
        ],
    )?;

    if inserted == 1 {
        append_audit(
            conn,
            &NewAuditEntry {
                notification_id: &id,
                timestamp: now,
                actor: SYSTEM_ACTOR,
                action: AuditAction::Created,
                from_status: None,
                to_status: Some(NotificationStatus::Pending),
                detail: Some(&format!(
                    "priority={} corpus={}",
                    new.priority, new.corpus_version
                )),
            },
        )?;
        return Ok(UpsertOutcome::Created { id });
    }

    let (existing, status): (String, String) = conn.query_row(
        "SELECT id, status FROM notifications WHERE report_id = ?1 AND recipient_email = ?2",
        params![new.report_id, new.recipient_email],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let existing = parse_id(&existing)?;
    let status = NotificationStatus::from_str(&status)?;

    if status != NotificationStatus::Pending {
        return Ok(UpsertOutcome::Unchanged { id: existing, status });
    }

    let refreshed = conn.execute(
        "UPDATE notifications SET
            priority = ?1, categories = ?2, excerpt = ?3, findings_json = ?4,
            corpus_version = ?5, email_subject = ?6, email_body_html = ?7,
            email_body_text = ?8, sent_by = COALESCE(?9, sent_by),
            updated_at = MAX(updated_at, ?10)
         WHERE id = ?11 AND status = 'pending'",
        params![
            new.priority.as_str(),
            categories,
            new.excerpt,
            findings,
            new.corpus_version,
            new.email_subject,
            new.email_body_html,
            new.email_body_text,
            new.sent_by,
            ts,
            existing.to_string(),
        ],
    )?;
    if refreshed == 0 {
        let status = load_status(conn, &existing)?;
        return Ok(UpsertOutcome::Unchanged { id: existing, status });
    }

    append_audit(
        conn,
        &NewAuditEntry {
            notification_id: &existing,
            timestamp: now,
            actor: SYSTEM_ACTOR,
            action: AuditAction::Refreshed,
            from_status: Some(NotificationStatus::Pending),
            to_status: Some(NotificationStatus::Pending),
            detail: Some(&format!("priority={} corpus={}", new.priority, new.corpus_version)),
        },
    )?;
    Ok(UpsertOutcome::Refreshed { id: existing })
}

/// Move a freshly created pending row straight to failed, e.g. when the
/// recipient address cannot be delivered to. Shares the caller's transaction.
pub fn reject_pending(
    conn: &Connection,
    id: &Uuid,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    ensure_transition(NotificationStatus::Pending, NotificationStatus::Failed)?;
    let changed = conn.execute(
        "UPDATE notifications SET status = 'failed', last_error = ?1,
            claim_token = NULL, claimed_at = NULL, updated_at = MAX(updated_at, ?2)
         WHERE id = ?3 AND status = 'pending'",
        params![error, fmt_ts(&now), id.to_string()],
    )?;
    if changed == 1 {
        append_audit(
            conn,
            &NewAuditEntry {
                notification_id: id,
                timestamp: now,
                actor: SYSTEM_ACTOR,
                action: AuditAction::Failed,
                from_status: Some(NotificationStatus::Pending),
                to_status: Some(NotificationStatus::Failed),
                detail: Some(error),
            },
        )?;
    }
    Ok(changed == 1)
}

// ═══════════════════════════════════════════
// Delivery claims
// ═══════════════════════════════════════════

/// Claim up to `limit` due pending rows, most urgent first.
///
/// Each claim is a compare-and-swap on the row: it sets a fresh claim
/// token and counts the attempt before anything is sent, so a crash
/// mid-send shows as an attempt with an expired lease, never as a
/// silent send. A row already claimed under a live lease is skipped.
pub fn claim_due_notifications(
    conn: &Connection,
    now: DateTime<Utc>,
    lease: Duration,
    limit: usize,
) -> Result<Vec<ClaimedDelivery>, DatabaseError> {
    let now_ts = fmt_ts(&now);
    let stale_ts = fmt_ts(&(now - lease));

    let candidates: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM notifications
             WHERE status = 'pending'
               AND delivery_attempts < attempt_limit
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
               AND (claim_token IS NULL OR claimed_at <= ?2)
             ORDER BY CASE priority WHEN 'critical' THEN 0 WHEN 'urgent' THEN 1 ELSE 2 END,
                      created_at ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![now_ts, stale_ts, limit as i64], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut claimed = Vec::with_capacity(candidates.len());
    for raw in candidates {
        if let Some(claim) = claim_notification(conn, &parse_id(&raw)?, now, lease)? {
            claimed.push(claim);
        }
    }
    Ok(claimed)
}

/// Claim one row. `None` means another worker holds it or it is not due.
pub fn claim_notification(
    conn: &Connection,
    id: &Uuid,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Option<ClaimedDelivery>, DatabaseError> {
    let token = Uuid::new_v4().to_string();
    let now_ts = fmt_ts(&now);
    let changed = conn.execute(
        "UPDATE notifications SET
            claim_token = ?1, claimed_at = ?2, delivery_attempts = delivery_attempts + 1,
            updated_at = MAX(updated_at, ?2)
         WHERE id = ?3 AND status = 'pending'
           AND delivery_attempts < attempt_limit
           AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)
           AND (claim_token IS NULL OR claimed_at <= ?4)",
        params![token, now_ts, id.to_string(), fmt_ts(&(now - lease))],
    )?;
    if changed == 0 {
        return Ok(None);
    }

    let claim = conn.query_row(
        "SELECT recipient_email, priority, email_subject, email_body_html, email_body_text,
                delivery_attempts, attempt_limit
         FROM notifications WHERE id = ?1 AND claim_token = ?2",
        params![id.to_string(), token],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, u32>(6)?,
            ))
        },
    )?;
    let (recipient_email, priority, subject, body_html, body_text, attempt, attempt_limit) = claim;

    Ok(Some(ClaimedDelivery {
        id: *id,
        claim_token: token,
        recipient_email,
        priority: Severity::from_str(&priority)?,
        subject,
        body_html,
        body_text,
        attempt,
        attempt_limit,
    }))
}

/// Record a successful send. `false` if the claim was lost meanwhile.
pub fn mark_sent(
    conn: &Connection,
    claim: &ClaimedDelivery,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    ensure_transition(NotificationStatus::Pending, NotificationStatus::Sent)?;
    let tx = conn.unchecked_transaction()?;

    let created_at: Option<String> = tx
        .query_row(
            "SELECT created_at FROM notifications WHERE id = ?1",
            params![claim.id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(created_at) = created_at else {
        return Ok(false);
    };
    let sent_at = stamp_after(now, Some(parse_ts(&created_at)?));

    let changed = tx.execute(
        "UPDATE notifications SET status = 'sent', sent_at = ?1, last_error = NULL,
            next_attempt_at = NULL, claim_token = NULL, claimed_at = NULL,
            updated_at = MAX(updated_at, ?1)
         WHERE id = ?2 AND status = 'pending' AND claim_token = ?3",
        params![fmt_ts(&sent_at), claim.id.to_string(), claim.claim_token],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    append_audit(
        &tx,
        &NewAuditEntry {
            notification_id: &claim.id,
            timestamp: sent_at,
            actor: WORKER_ACTOR,
            action: AuditAction::Sent,
            from_status: Some(NotificationStatus::Pending),
            to_status: Some(NotificationStatus::Sent),
            detail: Some(&format!("attempt {}/{}", claim.attempt, claim.attempt_limit)),
        },
    )?;
    tx.commit()?;
    Ok(true)
}

/// Record a failed attempt and leave the row pending until `next_attempt_at`.
pub fn schedule_retry(
    conn: &Connection,
    claim: &ClaimedDelivery,
    error: &str,
    next_attempt_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE notifications SET last_error = ?1, next_attempt_at = ?2,
            claim_token = NULL, claimed_at = NULL, updated_at = MAX(updated_at, ?3)
         WHERE id = ?4 AND status = 'pending' AND claim_token = ?5",
        params![
            error,
            fmt_ts(&next_attempt_at),
            fmt_ts(&now),
            claim.id.to_string(),
            claim.claim_token
        ],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    append_audit(
        &tx,
        &NewAuditEntry {
            notification_id: &claim.id,
            timestamp: now,
            actor: WORKER_ACTOR,
            action: AuditAction::DeliveryFailed,
            from_status: Some(NotificationStatus::Pending),
            to_status: Some(NotificationStatus::Pending),
            detail: Some(&format!(
                "attempt {}/{} failed: {error}; retry at {}",
                claim.attempt,
                claim.attempt_limit,
                fmt_ts(&next_attempt_at)
            )),
        },
    )?;
    tx.commit()?;
    Ok(true)
}

/// Stop automatic delivery: pending → failed.
pub fn mark_failed(
    conn: &Connection,
    claim: &ClaimedDelivery,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    ensure_transition(NotificationStatus::Pending, NotificationStatus::Failed)?;
    let tx = conn.unchecked_transaction()?;
    let changed = tx.execute(
        "UPDATE notifications SET status = 'failed', last_error = ?1, next_attempt_at = NULL,
            claim_token = NULL, claimed_at = NULL, updated_at = MAX(updated_at, ?2)
         WHERE id = ?3 AND status = 'pending' AND claim_token = ?4",
        params![error, fmt_ts(&now), claim.id.to_string(), claim.claim_token],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    append_audit(
        &tx,
        &NewAuditEntry {
            notification_id: &claim.id,
            timestamp: now,
            actor: WORKER_ACTOR,
            action: AuditAction::Failed,
            from_status: Some(NotificationStatus::Pending),
            to_status: Some(NotificationStatus::Failed),
            detail: Some(&format!(
                "attempt {}/{}: {error}",
                claim.attempt, claim.attempt_limit
            )),
        },
    )?;
    tx.commit()?;
    Ok(true)
}

/// Fail pending rows whose budget is spent and whose last claim expired
/// without an outcome (worker crashed mid-send). Returns their ids.
pub fn fail_exhausted_claims(
    conn: &Connection,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Vec<Uuid>, DatabaseError> {
    ensure_transition(NotificationStatus::Pending, NotificationStatus::Failed)?;
    let tx = conn.unchecked_transaction()?;
    let stale_ts = fmt_ts(&(now - lease));

    let ids: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM notifications
             WHERE status = 'pending' AND delivery_attempts >= attempt_limit
               AND (claim_token IS NULL OR claimed_at <= ?1)",
        )?;
        let rows = stmt
            .query_map(params![stale_ts], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let error = "delivery outcome unknown: attempt budget spent and worker lease expired";
    let mut failed = Vec::with_capacity(ids.len());
    for raw in ids {
        let id = parse_id(&raw)?;
        let changed = tx.execute(
            "UPDATE notifications SET status = 'failed', last_error = ?1,
                claim_token = NULL, claimed_at = NULL, updated_at = MAX(updated_at, ?2)
             WHERE id = ?3 AND status = 'pending'",
            params![error, fmt_ts(&now), raw],
        )?;
        if changed == 1 {
            append_audit(
                &tx,
                &NewAuditEntry {
                    notification_id: &id,
                    timestamp: now,
                    actor: WORKER_ACTOR,
                    action: AuditAction::Failed,
                    from_status: Some(NotificationStatus::Pending),
                    to_status: Some(NotificationStatus::Failed),
                    detail: Some(error),
                },
            )?;
            failed.push(id);
        }
    }
    tx.commit()?;
    Ok(failed)
}

// ═══════════════════════════════════════════
// Recipient and admin transitions
// ═══════════════════════════════════════════

/// First view by the recipient: sent → read. `false` if not `sent`.
pub fn mark_read(
    conn: &Connection,
    id: &Uuid,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let current = require_notification(&tx, id)?;
    if current.status != NotificationStatus::Sent {
        return Ok(false);
    }
    ensure_transition(current.status, NotificationStatus::Read)?;
    let read_at = stamp_after(now, current.sent_at);

    let changed = tx.execute(
        "UPDATE notifications SET status = 'read', read_at = ?1, updated_at = MAX(updated_at, ?1)
         WHERE id = ?2 AND status = 'sent' AND read_at IS NULL",
        params![fmt_ts(&read_at), id.to_string()],
    )?;
    if changed == 0 {
        return Ok(false);
    }
    append_audit(
        &tx,
        &NewAuditEntry {
            notification_id: id,
            timestamp: read_at,
            actor,
            action: AuditAction::Read,
            from_status: Some(NotificationStatus::Sent),
            to_status: Some(NotificationStatus::Read),
            detail: None,
        },
    )?;
    tx.commit()?;
    Ok(true)
}

/// sent|read → acknowledged, storing the note.
pub fn acknowledge_notification(
    conn: &Connection,
    id: &Uuid,
    actor: &str,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Notification, DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let current = require_notification(&tx, id)?;
    ensure_transition(current.status, NotificationStatus::Acknowledged)?;
    let acknowledged_at = stamp_after(now, current.read_at.or(current.sent_at));

    let changed = tx.execute(
        "UPDATE notifications SET status = 'acknowledged', acknowledged_at = ?1,
            acknowledgment_note = ?2, updated_at = MAX(updated_at, ?1)
         WHERE id = ?3 AND status = ?4",
        params![
            fmt_ts(&acknowledged_at),
            note,
            id.to_string(),
            current.status.as_str()
        ],
    )?;
    if changed == 0 {
        // Lost a race with another transition.
        let status = load_status(&tx, id)?;
        return Err(DatabaseError::InvalidTransition {
            from: status.as_str().into(),
            to: NotificationStatus::Acknowledged.as_str().into(),
        });
    }
    append_audit(
        &tx,
        &NewAuditEntry {
            notification_id: id,
            timestamp: acknowledged_at,
            actor,
            action: AuditAction::Acknowledged,
            from_status: Some(current.status),
            to_status: Some(NotificationStatus::Acknowledged),
            detail: note,
        },
    )?;
    let updated = require_notification(&tx, id)?;
    tx.commit()?;
    Ok(updated)
}

/// sent → escalated for rows delivered more than `sla` ago and never opened.
pub fn escalate_overdue(
    conn: &Connection,
    now: DateTime<Utc>,
    sla: Duration,
    escalate_to: Option<&str>,
) -> Result<Vec<Uuid>, DatabaseError> {
    ensure_transition(NotificationStatus::Sent, NotificationStatus::Escalated)?;
    let tx = conn.unchecked_transaction()?;
    let cutoff = fmt_ts(&(now - sla));

    let due: Vec<(String, String)> = {
        let mut stmt = tx.prepare(
            "SELECT id, sent_at FROM notifications
             WHERE status = 'sent' AND sent_at IS NOT NULL AND sent_at <= ?1",
        )?;
        let rows = stmt
            .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let reason = format!(
        "not opened within {} minutes of delivery",
        sla.num_minutes()
    );
    let mut escalated = Vec::with_capacity(due.len());
    for (raw, sent_at) in due {
        let id = parse_id(&raw)?;
        let at = stamp_after(now, Some(parse_ts(&sent_at)?));
        let changed = tx.execute(
            "UPDATE notifications SET status = 'escalated', escalated_at = ?1,
                escalated_to = ?2, escalation_reason = ?3, updated_at = MAX(updated_at, ?1)
             WHERE id = ?4 AND status = 'sent'",
            params![fmt_ts(&at), escalate_to, reason, raw],
        )?;
        if changed == 1 {
            let detail = match escalate_to {
                Some(to) => format!("{reason}; escalated to {to}"),
                None => reason.clone(),
            };
            append_audit(
                &tx,
                &NewAuditEntry {
                    notification_id: &id,
                    timestamp: at,
                    actor: ESCALATION_ACTOR,
                    action: AuditAction::Escalated,
                    from_status: Some(NotificationStatus::Sent),
                    to_status: Some(NotificationStatus::Escalated),
                    detail: Some(&detail),
                },
            )?;
            escalated.push(id);
        }
    }
    tx.commit()?;
    Ok(escalated)
}

/// Manual retry: failed → pending with a fresh budget of `extra_attempts`.
pub fn retry_failed(
    conn: &Connection,
    id: &Uuid,
    actor: &str,
    extra_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Notification, DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let current = require_notification(&tx, id)?;
    ensure_transition(current.status, NotificationStatus::Pending)?;

    let changed = tx.execute(
        "UPDATE notifications SET status = 'pending',
            attempt_limit = delivery_attempts + ?1, next_attempt_at = NULL,
            claim_token = NULL, claimed_at = NULL, suppressed_at = NULL,
            updated_at = MAX(updated_at, ?2)
         WHERE id = ?3 AND status = 'failed'",
        params![extra_attempts.max(1), fmt_ts(&now), id.to_string()],
    )?;
    if changed == 0 {
        let status = load_status(&tx, id)?;
        return Err(DatabaseError::InvalidTransition {
            from: status.as_str().into(),
            to: NotificationStatus::Pending.as_str().into(),
        });
    }
    append_audit(
        &tx,
        &NewAuditEntry {
            notification_id: id,
            timestamp: now,
            actor,
            action: AuditAction::Retried,
            from_status: Some(NotificationStatus::Failed),
            to_status: Some(NotificationStatus::Pending),
            detail: Some(&format!("{} more attempt(s) granted", extra_attempts.max(1))),
        },
    )?;
    let updated = require_notification(&tx, id)?;
    tx.commit()?;
    Ok(updated)
}

/// Administrative suppress. A pending row stops delivery and becomes
/// failed; a failed row is only marked. Either way it is audited.
pub fn suppress_notification(
    conn: &Connection,
    id: &Uuid,
    actor: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Notification, DatabaseError> {
    let tx = conn.unchecked_transaction()?;
    let current = require_notification(&tx, id)?;
    if current.status != NotificationStatus::Failed {
        ensure_transition(current.status, NotificationStatus::Failed)?;
    }
    let error = format!("suppressed by {actor}: {reason}");

    let changed = tx.execute(
        "UPDATE notifications SET status = 'failed', suppressed_at = ?1, last_error = ?2,
            next_attempt_at = NULL, claim_token = NULL, claimed_at = NULL,
            updated_at = MAX(updated_at, ?1)
         WHERE id = ?3 AND status = ?4",
        params![fmt_ts(&now), error, id.to_string(), current.status.as_str()],
    )?;
    if changed == 0 {
        let status = load_status(&tx, id)?;
        return Err(DatabaseError::InvalidTransition {
            from: status.as_str().into(),
            to: NotificationStatus::Failed.as_str().into(),
        });
    }
    append_audit(
        &tx,
        &NewAuditEntry {
            notification_id: id,
            timestamp: now,
            actor,
            action: AuditAction::Suppressed,
            from_status: Some(current.status),
            to_status: Some(NotificationStatus::Failed),
            detail: Some(reason),
        },
    )?;
    let updated = require_notification(&tx, id)?;
    tx.commit()?;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::{list_audit_for, save_report, tombstone_report};
    use crate::db::sqlite::open_memory_database;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    fn new_notification(report_id: &str, email: &str) -> NewNotification {
        NewNotification {
            report_id: report_id.into(),
            recipient_email: email.into(),
            recipient_role: Role::Doctor,
            sent_by: Some("rad@hospital.org".into()),
            priority: Severity::Critical,
            categories: ["neurological".to_string()].into_iter().collect(),
            excerpt: "Acute subdural hematoma.".into(),
            findings: Vec::new(),
            corpus_version: "2025.1".into(),
            email_subject: "[CRITICAL] Critical finding".into(),
            email_body_html: "<p>x</p>".into(),
            email_body_text: "x".into(),
            attempt_limit: 3,
        }
    }

    fn seeded(conn: &Connection, report_id: &str, email: &str) -> Uuid {
        save_report(conn, report_id, &ReportMetadata::default(), t0()).unwrap();
        upsert_notification(conn, &new_notification(report_id, email), t0())
            .unwrap()
            .id()
    }

    fn lease() -> Duration {
        Duration::seconds(120)
    }

    fn claim(conn: &Connection, now: DateTime<Utc>) -> ClaimedDelivery {
        let mut claims = claim_due_notifications(conn, now, lease(), 10).unwrap();
        assert_eq!(claims.len(), 1, "expected exactly one claim");
        claims.remove(0)
    }

    fn sent(conn: &Connection, report_id: &str, email: &str) -> Uuid {
        let id = seeded(conn, report_id, email);
        let c = claim_notification(conn, &id, t0(), lease())
            .unwrap()
            .expect("freshly seeded row is claimable");
        assert!(mark_sent(conn, &c, t0() + Duration::seconds(1)).unwrap());
        id
    }

    #[test]
    fn upsert_creates_pending_row_with_audit() {
        let conn = open_memory_database().unwrap();
        let id = seeded(&conn, "r-1", "doc@hospital.org");
        let n = require_notification(&conn, &id).unwrap();
        assert_eq!(n.status, NotificationStatus::Pending);
        assert_eq!(n.delivery_attempts, 0);
        assert_eq!(n.attempt_limit, 3);
        assert!(n.categories.contains("neurological"));
        let trail = list_audit_for(&conn, &id).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, AuditAction::Created);
    }

    #[test]
    fn upsert_is_idempotent_per_key() {
        let conn = open_memory_database().unwrap();
        let first = seeded(&conn, "r-1", "doc@hospital.org");
        let mut again = new_notification("r-1", "doc@hospital.org");
        again.excerpt = "Updated excerpt.".into();
        again.priority = Severity::Urgent;
        let outcome = upsert_notification(&conn, &again, t0() + Duration::minutes(1)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Refreshed { id: first });

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM notifications", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
        let n = require_notification(&conn, &first).unwrap();
        assert_eq!(n.excerpt, "Updated excerpt.");
        assert_eq!(n.priority, Severity::Urgent);
    }

    #[test]
    fn upsert_leaves_later_stage_rows_alone() {
        let conn = open_memory_database().unwrap();
        let id = sent(&conn, "r-1", "doc@hospital.org");
        let mut again = new_notification("r-1", "doc@hospital.org");
        again.excerpt = "Should not land.".into();
        let outcome = upsert_notification(&conn, &again, t0() + Duration::minutes(5)).unwrap();
        assert_eq!(
            outcome,
            UpsertOutcome::Unchanged { id, status: NotificationStatus::Sent }
        );
        assert_eq!(require_notification(&conn, &id).unwrap().excerpt, "Acute subdural hematoma.");
    }

    #[test]
    fn different_recipients_get_separate_rows() {
        let conn = open_memory_database().unwrap();
        let a = seeded(&conn, "r-1", "a@hospital.org");
        let b = upsert_notification(&conn, &new_notification("r-1", "b@hospital.org"), t0())
            .unwrap()
            .id();
        assert_ne!(a, b);
    }

    #[test]
    fn claim_is_exclusive_while_lease_is_live() {
        let conn = open_memory_database().unwrap();
        let id = seeded(&conn, "r-1", "doc@hospital.org");
        let first = claim_notification(&conn, &id, t0(), lease()).unwrap();
        assert!(first.is_some());
        assert_eq!(first.as_ref().unwrap().attempt, 1);
        let second = claim_notification(&conn, &id, t0() + Duration::seconds(5), lease()).unwrap();
        assert!(second.is_none());
        // after the lease expires the row can be taken over
        let third = claim_notification(&conn, &id, t0() + Duration::seconds(121), lease()).unwrap();
        assert_eq!(third.unwrap().attempt, 2);
    }

    #[test]
    fn lost_claim_cannot_record_outcome() {
        let conn = open_memory_database().unwrap();
        let id = seeded(&conn, "r-1", "doc@hospital.org");
        let stale = claim_notification(&conn, &id, t0(), lease()).unwrap().unwrap();
        let fresh = claim_notification(&conn, &id, t0() + Duration::minutes(3), lease())
            .unwrap()
            .unwrap();
        assert!(!mark_sent(&conn, &stale, t0() + Duration::minutes(3)).unwrap());
        assert!(mark_sent(&conn, &fresh, t0() + Duration::minutes(3)).unwrap());
    }

    #[test]
    fn retry_is_not_claimable_before_due() {
        let conn = open_memory_database().unwrap();
        seeded(&conn, "r-1", "doc@hospital.org");
        let c = claim(&conn, t0());
        let due = t0() + Duration::seconds(30);
        assert!(schedule_retry(&conn, &c, "timeout", due, t0()).unwrap());
        assert!(claim_due_notifications(&conn, t0() + Duration::seconds(10), lease(), 10)
            .unwrap()
            .is_empty());
        assert_eq!(next_due_at(&conn).unwrap(), Some(due));
        let again = claim(&conn, due);
        assert_eq!(again.attempt, 2);
    }

    #[test]
    fn exhausted_budget_is_not_claimed() {
        let conn = open_memory_database().unwrap();
        let id = seeded(&conn, "r-1", "doc@hospital.org");
        for attempt in 0..3 {
            let now = t0() + Duration::minutes(attempt * 10);
            let c = claim(&conn, now);
            assert!(schedule_retry(&conn, &c, "timeout", now, now).unwrap());
        }
        let n = require_notification(&conn, &id).unwrap();
        assert_eq!(n.delivery_attempts, 3);
        assert!(claim_due_notifications(&conn, t0() + Duration::hours(1), lease(), 10)
            .unwrap()
            .is_empty());
        // the sweep resolves the stuck row rather than leaving it pending
        let failed = fail_exhausted_claims(&conn, t0() + Duration::hours(1), lease()).unwrap();
        assert_eq!(failed, vec![id]);
        assert_eq!(
            require_notification(&conn, &id).unwrap().status,
            NotificationStatus::Failed
        );
    }

    #[test]
    fn crashed_worker_claim_is_failed_after_lease() {
        let conn = open_memory_database().unwrap();
        let mut new = new_notification("r-1", "doc@hospital.org");
        new.attempt_limit = 1;
        save_report(&conn, "r-1", &ReportMetadata::default(), t0()).unwrap();
        let id = upsert_notification(&conn, &new, t0()).unwrap().id();
        let _abandoned = claim(&conn, t0());

        // lease still live: nothing to do
        assert!(fail_exhausted_claims(&conn, t0() + Duration::seconds(30), lease())
            .unwrap()
            .is_empty());
        let failed = fail_exhausted_claims(&conn, t0() + Duration::minutes(5), lease()).unwrap();
        assert_eq!(failed, vec![id]);
        let n = require_notification(&conn, &id).unwrap();
        assert!(n.last_error.unwrap().contains("lease expired"));
    }

    #[test]
    fn claims_most_urgent_first() {
        let conn = open_memory_database().unwrap();
        save_report(&conn, "r-1", &ReportMetadata::default(), t0()).unwrap();
        let mut urgent = new_notification("r-1", "a@hospital.org");
        urgent.priority = Severity::Urgent;
        upsert_notification(&conn, &urgent, t0()).unwrap();
        upsert_notification(&conn, &new_notification("r-1", "b@hospital.org"), t0() + Duration::seconds(1))
            .unwrap();
        let claims = claim_due_notifications(&conn, t0() + Duration::seconds(2), lease(), 1).unwrap();
        assert_eq!(claims[0].priority, Severity::Critical);
    }

    #[test]
    fn read_is_first_view_only() {
        let conn = open_memory_database().unwrap();
        let id = sent(&conn, "r-1", "doc@hospital.org");
        assert!(mark_read(&conn, &id, "doc@hospital.org", t0() + Duration::minutes(2)).unwrap());
        let first = require_notification(&conn, &id).unwrap().read_at;
        assert!(!mark_read(&conn, &id, "doc@hospital.org", t0() + Duration::minutes(9)).unwrap());
        assert_eq!(require_notification(&conn, &id).unwrap().read_at, first);
    }

    #[test]
    fn timestamps_never_precede_earlier_stages() {
        let conn = open_memory_database().unwrap();
        let id = sent(&conn, "r-1", "doc@hospital.org");
        // a clock that went backwards still produces ordered stamps
        mark_read(&conn, &id, "doc@hospital.org", t0() - Duration::hours(1)).unwrap();
        let n = acknowledge_notification(&conn, &id, "doc@hospital.org", None, t0() - Duration::hours(2))
            .unwrap();
        let sent_at = n.sent_at.unwrap();
        let read_at = n.read_at.unwrap();
        let ack_at = n.acknowledged_at.unwrap();
        assert!(sent_at <= read_at && read_at <= ack_at);
    }

    #[test]
    fn acknowledge_twice_is_invalid_transition() {
        let conn = open_memory_database().unwrap();
        let id = sent(&conn, "r-1", "doc@hospital.org");
        acknowledge_notification(&conn, &id, "doc@hospital.org", Some("done"), t0() + Duration::minutes(3))
            .unwrap();
        let err = acknowledge_notification(&conn, &id, "doc@hospital.org", None, t0() + Duration::minutes(4))
            .unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
        let n = require_notification(&conn, &id).unwrap();
        assert_eq!(n.acknowledgment_note.as_deref(), Some("done"));
    }

    #[test]
    fn acknowledge_pending_rejected() {
        let conn = open_memory_database().unwrap();
        let id = seeded(&conn, "r-1", "doc@hospital.org");
        let err = acknowledge_notification(&conn, &id, "doc@hospital.org", None, t0()).unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
    }

    #[test]
    fn escalation_applies_to_unopened_sent_rows_only() {
        let conn = open_memory_database().unwrap();
        let unopened = sent(&conn, "r-1", "a@hospital.org");
        let opened = sent(&conn, "r-2", "b@hospital.org");
        mark_read(&conn, &opened, "b@hospital.org", t0() + Duration::minutes(1)).unwrap();

        let early = escalate_overdue(&conn, t0() + Duration::minutes(30), Duration::minutes(60), None)
            .unwrap();
        assert!(early.is_empty());

        let escalated = escalate_overdue(
            &conn,
            t0() + Duration::minutes(61),
            Duration::minutes(60),
            Some("chief@hospital.org"),
        )
        .unwrap();
        assert_eq!(escalated, vec![unopened]);
        let n = require_notification(&conn, &unopened).unwrap();
        assert_eq!(n.status, NotificationStatus::Escalated);
        assert_eq!(n.escalated_to.as_deref(), Some("chief@hospital.org"));
        assert!(n.escalation_reason.is_some());
        assert_eq!(
            require_notification(&conn, &opened).unwrap().status,
            NotificationStatus::Read
        );
    }

    #[test]
    fn manual_retry_grants_fresh_budget() {
        let conn = open_memory_database().unwrap();
        let id = seeded(&conn, "r-1", "doc@hospital.org");
        let c = claim(&conn, t0());
        mark_failed(&conn, &c, "550 mailbox unavailable", t0()).unwrap();

        let n = retry_failed(&conn, &id, "admin@hospital.org", 3, t0() + Duration::minutes(1)).unwrap();
        assert_eq!(n.status, NotificationStatus::Pending);
        assert_eq!(n.delivery_attempts, 1);
        assert_eq!(n.attempt_limit, 4);
        assert_eq!(claim(&conn, t0() + Duration::minutes(1)).attempt, 2);
    }

    #[test]
    fn retry_only_from_failed() {
        let conn = open_memory_database().unwrap();
        let id = sent(&conn, "r-1", "doc@hospital.org");
        let err = retry_failed(&conn, &id, "admin@hospital.org", 3, t0()).unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
    }

    #[test]
    fn suppress_pending_stops_delivery_and_is_audited() {
        let conn = open_memory_database().unwrap();
        let id = seeded(&conn, "r-1", "doc@hospital.org");
        let n = suppress_notification(&conn, &id, "admin@hospital.org", "duplicate study", t0()).unwrap();
        assert_eq!(n.status, NotificationStatus::Failed);
        assert!(n.suppressed_at.is_some());
        assert!(claim_due_notifications(&conn, t0(), lease(), 10).unwrap().is_empty());
        let trail = list_audit_for(&conn, &id).unwrap();
        assert_eq!(trail.last().unwrap().action, AuditAction::Suppressed);
    }

    #[test]
    fn suppress_sent_rejected() {
        let conn = open_memory_database().unwrap();
        let id = sent(&conn, "r-1", "doc@hospital.org");
        let err = suppress_notification(&conn, &id, "admin@hospital.org", "x", t0()).unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
    }

    #[test]
    fn list_scopes_and_filters() {
        let conn = open_memory_database().unwrap();
        seeded(&conn, "r-1", "a@hospital.org");
        sent(&conn, "r-2", "b@hospital.org");

        let all = list_notifications(&conn, &NotificationFilter::new(ListScope::All)).unwrap();
        assert_eq!(all.len(), 2);

        let mine = list_notifications(
            &conn,
            &NotificationFilter::new(ListScope::Recipient("a@hospital.org".into())),
        )
        .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].report_id, "r-1");

        let by_sender = list_notifications(
            &conn,
            &NotificationFilter::new(ListScope::Sender("rad@hospital.org".into())),
        )
        .unwrap();
        assert_eq!(by_sender.len(), 2);

        let mut filter = NotificationFilter::new(ListScope::All);
        filter.status = Some(NotificationStatus::Sent);
        let sent_only = list_notifications(&conn, &filter).unwrap();
        assert_eq!(sent_only.len(), 1);
        assert_eq!(sent_only[0].recipient_email, "b@hospital.org");

        let mut filter = NotificationFilter::new(ListScope::All);
        filter.limit = 1;
        assert_eq!(list_notifications(&conn, &filter).unwrap().len(), 1);
    }

    #[test]
    fn counts_by_status() {
        let conn = open_memory_database().unwrap();
        seeded(&conn, "r-1", "a@hospital.org");
        let id = sent(&conn, "r-2", "b@hospital.org");
        acknowledge_notification(&conn, &id, "b@hospital.org", None, t0() + Duration::minutes(1)).unwrap();
        let counts = count_by_status(&conn, &ListScope::All).unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.acknowledged, 1);
        assert_eq!(counts.unacknowledged, 1);
    }

    #[test]
    fn tombstoned_report_keeps_notification() {
        let conn = open_memory_database().unwrap();
        let id = seeded(&conn, "r-1", "doc@hospital.org");
        assert_eq!(tombstone_report(&conn, "r-1", None, t0()).unwrap(), 1);
        let n = require_notification(&conn, &id).unwrap();
        assert!(n.report_deleted);
        let trail = list_audit_for(&conn, &id).unwrap();
        assert_eq!(trail.last().unwrap().action, AuditAction::ReportDeleted);
    }

    #[test]
    fn audit_trail_records_full_lifecycle() {
        let conn = open_memory_database().unwrap();
        let id = seeded(&conn, "r-1", "doc@hospital.org");
        let c = claim(&conn, t0());
        schedule_retry(&conn, &c, "timeout", t0(), t0()).unwrap();
        let c = claim(&conn, t0() + Duration::seconds(1));
        mark_sent(&conn, &c, t0() + Duration::seconds(2)).unwrap();
        mark_read(&conn, &id, "doc@hospital.org", t0() + Duration::minutes(1)).unwrap();
        acknowledge_notification(&conn, &id, "doc@hospital.org", Some("called"), t0() + Duration::minutes(2))
            .unwrap();

        let actions: Vec<AuditAction> =
            list_audit_for(&conn, &id).unwrap().into_iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::Created,
                AuditAction::DeliveryFailed,
                AuditAction::Sent,
                AuditAction::Read,
                AuditAction::Acknowledged,
            ]
        );
    }
}
