use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{fmt_ts, parse_ts};
use crate::db::DatabaseError;
use crate::models::enums::{AuditAction, NotificationStatus};
use crate::models::AuditEntry;

/// Actor recorded for detector-driven events.
pub const SYSTEM_ACTOR: &str = "system";
/// Actor recorded for delivery outcomes.
pub const WORKER_ACTOR: &str = "delivery-worker";
/// Actor recorded for SLA escalations.
pub const ESCALATION_ACTOR: &str = "escalation-sweep";

pub struct NewAuditEntry<'a> {
    pub notification_id: &'a Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: &'a str,
    pub action: AuditAction,
    pub from_status: Option<NotificationStatus>,
    pub to_status: Option<NotificationStatus>,
    pub detail: Option<&'a str>,
}

/// Append one event. The table rejects updates and deletes.
pub fn append_audit(conn: &Connection, entry: &NewAuditEntry<'_>) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO audit_log (notification_id, timestamp, actor, action, from_status, to_status, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.notification_id.to_string(),
            fmt_ts(&entry.timestamp),
            entry.actor,
            entry.action.as_str(),
            entry.from_status.map(|s| s.as_str()),
            entry.to_status.map(|s| s.as_str()),
            entry.detail,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Full trail for one notification, oldest first.
pub fn list_audit_for(
    conn: &Connection,
    notification_id: &Uuid,
) -> Result<Vec<AuditEntry>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, notification_id, timestamp, actor, action, from_status, to_status, detail
         FROM audit_log WHERE notification_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![notification_id.to_string()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut entries = Vec::with_capacity(rows.len());
    for (id, notification_id, timestamp, actor, action, from_status, to_status, detail) in rows {
        entries.push(AuditEntry {
            id,
            notification_id: Uuid::parse_str(&notification_id)
                .map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?,
            timestamp: parse_ts(&timestamp)?,
            actor,
            action: AuditAction::from_str(&action)?,
            from_status: from_status
                .as_deref()
                .map(NotificationStatus::from_str)
                .transpose()?,
            to_status: to_status
                .as_deref()
                .map(NotificationStatus::from_str)
                .transpose()?,
            detail,
        });
    }
    Ok(entries)
}
