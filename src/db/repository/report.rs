use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{append_audit, fmt_ts, NewAuditEntry, SYSTEM_ACTOR};
use crate::db::DatabaseError;
use crate::models::enums::AuditAction;
use crate::models::ReportMetadata;

/// Insert the report row, or refresh its metadata on regeneration.
/// A tombstoned report is not revived.
pub fn save_report(
    conn: &Connection,
    report_id: &str,
    metadata: &ReportMetadata,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO reports (id, accession, patient_name, author, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            accession = excluded.accession,
            patient_name = excluded.patient_name,
            author = excluded.author
         WHERE reports.deleted_at IS NULL",
        params![
            report_id,
            metadata.accession,
            metadata.patient_name,
            metadata.author,
            fmt_ts(&now),
        ],
    )?;
    Ok(())
}

pub fn get_report_metadata(
    conn: &Connection,
    report_id: &str,
) -> Result<Option<ReportMetadata>, DatabaseError> {
    let meta = conn
        .query_row(
            "SELECT accession, patient_name, author FROM reports WHERE id = ?1",
            params![report_id],
            |row| {
                Ok(ReportMetadata {
                    accession: row.get(0)?,
                    patient_name: row.get(1)?,
                    author: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(meta)
}

/// Mark a report deleted. Its notifications stay, pointing at the
/// tombstone, and each gets an audit entry. Returns the number of
/// notifications affected.
pub fn tombstone_report(
    conn: &Connection,
    report_id: &str,
    actor: Option<&str>,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let tx = conn.unchecked_transaction()?;

    let changed = tx.execute(
        "UPDATE reports SET deleted_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        params![fmt_ts(&now), report_id],
    )?;
    if changed == 0 {
        let exists: bool = tx
            .query_row("SELECT 1 FROM reports WHERE id = ?1", params![report_id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(DatabaseError::NotFound {
                entity_type: "report".into(),
                id: report_id.into(),
            });
        }
        return Ok(0);
    }

    let ids: Vec<String> = {
        let mut stmt = tx.prepare("SELECT id FROM notifications WHERE report_id = ?1")?;
        let rows = stmt
            .query_map(params![report_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    for raw in &ids {
        let id = Uuid::parse_str(raw).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))?;
        append_audit(
            &tx,
            &NewAuditEntry {
                notification_id: &id,
                timestamp: now,
                actor: actor.unwrap_or(SYSTEM_ACTOR),
                action: AuditAction::ReportDeleted,
                from_status: None,
                to_status: None,
                detail: Some("owning report deleted; notification retained"),
            },
        )?;
    }

    tx.commit()?;
    Ok(ids.len())
}
