//! SLA escalation: delivered alerts nobody opened in time.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::error::DeliveryError;
use crate::core_state::CoreState;
use crate::db::repository::escalate_overdue;

/// Escalate every `sent` row older than the configured SLA. Returns the
/// escalated ids.
pub fn run_escalation_sweep(
    core: &CoreState,
    now: DateTime<Utc>,
) -> Result<Vec<Uuid>, DeliveryError> {
    let config = &core.config.escalation;
    let escalated = {
        let conn = core.db()?;
        escalate_overdue(
            &conn,
            now,
            Duration::minutes(config.sla_minutes),
            config.escalate_to.as_deref(),
        )?
    };

    for id in &escalated {
        tracing::warn!(
            notification_id = %id,
            sla_minutes = config.sla_minutes,
            escalate_to = config.escalate_to.as_deref().unwrap_or("-"),
            "Critical finding alert unread past SLA, escalated"
        );
    }
    Ok(escalated)
}
