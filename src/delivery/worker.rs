//! Delivery worker: claims due pending rows and sends them.
//!
//! The notifications table is the queue. A cycle claims a batch (each
//! claim counts an attempt before anything is sent), sends the batch
//! concurrently, then records each outcome under the claim token. A
//! crash between send and record leaves an expired claim that is either
//! re-claimed or, with no budget left, failed by the recovery sweep.

use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use futures_util::stream::{self, StreamExt};

use super::backoff::Backoff;
use super::error::{DeliveryError, GatewayError};
use super::gateway::{sender_line, EmailMessage, SendReceipt};
use crate::core_state::CoreState;
use crate::db::repository::{
    claim_due_notifications, fail_exhausted_claims, mark_failed, mark_sent, schedule_retry,
    ClaimedDelivery,
};
use crate::notification::service::mask_email;

/// Claims per worker slot taken in one cycle.
const CLAIMS_PER_WORKER: usize = 4;

/// What one cycle did. `lost` counts outcomes dropped because the claim
/// expired and another worker took the row over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub lost: usize,
    pub recovered: usize,
}

impl CycleReport {
    /// The batch was full; more work is probably waiting.
    pub fn saturated(&self, batch: usize) -> bool {
        self.claimed >= batch
    }
}

enum Outcome {
    Sent,
    Retried,
    Failed,
    Lost,
}

pub fn batch_size(core: &CoreState) -> usize {
    core.config.delivery.workers.max(1) * CLAIMS_PER_WORKER
}

/// Run one delivery cycle at `now`.
pub async fn run_delivery_cycle(
    core: &CoreState,
    now: DateTime<Utc>,
) -> Result<CycleReport, DeliveryError> {
    let config = &core.config.delivery;
    if !config.enabled {
        return Ok(CycleReport::default());
    }
    let lease = Duration::seconds(config.claim_lease_secs as i64);

    let (recovered, claims) = {
        let conn = core.db()?;
        let recovered = fail_exhausted_claims(&conn, now, lease)?;
        let claims = claim_due_notifications(&conn, now, lease, batch_size(core))?;
        (recovered, claims)
    };

    for id in &recovered {
        tracing::error!(
            notification_id = %id,
            "Critical finding alert FAILED: worker lease expired with no attempts left"
        );
    }

    let mut report = CycleReport {
        claimed: claims.len(),
        recovered: recovered.len(),
        ..Default::default()
    };
    if claims.is_empty() {
        return Ok(report);
    }

    let outcomes: Vec<Result<Outcome, DeliveryError>> = stream::iter(claims)
        .map(|claim| deliver(core, claim, now))
        .buffer_unordered(config.workers.max(1))
        .collect()
        .await;

    for outcome in outcomes {
        match outcome? {
            Outcome::Sent => report.sent += 1,
            Outcome::Retried => report.retried += 1,
            Outcome::Failed => report.failed += 1,
            Outcome::Lost => report.lost += 1,
        }
    }
    Ok(report)
}

/// Longest a single send may take. The outcome has to be recorded while
/// the claim is still live.
fn send_deadline(core: &CoreState) -> StdDuration {
    let lease = core.config.delivery.claim_lease_secs.max(2);
    StdDuration::from_secs(lease / 2)
}

async fn deliver(
    core: &CoreState,
    claim: ClaimedDelivery,
    now: DateTime<Utc>,
) -> Result<Outcome, DeliveryError> {
    let message = EmailMessage {
        from: sender_line(&core.config.delivery),
        to: claim.recipient_email.clone(),
        subject: claim.subject.clone(),
        html: claim.body_html.clone(),
        text: claim.body_text.clone(),
        priority: claim.priority,
    };
    let gateway = core.gateway();
    let started = Instant::now();

    let result: Result<SendReceipt, GatewayError> =
        match tokio::time::timeout(send_deadline(core), gateway.send(&message)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Transient(format!(
                "{} gateway did not answer within {}s",
                gateway.name(),
                send_deadline(core).as_secs()
            ))),
        };

    // Outcomes are stamped when the gateway answered, not when the cycle began.
    let elapsed = Duration::from_std(started.elapsed()).unwrap_or_else(|_| Duration::zero());
    let finished = now + elapsed;
    let conn = core.db()?;
    let recipient = mask_email(&claim.recipient_email);

    let outcome = match result {
        Ok(receipt) => {
            if mark_sent(&conn, &claim, finished)? {
                tracing::info!(
                    notification_id = %claim.id,
                    attempt = claim.attempt,
                    priority = %claim.priority,
                    recipient = %recipient,
                    message_id = receipt.message_id.as_deref().unwrap_or("-"),
                    "Critical finding alert sent"
                );
                Outcome::Sent
            } else {
                Outcome::Lost
            }
        }
        Err(GatewayError::Transient(error)) if claim.attempt < claim.attempt_limit => {
            let delay = Backoff::from_config(&core.config.delivery).jittered(claim.attempt);
            let next = finished + Duration::milliseconds(delay.as_millis() as i64);
            if schedule_retry(&conn, &claim, &error, next, finished)? {
                tracing::warn!(
                    notification_id = %claim.id,
                    attempt = claim.attempt,
                    max_attempts = claim.attempt_limit,
                    retry_in_secs = delay.as_secs(),
                    error = %error,
                    "Alert delivery failed, retry scheduled"
                );
                Outcome::Retried
            } else {
                Outcome::Lost
            }
        }
        Err(err) => {
            let error = match &err {
                GatewayError::Transient(e) => {
                    format!("retries exhausted after {} attempts: {e}", claim.attempt)
                }
                GatewayError::Permanent(e) => format!("rejected by gateway: {e}"),
            };
            if mark_failed(&conn, &claim, &error, finished)? {
                tracing::error!(
                    notification_id = %claim.id,
                    attempt = claim.attempt,
                    priority = %claim.priority,
                    recipient = %recipient,
                    error = %error,
                    "Critical finding alert FAILED, manual action required"
                );
                Outcome::Failed
            } else {
                Outcome::Lost
            }
        }
    };

    if matches!(outcome, Outcome::Lost) {
        tracing::warn!(notification_id = %claim.id, "Claim expired before outcome was recorded");
    }
    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use chrono::TimeZone;
    use futures_util::future::BoxFuture;

    use super::*;
    use crate::config::AppConfig;
    use crate::db::repository::{list_audit_for, require_notification};
    use crate::db::sqlite::open_memory_database;
    use crate::delivery::gateway::EmailGateway;
    use crate::intelligence::{Detector, KeywordCorpus};
    use crate::models::enums::{AuditAction, NotificationStatus, Role};
    use crate::models::ReportMetadata;
    use crate::notification::{on_report_generated, ReportGenerated, TriggerOutcome};

    /// Gateway that replays a script of results and records what it sent.
    pub(crate) struct ScriptedGateway {
        script: Mutex<VecDeque<Result<SendReceipt, GatewayError>>>,
        pub sent: Mutex<Vec<EmailMessage>>,
    }

    impl ScriptedGateway {
        pub(crate) fn new(script: Vec<Result<SendReceipt, GatewayError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn always_ok() -> Self {
            Self::new(Vec::new())
        }
    }

    impl EmailGateway for ScriptedGateway {
        fn name(&self) -> &str {
            "scripted"
        }

        fn send<'a>(
            &'a self,
            message: &'a EmailMessage,
        ) -> BoxFuture<'a, Result<SendReceipt, GatewayError>> {
            self.sent.lock().unwrap().push(message.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(SendReceipt::default()));
            Box::pin(async move { next })
        }
    }

    /// Gateway that accepts every message after a fixed delay.
    struct SlowGateway(StdDuration);

    impl EmailGateway for SlowGateway {
        fn name(&self) -> &str {
            "slow"
        }

        fn send<'a>(
            &'a self,
            _message: &'a EmailMessage,
        ) -> BoxFuture<'a, Result<SendReceipt, GatewayError>> {
            let delay = self.0;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(SendReceipt::default())
            })
        }
    }

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    pub(crate) fn core_with(gateway: Arc<dyn EmailGateway>, config: AppConfig) -> CoreState {
        CoreState::with_parts(
            open_memory_database().unwrap(),
            config,
            Detector::new(KeywordCorpus::builtin().unwrap(), 5),
            gateway,
        )
    }

    /// Create a critical alert stamped at [`t0`].
    pub(crate) fn trigger(core: &CoreState, report_id: &str, recipient: &str) -> uuid::Uuid {
        let event = ReportGenerated {
            report_id: report_id.into(),
            report_text: "CT demonstrates acute subdural hematoma with mass effect.".into(),
            indication: None,
            recipient_email: recipient.into(),
            recipient_role: Role::Doctor,
            sent_by: Some("rad@hospital.org".into()),
            metadata: ReportMetadata {
                accession: Some("ACC-7".into()),
                ..Default::default()
            },
        };
        let conn = core.db().unwrap();
        let outcome = on_report_generated(&conn, core.detector(), &core.config, &event, t0());
        match outcome {
            TriggerOutcome::Created { notification_id, .. } => notification_id,
            other => panic!("expected Created, got {other:?}"),
        }
    }

    fn timeout() -> Result<SendReceipt, GatewayError> {
        Err(GatewayError::Transient("request timed out after 10s".into()))
    }

    #[tokio::test]
    async fn success_marks_sent() {
        let gateway = Arc::new(ScriptedGateway::always_ok());
        let core = core_with(gateway.clone(), AppConfig::default());
        let id = trigger(&core, "r-1", "doc@hospital.org");

        let report = run_delivery_cycle(&core, t0()).await.unwrap();
        assert_eq!(report.sent, 1);

        let n = require_notification(&core.db().unwrap(), &id).unwrap();
        assert_eq!(n.status, NotificationStatus::Sent);
        assert_eq!(n.delivery_attempts, 1);
        assert!(n.sent_at.is_some());

        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "doc@hospital.org");
        assert!(sent[0].subject.starts_with("[CRITICAL]"));
    }

    #[tokio::test]
    async fn sent_at_reflects_when_gateway_answered() {
        let core = core_with(
            Arc::new(SlowGateway(StdDuration::from_millis(300))),
            AppConfig::default(),
        );
        let id = trigger(&core, "r-1", "doc@hospital.org");

        let report = run_delivery_cycle(&core, t0()).await.unwrap();
        assert_eq!(report.sent, 1);

        let n = require_notification(&core.db().unwrap(), &id).unwrap();
        let sent_at = n.sent_at.unwrap();
        assert!(sent_at - t0() >= Duration::milliseconds(300));
    }

    #[tokio::test]
    async fn three_timeouts_end_in_failed() {
        let gateway = Arc::new(ScriptedGateway::new(vec![timeout(), timeout(), timeout()]));
        let mut config = AppConfig::default();
        config.delivery.max_attempts = 3;
        let core = core_with(gateway.clone(), config);
        let id = trigger(&core, "r-1", "doc@hospital.org");

        // Far enough apart that every backoff has elapsed.
        let first = run_delivery_cycle(&core, t0()).await.unwrap();
        assert_eq!(first.retried, 1);
        let second = run_delivery_cycle(&core, t0() + Duration::hours(1)).await.unwrap();
        assert_eq!(second.retried, 1);
        let third = run_delivery_cycle(&core, t0() + Duration::hours(2)).await.unwrap();
        assert_eq!(third.failed, 1);

        let n = require_notification(&core.db().unwrap(), &id).unwrap();
        assert_eq!(n.status, NotificationStatus::Failed);
        assert_eq!(n.delivery_attempts, 3);
        assert!(n.last_error.as_deref().unwrap().contains("timed out"));

        // Nothing further is attempted.
        let fourth = run_delivery_cycle(&core, t0() + Duration::hours(3)).await.unwrap();
        assert_eq!(fourth.claimed, 0);
        assert_eq!(gateway.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn retry_waits_for_backoff() {
        let gateway = Arc::new(ScriptedGateway::new(vec![timeout()]));
        let core = core_with(gateway, AppConfig::default());
        let id = trigger(&core, "r-1", "doc@hospital.org");

        run_delivery_cycle(&core, t0()).await.unwrap();
        let early = run_delivery_cycle(&core, t0() + Duration::seconds(5)).await.unwrap();
        assert_eq!(early.claimed, 0);

        let n = require_notification(&core.db().unwrap(), &id).unwrap();
        let due = n.next_attempt_at.unwrap();
        assert!(due >= t0() + Duration::seconds(27) && due <= t0() + Duration::seconds(33));

        let later = run_delivery_cycle(&core, due).await.unwrap();
        assert_eq!(later.sent, 1);
    }

    #[tokio::test]
    async fn permanent_rejection_fails_immediately() {
        let gateway = Arc::new(ScriptedGateway::new(vec![Err(GatewayError::Permanent(
            "HTTP 422: invalid recipient".into(),
        ))]));
        let core = core_with(gateway, AppConfig::default());
        let id = trigger(&core, "r-1", "doc@hospital.org");

        let report = run_delivery_cycle(&core, t0()).await.unwrap();
        assert_eq!(report.failed, 1);
        let n = require_notification(&core.db().unwrap(), &id).unwrap();
        assert_eq!(n.status, NotificationStatus::Failed);
        assert_eq!(n.delivery_attempts, 1);
    }

    #[tokio::test]
    async fn disabled_delivery_leaves_rows_pending() {
        let gateway = Arc::new(ScriptedGateway::always_ok());
        let mut config = AppConfig::default();
        config.delivery.enabled = false;
        let core = core_with(gateway.clone(), config);
        let id = trigger(&core, "r-1", "doc@hospital.org");

        let report = run_delivery_cycle(&core, t0()).await.unwrap();
        assert_eq!(report, CycleReport::default());
        let n = require_notification(&core.db().unwrap(), &id).unwrap();
        assert_eq!(n.status, NotificationStatus::Pending);
        assert!(gateway.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn distinct_notifications_delivered_in_one_cycle() {
        let gateway = Arc::new(ScriptedGateway::always_ok());
        let core = core_with(gateway.clone(), AppConfig::default());
        for i in 0..5 {
            trigger(&core, &format!("r-{i}"), "doc@hospital.org");
        }
        let report = run_delivery_cycle(&core, t0()).await.unwrap();
        assert_eq!(report.sent, 5);
        assert_eq!(gateway.sent.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn every_attempt_is_audited() {
        let gateway = Arc::new(ScriptedGateway::new(vec![timeout()]));
        let core = core_with(gateway, AppConfig::default());
        let id = trigger(&core, "r-1", "doc@hospital.org");
        run_delivery_cycle(&core, t0()).await.unwrap();
        run_delivery_cycle(&core, t0() + Duration::hours(1)).await.unwrap();

        let actions: Vec<AuditAction> = list_audit_for(&core.db().unwrap(), &id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![AuditAction::Created, AuditAction::DeliveryFailed, AuditAction::Sent]
        );
    }
}
