//! Background tasks: the delivery loop and the escalation sweep.
//!
//! Both run as tokio tasks until shutdown is signalled. The delivery loop
//! sleeps until the next retry is due (bounded by the poll interval) and
//! wakes early when new pending work is written.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::escalation::run_escalation_sweep;
use super::worker::{batch_size, run_delivery_cycle};
use crate::core_state::CoreState;
use crate::db::repository::next_due_at;

/// Handle for the running background tasks.
pub struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Signal shutdown and wait for both loops to finish their current cycle.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Background tasks stopped");
    }
}

pub fn start_background_tasks(core: Arc<CoreState>) -> BackgroundTasks {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handles = vec![
        tokio::spawn(delivery_loop(core.clone(), shutdown_rx.clone())),
        tokio::spawn(escalation_loop(core, shutdown_rx)),
    ];

    BackgroundTasks {
        shutdown_tx,
        handles,
    }
}

/// Time until the next retry is due, bounded by `poll`.
fn next_wait(core: &CoreState, poll: Duration) -> Duration {
    let due = core.db().ok().and_then(|conn| next_due_at(&conn).ok().flatten());
    match due {
        Some(due) => (due - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(poll),
        None => poll,
    }
}

async fn delivery_loop(core: Arc<CoreState>, mut shutdown: watch::Receiver<bool>) {
    let poll = Duration::from_secs(core.config.delivery.poll_interval_secs.max(1));
    tracing::info!(
        workers = core.config.delivery.workers,
        enabled = core.config.delivery.enabled,
        gateway = core.gateway().name(),
        "Delivery worker started"
    );

    while !*shutdown.borrow() {
        let wait = match run_delivery_cycle(&core, Utc::now()).await {
            Ok(report) => {
                if report.claimed > 0 || report.recovered > 0 {
                    tracing::debug!(?report, "Delivery cycle finished");
                }
                if report.saturated(batch_size(&core)) {
                    Duration::ZERO
                } else {
                    next_wait(&core, poll)
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Delivery cycle failed");
                poll
            }
        };

        if wait.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = core.delivery_wakeup().notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    tracing::info!("Delivery worker shutting down");
}

async fn escalation_loop(core: Arc<CoreState>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        core.config.escalation.sweep_interval_secs.max(1),
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                if let Err(e) = run_escalation_sweep(&core, Utc::now()) {
                    tracing::error!(error = %e, "Escalation sweep failed");
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
    }
    tracing::info!("Escalation sweep shutting down");
}
