//! Shared application state.
//!
//! One `CoreState` is built at startup, wrapped in `Arc`, and shared by the
//! HTTP API and the background delivery/escalation tasks. The SQLite
//! connection sits behind a `Mutex`; guards are never held across `.await`.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::Connection;
use tokio::sync::Notify;

use crate::config::AppConfig;
use crate::db::{self, DatabaseError};
use crate::delivery::gateway::{EmailGateway, HttpEmailGateway, UnconfiguredGateway};
use crate::intelligence::Detector;
use crate::notification::{self, ReportGenerated, TriggerOutcome};

pub struct CoreState {
    db: Mutex<Connection>,
    pub config: AppConfig,
    detector: Detector,
    gateway: Arc<dyn EmailGateway>,
    /// Signalled when new pending work lands, so the worker skips its poll wait.
    delivery_wakeup: Notify,
}

impl CoreState {
    /// Open the configured database, load the corpus, build the gateway.
    pub fn open(config: AppConfig) -> Result<Self, CoreError> {
        let conn = db::open_database(&config.database.path)?;
        let detector = Detector::from_config(&config.detection);

        let gateway: Arc<dyn EmailGateway> = if config.gateway.is_configured() {
            let http = HttpEmailGateway::new(&config.gateway)
                .map_err(|e| CoreError::Gateway(e.to_string()))?;
            Arc::new(http)
        } else {
            tracing::warn!("No email gateway configured; alerts will queue until one is set");
            Arc::new(UnconfiguredGateway)
        };

        Ok(Self::with_parts(conn, config, detector, gateway))
    }

    /// Assemble from pre-built parts (tests, embedding).
    pub fn with_parts(
        conn: Connection,
        config: AppConfig,
        detector: Detector,
        gateway: Arc<dyn EmailGateway>,
    ) -> Self {
        Self {
            db: Mutex::new(conn),
            config,
            detector,
            gateway,
            delivery_wakeup: Notify::new(),
        }
    }

    /// Lock the database connection.
    pub fn db(&self) -> Result<MutexGuard<'_, Connection>, CoreError> {
        self.db.lock().map_err(|_| CoreError::LockPoisoned)
    }

    pub fn detector(&self) -> &Detector {
        &self.detector
    }

    pub fn gateway(&self) -> Arc<dyn EmailGateway> {
        Arc::clone(&self.gateway)
    }

    pub fn delivery_wakeup(&self) -> &Notify {
        &self.delivery_wakeup
    }

    pub fn wake_delivery(&self) {
        self.delivery_wakeup.notify_one();
    }

    /// Report-generated hook bound to this state. Never fails; wakes the
    /// delivery worker when a pending row was written.
    pub fn report_generated(&self, event: &ReportGenerated) -> TriggerOutcome {
        let outcome = match self.db() {
            Ok(conn) => notification::on_report_generated(
                &conn,
                &self.detector,
                &self.config,
                event,
                Utc::now(),
            ),
            Err(e) => {
                tracing::error!(report_id = %event.report_id, error = %e, "Report-generated hook could not reach the database");
                TriggerOutcome::Error { reason: e.to_string() }
            }
        };
        if outcome.has_new_work() {
            self.wake_delivery();
        }
        outcome
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Internal lock error")]
    LockPoisoned,
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Email gateway setup failed: {0}")]
    Gateway(String),
}
