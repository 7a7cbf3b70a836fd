use thiserror::Error;

use crate::core_state::CoreError;
use crate::db::DatabaseError;

/// Outcome class of one gateway call. Drives retry vs. give up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Timeouts, connection errors, 5xx, throttling. Retried with backoff.
    #[error("Transient gateway failure: {0}")]
    Transient(String),

    /// The gateway rejected the message itself. Never retried.
    #[error("Permanent gateway failure: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("State error: {0}")]
    State(#[from] CoreError),
}
