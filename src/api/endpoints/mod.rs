//! API endpoint handlers.
//!
//! Handlers stay thin: parse the request, lock the database, delegate to
//! `notification::service`.

pub mod health;
pub mod notifications;
pub mod reports;
