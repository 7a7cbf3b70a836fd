//! Email delivery: the gateway seam, retry backoff, the claim-based worker
//! pool and the acknowledgment SLA sweep.

pub mod background;
pub mod backoff;
pub mod error;
pub mod escalation;
pub mod gateway;
pub mod worker;

pub use background::{start_background_tasks, BackgroundTasks};
pub use backoff::Backoff;
pub use error::{DeliveryError, GatewayError};
pub use escalation::run_escalation_sweep;
pub use gateway::{EmailGateway, EmailMessage, HttpEmailGateway, SendReceipt, UnconfiguredGateway};
pub use worker::{run_delivery_cycle, CycleReport};
