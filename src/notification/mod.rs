//! Critical finding notifications: message composition, the status
//! state machine, and the operations that drive a notification through it.

pub mod composer;
pub mod lifecycle;
pub mod service;

pub use composer::{compose, ComposeError, ComposedMessage, ReportContext};
pub use lifecycle::{can_transition, ensure_transition};
pub use service::{
    on_report_generated, save_report_with_alert, Caller, LifecycleError, ListQuery,
    ReportGenerated, TriggerOutcome,
};
