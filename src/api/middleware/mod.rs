//! API middleware stack.
//!
//! Execution order (outermost → innermost):
//! 1. Caller identity: parses upstream identity headers
//! 2. Access log: records caller, route and status

pub mod audit;
pub mod auth;
