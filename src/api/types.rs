//! Shared types for the API layer.

use std::sync::Arc;

use crate::core_state::CoreState;

pub use crate::notification::Caller;

/// Header carrying the authenticated caller's email address.
pub const USER_EMAIL_HEADER: &str = "x-user-email";
/// Header carrying the authenticated caller's role.
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Shared context for all API routes and middleware.
#[derive(Clone)]
pub struct ApiContext {
    pub core: Arc<CoreState>,
}

impl ApiContext {
    pub fn new(core: Arc<CoreState>) -> Self {
        Self { core }
    }
}
