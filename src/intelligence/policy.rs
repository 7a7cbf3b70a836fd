//! Notification policy: pure decision over detector output.

use serde::{Deserialize, Serialize};

use super::types::Finding;
use crate::models::enums::Severity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// A finding qualifies at or above this confidence.
    pub min_confidence: f32,
    /// Whether `high` findings alone trigger a notification.
    pub notify_on_high: bool,
    /// Carry confident `high` findings along once something else triggered.
    pub include_high_when_triggered: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            notify_on_high: false,
            include_high_when_triggered: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub notify: bool,
    /// Highest severity among triggering findings.
    pub priority: Option<Severity>,
    /// Findings the recipient is told about, in text order.
    pub reported: Vec<Finding>,
}

impl PolicyDecision {
    fn silent() -> Self {
        Self {
            notify: false,
            priority: None,
            reported: Vec::new(),
        }
    }
}

fn triggers(severity: Severity, config: &PolicyConfig) -> bool {
    match severity {
        Severity::Critical | Severity::Urgent => true,
        Severity::High => config.notify_on_high,
    }
}

pub fn should_notify(findings: &[Finding], config: &PolicyConfig) -> PolicyDecision {
    let confident = |f: &&Finding| !f.negated && f.confidence >= config.min_confidence;

    let priority = findings
        .iter()
        .filter(confident)
        .filter(|f| triggers(f.severity, config))
        .map(|f| f.severity)
        .max_by_key(Severity::rank);

    let Some(priority) = priority else {
        return PolicyDecision::silent();
    };

    let reported = findings
        .iter()
        .filter(confident)
        .filter(|f| triggers(f.severity, config) || config.include_high_when_triggered)
        .cloned()
        .collect();

    PolicyDecision {
        notify: true,
        priority: Some(priority),
        reported,
    }
}
