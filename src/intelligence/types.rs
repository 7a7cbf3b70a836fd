use serde::{Deserialize, Serialize};

use crate::models::enums::{FindingCategory, Severity};

/// Byte offsets `[start, end)` into the scanned text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One corpus phrase matched in a report.
///
/// Negated matches are kept with a confidence below the notification
/// threshold so the audit shows what the detector saw and rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub phrase: String,
    pub category: FindingCategory,
    pub severity: Severity,
    pub confidence: f32,
    pub span: Span,
    pub negated: bool,
}

/// Result of scanning one text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionOutcome {
    pub findings: Vec<Finding>,
    /// Corpus version used; `None` when no corpus could be resolved.
    pub corpus_version: Option<String>,
    /// Corpus unavailable: findings are empty because detection did not run.
    pub degraded: bool,
}

impl DetectionOutcome {
    pub fn degraded() -> Self {
        Self {
            findings: Vec::new(),
            corpus_version: None,
            degraded: true,
        }
    }
}
