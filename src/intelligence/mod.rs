//! Findings detection: keyword corpus, detector, notification policy.

pub mod corpus;
pub mod detection;
pub mod policy;
pub mod types;

pub use corpus::{CorpusError, KeywordCorpus};
pub use detection::Detector;
pub use policy::{should_notify, PolicyConfig, PolicyDecision};
pub use types::{DetectionOutcome, Finding, Span};
