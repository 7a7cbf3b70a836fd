//! Versioned keyword corpus: phrase → (severity, category).
//!
//! A corpus is an immutable value. It is loaded once, validated, and
//! handed to the detector explicitly; nothing here is global.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::detection::tokenize;
use crate::models::enums::{FindingCategory, Severity};

const BUNDLED_CORPUS: &str = include_str!("../../resources/corpus/critical_findings.json");

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("Cannot read corpus file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corpus is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Malformed corpus: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct CorpusFile {
    version: String,
    entries: Vec<RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    phrase: String,
    severity: Severity,
    category: FindingCategory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    pub phrase: String,
    pub severity: Severity,
    pub category: FindingCategory,
    /// Lowercased phrase tokens, matched as a contiguous sequence.
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct KeywordCorpus {
    version: String,
    fingerprint: String,
    entries: Vec<CorpusEntry>,
    by_first_token: HashMap<String, Vec<usize>>,
}

impl KeywordCorpus {
    /// The corpus compiled into the binary.
    pub fn builtin() -> Result<Self, CorpusError> {
        Self::from_json(BUNDLED_CORPUS)
    }

    pub fn load(path: &Path) -> Result<Self, CorpusError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, CorpusError> {
        let file: CorpusFile = serde_json::from_str(raw)?;
        let version = file.version.trim().to_string();
        if version.is_empty() {
            return Err(CorpusError::Malformed("empty version".into()));
        }
        if file.entries.is_empty() {
            return Err(CorpusError::Malformed("no entries".into()));
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::with_capacity(file.entries.len());
        for raw in file.entries {
            let tokens: Vec<String> = tokenize(&raw.phrase).into_iter().map(|t| t.norm).collect();
            if tokens.is_empty() {
                return Err(CorpusError::Malformed(format!(
                    "phrase {:?} has no matchable tokens",
                    raw.phrase
                )));
            }
            if !seen.insert(tokens.clone()) {
                return Err(CorpusError::Malformed(format!(
                    "duplicate phrase {:?}",
                    raw.phrase
                )));
            }
            entries.push(CorpusEntry {
                phrase: tokens.join(" "),
                severity: raw.severity,
                category: raw.category,
                tokens,
            });
        }

        let mut by_first_token: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            by_first_token
                .entry(entry.tokens[0].clone())
                .or_default()
                .push(idx);
        }

        Ok(Self {
            fingerprint: fingerprint(&version, &entries),
            version,
            entries,
            by_first_token,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// SHA-256 over the version and normalized entries, hex encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose phrase starts with `token`.
    pub(crate) fn candidates(&self, token: &str) -> impl Iterator<Item = &CorpusEntry> {
        self.by_first_token
            .get(token)
            .into_iter()
            .flatten()
            .map(|&idx| &self.entries[idx])
    }
}

fn fingerprint(version: &str, entries: &[CorpusEntry]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.as_bytes());
    hasher.update(b"\n");
    for entry in entries {
        hasher.update(entry.phrase.as_bytes());
        hasher.update(b"|");
        hasher.update(entry.severity.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(entry.category.as_str().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
