//! Critical findings detector.
//!
//! Scans free text for corpus phrases, matched as contiguous token
//! sequences inside one sentence, and scores each match. Negated
//! matches are emitted with suppressed confidence, never dropped.
//! Deciding whether to notify is the policy's job.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::corpus::{CorpusEntry, KeywordCorpus};
use super::types::{DetectionOutcome, Finding, Span};
use crate::config::DetectionConfig;

/// Preceding tokens inspected for negation, hedging and certainty cues.
pub const DEFAULT_NEGATION_WINDOW: usize = 5;

/// Subtracted from a negated match before clamping.
pub const NEGATION_PENALTY: f32 = 0.6;

/// Upper bound on a negated match's confidence. Notification thresholds
/// must stay above this value.
pub const NEGATED_CONFIDENCE_CEILING: f32 = 0.4;

const SINGLE_TOKEN_CONFIDENCE: f32 = 0.75;
const TWO_TOKEN_CONFIDENCE: f32 = 0.9;
const LONG_PHRASE_CONFIDENCE: f32 = 0.95;
const CERTAINTY_BONUS: f32 = 0.05;
const REPEAT_BONUS: f32 = 0.05;
const HEDGE_PENALTY: f32 = 0.15;

const NEGATION_MARKERS: &[&[&str]] = &[
    &["no"],
    &["not"],
    &["nor"],
    &["without"],
    &["negative", "for"],
    &["rule", "out"],
    &["ruled", "out"],
    &["absence", "of"],
    &["free", "of"],
    &["resolution", "of"],
];

const CERTAINTY_CUES: &[&[&str]] = &[
    &["acute"],
    &["active"],
    &["confirmed"],
    &["definite"],
    &["definitive"],
    &["demonstrates"],
    &["demonstrated"],
    &["identified"],
    &["consistent", "with"],
    &["evidence", "of"],
];

const HEDGE_CUES: &[&[&str]] = &[
    &["possible"],
    &["possibly"],
    &["questionable"],
    &["equivocal"],
    &["may"],
    &["might"],
    &["cannot", "exclude"],
];

/// A cue window never reaches back past one of these.
const WINDOW_TERMINATORS: &[&str] = &["but", "however", "although", "though", "except"];

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").unwrap());

// ---------------------------------------------------------------------------
// Tokenization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    /// Lowercased token text.
    pub norm: String,
    pub start: usize,
    pub end: usize,
    pub sentence: usize,
}

/// Split text into lowercased word tokens, tagged with a sentence index.
pub(crate) fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut sentence = 0;
    let mut prev_end: Option<usize> = None;

    for m in TOKEN_RE.find_iter(text) {
        if let Some(end) = prev_end {
            if gap_breaks_sentence(text, end, m.start()) {
                sentence += 1;
            }
        }
        tokens.push(Token {
            norm: m.as_str().to_lowercase(),
            start: m.start(),
            end: m.end(),
            sentence,
        });
        prev_end = Some(m.end());
    }
    tokens
}

/// Sentences end at `!`, `?`, `;`, a period followed by whitespace, or a
/// blank line. A single newline is a wrapped line, not a break.
///
/// Judged against the whole text: the char after a gap's last `.` is the
/// next token, as in `3.5`.
fn gap_breaks_sentence(text: &str, start: usize, end: usize) -> bool {
    text[start..end]
        .char_indices()
        .any(|(i, c)| is_boundary_at(text, start + i, c))
}

fn is_boundary_at(text: &str, idx: usize, c: char) -> bool {
    let rest = &text[idx + c.len_utf8()..];
    match c {
        '!' | '?' | ';' => true,
        '.' => rest.chars().next().map_or(true, char::is_whitespace),
        '\n' => rest
            .chars()
            .take_while(|n| n.is_whitespace())
            .any(|n| n == '\n'),
        _ => false,
    }
}

/// Bounds of the sentence enclosing `span`, trailing punctuation included.
///
/// `span` must lie on char boundaries of `text`.
pub fn sentence_bounds(text: &str, span: Span) -> Span {
    let start = text[..span.start]
        .char_indices()
        .rev()
        .find(|&(i, c)| is_boundary_at(text, i, c))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    let end = text[span.end..]
        .char_indices()
        .find(|&(i, c)| is_boundary_at(text, span.end + i, c))
        .map(|(i, c)| {
            let at = span.end + i;
            if matches!(c, '.' | '!' | '?') {
                at + c.len_utf8()
            } else {
                at
            }
        })
        .unwrap_or(text.len());
    Span { start, end }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

struct PhraseMatch<'c> {
    entry: &'c CorpusEntry,
    first: usize,
    last: usize,
}

impl PhraseMatch<'_> {
    fn token_len(&self) -> usize {
        self.last - self.first + 1
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Cues {
    negated: bool,
    certain: bool,
    hedged: bool,
}

/// All phrase occurrences, longest match winning on overlap, in text order.
fn find_matches<'c>(tokens: &[Token], corpus: &'c KeywordCorpus) -> Vec<PhraseMatch<'c>> {
    let mut candidates = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        for entry in corpus.candidates(&token.norm) {
            let n = entry.tokens.len();
            let Some(run) = tokens.get(i..i + n) else {
                continue;
            };
            let same_sentence = run[n - 1].sentence == token.sentence;
            if same_sentence && run.iter().zip(&entry.tokens).all(|(t, e)| t.norm == *e) {
                candidates.push(PhraseMatch {
                    entry,
                    first: i,
                    last: i + n - 1,
                });
            }
        }
    }

    candidates.sort_by(|a, b| {
        b.token_len()
            .cmp(&a.token_len())
            .then(a.first.cmp(&b.first))
            .then(b.entry.severity.rank().cmp(&a.entry.severity.rank()))
    });

    let mut taken = vec![false; tokens.len()];
    let mut accepted = Vec::new();
    for candidate in candidates {
        if taken[candidate.first..=candidate.last].iter().any(|&t| t) {
            continue;
        }
        taken[candidate.first..=candidate.last]
            .iter_mut()
            .for_each(|t| *t = true);
        accepted.push(candidate);
    }
    accepted.sort_by_key(|m| m.first);
    accepted
}

fn contains_cue(words: &[&str], cues: &[&[&str]]) -> bool {
    cues.iter()
        .any(|cue| words.windows(cue.len()).any(|w| w == *cue))
}

fn inspect_window(tokens: &[Token], first: usize, window: usize) -> Cues {
    let sentence = tokens[first].sentence;
    let mut lo = first;
    while lo > 0 && first - lo < window {
        let prev = &tokens[lo - 1];
        if prev.sentence != sentence || WINDOW_TERMINATORS.contains(&prev.norm.as_str()) {
            break;
        }
        lo -= 1;
    }
    let words: Vec<&str> = tokens[lo..first].iter().map(|t| t.norm.as_str()).collect();
    Cues {
        negated: contains_cue(&words, NEGATION_MARKERS),
        certain: contains_cue(&words, CERTAINTY_CUES),
        hedged: contains_cue(&words, HEDGE_CUES),
    }
}

fn base_confidence(token_len: usize) -> f32 {
    match token_len {
        1 => SINGLE_TOKEN_CONFIDENCE,
        2 => TWO_TOKEN_CONFIDENCE,
        _ => LONG_PHRASE_CONFIDENCE,
    }
}

fn score(token_len: usize, cues: Cues, repeated: bool) -> f32 {
    let base = base_confidence(token_len);
    if cues.negated {
        return (base - NEGATION_PENALTY).clamp(0.0, NEGATED_CONFIDENCE_CEILING);
    }
    let mut confidence = base;
    if cues.certain {
        confidence += CERTAINTY_BONUS;
    }
    if cues.hedged {
        confidence -= HEDGE_PENALTY;
    }
    if repeated {
        confidence += REPEAT_BONUS;
    }
    confidence.clamp(0.0, 1.0)
}

/// Scan `text` against `corpus`. Pure and deterministic.
pub fn detect(text: &str, corpus: &KeywordCorpus, negation_window: usize) -> Vec<Finding> {
    let tokens = tokenize(text);
    let matches = find_matches(&tokens, corpus);

    let scored: Vec<(&PhraseMatch<'_>, Cues)> = matches
        .iter()
        .map(|m| (m, inspect_window(&tokens, m.first, negation_window)))
        .collect();

    let mut affirmed: HashMap<&str, usize> = HashMap::new();
    for (m, cues) in &scored {
        if !cues.negated {
            *affirmed.entry(m.entry.phrase.as_str()).or_default() += 1;
        }
    }

    scored
        .into_iter()
        .map(|(m, cues)| {
            let repeated = affirmed.get(m.entry.phrase.as_str()).copied().unwrap_or(0) > 1;
            Finding {
                phrase: m.entry.phrase.clone(),
                category: m.entry.category,
                severity: m.entry.severity,
                confidence: score(m.token_len(), cues, repeated),
                span: Span {
                    start: tokens[m.first].start,
                    end: tokens[m.last].end,
                },
                negated: cues.negated,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Detector: versioned corpus catalog
// ---------------------------------------------------------------------------

/// Holds every loaded corpus version and the one used for new reports.
///
/// When no corpus could be loaded the detector runs degraded: every scan
/// returns no findings with `degraded = true`.
#[derive(Debug, Clone)]
pub struct Detector {
    catalog: BTreeMap<String, Arc<KeywordCorpus>>,
    active: Option<String>,
    negation_window: usize,
    load_error: Option<String>,
}

impl Detector {
    pub fn new(corpus: KeywordCorpus, negation_window: usize) -> Self {
        let version = corpus.version().to_string();
        let mut catalog = BTreeMap::new();
        catalog.insert(version.clone(), Arc::new(corpus));
        Self {
            catalog,
            active: Some(version),
            negation_window: negation_window.max(1),
            load_error: None,
        }
    }

    /// A detector with no usable corpus.
    pub fn degraded(reason: impl Into<String>, negation_window: usize) -> Self {
        Self {
            catalog: BTreeMap::new(),
            active: None,
            negation_window: negation_window.max(1),
            load_error: Some(reason.into()),
        }
    }

    /// Load the configured corpus, or the bundled one. Never fails: a load
    /// error is logged and the detector starts degraded.
    pub fn from_config(config: &DetectionConfig) -> Self {
        let builtin = KeywordCorpus::builtin();
        let loaded = match &config.corpus_path {
            Some(path) => KeywordCorpus::load(path),
            None => KeywordCorpus::builtin(),
        };

        match loaded {
            Ok(corpus) => {
                tracing::info!(
                    version = corpus.version(),
                    fingerprint = corpus.fingerprint(),
                    entries = corpus.len(),
                    "Keyword corpus loaded"
                );
                let mut detector = Self::new(corpus, config.negation_window);
                if let Ok(builtin) = builtin {
                    detector.register(builtin);
                }
                detector
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = ?config.corpus_path,
                    "Keyword corpus unavailable, detection degraded"
                );
                let mut detector = Self::degraded(e.to_string(), config.negation_window);
                // The bundled version stays replayable for audits.
                if let Ok(builtin) = builtin {
                    detector.register(builtin);
                }
                detector
            }
        }
    }

    /// Make another corpus version available to [`Detector::detect_with_version`].
    /// The active version is unchanged.
    pub fn register(&mut self, corpus: KeywordCorpus) {
        self.catalog
            .entry(corpus.version().to_string())
            .or_insert_with(|| Arc::new(corpus));
    }

    pub fn active_version(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_corpus(&self) -> Option<Arc<KeywordCorpus>> {
        self.active
            .as_ref()
            .and_then(|v| self.catalog.get(v))
            .cloned()
    }

    pub fn is_degraded(&self) -> bool {
        self.active_corpus().is_none()
    }

    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> {
        self.catalog.keys().map(String::as_str)
    }

    /// Scan with the active corpus.
    pub fn detect(&self, text: &str) -> DetectionOutcome {
        match self.active.as_deref() {
            Some(version) => self.detect_with_version(text, version),
            None => DetectionOutcome::degraded(),
        }
    }

    /// Scan with a specific corpus version. An unknown version degrades.
    pub fn detect_with_version(&self, text: &str, corpus_version: &str) -> DetectionOutcome {
        match self.catalog.get(corpus_version) {
            Some(corpus) => DetectionOutcome {
                findings: detect(text, corpus, self.negation_window),
                corpus_version: Some(corpus.version().to_string()),
                degraded: false,
            },
            None => {
                tracing::warn!(corpus_version, "Requested corpus version not loaded");
                DetectionOutcome::degraded()
            }
        }
    }
}
