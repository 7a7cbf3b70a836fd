//! Alert message composition.
//!
//! Deterministic: the same findings and report context always render the
//! same subject and bodies. Only the sentences around reported findings
//! are quoted, never the whole report.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::intelligence::detection::sentence_bounds;
use crate::intelligence::types::{Finding, Span};
use crate::models::enums::Severity;
use crate::models::ReportMetadata;

/// Longest quoted sentence, in characters.
pub const EXCERPT_MAX_CHARS: usize = 300;

/// Most sentences quoted in one alert.
pub const MAX_EXCERPT_SENTENCES: usize = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ComposeError {
    #[error("No qualifying findings to compose")]
    NoQualifyingFindings,

    #[error("Finding {phrase:?} has span {start}..{end} outside the report text")]
    InvalidSpan {
        phrase: String,
        start: usize,
        end: usize,
    },
}

pub struct ReportContext<'a> {
    pub report_id: &'a str,
    /// Exactly the text the findings' spans point into.
    pub text: &'a str,
    pub metadata: &'a ReportMetadata,
    pub priority: Severity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedMessage {
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    pub excerpt: String,
    pub categories: BTreeSet<String>,
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "Critical",
        Severity::Urgent => "Urgent",
        Severity::High => "High",
    }
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "#DC2626",
        Severity::Urgent => "#EA580C",
        Severity::High => "#CA8A04",
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Truncate to `max` characters on a char boundary, marking the cut.
fn bounded(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Collapse internal whitespace so wrapped report lines quote cleanly.
fn squash_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn quoted_sentence(text: &str, finding: &Finding) -> Result<String, ComposeError> {
    let span = finding.span;
    let valid = span.start < span.end
        && span.end <= text.len()
        && text.is_char_boundary(span.start)
        && text.is_char_boundary(span.end);
    if !valid {
        return Err(ComposeError::InvalidSpan {
            phrase: finding.phrase.clone(),
            start: span.start,
            end: span.end,
        });
    }
    Ok(excerpt_window(text, span, EXCERPT_MAX_CHARS))
}

/// The sentence around `span`, or when that is longer than `max`, a window
/// of it centred on the span with `…` at each cut end.
fn excerpt_window(text: &str, span: Span, max: usize) -> String {
    let bounds = sentence_bounds(text, span);
    let whole = squash_whitespace(&text[bounds.start..bounds.end]);
    if whole.chars().count() <= max {
        return whole;
    }

    // Byte offset of every char in the sentence, plus its end.
    let offsets: Vec<usize> = text[bounds.start..bounds.end]
        .char_indices()
        .map(|(i, _)| bounds.start + i)
        .chain(std::iter::once(bounds.end))
        .collect();
    let chars = offsets.len() - 1;
    let first = offsets.partition_point(|&o| o < span.start);
    let last = offsets.partition_point(|&o| o < span.end);

    let budget = max.saturating_sub(2);
    if last - first >= budget {
        return bounded(&squash_whitespace(&text[span.start..span.end]), max);
    }
    let context = budget - (last - first);
    let mut start = first.saturating_sub(context / 2);
    let mut end = (last + context - context / 2).min(chars);
    if end - start < budget {
        if start == 0 {
            end = budget.min(chars);
        } else if end == chars {
            start = chars.saturating_sub(budget);
        }
    }

    let mut out = String::new();
    if start > 0 {
        out.push('…');
    }
    out.push_str(&squash_whitespace(&text[offsets[start]..offsets[end]]));
    if end < chars {
        out.push('…');
    }
    out
}

/// Render subject, bodies and excerpt. All or nothing: any bad finding
/// fails the whole message.
pub fn compose(findings: &[Finding], ctx: &ReportContext<'_>) -> Result<ComposedMessage, ComposeError> {
    if findings.is_empty() {
        return Err(ComposeError::NoQualifyingFindings);
    }

    let mut sentences: Vec<String> = Vec::new();
    let mut quotes = Vec::with_capacity(findings.len());
    for finding in findings {
        let sentence = quoted_sentence(ctx.text, finding)?;
        if !sentences.contains(&sentence) && sentences.len() < MAX_EXCERPT_SENTENCES {
            sentences.push(sentence.clone());
        }
        quotes.push(sentence);
    }

    let categories: BTreeSet<String> = findings
        .iter()
        .map(|f| f.category.as_str().to_string())
        .collect();

    let accession = ctx.metadata.accession.as_deref().unwrap_or("N/A");
    let patient = ctx.metadata.patient_name.as_deref().unwrap_or("Unknown patient");
    let author = ctx.metadata.author.as_deref().unwrap_or("Radiology");

    let subject = format!(
        "{} {} finding - Accession {} - {}",
        ctx.priority.subject_prefix(),
        severity_label(ctx.priority),
        squash_whitespace(accession),
        squash_whitespace(patient),
    );

    let excerpt = sentences.join("\n");

    Ok(ComposedMessage {
        body_text: render_text(findings, &quotes, ctx, accession, patient, author, &excerpt),
        body_html: render_html(findings, &quotes, ctx, accession, patient, author),
        subject,
        excerpt,
        categories,
    })
}

fn render_text(
    findings: &[Finding],
    quotes: &[String],
    ctx: &ReportContext<'_>,
    accession: &str,
    patient: &str,
    author: &str,
    excerpt: &str,
) -> String {
    let lines: Vec<String> = findings
        .iter()
        .zip(quotes)
        .map(|(f, quote)| {
            format!(
                "  - [{}] {} ({}, confidence {:.0}%)\n    \"{}\"",
                f.severity.as_str().to_uppercase(),
                f.phrase,
                f.category,
                f.confidence * 100.0,
                quote
            )
        })
        .collect();

    format!(
        "{label} FINDING ALERT\n\
         \n\
         Patient: {patient}\n\
         Accession: {accession}\n\
         Report: {report_id}\n\
         Reported by: {author}\n\
         \n\
         Findings:\n\
         {findings}\n\
         \n\
         Report excerpt:\n\
         {excerpt}\n\
         \n\
         ACTION REQUIRED: this alert requires acknowledgment. Review the findings \
         and contact the reporting radiologist with any questions.\n",
        label = severity_label(ctx.priority).to_uppercase(),
        report_id = ctx.report_id,
        findings = lines.join("\n"),
    )
}

fn render_html(
    findings: &[Finding],
    quotes: &[String],
    ctx: &ReportContext<'_>,
    accession: &str,
    patient: &str,
    author: &str,
) -> String {
    let items: String = findings
        .iter()
        .zip(quotes)
        .map(|(f, quote)| {
            format!(
                r#"<div style="margin:10px 0;padding:10px;border-left:4px solid {color}">
<strong style="color:{color};text-transform:uppercase">{severity}</strong>: {phrase}<br/>
<small>Category: {category} | Confidence: {confidence:.0}%</small>
<blockquote style="margin:8px 0 0 0;color:#374151">{quote}</blockquote>
</div>
"#,
                color = severity_color(f.severity),
                severity = f.severity,
                phrase = escape_html(&f.phrase),
                category = f.category,
                confidence = f.confidence * 100.0,
                quote = escape_html(quote),
            )
        })
        .collect();

    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"></head>
<body style="font-family:Arial,sans-serif;color:#1F2937;max-width:600px;margin:0 auto;padding:20px">
<h1 style="color:{color};font-size:22px">{label} Finding Alert</h1>
<table style="border-collapse:collapse;margin-bottom:16px">
<tr><td style="font-weight:bold;padding:4px 12px 4px 0">Patient</td><td>{patient}</td></tr>
<tr><td style="font-weight:bold;padding:4px 12px 4px 0">Accession</td><td>{accession}</td></tr>
<tr><td style="font-weight:bold;padding:4px 12px 4px 0">Report</td><td>{report_id}</td></tr>
<tr><td style="font-weight:bold;padding:4px 12px 4px 0">Reported by</td><td>{author}</td></tr>
</table>
<h2 style="font-size:18px">Findings</h2>
{items}<p style="margin-top:24px;padding:12px;background:#FEF3C7;border-left:4px solid #F59E0B">
<strong>Action required:</strong> this alert requires acknowledgment. Review the findings
and contact the reporting radiologist with any questions.</p>
</body>
</html>
"##,
        color = severity_color(ctx.priority),
        label = severity_label(ctx.priority),
        patient = escape_html(patient),
        accession = escape_html(accession),
        report_id = escape_html(ctx.report_id),
        author = escape_html(author),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intelligence::corpus::KeywordCorpus;
    use crate::intelligence::detection::{detect, DEFAULT_NEGATION_WINDOW};
    use crate::intelligence::policy::{should_notify, PolicyConfig};
    use crate::models::enums::FindingCategory;

    fn metadata() -> ReportMetadata {
        ReportMetadata {
            accession: Some("ACC-1042".into()),
            patient_name: Some("Jane <Doe>".into()),
            author: Some("Dr. Rivera".into()),
        }
    }

    fn compose_text(text: &str) -> ComposedMessage {
        let corpus = KeywordCorpus::builtin().unwrap();
        let decision = should_notify(
            &detect(text, &corpus, DEFAULT_NEGATION_WINDOW),
            &PolicyConfig::default(),
        );
        let meta = metadata();
        compose(
            &decision.reported,
            &ReportContext {
                report_id: "r-1",
                text,
                metadata: &meta,
                priority: decision.priority.unwrap(),
            },
        )
        .unwrap()
    }

    #[test]
    fn subject_carries_prefix_and_accession() {
        let msg = compose_text("CT demonstrates acute subdural hematoma with mass effect.");
        assert!(msg.subject.starts_with("[CRITICAL]"));
        assert!(msg.subject.contains("ACC-1042"));
        assert!(msg.subject.contains("Jane <Doe>"));
    }

    #[test]
    fn excerpt_is_the_enclosing_sentence_only() {
        let text = "Heart size normal. CT demonstrates acute subdural hematoma with mass effect. \
                    Bones are unremarkable.";
        let msg = compose_text(text);
        assert_eq!(
            msg.excerpt,
            "CT demonstrates acute subdural hematoma with mass effect."
        );
        assert!(!msg.body_text.contains("Bones are unremarkable"));
        assert!(!msg.body_html.contains("Heart size normal"));
    }

    #[test]
    fn long_sentence_is_bounded() {
        let filler = "with extensive surrounding change ".repeat(20);
        let text = format!("Acute subdural hematoma {filler}noted.");
        let msg = compose_text(&text);
        assert!(msg.excerpt.chars().count() <= EXCERPT_MAX_CHARS);
        assert!(msg.excerpt.ends_with('…'));
    }

    #[test]
    fn excerpt_keeps_finding_deep_in_long_sentence() {
        let filler = "with extensive soft tissue change ".repeat(14);
        let text = format!("Chest CT {filler}and a tension pneumothorax on the left.");
        let msg = compose_text(&text);
        assert!(msg.excerpt.contains("tension pneumothorax"), "{}", msg.excerpt);
        assert!(msg.excerpt.chars().count() <= EXCERPT_MAX_CHARS);
        assert!(msg.excerpt.starts_with('…'));
        assert!(msg.excerpt.ends_with("on the left."));
    }

    #[test]
    fn html_body_is_escaped() {
        let msg = compose_text("Tension pneumothorax <b>now</b>.");
        assert!(msg.body_html.contains("Jane &lt;Doe&gt;"));
        assert!(msg.body_html.contains("&lt;b&gt;now&lt;/b&gt;"));
        assert!(!msg.body_html.contains("<b>now"));
        // plain text keeps the original characters
        assert!(msg.body_text.contains("<b>now</b>"));
    }

    #[test]
    fn categories_collected() {
        let msg = compose_text("Acute subdural hematoma. Tension pneumothorax.");
        let expected: BTreeSet<String> =
            ["neurological", "respiratory"].iter().map(|s| s.to_string()).collect();
        assert_eq!(msg.categories, expected);
    }

    #[test]
    fn duplicate_sentences_quoted_once() {
        let msg = compose_text("Acute subdural hematoma with mass effect.");
        assert_eq!(msg.excerpt.lines().count(), 1);
    }

    #[test]
    fn composition_is_deterministic() {
        let text = "Free air under the diaphragm. Acute appendicitis with perforation.";
        assert_eq!(compose_text(text), compose_text(text));
    }

    #[test]
    fn missing_metadata_uses_placeholders() {
        let text = "Tension pneumothorax.";
        let corpus = KeywordCorpus::builtin().unwrap();
        let findings = detect(text, &corpus, DEFAULT_NEGATION_WINDOW);
        let meta = ReportMetadata::default();
        let msg = compose(
            &findings,
            &ReportContext {
                report_id: "r-2",
                text,
                metadata: &meta,
                priority: Severity::Critical,
            },
        )
        .unwrap();
        assert_eq!(msg.subject, "[CRITICAL] Critical finding - Accession N/A - Unknown patient");
    }

    #[test]
    fn empty_findings_rejected() {
        let meta = metadata();
        let err = compose(
            &[],
            &ReportContext {
                report_id: "r-1",
                text: "nothing",
                metadata: &meta,
                priority: Severity::Urgent,
            },
        )
        .unwrap_err();
        assert_eq!(err, ComposeError::NoQualifyingFindings);
    }

    #[test]
    fn out_of_range_span_fails_whole_message() {
        let meta = metadata();
        let good = Finding {
            phrase: "pneumothorax".into(),
            category: FindingCategory::Respiratory,
            severity: Severity::Urgent,
            confidence: 0.75,
            span: Span { start: 0, end: 12 },
            negated: false,
        };
        let bad = Finding {
            span: Span { start: 40, end: 60 },
            ..good.clone()
        };
        let err = compose(
            &[good, bad],
            &ReportContext {
                report_id: "r-1",
                text: "Pneumothorax.",
                metadata: &meta,
                priority: Severity::Urgent,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ComposeError::InvalidSpan { .. }));
    }
}
