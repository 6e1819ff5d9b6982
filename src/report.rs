//! Patient report text normalization.
//!
//! Pasted reports often arrive with unicode spaces and glued label/value
//! tokens (`Hb13.5g/dL`, `CRP<5`). Normalization separates those so the
//! summarizer, retriever, and offline validator all see the same tokens.

use once_cell::sync::Lazy;
use regex::Regex;

static LETTER_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Za-z])(\d)").unwrap());
// `/` is deliberately absent: `140/90` must stay one token.
static DIGIT_LETTER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d)([A-Za-zµ%])").unwrap());
static BEFORE_COMPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z0-9%/µ])([<>≤≥])").unwrap());
static COMPARATOR_DIGIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"([<>≤≥])([0-9])").unwrap());
static COMPARATOR_SPACING: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*([<>≤≥])\s*").unwrap());
static SPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\x0c\x0b]+").unwrap());

/// Normalize a pasted report for downstream processing.
pub fn normalize_report_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let normalized = text.replace('\u{00A0}', " ").replace('\u{2009}', " ");
    let normalized = LETTER_DIGIT.replace_all(&normalized, "$1 $2");
    let normalized = DIGIT_LETTER.replace_all(&normalized, "$1 $2");
    let normalized = BEFORE_COMPARATOR.replace_all(&normalized, "$1 $2");
    let normalized = COMPARATOR_DIGIT.replace_all(&normalized, "$1 $2");
    let normalized = COMPARATOR_SPACING.replace_all(&normalized, " $1 ");
    let normalized = SPACE_RUN.replace_all(&normalized, " ");

    normalized.trim().to_string()
}
