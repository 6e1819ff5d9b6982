//! Trailing RISKS JSON extraction from generated text.
//!
//! The generation chain emits a free-form document whose final section is a
//! markdown heading followed by a JSON object of risk flags. The
//! surrounding prose may contain markdown fences or trailing commentary, so
//! extraction is a heuristic, not a parser: find the heading
//! (case-insensitive), then slice from the first `{` to the last `}` of the
//! tail.
//!
//! Known limitation: a stray unbalanced brace in prose between the heading
//! and the real object mis-slices the candidate. Accepted — the failure
//! surfaces as [`RiskBlock::Invalid`], never as a silently wrong parse.

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

/// Outcome of locating and parsing the trailing JSON block.
///
/// `NotFound` (no heading, or no brace pair after it) is distinct from
/// `Invalid` (a candidate was found but could not be understood), so
/// callers can silently omit a risk panel in the first case and surface a
/// diagnostic in the second.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskBlock {
    Found(RiskReport),
    Invalid(String),
    NotFound,
}

/// `{"risk_flags": [...]}` — an empty list is valid and means "no risks
/// supported by the source text".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RiskReport {
    pub risk_flags: Vec<RiskFlag>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskFlag {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub suggested_action: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Moderate,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => f.write_str("low"),
            Severity::Moderate => f.write_str("moderate"),
            Severity::High => f.write_str("high"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evidence {
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub quote: String,
}

/// Extract the JSON object trailing a `### <heading>` section.
pub fn extract_trailing_json(heading: &str, full_text: &str) -> RiskBlock {
    let tail = match section_tail(heading, full_text) {
        Some(tail) => tail,
        None => return RiskBlock::NotFound,
    };

    let start = tail.find('{');
    let end = tail.rfind('}');
    let candidate = match (start, end) {
        (Some(s), Some(e)) if e > s => &tail[s..=e],
        _ => return RiskBlock::NotFound,
    };

    let value: serde_json::Value = match serde_json::from_str(candidate) {
        Ok(v) => v,
        Err(e) => return RiskBlock::Invalid(format!("JSON parse error: {}", e)),
    };

    if value.get("risk_flags").is_none() {
        return RiskBlock::Invalid("JSON parsed but missing 'risk_flags' key".to_string());
    }

    match serde_json::from_value::<RiskReport>(value) {
        Ok(report) => RiskBlock::Found(report),
        Err(e) => RiskBlock::Invalid(format!("risk_flags did not match schema: {}", e)),
    }
}

/// Everything after the `### <heading>` marker, or `None` if absent.
fn section_tail<'a>(heading: &str, full_text: &'a str) -> Option<&'a str> {
    let pattern = format!(r"###\s*{}", regex::escape(heading));
    let re = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .ok()?;
    let m = re.find(full_text)?;
    Some(full_text[m.end()..].trim())
}

/// Remove the entire `### <heading> ...` section from display text.
pub fn strip_section(heading: &str, full_text: &str) -> String {
    let pattern = format!(r"(?s)###\s*{}.*$", regex::escape(heading));
    match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(re) => re.replace(full_text, "").trim().to_string(),
        Err(_) => full_text.to_string(),
    }
}

/// Turn a risk report into readable markdown bullet notes.
/// Display-only; the JSON stays unchanged.
pub fn humanize_risks(report: &RiskReport) -> String {
    if report.risk_flags.is_empty() {
        return "No specific risks were identified.".to_string();
    }

    let mut lines = Vec::new();
    for flag in &report.risk_flags {
        let name = if flag.name.is_empty() {
            "(unnamed)"
        } else {
            &flag.name
        };
        let severity = flag
            .severity
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        lines.push(format!(
            "- **{}** (_{}, severity: {}_)",
            name, flag.category, severity
        ));
        if !flag.rationale.is_empty() {
            lines.push(format!("  - Rationale: {}", flag.rationale));
        }
        if !flag.evidence.is_empty() {
            lines.push("  - Evidence (from report):".to_string());
            for e in &flag.evidence {
                let quote = e.quote.trim();
                if !quote.is_empty() {
                    lines.push(format!("    - \u{201c}{}\u{201d}", quote));
                }
            }
        }
        if let Some(action) = &flag.suggested_action {
            if !action.is_empty() {
                lines.push(format!("  - Suggested action: {}", action));
            }
        }
    }
    lines.join("\n")
}
