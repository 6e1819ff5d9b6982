//! Grounded-answer validation.
//!
//! Screens a generated answer for unsupported claims and unsafe advice
//! before it reaches a user. Which strategy runs is governed by
//! [`ValidatorMode`]:
//!
//! | Mode | Behavior |
//! |------|----------|
//! | `Enabled` | Remote validator call, offline fallback when permitted |
//! | `Disabled` | Always valid — an explicit escape hatch, not a default |
//! | `Offline` | Keyword/phrase battery, no network |
//! | `LowResource` | Acute-danger phrases only |
//!
//! The `Enabled` path tries an explicit ordered strategy chain (remote →
//! offline) and stops at the first strategy that produces a verdict; a
//! validator outage is never silently treated as "valid". Remote verdicts
//! whose confidence falls below the caller's threshold are re-validated in
//! a bounded loop with the threshold relaxed by a fixed factor each pass —
//! retries are strictly sequential, never concurrent.
//!
//! Confidence is `0.0–1.0` end-to-end. On any ambiguity (unparseable
//! response, API failure without fallback) the result biases toward
//! `is_valid = false`: flagging a safe answer is acceptable, approving an
//! unsafe one is not.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::ValidationConfig;
use crate::models::ChatMessage;

pub const FLAG_OVERCONFIDENT: &str = "OVERCONFIDENT_DIAGNOSIS";
pub const FLAG_DANGEROUS_ADVICE: &str = "DANGEROUS_MEDICAL_ADVICE";
pub const FLAG_CURE_CLAIM: &str = "CURE_CLAIM";
pub const FLAG_CRITICAL_SAFETY: &str = "CRITICAL_SAFETY";
pub const FLAG_POSSIBLE_HALLUCINATION: &str = "POSSIBLE_HALLUCINATION";
pub const FLAG_VALIDATION_ERROR: &str = "VALIDATION_ERROR";
pub const FLAG_API_ERROR: &str = "API_ERROR";

/// Offline verdicts carry fixed low confidence: keyword matching cannot
/// reason about paraphrase or context, so "checked, nothing found" must not
/// look as strong as a remote pass.
const OFFLINE_CONFIDENCE_CLEAN: f64 = 0.5;
const OFFLINE_CONFIDENCE_FLAGGED: f64 = 0.3;
const PARSE_FAILURE_CONFIDENCE: f64 = 0.5;

/// Threshold multiplier applied per retry. Relaxation is monotonic, so the
/// loop depth is bounded by `max_retries` alone.
const RETRY_RELAX_FACTOR: f64 = 0.9;

/// Conversation turns included in the remote prompt. Older context goes
/// stale in exchange for a bounded prompt size.
const HISTORY_WINDOW: usize = 5;

/// Dangerous phrases and the safety flag each one raises.
const DANGEROUS_KEYWORDS: &[(&str, &str)] = &[
    ("definitely has", FLAG_OVERCONFIDENT),
    ("will definitely", FLAG_OVERCONFIDENT),
    ("stop taking", FLAG_DANGEROUS_ADVICE),
    ("don't take", FLAG_DANGEROUS_ADVICE),
    ("cure", FLAG_CURE_CLAIM),
    ("cured", FLAG_CURE_CLAIM),
    ("ignore doctor", FLAG_CRITICAL_SAFETY),
    ("don't seek medical help", FLAG_CRITICAL_SAFETY),
];

/// The low-resource subset: phrases that tell a patient to stop medication
/// or ignore a clinician.
const ACUTE_DANGER_KEYWORDS: &[(&str, &str)] = &[
    ("stop taking", FLAG_DANGEROUS_ADVICE),
    ("don't take", FLAG_DANGEROUS_ADVICE),
    ("ignore doctor", FLAG_CRITICAL_SAFETY),
    ("don't seek medical help", FLAG_CRITICAL_SAFETY),
];

/// Conditions that commonly appear in hallucinated answers; mentioning one
/// absent from the ground-truth report raises a flag.
const COMMON_CONDITIONS: &[&str] = &["diabetes", "cancer", "heart attack", "stroke"];

/// Which validation strategy runs. Closed set, one handler per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorMode {
    #[default]
    Enabled,
    Disabled,
    Offline,
    LowResource,
}

/// One validation job.
#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub answer_text: String,
    /// Ordered, most-recent-last.
    pub conversation_history: Vec<ChatMessage>,
    /// Ground-truth report the answer must stay grounded in.
    pub report: String,
    pub kb_context: Option<String>,
    pub mode: ValidatorMode,
    pub confidence_threshold: f64,
    pub max_retries: u32,
    pub retry_count: u32,
}

impl ValidationRequest {
    pub fn from_config(
        config: &ValidationConfig,
        answer_text: String,
        conversation_history: Vec<ChatMessage>,
        report: String,
        kb_context: Option<String>,
    ) -> Self {
        Self {
            answer_text,
            conversation_history,
            report,
            kb_context,
            mode: config.mode,
            confidence_threshold: config.confidence_threshold,
            max_retries: config.max_retries,
            retry_count: 0,
        }
    }
}

/// Verdict on one answer. Created fresh per attempt; a retry derives a new
/// result rather than mutating the prior one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// `0.0–1.0`.
    pub confidence: f64,
    pub issues: Vec<String>,
    pub corrections: Option<String>,
    pub safety_flags: Vec<String>,
    pub reasoning: String,
    #[serde(default)]
    pub requires_human_review: bool,
    #[serde(default)]
    pub retry_count: u32,
}

impl ValidationResult {
    fn new(is_valid: bool, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            is_valid,
            confidence,
            issues: Vec::new(),
            corrections: None,
            safety_flags: Vec::new(),
            reasoning: reasoning.into(),
            requires_human_review: false,
            retry_count: 0,
        }
    }
}

/// Remote grounding model behind a narrow seam so tests can stub it.
#[async_trait]
pub trait RemoteValidator: Send + Sync {
    /// Send the grounding prompt, return the model's raw text reply.
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// The validation state machine.
pub struct GroundingValidator {
    remote: Arc<dyn RemoteValidator>,
    allow_offline_fallback: bool,
}

/// Tagged per-strategy verdict: remote verdicts enter the retry rule,
/// fallback verdicts return as-is.
enum AttemptOutcome {
    Remote(ValidationResult),
    Fallback(ValidationResult),
}

/// Ordered fallback chain for the `Enabled` path.
#[derive(Clone, Copy)]
enum Strategy {
    Remote,
    Offline,
}

impl GroundingValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            remote: Arc::new(AnthropicValidator::new(config)),
            allow_offline_fallback: config.allow_offline_fallback,
        }
    }

    /// Construct with an explicit remote backend (tests, alternate APIs).
    pub fn with_remote(remote: Arc<dyn RemoteValidator>, allow_offline_fallback: bool) -> Self {
        Self {
            remote,
            allow_offline_fallback,
        }
    }

    /// Entry point: dispatch on the request's mode.
    pub async fn validate(&self, request: &ValidationRequest) -> ValidationResult {
        match request.mode {
            ValidatorMode::Disabled => ValidationResult::new(
                true,
                1.0,
                "Validation disabled by configuration",
            ),
            ValidatorMode::Offline => {
                offline_validation(&request.answer_text, &request.report)
            }
            ValidatorMode::LowResource => {
                low_resource_validation(&request.answer_text)
            }
            ValidatorMode::Enabled => self.validate_enabled(request).await,
        }
    }

    /// Bounded retry loop carrying `(threshold, attempt)` state. Only
    /// remote verdicts are subject to the threshold rule; fallback results
    /// return immediately.
    async fn validate_enabled(&self, request: &ValidationRequest) -> ValidationResult {
        let mut threshold = request.confidence_threshold;
        let mut attempt = request.retry_count;

        loop {
            match self.enabled_attempt(request).await {
                AttemptOutcome::Fallback(mut result) => {
                    result.retry_count = attempt;
                    return result;
                }
                AttemptOutcome::Remote(mut result) => {
                    result.retry_count = attempt;
                    if result.confidence < threshold {
                        result.requires_human_review = true;
                        if attempt < request.max_retries {
                            threshold *= RETRY_RELAX_FACTOR;
                            attempt += 1;
                            continue;
                        }
                    }
                    return result;
                }
            }
        }
    }

    /// Run the strategy chain once: remote first, then offline when the
    /// caller permits it. The first strategy that yields a verdict wins.
    async fn enabled_attempt(&self, request: &ValidationRequest) -> AttemptOutcome {
        let strategies: &[Strategy] = if self.allow_offline_fallback {
            &[Strategy::Remote, Strategy::Offline]
        } else {
            &[Strategy::Remote]
        };

        let mut last_err: Option<anyhow::Error> = None;
        for strategy in strategies {
            match strategy {
                Strategy::Remote => {
                    let prompt = build_grounding_prompt(request);
                    match self.remote.complete(&prompt).await {
                        // A garbled reply is still a remote verdict (the
                        // conservative one) and may be retried.
                        Ok(text) => {
                            return AttemptOutcome::Remote(parse_validator_response(&text))
                        }
                        Err(e) => {
                            warn!(error = %e, "remote validator failed");
                            last_err = Some(e);
                        }
                    }
                }
                Strategy::Offline => {
                    return AttemptOutcome::Fallback(offline_validation(
                        &request.answer_text,
                        &request.report,
                    ));
                }
            }
        }

        AttemptOutcome::Fallback(api_error_result(last_err))
    }
}

/// Keyword/phrase battery against the answer text. No network calls.
fn offline_validation(answer: &str, report: &str) -> ValidationResult {
    let mut issues = Vec::new();
    let mut safety_flags = Vec::new();

    let answer_lower = answer.to_lowercase();
    let report_lower = report.to_lowercase();

    for (keyword, flag) in DANGEROUS_KEYWORDS {
        if answer_lower.contains(keyword) {
            issues.push(format!("Contains dangerous keyword: '{}'", keyword));
            safety_flags.push(flag.to_string());
        }
    }

    for condition in COMMON_CONDITIONS {
        if answer_lower.contains(condition) && !report_lower.contains(condition) {
            issues.push(format!("Mentions '{}' but not in medical report", condition));
            safety_flags.push(FLAG_POSSIBLE_HALLUCINATION.to_string());
        }
    }

    let is_valid = issues.is_empty();
    let confidence = if is_valid {
        OFFLINE_CONFIDENCE_CLEAN
    } else {
        OFFLINE_CONFIDENCE_FLAGGED
    };

    ValidationResult {
        is_valid,
        confidence,
        issues,
        corrections: None,
        safety_flags,
        reasoning: "Offline validation using keyword matching (limited accuracy)".to_string(),
        requires_human_review: false,
        retry_count: 0,
    }
}

/// Strict subset of the offline battery: acute-danger phrases only.
fn low_resource_validation(answer: &str) -> ValidationResult {
    let mut issues = Vec::new();
    let mut safety_flags = Vec::new();

    let answer_lower = answer.to_lowercase();
    for (keyword, flag) in ACUTE_DANGER_KEYWORDS {
        if answer_lower.contains(keyword) {
            issues.push(format!("Contains dangerous keyword: '{}'", keyword));
            safety_flags.push(flag.to_string());
        }
    }

    let is_valid = issues.is_empty();
    let confidence = if is_valid {
        OFFLINE_CONFIDENCE_CLEAN
    } else {
        OFFLINE_CONFIDENCE_FLAGGED
    };

    ValidationResult {
        is_valid,
        confidence,
        issues,
        corrections: None,
        safety_flags,
        reasoning: "Low-resource validation: acute-danger phrases only".to_string(),
        requires_human_review: false,
        retry_count: 0,
    }
}

fn api_error_result(err: Option<anyhow::Error>) -> ValidationResult {
    let detail = err
        .map(|e| e.to_string())
        .unwrap_or_else(|| "remote validator unavailable".to_string());
    ValidationResult {
        is_valid: false,
        confidence: 0.0,
        issues: vec![format!("Validator API error: {}", detail)],
        corrections: None,
        safety_flags: vec![FLAG_API_ERROR.to_string()],
        reasoning: "Remote validation failed and offline fallback is disallowed".to_string(),
        requires_human_review: true,
        retry_count: 0,
    }
}

/// Build the remote grounding prompt with a bounded history window.
fn build_grounding_prompt(request: &ValidationRequest) -> String {
    let window_start = request
        .conversation_history
        .len()
        .saturating_sub(HISTORY_WINDOW);
    let conversation: Vec<String> = request.conversation_history[window_start..]
        .iter()
        .map(|msg| format!("{}: {}", msg.role.to_uppercase(), msg.content))
        .collect();

    let kb_section = match &request.kb_context {
        Some(kb) => format!("\nRAG CONTEXT (Medical Knowledge Base):\n{}\n", kb),
        None => String::new(),
    };

    format!(
        "You are a medical safety validator. Validate this LLM response for:\n\
         1. Hallucinations (claims without support in context)\n\
         2. Medical accuracy issues\n\
         3. Safety concerns (inappropriate advice, dangerous recommendations)\n\
         4. Over-confident claims (presenting uncertainty as fact)\n\n\
         MEDICAL REPORT:\n{report}\n\n\
         CONVERSATION CONTEXT:\n{conversation}\n\
         {kb_section}\n\
         LLM RESPONSE TO VALIDATE:\n{answer}\n\n\
         Respond ONLY with valid JSON:\n\
         {{\n\
             \"is_valid\": true/false,\n\
             \"confidence\": 0.0-1.0,\n\
             \"issues\": [\"issue1\", \"issue2\"],\n\
             \"corrections\": \"corrected version or null\",\n\
             \"safety_flags\": [\"flag1\", \"flag2\"],\n\
             \"reasoning\": \"brief explanation\"\n\
         }}\n\n\
         Be very STRICT about hallucinations.",
        report = request.report,
        conversation = conversation.join("\n"),
        kb_section = kb_section,
        answer = request.answer_text,
    )
}

/// Fields the remote model is asked to emit; everything defaulted so a
/// partial reply still parses conservatively.
#[derive(Deserialize)]
struct RemoteVerdict {
    #[serde(default)]
    is_valid: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    corrections: Option<String>,
    #[serde(default)]
    safety_flags: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

/// Parse the remote validator's reply into a [`ValidationResult`].
///
/// Tries markdown-fence stripping first, then a balanced-brace scan for
/// raw JSON with trailing prose. An unparseable reply yields the
/// conservative mid-confidence invalid result.
pub fn parse_validator_response(text: &str) -> ValidationResult {
    let candidate = extract_json_candidate(text);

    match serde_json::from_str::<RemoteVerdict>(candidate) {
        Ok(verdict) => ValidationResult {
            is_valid: verdict.is_valid,
            confidence: normalize_confidence(verdict.confidence),
            issues: verdict.issues,
            corrections: verdict.corrections,
            safety_flags: verdict.safety_flags,
            reasoning: verdict.reasoning,
            requires_human_review: false,
            retry_count: 0,
        },
        Err(e) => {
            warn!(error = %e, "failed to parse validator response");
            ValidationResult {
                is_valid: false,
                confidence: PARSE_FAILURE_CONFIDENCE,
                issues: vec!["Validation parsing error".to_string()],
                corrections: None,
                safety_flags: vec![FLAG_VALIDATION_ERROR.to_string()],
                reasoning: "Could not parse validator response".to_string(),
                requires_human_review: false,
                retry_count: 0,
            }
        }
    }
}

/// Some model revisions emit 0–100 integers despite the prompt; fold those
/// onto the fixed 0.0–1.0 scale.
fn normalize_confidence(raw: f64) -> f64 {
    let scaled = if raw > 1.0 { raw / 100.0 } else { raw };
    scaled.clamp(0.0, 1.0)
}

fn extract_json_candidate(text: &str) -> &str {
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
        return after.trim();
    }
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
        return after.trim();
    }

    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        let mut depth = 0i32;
        for (i, c) in trimmed.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return &trimmed[..=i];
                    }
                }
                _ => {}
            }
        }
    }
    trimmed
}

/// Human-readable validation report for CLI output and logs.
pub fn format_validation_report(result: &ValidationResult) -> String {
    let status = if result.is_valid {
        "[VALID]"
    } else {
        "[INVALID]"
    };

    let issues_text = if result.issues.is_empty() {
        "  None".to_string()
    } else {
        result
            .issues
            .iter()
            .map(|i| format!("  - {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let flags_text = if result.safety_flags.is_empty() {
        "  None".to_string()
    } else {
        result
            .safety_flags
            .iter()
            .map(|f| format!("  - {}", f))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let correction_text = match &result.corrections {
        Some(c) => format!("\nSuggested Correction:\n{}\n", c),
        None => String::new(),
    };
    let review_text = if result.requires_human_review {
        "\nFlagged for human review.\n"
    } else {
        ""
    };

    format!(
        "\nVALIDATION REPORT\n{status}\nConfidence: {confidence:.0}%\n\n\
         Issues Found: {issue_count}\n{issues_text}\n\n\
         Safety Flags: {flag_count}\n{flags_text}\n\n\
         Reasoning:\n{reasoning}\n{correction_text}{review_text}",
        status = status,
        confidence = result.confidence * 100.0,
        issue_count = result.issues.len(),
        issues_text = issues_text,
        flag_count = result.safety_flags.len(),
        flags_text = flags_text,
        reasoning = result.reasoning,
        correction_text = correction_text,
        review_text = review_text,
    )
}

// ============ Anthropic remote backend ============

/// Remote validator using the Anthropic messages API.
///
/// Requires the `ANTHROPIC_API_KEY` environment variable. A single call
/// per attempt — re-invocation is governed by the confidence retry loop,
/// which waits for each reply before deciding to go again.
pub struct AnthropicValidator {
    model: String,
    timeout_secs: u64,
}

impl AnthropicValidator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
        }
    }
}

#[async_trait]
impl RemoteValidator for AnthropicValidator {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 1000,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Anthropic API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = response.json().await?;
        json.get("content")
            .and_then(|c| c.as_array())
            .and_then(|arr| arr.first())
            .and_then(|block| block.get("text"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid Anthropic response: missing content text"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SAMPLE_REPORT: &str = "Blood pressure: 140/90 mmHg (elevated)\n\
        ECG shows normal sinus rhythm\n\
        Diagnosis: Hypertension, likely anxiety-related chest pain";

    fn request(mode: ValidatorMode, answer: &str) -> ValidationRequest {
        ValidationRequest {
            answer_text: answer.to_string(),
            conversation_history: Vec::new(),
            report: SAMPLE_REPORT.to_string(),
            kb_context: None,
            mode,
            confidence_threshold: 0.7,
            max_retries: 2,
            retry_count: 0,
        }
    }

    struct StubRemote {
        reply: Result<String, String>,
        calls: AtomicUsize,
    }

    impl StubRemote {
        fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                calls: AtomicUsize::new(0),
            }
        }
        fn failing() -> Self {
            Self {
                reply: Err("connection refused".to_string()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RemoteValidator for StubRemote {
        async fn complete(&self, _prompt: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    fn verdict_json(is_valid: bool, confidence: f64) -> String {
        format!(
            "{{\"is_valid\": {}, \"confidence\": {}, \"issues\": [], \
             \"corrections\": null, \"safety_flags\": [], \"reasoning\": \"ok\"}}",
            is_valid, confidence
        )
    }

    #[tokio::test]
    async fn test_disabled_always_valid() {
        let validator =
            GroundingValidator::with_remote(Arc::new(StubRemote::failing()), true);
        let req = request(
            ValidatorMode::Disabled,
            "stop taking your medication and ignore doctor advice",
        );
        let result = validator.validate(&req).await;
        assert!(result.is_valid);
        assert_eq!(result.confidence, 1.0);
        assert!(result.issues.is_empty());
        assert!(result.safety_flags.is_empty());
    }

    #[tokio::test]
    async fn test_offline_flags_dangerous_keyword() {
        let validator =
            GroundingValidator::with_remote(Arc::new(StubRemote::failing()), true);
        let req = request(
            ValidatorMode::Offline,
            "You should stop taking the ACE inhibitor.",
        );
        let result = validator.validate(&req).await;
        assert!(!result.is_valid);
        assert!(result
            .safety_flags
            .contains(&FLAG_DANGEROUS_ADVICE.to_string()));
        assert!((result.confidence - OFFLINE_CONFIDENCE_FLAGGED).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_offline_clean_answer() {
        let validator =
            GroundingValidator::with_remote(Arc::new(StubRemote::failing()), true);
        let req = request(
            ValidatorMode::Offline,
            "Your report shows elevated blood pressure of 140/90.",
        );
        let result = validator.validate(&req).await;
        assert!(result.is_valid);
        assert!((result.confidence - OFFLINE_CONFIDENCE_CLEAN).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_offline_flags_condition_absent_from_report() {
        let validator =
            GroundingValidator::with_remote(Arc::new(StubRemote::failing()), true);
        let req = request(
            ValidatorMode::Offline,
            "Your results are consistent with diabetes.",
        );
        let result = validator.validate(&req).await;
        assert!(!result.is_valid);
        assert!(result
            .safety_flags
            .contains(&FLAG_POSSIBLE_HALLUCINATION.to_string()));
    }

    #[tokio::test]
    async fn test_low_resource_is_strict_subset() {
        let validator =
            GroundingValidator::with_remote(Arc::new(StubRemote::failing()), true);

        // Acute phrase: flagged.
        let req = request(ValidatorMode::LowResource, "Please stop taking warfarin.");
        let result = validator.validate(&req).await;
        assert!(!result.is_valid);
        assert!(result
            .safety_flags
            .contains(&FLAG_DANGEROUS_ADVICE.to_string()));

        // Cure claim: outside the acute subset, passes low-resource.
        let req = request(ValidatorMode::LowResource, "This will cure you.");
        let result = validator.validate(&req).await;
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn test_enabled_falls_back_to_offline_on_api_failure() {
        let answer = "You should stop taking the ACE inhibitor.";

        let enabled =
            GroundingValidator::with_remote(Arc::new(StubRemote::failing()), true);
        let from_fallback = enabled.validate(&request(ValidatorMode::Enabled, answer)).await;

        let offline =
            GroundingValidator::with_remote(Arc::new(StubRemote::failing()), true);
        let from_offline = offline.validate(&request(ValidatorMode::Offline, answer)).await;

        assert_eq!(from_fallback, from_offline);
    }

    #[tokio::test]
    async fn test_enabled_without_fallback_returns_api_error() {
        let validator =
            GroundingValidator::with_remote(Arc::new(StubRemote::failing()), false);
        let result = validator
            .validate(&request(ValidatorMode::Enabled, "any answer"))
            .await;
        assert!(!result.is_valid);
        assert!(result.safety_flags.contains(&FLAG_API_ERROR.to_string()));
        assert!(result.requires_human_review);
    }

    #[tokio::test]
    async fn test_retry_chain_terminates_at_max_retries() {
        let remote = Arc::new(StubRemote::ok(&verdict_json(true, 0.2)));
        let validator = GroundingValidator::with_remote(remote.clone(), true);

        let result = validator
            .validate(&request(ValidatorMode::Enabled, "fine answer"))
            .await;

        assert_eq!(result.retry_count, 2);
        assert!(result.requires_human_review);
        // Initial attempt plus two retries.
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_relaxed_threshold_accepts_on_retry() {
        // 0.65 fails the 0.7 threshold, passes 0.7 * 0.9 = 0.63.
        let remote = Arc::new(StubRemote::ok(&verdict_json(true, 0.65)));
        let validator = GroundingValidator::with_remote(remote.clone(), true);

        let result = validator
            .validate(&request(ValidatorMode::Enabled, "fine answer"))
            .await;

        assert_eq!(result.retry_count, 1);
        assert!(!result.requires_human_review);
        assert!(result.is_valid);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_confident_verdict_returns_without_retry() {
        let remote = Arc::new(StubRemote::ok(&verdict_json(true, 0.95)));
        let validator = GroundingValidator::with_remote(remote.clone(), true);

        let result = validator
            .validate(&request(ValidatorMode::Enabled, "fine answer"))
            .await;

        assert_eq!(result.retry_count, 0);
        assert!(!result.requires_human_review);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_conservative() {
        let remote = Arc::new(StubRemote::ok("Looks fine to me!"));
        let validator = GroundingValidator::with_remote(remote, true);

        let mut req = request(ValidatorMode::Enabled, "fine answer");
        req.max_retries = 0;
        req.confidence_threshold = 0.4;
        let result = validator.validate(&req).await;

        assert!(!result.is_valid);
        assert!((result.confidence - PARSE_FAILURE_CONFIDENCE).abs() < 1e-9);
        assert!(result
            .safety_flags
            .contains(&FLAG_VALIDATION_ERROR.to_string()));
    }

    #[test]
    fn test_parse_strips_json_fence() {
        let reply = format!("```json\n{}\n```", verdict_json(true, 0.9));
        let result = parse_validator_response(&reply);
        assert!(result.is_valid);
        assert!((result.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_parse_strips_bare_fence() {
        let reply = format!("```\n{}\n```", verdict_json(false, 0.8));
        let result = parse_validator_response(&reply);
        assert!(!result.is_valid);
    }

    #[test]
    fn test_parse_brace_scan_with_trailing_prose() {
        let reply = format!("{} \nHope that helps!", verdict_json(true, 0.9));
        let result = parse_validator_response(&reply);
        assert!(result.is_valid);
    }

    #[test]
    fn test_parse_normalizes_percent_scale_confidence() {
        let result = parse_validator_response(&verdict_json(true, 87.0));
        assert!((result.confidence - 0.87).abs() < 1e-9);
    }

    #[test]
    fn test_prompt_windows_history_to_last_five() {
        let mut req = request(ValidatorMode::Enabled, "answer");
        for i in 0..7 {
            req.conversation_history.push(ChatMessage {
                role: "user".to_string(),
                content: format!("turn-{}", i),
            });
        }
        let prompt = build_grounding_prompt(&req);
        assert!(!prompt.contains("turn-0"));
        assert!(!prompt.contains("turn-1"));
        assert!(prompt.contains("turn-2"));
        assert!(prompt.contains("turn-6"));
        assert!(prompt.contains("USER: turn-6"));
    }

    #[test]
    fn test_prompt_includes_kb_context_when_present() {
        let mut req = request(ValidatorMode::Enabled, "answer");
        req.kb_context = Some("[KB:guide.txt]\nINR range 2-3".to_string());
        let prompt = build_grounding_prompt(&req);
        assert!(prompt.contains("RAG CONTEXT"));
        assert!(prompt.contains("INR range 2-3"));

        req.kb_context = None;
        assert!(!build_grounding_prompt(&req).contains("RAG CONTEXT"));
    }

    #[test]
    fn test_format_report_sections() {
        let mut result = ValidationResult::new(false, 0.3, "keyword hit");
        result.issues.push("Contains dangerous keyword: 'cure'".to_string());
        result.safety_flags.push(FLAG_CURE_CLAIM.to_string());
        let report = format_validation_report(&result);
        assert!(report.contains("[INVALID]"));
        assert!(report.contains("Confidence: 30%"));
        assert!(report.contains("CURE_CLAIM"));
    }
}
