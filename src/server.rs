//! HTTP serving surface.
//!
//! Exposes the summarization backend as a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Readiness: `{ready, meta}` with the latest index status |
//! | `POST` | `/summarize` | Summarize a report, flag risks, validate the output |
//! | `POST` | `/chat` | Answer a follow-up question grounded in the report |
//! | `POST` | `/validate` | Run the grounding validator on an arbitrary answer |
//!
//! The KB index builds in a background task started at process startup;
//! handlers read an immutable snapshot and never wait on the builder.
//! `/summarize` answers "index still building" until the snapshot is ready.
//!
//! # Error Contract
//!
//! Error responses use the envelope:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "report cannot be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `generation_error` (503).

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::extract::{extract_trailing_json, humanize_risks, strip_section, RiskBlock, RiskReport};
use crate::generate::{mock_chat_answer, mock_summary, Generator, OllamaGenerator};
use crate::index::{build_or_load, format_docs, IndexReport, Retriever};
use crate::kb::load_kb_docs;
use crate::models::ChatMessage;
use crate::report::normalize_report_text;
use crate::state::{KbSnapshot, SharedState};
use crate::validator::{GroundingValidator, ValidationRequest, ValidationResult};

/// Heading under which the generation chain emits its risk JSON.
const RISKS_HEADING: &str = "RISKS";

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    shared: Arc<SharedState>,
    generator: Arc<dyn Generator>,
    validator: Arc<GroundingValidator>,
}

/// Start the HTTP server and the background index build.
///
/// Runs until the process is terminated. Binding failures are the only
/// startup error — a KB that fails to build leaves the server up with KB
/// features degraded.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let config = Arc::new(config.clone());
    let shared = Arc::new(SharedState::new());

    tokio::spawn(build_kb_task(config.clone(), shared.clone()));

    let state = AppState {
        generator: Arc::new(OllamaGenerator::new(&config.generation)),
        validator: Arc::new(GroundingValidator::new(&config.validation)),
        config: config.clone(),
        shared,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/summarize", post(handle_summarize))
        .route("/chat", post(handle_chat))
        .route("/validate", post(handle_validate))
        .layer(cors)
        .with_state(state);

    info!(bind = %config.server.bind, "medsum server listening");

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Background build task: load the corpus, build or load the index, and
/// publish one ready snapshot. Never takes the process down.
async fn build_kb_task(config: Arc<Config>, shared: Arc<SharedState>) {
    let snapshot = match try_build(&config).await {
        Ok((retriever, report)) => KbSnapshot {
            ready: true,
            retriever,
            report,
        },
        Err(e) => {
            error!(error = %e, "KB index build failed");
            KbSnapshot {
                ready: true,
                retriever: None,
                report: IndexReport::index_error(e.to_string()),
            }
        }
    };
    shared.publish(snapshot);
}

async fn try_build(config: &Config) -> anyhow::Result<(Option<Arc<Retriever>>, IndexReport)> {
    let docs = load_kb_docs(&config.kb.glob)?;
    let embedder = create_embedder(&config.embedding)?;
    let outcome = build_or_load(
        &docs,
        &config.kb.glob,
        &config.kb.index_dir,
        &config.chunking,
        embedder,
        config.retrieval.top_k,
    )
    .await?;

    let mut report = outcome.report;
    report.kb_docs = report.kb_docs.or(Some(docs.len()));
    Ok((outcome.retriever, report))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn generation_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "generation_error".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    ready: bool,
    meta: IndexReport,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.shared.kb();
    Json(HealthResponse {
        ready: snapshot.ready,
        meta: snapshot.report.clone(),
    })
}

// ============ POST /summarize ============

#[derive(Deserialize)]
struct SummarizeReq {
    report: String,
    #[serde(default = "default_use_kb")]
    use_kb: bool,
}

fn default_use_kb() -> bool {
    true
}

#[derive(Serialize)]
struct SummarizeResp {
    text: String,
    risks: Option<RiskReport>,
    risk_notes: Option<String>,
    /// Set when a RISKS section was present but could not be parsed —
    /// distinct from "no risks mentioned".
    risk_parse_error: Option<String>,
    validation: Option<ValidationResult>,
    ready: bool,
    meta: IndexReport,
}

async fn handle_summarize(
    State(state): State<AppState>,
    Json(req): Json<SummarizeReq>,
) -> Result<Json<SummarizeResp>, AppError> {
    let report = normalize_report_text(&req.report);
    if report.is_empty() {
        return Err(bad_request("report cannot be empty"));
    }

    state.shared.set_last_report(report.clone());

    let snapshot = state.shared.kb();
    if req.use_kb && !snapshot.ready {
        return Ok(Json(SummarizeResp {
            text: "KB index is still building. Retry shortly or disable KB for now.".to_string(),
            risks: None,
            risk_notes: None,
            risk_parse_error: None,
            validation: None,
            ready: false,
            meta: snapshot.report.clone(),
        }));
    }

    let kb_context = retrieve_context(&snapshot, req.use_kb, &report).await;

    let output = match state.generator.summarize(&report, &kb_context).await {
        Ok(text) => text,
        Err(e) => {
            if !state.config.generation.allow_mock_fallback {
                return Err(generation_error(e.to_string()));
            }
            warn!(error = %e, "generation failed, serving mock summary");
            mock_summary(&report)
        }
    };

    let (risks, risk_notes, risk_parse_error) = risk_fields(&output);
    let text = strip_section(RISKS_HEADING, &output);

    let validation = state
        .validator
        .validate(&ValidationRequest::from_config(
            &state.config.validation,
            output,
            Vec::new(),
            report,
            Some(kb_context),
        ))
        .await;

    Ok(Json(SummarizeResp {
        text,
        risks,
        risk_notes,
        risk_parse_error,
        validation: Some(validation),
        ready: true,
        meta: snapshot.report.clone(),
    }))
}

/// Map the extractor's three-way outcome onto the response fields.
fn risk_fields(output: &str) -> (Option<RiskReport>, Option<String>, Option<String>) {
    match extract_trailing_json(RISKS_HEADING, output) {
        RiskBlock::Found(report) => {
            let notes = humanize_risks(&report);
            (Some(report), Some(notes), None)
        }
        RiskBlock::Invalid(reason) => (None, None, Some(reason)),
        RiskBlock::NotFound => (None, None, None),
    }
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatReq {
    question: String,
    #[serde(default)]
    report: Option<String>,
    #[serde(default)]
    history: Vec<ChatMessage>,
    #[serde(default = "default_use_kb")]
    use_kb: bool,
}

#[derive(Serialize)]
struct ChatResp {
    text: String,
    validation: Option<ValidationResult>,
    ready: bool,
    meta: IndexReport,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatReq>,
) -> Result<Json<ChatResp>, AppError> {
    let question = req.question.trim().to_string();
    if question.is_empty() {
        return Err(bad_request("question cannot be empty"));
    }

    let report = normalize_report_text(
        &req.report
            .or_else(|| state.shared.last_report())
            .unwrap_or_default(),
    );
    let snapshot = state.shared.kb();
    if report.is_empty() {
        return Ok(Json(ChatResp {
            text: "No patient report is available. Paste a report and summarize first, \
                   or include report text directly in this request."
                .to_string(),
            validation: None,
            ready: false,
            meta: snapshot.report.clone(),
        }));
    }

    let kb_context = retrieve_context(&snapshot, req.use_kb, &question).await;

    let answer = match state
        .generator
        .answer(&question, &report, &kb_context)
        .await
    {
        Ok(text) => text,
        Err(e) => {
            if !state.config.generation.allow_mock_fallback {
                return Err(generation_error(e.to_string()));
            }
            warn!(error = %e, "generation failed, serving mock answer");
            mock_chat_answer(&question, &report)
        }
    };

    let validation = state
        .validator
        .validate(&ValidationRequest::from_config(
            &state.config.validation,
            answer.clone(),
            req.history,
            report,
            Some(kb_context),
        ))
        .await;

    Ok(Json(ChatResp {
        text: answer,
        validation: Some(validation),
        ready: snapshot.ready,
        meta: snapshot.report.clone(),
    }))
}

/// Retrieve and format KB context for a query. Retrieval failures degrade
/// to the empty-KB marker rather than failing the request.
async fn retrieve_context(snapshot: &KbSnapshot, use_kb: bool, query: &str) -> String {
    if !use_kb {
        return "[KB:empty]\n(No KB used.)".to_string();
    }
    let retriever = match &snapshot.retriever {
        Some(r) => r,
        None => return "[KB:empty]\n(No relevant knowledge found.)".to_string(),
    };
    match retriever.retrieve(query).await {
        Ok(chunks) => format_docs(&chunks),
        Err(e) => {
            warn!(error = %e, "KB retrieval failed, continuing without context");
            "[KB:empty]\n(No relevant knowledge found.)".to_string()
        }
    }
}

// ============ POST /validate ============

#[derive(Deserialize)]
struct ValidateReq {
    answer: String,
    report: String,
    #[serde(default)]
    history: Vec<ChatMessage>,
    #[serde(default)]
    kb_context: Option<String>,
}

async fn handle_validate(
    State(state): State<AppState>,
    Json(req): Json<ValidateReq>,
) -> Result<Json<ValidationResult>, AppError> {
    if req.answer.trim().is_empty() {
        return Err(bad_request("answer cannot be empty"));
    }

    let result = state
        .validator
        .validate(&ValidationRequest::from_config(
            &state.config.validation,
            req.answer,
            req.history,
            req.report,
            req.kb_context,
        ))
        .await;

    Ok(Json(result))
}
