// 🌐 HTTP API - operator UI surface
// Prompts, credentials, runs, live log, mappings, ledger listings, schedulers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::runtime::Handle;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::SyncError;
use crate::ledger::{BudgetFile, LedgerAccount};
use crate::mapping::{LedgerTarget, MappingView};
use crate::pipeline::{BankJob, RunReport, Session};
use crate::runlog::LogLine;
use crate::scheduler::{ScheduleInterval, ScheduledJob, Scheduler, SchedulerStatus};
use crate::secrets::{AnswerError, PendingPrompt, SecretKind, SecretValue};

// ============================================================================
// STATE + ENVELOPE
// ============================================================================

/// Latest interactive run, as the UI sees it
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub bank: String,
    pub finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    session: Arc<Session>,
    schedulers: Arc<BTreeMap<String, Scheduler>>,
    latest: Arc<Mutex<Option<RunView>>>,
}

impl AppState {
    /// One scheduler per bank in the session's portal registry
    pub fn new(session: Arc<Session>, runtime: Handle) -> Self {
        let schedulers = session
            .banks()
            .into_iter()
            .map(|bank| {
                let job: Arc<dyn ScheduledJob> =
                    Arc::new(BankJob::new(Arc::clone(&session), bank.clone()));
                (bank, Scheduler::new(job, runtime.clone()))
            })
            .collect();

        AppState {
            session,
            schedulers: Arc::new(schedulers),
            latest: Arc::new(Mutex::new(None)),
        }
    }
}

/// API Response wrapper
#[derive(Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::ok(data))).into_response()
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    let body: ApiResponse<()> = ApiResponse {
        success: false,
        data: None,
        error: Some(message.into()),
    };
    (status, Json(body)).into_response()
}

fn ledger_failure(e: SyncError) -> Response {
    tracing::warn!("ledger listing failed: {}", e);
    failure(StatusCode::BAD_GATEWAY, e.to_string())
}

// ============================================================================
// REQUEST / RESPONSE BODIES
// ============================================================================

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    running: bool,
    /// Budget file the mapping form preselects
    default_file: Option<String>,
}

#[derive(Deserialize)]
struct AnswerRequest {
    id: Uuid,
    value: String,
}

#[derive(Serialize)]
struct CredentialsResponse {
    cached: Vec<SecretKind>,
}

#[derive(Debug, Clone, Deserialize)]
struct TargetRequest {
    file: String,
    account: String,
    #[serde(default)]
    encryption_secret: Option<String>,
}

impl From<TargetRequest> for LedgerTarget {
    fn from(req: TargetRequest) -> Self {
        let target = LedgerTarget::new(req.file, req.account);
        match req.encryption_secret.filter(|s| !s.is_empty()) {
            Some(secret) => target.with_encryption_secret(SecretValue::new(secret)),
            None => target,
        }
    }
}

#[derive(Deserialize)]
struct RunRequest {
    bank: String,
    /// source id -> ledger target
    #[serde(default)]
    targets: HashMap<String, TargetRequest>,
}

#[derive(Deserialize)]
struct LogQuery {
    #[serde(default)]
    since: u64,
}

#[derive(Serialize)]
struct LogResponse {
    lines: Vec<LogLine>,
    next: u64,
}

#[derive(Deserialize)]
struct MappingRequest {
    source_id: String,
    #[serde(flatten)]
    target: TargetRequest,
}

#[derive(Deserialize)]
struct AccountsRequest {
    file: String,
    #[serde(default)]
    encryption_secret: Option<String>,
}

#[derive(Deserialize)]
struct StartRequest {
    interval: ScheduleInterval,
    #[serde(default)]
    run_now: bool,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check(State(state): State<AppState>) -> Response {
    ok(Health {
        status: "OK",
        version: crate::VERSION,
        running: state.session.is_running(),
        default_file: state.session.config().ledger_file.clone(),
    })
}

/// GET /api/prompt - The secret request waiting for an answer, if any
async fn get_prompt(State(state): State<AppState>) -> Response {
    ok::<Option<PendingPrompt>>(state.session.broker().pending())
}

/// POST /api/prompt - Answer the pending request
async fn answer_prompt(State(state): State<AppState>, Json(req): Json<AnswerRequest>) -> Response {
    match state.session.broker().answer(req.id, &req.value) {
        Ok(()) => ok("answered"),
        Err(e @ AnswerError::NoSuchRequest(_)) => failure(StatusCode::NOT_FOUND, e.to_string()),
        Err(e @ AnswerError::Empty) => failure(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

/// GET /api/credentials - Which secrets are cached (never the values)
async fn get_credentials(State(state): State<AppState>) -> Response {
    ok(CredentialsResponse {
        cached: state.session.broker().cached_kinds(),
    })
}

/// POST /api/credentials/clear
async fn clear_credentials(State(state): State<AppState>) -> Response {
    state.session.broker().clear();
    ok("cleared")
}

/// POST /api/runs - Start an interactive run in the background
async fn start_run(State(state): State<AppState>, Json(req): Json<RunRequest>) -> Response {
    if state.session.portal(&req.bank).is_none() {
        return failure(
            StatusCode::NOT_FOUND,
            SyncError::UnknownBank(req.bank).to_string(),
        );
    }
    if state.session.is_running() {
        return failure(StatusCode::CONFLICT, SyncError::RunInProgress.to_string());
    }

    let targets: HashMap<String, LedgerTarget> = req
        .targets
        .into_iter()
        .map(|(source, target)| (source, target.into()))
        .collect();

    *state.latest.lock() = Some(RunView {
        bank: req.bank.clone(),
        finished: false,
        report: None,
        error: None,
    });

    let session = Arc::clone(&state.session);
    let latest = Arc::clone(&state.latest);
    let bank = req.bank.clone();
    tokio::task::spawn_blocking(move || {
        let outcome = session.run(&bank, &targets);
        if let Err(SyncError::RunInProgress) = outcome {
            tracing::warn!("run request for {} lost the race to another run", bank);
            return;
        }
        let view = match outcome {
            Ok(report) => RunView {
                bank,
                finished: true,
                report: Some(report),
                error: None,
            },
            Err(e) => RunView {
                bank,
                finished: true,
                report: None,
                error: Some(e.to_string()),
            },
        };
        *latest.lock() = Some(view);
    });

    (
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok(serde_json::json!({ "bank": req.bank }))),
    )
        .into_response()
}

/// GET /api/runs/latest
async fn latest_run(State(state): State<AppState>) -> Response {
    ok::<Option<RunView>>(state.latest.lock().clone())
}

/// GET /api/log?since=N - Run log lines from sequence N on
async fn get_log(State(state): State<AppState>, Query(query): Query<LogQuery>) -> Response {
    let log = state.session.log();
    ok(LogResponse {
        lines: log.since(query.since),
        next: log.next_seq(),
    })
}

/// GET /api/mappings
async fn get_mappings(State(state): State<AppState>) -> Response {
    ok::<Vec<MappingView>>(state.session.mappings().list())
}

/// POST /api/mappings - save_mapping(source, file, account, secret?)
async fn save_mapping(State(state): State<AppState>, Json(req): Json<MappingRequest>) -> Response {
    if req.source_id.trim().is_empty() {
        return failure(StatusCode::BAD_REQUEST, "source_id is required");
    }
    state.session.save_mapping(&req.source_id, req.target.into());
    ok::<Vec<MappingView>>(state.session.mappings().list())
}

/// DELETE /api/mappings/:source
async fn delete_mapping(State(state): State<AppState>, Path(source): Path<String>) -> Response {
    match state.session.mappings().remove(&source) {
        Some(_) => ok::<Vec<MappingView>>(state.session.mappings().list()),
        None => failure(
            StatusCode::NOT_FOUND,
            format!("no mapping for source '{}'", source),
        ),
    }
}

/// GET /api/ledger/files
async fn ledger_files(State(state): State<AppState>) -> Response {
    let session = Arc::clone(&state.session);
    match tokio::task::spawn_blocking(move || session.list_budget_files()).await {
        Ok(Ok(files)) => ok::<Vec<BudgetFile>>(files),
        Ok(Err(e)) => ledger_failure(e),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// POST /api/ledger/accounts - Accounts of one (possibly encrypted) file
async fn ledger_accounts(
    State(state): State<AppState>,
    Json(req): Json<AccountsRequest>,
) -> Response {
    let session = Arc::clone(&state.session);
    let secret = req.encryption_secret.filter(|s| !s.is_empty()).map(SecretValue::new);
    let listing =
        tokio::task::spawn_blocking(move || session.list_accounts(&req.file, secret.as_ref()))
            .await;
    match listing {
        Ok(Ok(accounts)) => ok::<Vec<LedgerAccount>>(accounts),
        Ok(Err(e)) => ledger_failure(e),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn scheduler_for<'a>(state: &'a AppState, bank: &str) -> Result<&'a Scheduler, Response> {
    state.schedulers.get(bank).ok_or_else(|| {
        failure(
            StatusCode::NOT_FOUND,
            SyncError::UnknownBank(bank.to_string()).to_string(),
        )
    })
}

/// GET /api/banks/:bank/scheduler
async fn scheduler_status(State(state): State<AppState>, Path(bank): Path<String>) -> Response {
    match scheduler_for(&state, &bank) {
        Ok(scheduler) => ok::<SchedulerStatus>(scheduler.status()),
        Err(resp) => resp,
    }
}

/// POST /api/banks/:bank/scheduler/start
async fn scheduler_start(
    State(state): State<AppState>,
    Path(bank): Path<String>,
    Json(req): Json<StartRequest>,
) -> Response {
    let scheduler = match scheduler_for(&state, &bank) {
        Ok(scheduler) => scheduler,
        Err(resp) => return resp,
    };
    match scheduler.start(req.interval, req.run_now) {
        Ok(()) => ok::<SchedulerStatus>(scheduler.status()),
        Err(e) => failure(StatusCode::PRECONDITION_FAILED, e.to_string()),
    }
}

/// POST /api/banks/:bank/scheduler/stop
async fn scheduler_stop(State(state): State<AppState>, Path(bank): Path<String>) -> Response {
    match scheduler_for(&state, &bank) {
        Ok(scheduler) => {
            scheduler.stop();
            ok::<SchedulerStatus>(scheduler.status())
        }
        Err(resp) => resp,
    }
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/prompt", get(get_prompt).post(answer_prompt))
        .route("/credentials", get(get_credentials))
        .route("/credentials/clear", post(clear_credentials))
        .route("/runs", post(start_run))
        .route("/runs/latest", get(latest_run))
        .route("/log", get(get_log))
        .route("/mappings", get(get_mappings).post(save_mapping))
        .route("/mappings/:source", delete(delete_mapping))
        .route("/ledger/files", get(ledger_files))
        .route("/ledger/accounts", post(ledger_accounts))
        .route("/banks/:bank/scheduler", get(scheduler_status))
        .route("/banks/:bank/scheduler/start", post(scheduler_start))
        .route("/banks/:bank/scheduler/stop", post(scheduler_stop))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

// ============================================================================
// TESTS
// ============================================================================
