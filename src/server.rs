//! HTTP API.
//!
//! Exposes runs and proposals as JSON so a dashboard or script can drive
//! the review workflow.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/runs` | Start a run (`{"paths": [...]}` optional); returns `202` with the run id |
//! | `GET`  | `/runs` | Recent runs (`?limit=`) |
//! | `GET`  | `/runs/{id}` | One run with its chunk counters |
//! | `POST` | `/runs/{id}/cancel` | Cancel an active run |
//! | `GET`  | `/proposals` | Proposals (`?run_id=&status=`) |
//! | `GET`  | `/proposals/{id}` | One proposal with its backups and applied record |
//! | `DELETE` | `/proposals/{id}` | Discard a proposal |
//! | `POST` | `/proposals/{id}/transition` | `{"action": "accept" \| "reject" \| "rescan"}` |
//! | `POST` | `/proposals/{id}/apply` | Apply an accepted proposal |
//! | `POST` | `/proposals/{id}/rollback` | Restore the pre-apply backup |
//! | `POST` | `/proposals/bulk` | `{"ids": [...], "action": ...}` |
//! | `POST` | `/proposals/revalidate` | Mark drifted accepted proposals stale |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "drifted", "message": "configuration.yaml changed since ..." } }
//! ```
//!
//! `not_found` is 404; `invalid_transition`, `not_accepted`, `not_applied`,
//! and `drifted` are 409; `invalid_structure` and `rescan_failed` are 422;
//! request problems are 400; storage and filesystem failures are 500.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use config_advisor_core::document::DocumentFilter;
use config_advisor_core::lifecycle::ProposalAction;
use config_advisor_core::models::{AppliedRecord, BackupRecord, Proposal, ProposalStatus, Run};
use config_advisor_core::store::ProposalFilter;

use crate::advisor::{Advisor, AdvisorError, BulkResult};
use crate::config::Config;

#[derive(Clone)]
struct AppState {
    advisor: Advisor,
}

/// Start the HTTP server on `[server].bind` and serve until the process
/// exits.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let advisor = crate::open_advisor(config).await?;
    let bind_addr = config.server.bind.clone();

    println!("Config advisor listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router(advisor)).await?;
    Ok(())
}

/// Build the application router around `advisor`.
pub fn router(advisor: Advisor) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/runs", post(handle_start_run).get(handle_list_runs))
        .route("/runs/{id}", get(handle_get_run))
        .route("/runs/{id}/cancel", post(handle_cancel_run))
        .route("/proposals", get(handle_list_proposals))
        .route("/proposals/bulk", post(handle_bulk))
        .route("/proposals/revalidate", post(handle_revalidate))
        .route(
            "/proposals/{id}",
            get(handle_get_proposal).delete(handle_discard),
        )
        .route("/proposals/{id}/transition", post(handle_transition))
        .route("/proposals/{id}/apply", post(handle_apply))
        .route("/proposals/{id}/rollback", post(handle_rollback))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { advisor })
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

impl From<AdvisorError> for AppError {
    fn from(err: AdvisorError) -> Self {
        let code = err.code();
        let status = match code {
            "not_found" => StatusCode::NOT_FOUND,
            "invalid_transition" | "not_accepted" | "not_applied" | "drifted" => {
                StatusCode::CONFLICT
            }
            "invalid_structure" | "rescan_failed" => StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_action" | "no_documents" | "invalid_documents" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code, error = %format!("{:#}", err), "request failed");
        }
        AppError {
            status,
            code: code.to_string(),
            message: format!("{:#}", err),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Runs ============

#[derive(Deserialize, Default)]
struct StartRunRequest {
    #[serde(default)]
    paths: Vec<String>,
}

#[derive(Serialize)]
struct StartRunResponse {
    run_id: String,
}

/// The body is optional; an empty body analyzes every document.
async fn handle_start_run(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<StartRunResponse>), AppError> {
    let request: StartRunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRunRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(e.to_string()))?
    };
    let run_id = state
        .advisor
        .start_run(&DocumentFilter::paths(request.paths))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { run_id })))
}

#[derive(Deserialize)]
struct ListRunsQuery {
    limit: Option<usize>,
}

#[derive(Serialize)]
struct RunsResponse {
    runs: Vec<Run>,
}

async fn handle_list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<RunsResponse>, AppError> {
    let runs = state
        .advisor
        .list_runs(query.limit.unwrap_or(20).min(500))
        .await?;
    Ok(Json(RunsResponse { runs }))
}

async fn handle_get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    Ok(Json(state.advisor.get_run(&id).await?))
}

async fn handle_cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Run>, AppError> {
    Ok(Json(state.advisor.cancel_run(&id).await?))
}

// ============ Proposals ============

#[derive(Deserialize)]
struct ListProposalsQuery {
    run_id: Option<String>,
    status: Option<String>,
}

#[derive(Serialize)]
struct ProposalsResponse {
    proposals: Vec<Proposal>,
}

async fn handle_list_proposals(
    State(state): State<AppState>,
    Query(query): Query<ListProposalsQuery>,
) -> Result<Json<ProposalsResponse>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ProposalStatus>)
        .transpose()
        .map_err(|e| bad_request(e.to_string()))?;
    let proposals = state
        .advisor
        .list_proposals(&ProposalFilter {
            run_id: query.run_id,
            status,
        })
        .await?;
    Ok(Json(ProposalsResponse { proposals }))
}

#[derive(Serialize)]
struct ProposalDetail {
    proposal: Proposal,
    backups: Vec<BackupRecord>,
    applied: Option<AppliedRecord>,
}

async fn handle_get_proposal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProposalDetail>, AppError> {
    let proposal = state.advisor.get_proposal(&id).await?;
    let backups = state.advisor.backups(&id).await?;
    let applied = state.advisor.applied(&id).await?;
    Ok(Json(ProposalDetail {
        proposal,
        backups,
        applied,
    }))
}

async fn handle_discard(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.advisor.discard_proposal(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct TransitionRequest {
    action: String,
}

fn parse_action(action: &str) -> Result<ProposalAction, AppError> {
    match action.parse::<ProposalAction>() {
        Ok(a @ (ProposalAction::Accept | ProposalAction::Reject | ProposalAction::Rescan)) => Ok(a),
        Ok(other) => Err(bad_request(format!(
            "action '{}' cannot be requested here; use accept, reject, or rescan",
            other
        ))),
        Err(e) => Err(bad_request(e.to_string())),
    }
}

async fn handle_transition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<TransitionRequest>,
) -> Result<Json<Proposal>, AppError> {
    let action = parse_action(&request.action)?;
    Ok(Json(state.advisor.transition_proposal(&id, action).await?))
}

async fn handle_apply(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AppliedRecord>, AppError> {
    Ok(Json(state.advisor.apply_proposal(&id).await?))
}

async fn handle_rollback(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AppliedRecord>, AppError> {
    Ok(Json(state.advisor.rollback_proposal(&id).await?))
}

#[derive(Deserialize)]
struct BulkRequest {
    ids: Vec<String>,
    action: String,
}

async fn handle_bulk(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Result<Json<BulkResult>, AppError> {
    let action = parse_action(&request.action)?;
    Ok(Json(state.advisor.bulk_transition(&request.ids, action).await))
}

#[derive(Serialize)]
struct RevalidateResponse {
    stale: Vec<String>,
}

async fn handle_revalidate(
    State(state): State<AppState>,
) -> Result<Json<RevalidateResponse>, AppError> {
    let stale = state.advisor.revalidate().await?;
    Ok(Json(RevalidateResponse { stale }))
}
