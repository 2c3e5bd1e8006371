//! Build query and submission endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use shipyard_bus::{Topic, publish_json};
use shipyard_core::{BuildId, BuildRecord, BuildRequest, LogEntry, redact_url};
use tracing::info;

use crate::OrchestratorState;
use crate::error::ApiError;

const DEFAULT_LIMIT: u32 = 50;
const ANONYMOUS: &str = "anonymous";

pub fn router() -> Router<OrchestratorState> {
    Router::new()
        .route("/", get(list_builds).post(submit_build))
        .route("/stalled", get(stalled_builds))
        .route("/{id}", get(get_build))
        .route("/{id}/logs", get(get_logs))
}

fn parse_id(raw: &str) -> Result<BuildId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid build id: {}", raw)))
}

/// Records leave the API with repository credentials removed.
fn redacted(mut record: BuildRecord) -> BuildRecord {
    record.repository_url = redact_url(&record.repository_url);
    record
}

fn redacted_all(records: Vec<BuildRecord>) -> Vec<BuildRecord> {
    records.into_iter().map(redacted).collect()
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u32>,
}

async fn list_builds(
    State(state): State<OrchestratorState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BuildRecord>>, ApiError> {
    let builds = state
        .orchestrator
        .list_builds(query.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;
    Ok(Json(redacted_all(builds)))
}

async fn get_build(
    State(state): State<OrchestratorState>,
    Path(id): Path<String>,
) -> Result<Json<BuildRecord>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(redacted(state.orchestrator.get_build(id).await?)))
}

async fn get_logs(
    State(state): State<OrchestratorState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.get_logs(id).await?))
}

async fn stalled_builds(
    State(state): State<OrchestratorState>,
) -> Result<Json<Vec<BuildRecord>>, ApiError> {
    let stalled = state.orchestrator.stalled(state.max_queued_age).await?;
    Ok(Json(redacted_all(stalled)))
}

#[derive(Debug, Deserialize)]
struct SubmitBuildRequest {
    repository_url: String,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    commit_hash: Option<String>,
    #[serde(default)]
    submitter_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitBuildResponse {
    pub build_id: BuildId,
    pub message: String,
}

/// Development entry point. Production submissions arrive on
/// `build-requests` from the authenticated gateway.
async fn submit_build(
    State(state): State<OrchestratorState>,
    Json(req): Json<SubmitBuildRequest>,
) -> Result<(StatusCode, Json<SubmitBuildResponse>), ApiError> {
    let submitter = req
        .submitter_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| ANONYMOUS.to_string());
    let mut request = BuildRequest::new(req.repository_url, submitter);
    request.branch = req.branch;
    request.commit_hash = req.commit_hash;
    request.validate()?;

    publish_json(
        state.bus.as_ref(),
        Topic::BuildRequests,
        &request.id.partition_key(),
        &request,
    )
    .await?;
    info!(
        build_id = %request.id,
        repository = %redact_url(&request.repository_url),
        "Build request submitted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitBuildResponse {
            build_id: request.id,
            message: "Build request submitted successfully".to_string(),
        }),
    ))
}
