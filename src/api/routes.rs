//! API route definitions.
//!
//! Views are read-only. Triggering a run, toggling the agent and ingesting
//! signals require the shared secret.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::state::AppState;
use super::ApiError;
use crate::signals::{sqlite as ingest, ErrorEvent, LatencySample, LogLine};
use crate::storage::findings::FindingStatus;
use crate::storage::journal::{LogQuery, DEFAULT_LIMIT, MAX_LIMIT};
use crate::storage::tasks::TaskStatus;

pub const SECRET_HEADER: &str = "x-opswarden-secret";

type ApiResult = Result<Json<Value>, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/agent/status", get(agent_status))
        .route("/agent/logs", get(agent_logs))
        .route("/agent/reports", get(agent_reports))
        .route("/agent/findings", get(agent_findings))
        .route("/agent/tasks", get(agent_tasks))
        .route("/agent/run", post(trigger_run))
        .route("/agent/enabled", put(set_enabled))
        .route("/signals/errors", post(ingest_errors))
        .route("/signals/latency", post(ingest_latency))
        .route("/signals/logs", post(ingest_logs))
}

fn meta(extra: Value) -> Value {
    let mut meta = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    });
    if let (Some(m), Some(extra)) = (meta.as_object_mut(), extra.as_object()) {
        m.extend(extra.clone());
    }
    meta
}

fn clamp(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// Accept the secret from `x-opswarden-secret` or `Authorization: Bearer`.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.secret.as_deref() else {
        return Err(ApiError::SecretNotConfigured);
    };
    let presented = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        });
    match presented {
        Some(p) if constant_time_eq(p.as_bytes(), expected.as_bytes()) => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta(json!({}))
    }))
}

async fn agent_status(State(state): State<AppState>) -> ApiResult {
    let agent = state
        .state
        .load()
        .map_err(|e| ApiError::Internal(e.into()))?;
    let findings = state.findings.count_by_status()?;
    let tasks = state.tasks.count_by_status()?;
    let latest_report = state.journal.latest_report()?;
    Ok(Json(json!({
        "data": {
            "agent": agent,
            "findings": findings,
            "tasks": tasks,
            "latest_report": latest_report,
        },
        "meta": meta(json!({}))
    })))
}

async fn agent_logs(State(state): State<AppState>, Query(query): Query<LogQuery>) -> ApiResult {
    let entries = state.journal.logs(&query)?;
    Ok(Json(json!({
        "data": entries,
        "meta": meta(json!({ "total": entries.len(), "limit": clamp(query.limit) }))
    })))
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

async fn agent_reports(State(state): State<AppState>, Query(query): Query<RangeQuery>) -> ApiResult {
    let reports = state
        .journal
        .reports(query.since, query.until, clamp(query.limit))?;
    Ok(Json(json!({
        "data": reports,
        "meta": meta(json!({ "total": reports.len() }))
    })))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn agent_findings(State(state): State<AppState>, Query(query): Query<StatusQuery>) -> ApiResult {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<FindingStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let findings = state.findings.list(status, clamp(query.limit))?;
    Ok(Json(json!({
        "data": findings,
        "meta": meta(json!({ "total": findings.len() }))
    })))
}

async fn agent_tasks(State(state): State<AppState>, Query(query): Query<StatusQuery>) -> ApiResult {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<TaskStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let tasks = state.tasks.list(status, clamp(query.limit))?;
    Ok(Json(json!({
        "data": tasks,
        "meta": meta(json!({ "total": tasks.len() }))
    })))
}

async fn trigger_run(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    authorize(&state, &headers)?;
    let outcome = state
        .scheduler
        .run_once(Utc::now())
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(Json(json!({
        "data": outcome,
        "meta": meta(json!({}))
    })))
}

#[derive(Debug, Deserialize)]
struct EnabledBody {
    enabled: bool,
}

async fn set_enabled(State(state): State<AppState>, headers: HeaderMap, Json(body): Json<EnabledBody>) -> ApiResult {
    authorize(&state, &headers)?;
    let agent = state
        .state
        .set_enabled(body.enabled, Utc::now())
        .map_err(|e| ApiError::Internal(e.into()))?;
    tracing::info!(enabled = body.enabled, "agent toggled via api");
    Ok(Json(json!({
        "data": agent,
        "meta": meta(json!({}))
    })))
}

fn accepted(n: usize) -> Json<Value> {
    Json(json!({
        "data": { "accepted": n },
        "meta": meta(json!({}))
    }))
}

async fn ingest_errors(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(events): Json<Vec<ErrorEvent>>,
) -> ApiResult {
    authorize(&state, &headers)?;
    Ok(accepted(ingest::ingest_errors(&state.pool, &events)?))
}

async fn ingest_latency(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(samples): Json<Vec<LatencySample>>,
) -> ApiResult {
    authorize(&state, &headers)?;
    Ok(accepted(ingest::ingest_latency(&state.pool, &samples)?))
}

async fn ingest_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(lines): Json<Vec<LogLine>>,
) -> ApiResult {
    authorize(&state, &headers)?;
    Ok(accepted(ingest::ingest_logs(&state.pool, &lines)?))
}
