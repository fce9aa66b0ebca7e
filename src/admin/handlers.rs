use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::ledger::{LedgerError, LedgerStore, OnchainTx};
use crate::settlement::{DrainReport, ProcessError, QueueProcessor};

/// Shared state of the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub store: LedgerStore,
    pub processor: Arc<QueueProcessor>,
    pub api_key: Arc<str>,
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub chain_healthy: bool,
    pub halted: Option<String>,
    pub queue: BTreeMap<String, i64>,
}

#[derive(Deserialize)]
pub struct RequeueParams {
    #[serde(default)]
    pub force: bool,
}

/// Error body: `{"error": "..."}`.
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let status = match &e {
            LedgerError::ReferenceNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::RequeueRefused { .. } | LedgerError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl From<ProcessError> for ApiError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Ledger(e) => e.into(),
            e @ ProcessError::Halted(_) => ApiError(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            e @ ProcessError::Unrecorded { .. } => {
                ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            other => ApiError(StatusCode::BAD_GATEWAY, other.to_string()),
        }
    }
}

async fn queue_counts(store: &LedgerStore) -> Result<BTreeMap<String, i64>, ApiError> {
    let mut conn = store.acquire().await?;
    Ok(store.count_by_status(&mut conn).await?)
}

pub async fn get_status(State(state): State<AdminState>) -> Result<Json<SystemStatus>, ApiError> {
    let queue = queue_counts(&state.store).await?;
    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        chain_healthy: state.processor.chain().is_healthy().await,
        halted: state.processor.halted().map(str::to_string),
        queue,
    }))
}

pub async fn get_queue(
    State(state): State<AdminState>,
) -> Result<Json<BTreeMap<String, i64>>, ApiError> {
    Ok(Json(queue_counts(&state.store).await?))
}

pub async fn get_tx(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
) -> Result<Json<OnchainTx>, ApiError> {
    let mut conn = state.store.acquire().await?;
    state
        .store
        .onchain_tx(&mut conn, id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("onchain tx {} not found", id)))
}

pub async fn requeue_tx(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
    Query(params): Query<RequeueParams>,
) -> Result<(StatusCode, Json<OnchainTx>), ApiError> {
    let mut tx = state.store.begin().await?;
    let retry = state.store.requeue(&mut tx, id, params.force).await?;
    tx.commit().await.map_err(LedgerError::from)?;

    tracing::info!(tx_id = %id, retry_id = %retry.id, force = params.force, "Intent requeued");
    Ok((StatusCode::CREATED, Json(retry)))
}

pub async fn trigger_drain(
    State(state): State<AdminState>,
) -> Result<Json<DrainReport>, ApiError> {
    let report = state.processor.drain_once().await?;
    Ok(Json(report))
}
