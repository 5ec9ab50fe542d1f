use std::sync::Arc;
use std::time::Duration;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use shared::payload::ScanMessage;
use shared::protocol::{MONITOR_PATH, SCANS_PATH};
use shared::types::ScanRecord;
use crate::monitor::CycleReport;
use crate::pipeline::{Delivery, Pipeline};
use crate::store::{CallGuard, UpsertOutcome};
use crate::store_manager::StorePool;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub stores: Arc<StorePool>,
    pub report_rx: watch::Receiver<CycleReport>,
    /// Cancelled on shutdown; in-flight writes that have not committed roll back
    pub cancel: CancellationToken,
    pub snapshot_timeout: Duration,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub outcome: UpsertOutcome,
    pub rows_affected: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(SCANS_PATH, get(get_scans).post(ingest_scan))
        .route(MONITOR_PATH, get(get_monitor))
        .with_state(state)
}

/// Status code that tells the producer whether to redeliver.
fn delivery_status(delivery: Delivery) -> StatusCode {
    match delivery {
        Delivery::Ack => StatusCode::OK,
        Delivery::Nack => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// 200 acknowledges the message, including stale duplicates. 503 asks the
/// producer to redeliver. Bodies that fail to parse are rejected by the
/// extractor with a 4xx and must not be redelivered.
async fn ingest_scan(
    State(state): State<AppState>,
    Json(message): Json<ScanMessage>,
) -> Response {
    let record = message.into_record();
    let result = state.pipeline.process(record, &state.cancel).await;
    let status = delivery_status(Delivery::for_result(&result));

    match result {
        Ok(outcome) => (
            status,
            Json(IngestResponse {
                outcome,
                rows_affected: outcome.rows_affected(),
            }),
        )
            .into_response(),
        Err(e) => (status, Json(ErrorResponse { error: e.to_string() })).into_response(),
    }
}

async fn get_scans(
    State(state): State<AppState>,
) -> Result<Json<Vec<ScanRecord>>, StatusCode> {
    let guard = CallGuard::new(state.snapshot_timeout, state.cancel.child_token());
    let snapshot = state
        .stores
        .handle()
        .snapshot_all(guard)
        .await
        .map_err(|e| {
            tracing::error!("Failed to read scan results: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    let mut entries: Vec<_> = snapshot.into_iter().collect();
    entries.sort_by_key(|(key, _)| *key);
    Ok(Json(entries.into_iter().map(|(_, record)| record).collect()))
}

async fn get_monitor(State(state): State<AppState>) -> Json<CycleReport> {
    Json(state.report_rx.borrow().clone())
}
