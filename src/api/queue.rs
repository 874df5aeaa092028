//! Operation queue endpoints.
//!
//! Every route takes an optional `?chunk=` query parameter selecting the
//! chunk; without it the configured default chunk is used. Request bodies are
//! parsed leniently: an empty body is accepted wherever no field is required.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::metrics::OperationMetrics;
use crate::queue::{
    DeleteReport, FailedDelete, OperationQueue, QueueError, Snapshot, SnapshotDocument, SortKey,
};
use crate::server::AppState;

use super::retry::RetryPolicy;

#[derive(Debug, Default, Deserialize)]
pub struct ChunkQuery {
    /// Target chunk; the configured default when absent
    pub chunk: Option<String>,
}

/// Body of `GET /dy-queue`.
#[derive(Debug, Serialize)]
pub struct ListResponse {
    /// Sort key of the newest live item
    pub skey: Option<SortKey>,
    /// Payloads in arrival order
    pub data: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub status: &'static str,
    pub message: String,
    pub skey: SortKey,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    /// "ok" or "partial"
    pub status: &'static str,
    pub deleted: usize,
    pub failed: Vec<FailedDelete>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SnapshotResponse {
    pub status: &'static str,
    pub snapshot: Snapshot,
}

fn chunk_key(state: &AppState, query: ChunkQuery) -> String {
    query
        .chunk
        .unwrap_or_else(|| state.queue.default_chunk_key().to_string())
}

/// Parse an optional JSON body. Empty or whitespace-only bodies yield `None`.
fn parse_body(body: &Bytes) -> Result<Option<Value>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    serde_json::from_slice(body)
        .map(Some)
        .map_err(|e| AppError::Validation(format!("Request body is not valid JSON: {}", e)))
}

/// Extract the payload of an enqueue request.
///
/// Strings are stored as given; any other JSON value is stored in its
/// compact serialized form.
fn payload_from_body(body: Option<Value>) -> Result<String> {
    match body.as_ref().and_then(|b| b.get("data")) {
        Some(Value::String(data)) => Ok(data.clone()),
        Some(Value::Null) | None => Err(AppError::Validation(
            "Request body must contain a \"data\" field".to_string(),
        )),
        Some(other) => Ok(other.to_string()),
    }
}

/// GET /dy-queue - List the live items of a chunk
#[tracing::instrument(name = "http.list_queue", skip(state, query), fields(chunk = ?query.chunk))]
pub async fn list_items(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
) -> Result<Json<ListResponse>> {
    let chunk = chunk_key(&state, query);
    let queue: &OperationQueue = &state.queue;
    let chunk_ref: &str = &chunk;

    let items = state
        .retry
        .run("list", move || queue.list(chunk_ref))
        .await?;

    Ok(Json(ListResponse {
        skey: items.last().map(|item| item.sort_key.clone()),
        data: items.into_iter().map(|item| item.payload).collect(),
    }))
}

/// POST /dy-queue - Append an item to a chunk
#[tracing::instrument(name = "http.enqueue", skip(state, query, body), fields(chunk = ?query.chunk))]
pub async fn enqueue_item(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<Json<EnqueueResponse>> {
    let payload = payload_from_body(parse_body(&body)?)?;
    let chunk = chunk_key(&state, query);
    let queue: &OperationQueue = &state.queue;
    let chunk_ref: &str = &chunk;

    let item = state
        .retry
        .run("enqueue", move || queue.enqueue(chunk_ref, payload.clone()))
        .await?;

    Ok(Json(EnqueueResponse {
        status: "ok",
        message: String::new(),
        skey: item.sort_key,
    }))
}

/// DELETE /dy-queue - Remove every item of a chunk
///
/// A partially cleared chunk is cleared again, up to the retry limit. If rows
/// are still left the response is 502 with the rows that failed.
#[tracing::instrument(name = "http.delete_queue", skip(state, query, body), fields(chunk = ?query.chunk))]
pub async fn delete_items(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<DeleteResponse>)> {
    // The body carries nothing the operation needs, but it must be JSON if present
    parse_body(&body)?;
    let chunk = chunk_key(&state, query);

    let (deleted, report) = delete_with_retries(&state.queue, &state.retry, &chunk).await?;

    if report.is_complete() {
        Ok((
            StatusCode::OK,
            Json(DeleteResponse {
                status: "ok",
                deleted,
                failed: Vec::new(),
            }),
        ))
    } else {
        tracing::error!(
            chunk_key = %chunk,
            deleted = deleted,
            failed = report.failed.len(),
            "Chunk could not be fully cleared"
        );
        Ok((
            StatusCode::BAD_GATEWAY,
            Json(DeleteResponse {
                status: "partial",
                deleted,
                failed: report.failed,
            }),
        ))
    }
}

/// Clear a chunk, repeating while rows are left over.
///
/// Returns the rows deleted across all passes and the last pass's report.
async fn delete_with_retries(
    queue: &OperationQueue,
    retry: &RetryPolicy,
    chunk: &str,
) -> std::result::Result<(usize, DeleteReport), QueueError> {
    let mut backoff = retry.backoff();
    let mut deleted = 0;
    let mut pass = 1;

    loop {
        let report = retry.run("delete_all", move || queue.delete_all(chunk)).await?;
        deleted += report.deleted;

        if report.is_complete() || pass >= retry.max_attempts() {
            return Ok((deleted, report));
        }

        OperationMetrics::record_retry("delete_all", "PARTIAL");
        tokio::time::sleep(backoff.next_delay()).await;
        pass += 1;
    }
}

/// PATCH /dy-queue - Accepted and ignored
#[tracing::instrument(name = "http.patch_queue", skip(query), fields(chunk = ?query.chunk))]
pub async fn patch_queue(Query(query): Query<ChunkQuery>) -> Json<StatusResponse> {
    tracing::debug!("PATCH acknowledged without effect");
    Json(StatusResponse {
        status: "ok",
        message: String::new(),
    })
}

/// POST /dy-queue/snapshot - Write the live items of a chunk to blob storage
#[tracing::instrument(name = "http.create_snapshot", skip(state, query), fields(chunk = ?query.chunk))]
pub async fn create_snapshot(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
) -> Result<Json<SnapshotResponse>> {
    let chunk = chunk_key(&state, query);
    let queue: &OperationQueue = &state.queue;
    let chunk_ref: &str = &chunk;

    let snapshot = state
        .retry
        .run("snapshot", move || queue.snapshot(chunk_ref))
        .await?;

    Ok(Json(SnapshotResponse {
        status: "ok",
        snapshot,
    }))
}

/// GET /dy-queue/snapshot - Newest snapshot of a chunk
#[tracing::instrument(name = "http.latest_snapshot", skip(state, query), fields(chunk = ?query.chunk))]
pub async fn latest_snapshot(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
) -> Result<Json<SnapshotDocument>> {
    let chunk = chunk_key(&state, query);
    let queue: &OperationQueue = &state.queue;
    let chunk_ref: &str = &chunk;

    let document = state
        .retry
        .run("latest_snapshot", move || queue.latest_snapshot(chunk_ref))
        .await?;

    document
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No snapshot for chunk {:?}", chunk)))
}
