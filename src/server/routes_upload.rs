//! Chunked upload API.
//!
//! - `POST /upload/chunk` - multipart chunk delivery
//! - `POST /upload/complete` - re-run conversion and publishing for a merged upload
//! - `GET /upload/sessions` - in-flight sessions
//! - `DELETE /upload/sessions/:file_name` - abandon an open session

use axum::{
    extract::{multipart::Field, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use futures::TryStreamExt;
use reelforge_common::{Error, SessionId};
use reelforge_upload::{reclaim_chunks, MergedArtifact, SessionSummary};
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;

use super::{AppContext, AppError};
use crate::finalize::FinalizeReport;

/// Room for the multipart framing and text fields around one chunk.
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

pub fn upload_routes(max_chunk_bytes: u64) -> Router<AppContext> {
    let body_limit = usize::try_from(max_chunk_bytes.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);

    Router::new()
        .route(
            "/upload/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/upload/complete", post(complete_upload))
        .route("/upload/sessions", get(list_sessions))
        .route("/upload/sessions/:file_name", delete(abort_session))
}

/// Reply while chunks are still outstanding.
#[derive(Debug, Serialize)]
struct ChunkAccepted {
    message: String,
    file_name: String,
    received: u64,
    total_chunks: u64,
}

/// Reply once the upload has been merged and finalized.
#[derive(Debug, Serialize)]
struct UploadFinished {
    message: String,
    file_name: String,
    size: u64,
    playback_url: String,
    published_url: Option<String>,
    publish_error: Option<String>,
}

impl From<FinalizeReport> for UploadFinished {
    fn from(report: FinalizeReport) -> Self {
        Self {
            message: format!("Upload of {} complete", report.session_id),
            file_name: report.session_id,
            size: report.byte_size,
            playback_url: report.playback_url,
            published_url: report.published_url,
            publish_error: report.publish_error,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ChunkReply {
    Pending(ChunkAccepted),
    Finished(UploadFinished),
}

/// Text fields that must precede the `chunk` part.
#[derive(Default)]
struct ChunkFields {
    file_name: Option<String>,
    chunk_number: Option<u64>,
    total_chunks: Option<u64>,
}

fn multipart_error(e: axum::extract::multipart::MultipartError) -> Error {
    Error::invalid_argument(format!("malformed multipart body: {}", e.body_text()))
}

async fn read_text(field: Field<'_>) -> Result<String, Error> {
    field.text().await.map_err(multipart_error)
}

fn parse_count(name: &str, value: &str) -> Result<u64, Error> {
    value.trim().parse().map_err(|_| {
        Error::invalid_argument(format!(
            "{name} must be a non-negative integer, got {value:?}"
        ))
    })
}

async fn upload_chunk(
    State(ctx): State<AppContext>,
    mut multipart: Multipart,
) -> Result<Json<ChunkReply>, AppError> {
    let mut fields = ChunkFields::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "fileName" => fields.file_name = Some(read_text(field).await?),
            "chunkNumber" => {
                fields.chunk_number = Some(parse_count("chunkNumber", &read_text(field).await?)?)
            }
            "totalChunks" => {
                fields.total_chunks = Some(parse_count("totalChunks", &read_text(field).await?)?)
            }
            "chunk" => {
                let (Some(file_name), Some(index), Some(total_chunks)) =
                    (fields.file_name.take(), fields.chunk_number, fields.total_chunks)
                else {
                    return Err(Error::invalid_argument(
                        "fileName, chunkNumber and totalChunks must precede the chunk",
                    )
                    .into());
                };
                let session_id = SessionId::parse(file_name)?;
                return accept_chunk(&ctx, session_id, total_chunks, index, field).await;
            }
            other => {
                tracing::debug!(field = other, "Ignoring unknown multipart field");
            }
        }
    }

    Err(Error::invalid_argument("chunk data is missing").into())
}

async fn accept_chunk(
    ctx: &AppContext,
    session_id: SessionId,
    total_chunks: u64,
    index: u64,
    field: Field<'_>,
) -> Result<Json<ChunkReply>, AppError> {
    let body = Box::pin(field.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let reader = StreamReader::new(body);

    let receipt = ctx
        .ingestor
        .ingest(&session_id, total_chunks, index, reader)
        .await?;

    if !receipt.is_ready_to_merge() {
        return Ok(Json(ChunkReply::Pending(ChunkAccepted {
            message: format!(
                "Chunk {} of {} received, waiting for other chunks",
                index + 1,
                receipt.total_chunks
            ),
            file_name: session_id.to_string(),
            received: receipt.received,
            total_chunks: receipt.total_chunks,
        })));
    }

    let artifact = ctx.merger.merge(&session_id).await?;
    let report = ctx.finalizer.finalize(&artifact).await?;
    Ok(Json(ChunkReply::Finished(report.into())))
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    #[serde(rename = "fileName")]
    file_name: Option<String>,
}

async fn complete_upload(
    State(ctx): State<AppContext>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<UploadFinished>, AppError> {
    let file_name = request
        .file_name
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::invalid_argument("fileName is missing"))?;
    let session_id = SessionId::parse(file_name)?;

    let path = ctx.merger.artifact_path(&session_id);
    let artifact = MergedArtifact::open_existing(session_id, path).await?;
    let report = ctx.finalizer.finalize(&artifact).await?;
    Ok(Json(report.into()))
}

async fn list_sessions(State(ctx): State<AppContext>) -> Json<Vec<SessionSummary>> {
    Json(ctx.registry.snapshot())
}

async fn abort_session(
    State(ctx): State<AppContext>,
    Path(file_name): Path<String>,
) -> Result<StatusCode, AppError> {
    let session_id = SessionId::parse(file_name)?;
    let records = ctx.registry.abort(&session_id)?;
    reclaim_chunks(ctx.store.as_ref(), &session_id, &records).await;
    Ok(StatusCode::NO_CONTENT)
}
