//! Direct artifact streaming with HTTP range requests.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use reelforge_common::{Error, Result, SessionId};
use reelforge_upload::MergedArtifact;
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tokio_util::io::ReaderStream;

use super::range::{ByteRange, RangeSpec};
use crate::server::{AppContext, AppError};

/// Read size for streamed bodies.
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// A full or partial delivery of one artifact.
///
/// The body reads the file lazily; dropping the response (for instance when
/// the client disconnects) closes the file handle.
pub struct StreamResponse {
    pub status: StatusCode,
    pub range: Option<ByteRange>,
    pub total_size: u64,
    pub content_type: &'static str,
    body: ReaderStream<Take<File>>,
}

impl StreamResponse {
    /// Bytes the body will yield.
    pub fn content_length(&self) -> u64 {
        self.range.map_or(self.total_size, |r| r.len())
    }
}

impl IntoResponse for StreamResponse {
    fn into_response(self) -> Response {
        let content_length = self.content_length();

        // Headers are already out when a read fails; the error ends the
        // body stream and hyper aborts the connection.
        let stream = self.body.inspect_err(|e| {
            tracing::warn!(error = %e, "Artifact read failed mid-stream");
        });

        let mut builder = Response::builder()
            .status(self.status)
            .header(header::CONTENT_TYPE, self.content_type)
            .header(header::CONTENT_LENGTH, content_length)
            .header(header::ACCEPT_RANGES, "bytes");
        if let Some(range) = self.range {
            builder = builder.header(header::CONTENT_RANGE, range.content_range(self.total_size));
        }

        match builder.body(Body::from_stream(stream)) {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Failed to build stream response");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// Serve `artifact`, honouring an optional `Range` header value.
///
/// The range is resolved against the size of the opened file, not the size
/// recorded when the artifact was merged.
pub async fn serve_artifact(
    artifact: &MergedArtifact,
    range_header: Option<&str>,
) -> Result<StreamResponse> {
    // Reject malformed ranges before touching the file.
    let spec = range_header.map(RangeSpec::parse).transpose()?;

    let mut file = File::open(&artifact.path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found("artifact", &artifact.session_id)
        } else {
            Error::storage(format!("open {}", artifact.path.display()), e)
        }
    })?;
    let total_size = file
        .metadata()
        .await
        .map_err(|e| Error::storage(format!("stat {}", artifact.path.display()), e))?
        .len();

    let content_type = guess_content_type(artifact.session_id.as_str());

    let Some(spec) = spec else {
        return Ok(StreamResponse {
            status: StatusCode::OK,
            range: None,
            total_size,
            content_type,
            body: ReaderStream::with_capacity(file.take(total_size), STREAM_CHUNK_SIZE),
        });
    };

    let range = spec.resolve(total_size)?;
    file.seek(SeekFrom::Start(range.start))
        .await
        .map_err(|e| Error::storage(format!("seek {}", artifact.path.display()), e))?;

    tracing::debug!(
        session = %artifact.session_id,
        start = range.start,
        end = range.end,
        total_size,
        "Serving partial content"
    );

    Ok(StreamResponse {
        status: StatusCode::PARTIAL_CONTENT,
        range: Some(range),
        total_size,
        content_type,
        body: ReaderStream::with_capacity(file.take(range.len()), STREAM_CHUNK_SIZE),
    })
}

/// Guess the MIME type from the file extension.
pub fn guess_content_type(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "ts" | "m2ts" => "video/mp2t",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        _ => "application/octet-stream",
    }
}

/// Stream a merged upload by file name.
pub async fn stream_artifact(
    State(ctx): State<AppContext>,
    Path(file_name): Path<String>,
    headers: HeaderMap,
) -> std::result::Result<StreamResponse, AppError> {
    let session_id = SessionId::parse(file_name)?;
    let path = ctx.merger.artifact_path(&session_id);
    let artifact = MergedArtifact::open_existing(session_id, path).await?;

    let range = headers
        .get(header::RANGE)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| Error::invalid_argument("Range header is not valid ASCII"))
        })
        .transpose()?;

    Ok(serve_artifact(&artifact, range).await?)
}
