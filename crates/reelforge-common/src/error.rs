//! Unified error type for reelforge.
//!
//! Every failure in the upload and playback paths funnels into [`Error`],
//! which carries enough structure for the HTTP layer to derive a status code
//! via [`Error::http_status`] and a stable machine-readable [`Error::code`].

use std::fmt;

/// Unified error type covering all failure modes in reelforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request argument was malformed (bad chunk metadata, bad range, bad name).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A chunk index fell outside the session's declared bounds.
    #[error("Chunk index {index} out of range (total chunks: {total})")]
    OutOfRange {
        /// The offending index.
        index: u64,
        /// The session's declared chunk count.
        total: u64,
    },

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "artifact").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// An I/O failure while writing or reading a chunk or artifact.
    #[error("Storage error ({context}): {source}")]
    Storage {
        /// What was being done when the failure happened.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A merge was aborted; no artifact was created.
    #[error("Merge of '{session}' failed: {message}")]
    Merge {
        /// Session whose merge failed.
        session: String,
        /// Human-readable error description.
        message: String,
    },

    /// The requested byte range lies outside the artifact.
    #[error("Range '{range}' not satisfiable for {size} byte artifact")]
    RangeNotSatisfiable {
        /// The raw range the client asked for.
        range: String,
        /// Size of the artifact in bytes.
        size: u64,
    },

    /// A chunk arrived for a session that is already merging or merged.
    #[error("Upload session '{0}' is closed")]
    SessionClosed(String),

    /// A second merge was attempted for the same session.
    #[error("Upload session '{0}' is already merging")]
    AlreadyMerging(String),

    /// An external tool (ffmpeg) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Publishing an artifact to remote storage failed.
    #[error("Publish error: {0}")]
    Publish(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) => 400,
            Error::OutOfRange { .. } => 400,
            Error::NotFound { .. } => 404,
            Error::Storage { .. } => 500,
            Error::Merge { .. } => 500,
            Error::RangeNotSatisfiable { .. } => 416,
            Error::SessionClosed(_) => 409,
            Error::AlreadyMerging(_) => 409,
            Error::Tool { .. } => 502,
            Error::Publish(_) => 502,
            Error::Internal(_) => 500,
        }
    }

    /// Stable machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::OutOfRange { .. } => "out_of_range",
            Error::NotFound { .. } => "not_found",
            Error::Storage { .. } => "storage_error",
            Error::Merge { .. } => "merge_error",
            Error::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            Error::SessionClosed(_) => "session_closed",
            Error::AlreadyMerging(_) => "already_merging",
            Error::Tool { .. } => "tool_error",
            Error::Publish(_) => "publish_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether the client may resend the same request and expect progress.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::Publish(_))
    }

    /// Convenience constructor for [`Error::InvalidArgument`].
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Storage`].
    pub fn storage(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Storage {
            context: context.into(),
            source,
        }
    }

    /// Convenience constructor for [`Error::Merge`].
    pub fn merge(session: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::Merge {
            session: session.to_string(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Error::Storage {
            context: "io".to_string(),
            source,
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
