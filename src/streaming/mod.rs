//! Playback of merged uploads.
//!
//! # Routes
//!
//! - `GET /play/{file_name}` - Full or ranged delivery of a merged artifact

mod direct;
pub mod range;

pub use direct::{guess_content_type, serve_artifact, stream_artifact, StreamResponse};
pub use range::{ByteRange, RangeSpec};

use axum::{routing::get, Router};

use crate::server::AppContext;

/// Create the playback router.
pub fn play_router() -> Router<AppContext> {
    Router::new().route("/:file_name", get(stream_artifact))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_router_creation() {
        let _router: Router<AppContext> = play_router();
    }
}
