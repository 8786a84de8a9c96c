//! Reelforge - resumable chunked video uploads
//!
//! This library crate exposes the server, playback and post-merge
//! collaborators for integration testing. The upload session engine itself
//! lives in `reelforge-upload`.

pub mod config;
pub mod conversion;
pub mod finalize;
pub mod publish;
pub mod server;
pub mod streaming;
