//! Media conversion module.
//!
//! Uploads in formats that do not play well in browsers (QuickTime `.mov`
//! by default) are converted with ffmpeg before they are published. The
//! merged original is kept untouched.

mod executor;

pub use executor::{FfmpegTranscoder, TranscodeSettings, Transcoder};
