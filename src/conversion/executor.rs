//! FFmpeg-backed transcoding of merged uploads.

use async_trait::async_trait;
use reelforge_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ConversionConfig;

/// Converts a finished artifact into another container format.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Transcode `input`, returning the path of the new file.
    ///
    /// The input is never modified. On failure no output file is left behind.
    async fn transcode(&self, input: &Path) -> Result<PathBuf>;
}

/// Transcoding settings.
#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    /// ffmpeg binary.
    pub ffmpeg_path: PathBuf,
    /// Extension of produced files (default: mp4).
    pub target_extension: String,
    /// Output directory for converted files.
    pub output_dir: PathBuf,
    /// Move the moov atom to the front so the output plays while downloading.
    pub faststart: bool,
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            target_extension: "mp4".to_string(),
            output_dir: PathBuf::from("./data/converted"),
            faststart: true,
        }
    }
}

impl From<&ConversionConfig> for TranscodeSettings {
    fn from(config: &ConversionConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            target_extension: config.target_extension.clone(),
            output_dir: config.output_dir.clone(),
            faststart: true,
        }
    }
}

/// Runs `ffmpeg` as a child process.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTranscoder {
    settings: TranscodeSettings,
}

impl FfmpegTranscoder {
    pub fn new(settings: TranscodeSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &TranscodeSettings {
        &self.settings
    }

    /// Where the converted copy of `input` is written.
    pub fn output_path(&self, input: &Path) -> PathBuf {
        let file_stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("output");
        self.settings
            .output_dir
            .join(format!("{}.{}", file_stem, self.settings.target_extension))
    }

    /// ffmpeg arguments converting `input` into `output`.
    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
        ];

        if self.settings.faststart {
            args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        }

        args.extend([
            "-y".to_string(), // Overwrite
            output.to_string_lossy().to_string(),
        ]);

        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.settings.output_dir)
            .await
            .map_err(|e| {
                Error::storage(
                    format!("create {}", self.settings.output_dir.display()),
                    e,
                )
            })?;

        let output = self.output_path(input);
        let args = self.build_args(input, &output);
        debug!("FFmpeg args: {:?}", args);

        let result = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let failure = match result {
            Ok(out) if out.status.success() => {
                info!(input = %input.display(), output = %output.display(), "Converted upload");
                return Ok(output);
            }
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
                let detail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
                Error::tool(
                    "ffmpeg",
                    format!("exited with status {}: {}", out.status, detail),
                )
            }
            Err(e) => Error::tool("ffmpeg", format!("failed to execute: {e}")),
        };

        if let Err(e) = tokio::fs::remove_file(&output).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(output = %output.display(), error = %e, "Failed to remove partial conversion");
            }
        }
        Err(failure)
    }
}
