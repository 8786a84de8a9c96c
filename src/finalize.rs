//! Post-merge handling: optional conversion, then optional publishing.

use reelforge_common::Result;
use reelforge_upload::MergedArtifact;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, ConversionConfig};
use crate::conversion::{FfmpegTranscoder, TranscodeSettings, Transcoder};
use crate::publish::{HttpPublisher, Publisher};

/// Route prefix under which artifacts are played back.
pub const PLAYBACK_PREFIX: &str = "/api/play";

/// Outcome of finalizing one artifact.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub session_id: String,
    pub artifact_path: PathBuf,
    pub byte_size: u64,
    /// Converted copy, while it still exists on disk.
    pub converted_path: Option<PathBuf>,
    /// Local playback location; always usable.
    pub playback_url: String,
    pub published_url: Option<String>,
    pub publish_error: Option<String>,
}

/// Local playback URL for an artifact.
pub fn playback_url(artifact: &MergedArtifact) -> String {
    format!(
        "{}/{}",
        PLAYBACK_PREFIX,
        urlencoding::encode(artifact.session_id.as_str())
    )
}

/// Chains conversion and publishing for merged uploads.
#[derive(Clone)]
pub struct Finalizer {
    conversion: ConversionConfig,
    transcoder: Option<Arc<dyn Transcoder>>,
    publisher: Option<Arc<dyn Publisher>>,
}

impl Finalizer {
    /// A finalizer that neither converts nor publishes.
    pub fn new(conversion: ConversionConfig) -> Self {
        Self {
            conversion,
            transcoder: None,
            publisher: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut finalizer = Self::new(config.conversion.clone());
        if config.conversion.enabled {
            let settings = TranscodeSettings::from(&config.conversion);
            finalizer = finalizer.with_transcoder(Arc::new(FfmpegTranscoder::new(settings)));
        }
        if let Some(publisher) = HttpPublisher::from_config(&config.publish) {
            finalizer = finalizer.with_publisher(Arc::new(publisher));
        }
        finalizer
    }

    pub fn with_transcoder(mut self, transcoder: Arc<dyn Transcoder>) -> Self {
        self.transcoder = Some(transcoder);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Convert (when the upload's format calls for it) and publish.
    ///
    /// A conversion failure is returned as an error; the merged artifact is
    /// untouched and stays playable. A publish failure is recorded in the
    /// report instead, with the local playback URL as the fallback.
    pub async fn finalize(&self, artifact: &MergedArtifact) -> Result<FinalizeReport> {
        let extension = artifact.session_id.extension();

        let mut converted_path = None;
        if let Some(transcoder) = &self.transcoder {
            if self.conversion.requires_conversion(extension.as_deref()) {
                converted_path = Some(transcoder.transcode(&artifact.path).await?);
            }
        }

        let mut published_url = None;
        let mut publish_error = None;
        if let Some(publisher) = &self.publisher {
            let source = converted_path.as_deref().unwrap_or(&artifact.path);
            match publisher.publish(source).await {
                Ok(url) => {
                    published_url = Some(url);
                    // The merged original stays as the playback copy.
                    if let Some(converted) = converted_path.take() {
                        if let Err(e) = tokio::fs::remove_file(&converted).await {
                            tracing::warn!(path = %converted.display(), error = %e, "Failed to remove converted file");
                            converted_path = Some(converted);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %artifact.session_id, error = %e, "Publish failed, local copy kept");
                    publish_error = Some(e.to_string());
                }
            }
        }

        Ok(FinalizeReport {
            session_id: artifact.session_id.to_string(),
            artifact_path: artifact.path.clone(),
            byte_size: artifact.byte_size,
            converted_path,
            playback_url: playback_url(artifact),
            published_url,
            publish_error,
        })
    }
}
