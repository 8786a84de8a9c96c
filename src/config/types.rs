use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub conversion: ConversionConfig,

    #[serde(default)]
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5500
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Scratch area for chunk blobs
    #[serde(default = "default_chunk_dir")]
    pub chunk_dir: PathBuf,

    /// Where merged artifacts are published for playback
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,

    /// Sync chunks and artifacts to disk before acknowledging them
    #[serde(default = "default_fsync")]
    pub fsync: bool,
}

fn default_chunk_dir() -> PathBuf {
    PathBuf::from("./data/chunks")
}
fn default_artifact_dir() -> PathBuf {
    PathBuf::from("./data/uploads")
}
fn default_fsync() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_dir: default_chunk_dir(),
            artifact_dir: default_artifact_dir(),
            fsync: default_fsync(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UploadConfig {
    /// Largest chunk count a client may declare
    #[serde(default = "default_max_total_chunks")]
    pub max_total_chunks: u64,

    /// Largest single chunk in bytes
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: u64,

    /// Open sessions without chunk activity for this long are abandoned
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often idle sessions are looked for
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

fn default_max_total_chunks() -> u64 {
    10_000
}
fn default_max_chunk_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_idle_timeout() -> u64 {
    60 * 60
}
fn default_reap_interval() -> u64 {
    60
}

impl UploadConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_total_chunks: default_max_total_chunks(),
            max_chunk_bytes: default_max_chunk_bytes(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConversionConfig {
    #[serde(default = "default_conversion_enabled")]
    pub enabled: bool,

    /// ffmpeg binary, looked up on PATH when not absolute
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: PathBuf,

    /// Upload extensions that are converted before publishing (lowercase, no dot)
    #[serde(default = "default_conversion_extensions")]
    pub extensions: Vec<String>,

    #[serde(default = "default_target_extension")]
    pub target_extension: String,

    /// Where converted files are written
    #[serde(default = "default_converted_dir")]
    pub output_dir: PathBuf,
}

fn default_conversion_enabled() -> bool {
    true
}
fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}
fn default_conversion_extensions() -> Vec<String> {
    vec!["mov".to_string()]
}
fn default_target_extension() -> String {
    "mp4".to_string()
}
fn default_converted_dir() -> PathBuf {
    PathBuf::from("./data/converted")
}

impl ConversionConfig {
    /// Whether a file with this extension must be converted.
    pub fn requires_conversion(&self, extension: Option<&str>) -> bool {
        self.enabled
            && extension.is_some_and(|ext| {
                self.extensions
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(ext))
            })
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: default_conversion_enabled(),
            ffmpeg_path: default_ffmpeg(),
            extensions: default_conversion_extensions(),
            target_extension: default_target_extension(),
            output_dir: default_converted_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublishConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Upload endpoint receiving the multipart `file` form
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Bearer token (falls back to REELFORGE_PUBLISH_API_KEY)
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_resource_type")]
    pub resource_type: String,

    #[serde(default = "default_publish_timeout")]
    pub timeout_secs: u64,
}

fn default_resource_type() -> String {
    "video".to_string()
}
fn default_publish_timeout() -> u64 {
    600
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            resource_type: default_resource_type(),
            timeout_secs: default_publish_timeout(),
        }
    }
}
