mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Environment variable consulted when `publish.api_key` is unset.
pub const PUBLISH_API_KEY_ENV: &str = "REELFORGE_PUBLISH_API_KEY";

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    apply_env(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    // Try default locations
    let default_paths = [
        "./reelforge.toml",
        "./config.toml",
        "~/.config/reelforge/config.toml",
        "/etc/reelforge/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    let mut config = Config::default();
    apply_env(&mut config);
    Ok(config)
}

fn apply_env(config: &mut Config) {
    if config.publish.api_key.is_none() {
        if let Ok(key) = std::env::var(PUBLISH_API_KEY_ENV) {
            if !key.is_empty() {
                config.publish.api_key = Some(key);
            }
        }
    }
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    if config.upload.max_total_chunks == 0 {
        anyhow::bail!("upload.max_total_chunks must be greater than 0");
    }
    if config.upload.max_chunk_bytes == 0 {
        anyhow::bail!("upload.max_chunk_bytes must be greater than 0");
    }
    if config.upload.reap_interval_secs == 0 {
        anyhow::bail!("upload.reap_interval_secs must be greater than 0");
    }

    // Scratch blobs and artifacts must not share a namespace.
    let storage = &config.storage;
    if storage.chunk_dir == storage.artifact_dir
        || storage.chunk_dir.starts_with(&storage.artifact_dir)
        || storage.artifact_dir.starts_with(&storage.chunk_dir)
    {
        anyhow::bail!(
            "storage.chunk_dir {:?} and storage.artifact_dir {:?} must not overlap",
            storage.chunk_dir,
            storage.artifact_dir
        );
    }

    if config.conversion.enabled && config.conversion.target_extension.trim().is_empty() {
        anyhow::bail!("conversion.target_extension cannot be empty");
    }

    if config.publish.enabled {
        match config.publish.endpoint.as_deref() {
            None | Some("") => anyhow::bail!("publish is enabled but publish.endpoint is not set"),
            Some(endpoint) if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") => {
                anyhow::bail!("publish.endpoint must be an http(s) URL: {}", endpoint)
            }
            Some(_) => {}
        }
    }

    Ok(())
}
