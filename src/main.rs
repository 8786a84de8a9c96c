mod cli;

use reelforge::{config, server};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&Path>,
) -> Result<()> {
    // Load config
    let mut config = config::load_config_or_default(config_path)?;

    // Override host/port from CLI if specified
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config::validate_config(&config)?;

    tracing::info!("Starting Reelforge server");
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );
    tracing::info!(
        chunk_dir = %config.storage.chunk_dir.display(),
        artifact_dir = %config.storage.artifact_dir.display(),
        conversion = config.conversion.enabled,
        publish = config.publish.enabled,
        "Storage configured"
    );

    server::start_server(config).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "reelforge=trace,reelforge_upload=trace,reelforge_common=debug,tower_http=debug"
                .to_string()
        } else {
            "reelforge=debug,reelforge_upload=debug,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            // Create tokio runtime
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::CheckTools => check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("reelforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;

    println!("Checking external tools...\n");

    let ffmpeg = &config.conversion.ffmpeg_path;
    match which::which(ffmpeg) {
        Ok(path) => {
            print!("✓ ffmpeg");
            let version = std::process::Command::new(&path)
                .arg("-version")
                .output()
                .ok()
                .filter(|out| out.status.success())
                .map(|out| String::from_utf8_lossy(&out.stdout).to_string());
            if let Some(version) = version {
                print!(" ({})", version.lines().next().unwrap_or(""));
            }
            println!(" - {}", path.display());
            println!("\nAll required tools are available!");
        }
        Err(_) => {
            println!("✗ ffmpeg ({})", ffmpeg.display());
            println!();
            if config.conversion.enabled {
                println!(
                    "ffmpeg is missing. Uploads with extensions {:?} cannot be converted.",
                    config.conversion.extensions
                );
            } else {
                println!("ffmpeg is missing, but conversion is disabled.");
            }
        }
    }

    Ok(())
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!("  Chunk dir: {}", config.storage.chunk_dir.display());
            println!("  Artifact dir: {}", config.storage.artifact_dir.display());
            println!(
                "  Max chunk size: {} bytes, max chunks: {}",
                config.upload.max_chunk_bytes, config.upload.max_total_chunks
            );
            println!("  Idle timeout: {}s", config.upload.idle_timeout_secs);
            println!("  Conversion enabled: {}", config.conversion.enabled);
            println!("  Publish enabled: {}", config.publish.enabled);
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
        }
    }

    Ok(())
}
