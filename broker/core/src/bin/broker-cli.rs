//! Broker CLI
//!
//! One-shot command-line driver for the broker: reads configuration from the
//! environment (and the optional TOML file), submits a single prompt, and
//! prints the generated text.
//!
//! # Usage
//!
//! ```bash
//! # Generate from a prompt
//! GEMINI_API_KEY=... broker-cli "Name three dog breeds."
//!
//! # Analyze an image
//! GEMINI_API_KEY=... broker-cli --image photo.jpg "What breed is this?"
//!
//! # With verbose logging
//! RUST_LOG=debug broker-cli "..."
//! ```
//!
//! # Environment Variables
//!
//! - `GEMINI_API_KEY`: provider credential (required)
//! - `BROKER_CONFIG`: path to a TOML config file
//! - `BROKER_MAX_TOKENS`, `BROKER_MAX_ATTEMPTS`, ...: see the config module
//! - `RUST_LOG`: log level (trace, debug, info, warn, error)

use tracing::{info, warn};

use broker_core::{load_config, Broker, GenerateOptions};

/// Guess a MIME type from a file extension
fn mime_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or_default() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("broker_cli=info".parse()?)
                .add_directive("broker_core=info".parse()?),
        )
        .with_target(true)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let image_path = match args.first().map(String::as_str) {
        Some("--image") => {
            args.remove(0);
            if args.is_empty() {
                anyhow::bail!("--image requires a file path");
            }
            Some(args.remove(0))
        }
        _ => None,
    };

    let prompt = args.join(" ");
    if prompt.is_empty() {
        anyhow::bail!("usage: broker-cli [--image FILE] PROMPT");
    }

    let config = load_config()?;
    let broker = Broker::new(config);

    if !broker.health_check().await {
        warn!("Backend not reachable - the request may fail");
    }

    let started = std::time::Instant::now();
    let text = match image_path {
        Some(path) => {
            let bytes = std::fs::read(&path)
                .map_err(|e| anyhow::anyhow!("failed to read {path}: {e}"))?;
            broker
                .analyze_image(&bytes, mime_for(&path), &prompt, GenerateOptions::new())
                .await?
        }
        None => broker.generate_text(&prompt, GenerateOptions::new()).await?,
    };

    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        "generation complete"
    );
    println!("{text}");

    Ok(())
}
