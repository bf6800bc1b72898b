//! ipfetch CLI
//!
//! Fetches one CID through the public gateways, validates it as the given
//! kind and prints the result followed by fetcher statistics.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ipfetch_core::{Content, ContentKind, FetchConfig, FetchError};
use ipfetch_fetch::{init_tracing, ContentFetcher, TelemetryConfig};

#[derive(Parser)]
#[command(name = "ipfetch")]
#[command(about = "Fetch and validate content from IPFS gateways")]
#[command(version)]
struct Cli {
    /// Content identifier (CIDv0 or CIDv1)
    cid: String,

    /// How to validate the payload (json, image, metadata, profile)
    #[arg(short, long, default_value = "json")]
    kind: ContentKind,

    /// TOML configuration file; IPFETCH_* variables still override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut telemetry = TelemetryConfig::from_env();
    telemetry.json |= cli.json_logs;
    if let Err(e) = init_tracing(&telemetry) {
        eprintln!("warning: {}", e);
    }

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<(), FetchError> {
    let config = match &cli.config {
        Some(path) => FetchConfig::from_path(path)?,
        None => FetchConfig::from_env(),
    };
    let fetcher = ContentFetcher::new(config)?;

    let result = fetcher.fetch(&cli.cid, cli.kind).await;
    if let Ok(content) = &result {
        print_content(content);
    }

    let stats = fetcher.stats().await;
    match serde_json::to_string_pretty(&stats) {
        Ok(rendered) => eprintln!("{}", rendered),
        Err(e) => tracing::warn!(error = %e, "Failed to render statistics"),
    }

    result.map(|_| ())
}

fn print_content(content: &Content) {
    match content {
        Content::Image(image) => {
            println!("{} image, {} bytes", image.mime, image.bytes.len());
        }
        Content::Json(value) | Content::Metadata(value) | Content::Profile(value) => {
            match serde_json::to_string_pretty(value) {
                Ok(rendered) => println!("{}", rendered),
                Err(_) => println!("{}", value),
            }
        }
    }
}
