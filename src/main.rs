//! Command-line entrypoint for `pan`.
//!
//! Parses flags, loads settings, resolves the transfer jobs and hands them
//! to the engine. Ctrl+C cancels the batch.
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use pan_transfer::api::{PanApi, PanClient};
use pan_transfer::config::DEFAULT_REMOTE_ROOT;
use pan_transfer::observer::{ConsoleProgress, HiddenProgress, ProgressSurface};
use pan_transfer::resolve::{resolve_download, resolve_upload};
use pan_transfer::{
    Args, EngineConfig, FileOutcome, Settings, Throttle, TransferBatch, TransferEngine,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,pan_transfer=info,pan=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_settings(args: &Args) -> Result<Settings> {
    let settings = match &args.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    Ok(args.merge_into(settings))
}

async fn run(args: Args) -> Result<()> {
    let settings = load_settings(&args)?;
    let token = settings
        .access_token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            anyhow!("no access token: pass --access_token, set PAN_ACCESS_TOKEN or add it to the config file")
        })?;

    let config = EngineConfig::from_settings(&settings);
    let throttle = config.rate_limit.and_then(Throttle::per_second);
    let client = PanClient::new(token)
        .context("building HTTP client")?
        .with_throttle(throttle);
    let api: Arc<dyn PanApi> = Arc::new(client);

    let batch = if args.upload {
        let remote_root = settings
            .remote_root
            .as_deref()
            .unwrap_or(DEFAULT_REMOTE_ROOT);
        let specs = resolve_upload(&args.path, args.prefix.as_deref(), remote_root)
            .with_context(|| format!("reading {}", args.path))?;
        TransferBatch::uploads(specs)
    } else {
        let output_dir = settings
            .output_dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let specs = resolve_download(api.as_ref(), &args.path, &output_dir)
            .await
            .with_context(|| format!("looking up {}", args.path))?;
        TransferBatch::downloads(specs)
    };

    if batch.is_empty() {
        println!("Nothing to transfer.");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl+C, stopping transfers...");
            signal_token.cancel();
        }
    });

    let progress: Arc<dyn ProgressSurface> = if args.quiet {
        Arc::new(HiddenProgress)
    } else {
        Arc::new(ConsoleProgress::new())
    };

    let engine = TransferEngine::new(api, config)
        .with_progress(progress)
        .with_cancellation(cancel);
    let report = engine.run(batch).await?;

    println!(
        "Done: {} transferred, {} already present.",
        report.count(FileOutcome::Transferred),
        report.count(FileOutcome::AlreadyPresent)
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
