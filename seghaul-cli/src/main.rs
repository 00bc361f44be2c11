mod cli;
mod config;
mod error;
mod input;
mod progress;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::Parser;
use seghaul_engine::{ClientPool, MediaDownloader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::Args;
use crate::config::AppConfig;
use crate::error::AppError;

const DEFAULT_LOG_FILTER: &str = "seghaul=info,seghaul_engine=info";

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let guard = match init_logging(args.verbose, args.quiet, args.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };

    let code = match run(args).await {
        Ok(output) => {
            println!("{}", output.display());
            0
        }
        Err(e) if e.is_cancelled() => {
            warn!("Download cancelled");
            eprintln!("Cancelled");
            e.exit_code()
        }
        Err(e) => {
            error!("Application error: {e}");
            eprintln!("Error: {e}");
            e.exit_code()
        }
    };

    // Flush the file writer before exiting.
    drop(guard);
    process::exit(code);
}

async fn run(args: Args) -> Result<PathBuf, AppError> {
    let config = AppConfig::load(args.config.as_deref())?;
    let mut options = config.download;
    args.apply(&mut options)?;

    let manifest_text = match &args.manifest_file {
        Some(path) => Some(tokio::fs::read_to_string(path).await?),
        None => None,
    };
    let input = args.input(manifest_text)?;
    info!(url = %input.base_url(), threads = options.thread_count, "Starting download");

    let token = CancellationToken::new();
    let stop_input = CancellationToken::new();

    let ctrl_c = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        info!("Ctrl-C received, cancelling");
                        token.cancel();
                    }
                }
                _ = token.cancelled() => {}
            }
        })
    };
    let keyboard = (!args.quiet).then(|| {
        let token = token.clone();
        let stop = stop_input.clone();
        tokio::task::spawn_blocking(move || input::input_handler(token, stop))
    });

    let (tx, rx) = mpsc::channel(256);
    let renderer = tokio::spawn(progress::render(rx, args.quiet));

    let downloader = MediaDownloader::new(Arc::new(ClientPool::new(config.profiles)));
    let result = downloader
        .download(&input, &options, Some(tx), &token)
        .await;

    stop_input.cancel();
    if let Some(handle) = keyboard {
        let _ = handle.await;
    }
    let _ = renderer.await;
    ctrl_c.abort();

    Ok(result?)
}

fn init_logging(
    verbose: u8,
    quiet: bool,
    log_file: Option<&Path>,
) -> Result<Option<WorkerGuard>, AppError> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
            1 => EnvFilter::new("seghaul=debug,seghaul_engine=debug"),
            _ => EnvFilter::new("seghaul=trace,seghaul_engine=trace"),
        }
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file_name = path.file_name().ok_or_else(|| {
                AppError::Logging(format!("{} is not a file path", path.display()))
            })?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose > 0),
        )
        .with(file_layer)
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))?;

    Ok(guard)
}
