use std::path::PathBuf;

use clap::{ArgAction, Parser};
use seghaul_engine::{DownloadInput, DownloadOptions, OutputFormat};
use url::Url;

use crate::error::AppError;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Download HLS and DASH streams into a single media file",
    long_about = None
)]
pub struct Args {
    /// Manifest URL (HLS playlist or DASH MPD)
    #[arg(required_unless_present = "manifest_file", conflicts_with = "manifest_file")]
    pub url: Option<String>,

    /// Read the manifest from a local file instead of fetching it
    #[arg(long, requires = "base_url")]
    pub manifest_file: Option<PathBuf>,

    /// Base URL that relative references in --manifest-file resolve against
    #[arg(long)]
    pub base_url: Option<String>,

    /// Output directory
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Scratch directory for segments (defaults to the output directory)
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Output file name without extension
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Container for single-track downloads
    #[arg(short = 'f', long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Container when video and audio tracks are muxed
    #[arg(long, value_enum)]
    pub mux_format: Option<OutputFormat>,

    /// Concurrent segment downloads
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Retries per segment
    #[arg(long)]
    pub retry: Option<u32>,

    /// Seconds between retries
    #[arg(long)]
    pub retry_wait: Option<f64>,

    /// Download speed cap in bytes per second
    #[arg(long)]
    pub max_speed: Option<u64>,

    /// Per-request timeout in seconds (0 disables it)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Replace an existing output file
    #[arg(long)]
    pub overwrite: bool,

    /// Reuse segments already in the scratch directory
    #[arg(long, overrides_with = "no_check_complete")]
    pub check_complete: bool,

    /// Download every segment again
    #[arg(long)]
    pub no_check_complete: bool,

    /// Highest video height to select
    #[arg(long)]
    pub max_height: Option<u32>,

    /// Preferred audio language (e.g. `en`)
    #[arg(long)]
    pub audio_lang: Option<String>,

    /// Take the best rendition when none fits --max-height
    #[arg(long)]
    pub fallback_to_best: bool,

    /// Keep scratch segments after a successful download
    #[arg(long)]
    pub keep_segments: bool,

    /// Path to the encoder executable (ffmpeg)
    #[arg(long)]
    pub encoder: Option<PathBuf>,

    /// HTTP profile from the config file
    #[arg(long)]
    pub profile: Option<String>,

    /// Extra request header, `Name: value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,

    /// Config file (defaults to <config dir>/seghaul/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Errors only, no progress bar
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Apply the flags given on the command line on top of `options`.
    pub fn apply(&self, options: &mut DownloadOptions) -> Result<(), AppError> {
        if let Some(dir) = &self.output_dir {
            options.output_dir = dir.clone();
        }
        if let Some(dir) = &self.work_dir {
            options.work_dir = Some(dir.clone());
        }
        if let Some(name) = &self.name {
            options.output_name = Some(name.clone());
        }
        if let Some(format) = self.format {
            options.prefer_output_format = format;
        }
        if let Some(format) = self.mux_format {
            options.prefer_mux_output_format = format;
        }
        if let Some(threads) = self.threads {
            options.thread_count = threads;
        }
        if let Some(retry) = self.retry {
            options.retry_count = retry;
        }
        if let Some(wait) = self.retry_wait {
            options.retry_wait_secs = wait;
        }
        if let Some(speed) = self.max_speed {
            options.max_speed = Some(speed);
        }
        if let Some(timeout) = self.timeout {
            options.timeout_secs = timeout;
        }
        if self.check_complete {
            options.check_complete = true;
        }
        if self.no_check_complete {
            options.check_complete = false;
        }
        if let Some(height) = self.max_height {
            options.max_height = Some(height);
        }
        if let Some(lang) = &self.audio_lang {
            options.audio_language = Some(lang.clone());
        }
        if let Some(encoder) = &self.encoder {
            options.encoder_path = Some(encoder.clone());
        }
        if let Some(profile) = &self.profile {
            options.http_client_name = profile.clone();
        }
        options.overwrite |= self.overwrite;
        options.fallback_to_best |= self.fallback_to_best;
        options.keep_segments |= self.keep_segments;

        for (name, value) in parse_headers(&self.headers)? {
            options.headers.insert(name, value);
        }
        Ok(())
    }

    /// Where the manifest comes from. File input is read by the caller.
    pub fn input(&self, manifest_text: Option<String>) -> Result<DownloadInput, AppError> {
        match (&self.url, manifest_text) {
            (_, Some(text)) => {
                let base = self.base_url.as_deref().unwrap_or_default();
                let base_url = Url::parse(base).map_err(|e| {
                    AppError::InvalidInput(format!("invalid base URL `{base}`: {e}"))
                })?;
                Ok(DownloadInput::Text { text, base_url })
            }
            (Some(url), None) => Ok(DownloadInput::parse_url(url)?),
            (None, None) => Err(AppError::InvalidInput(
                "a manifest URL or --manifest-file is required".to_string(),
            )),
        }
    }
}

/// Parse `Name: value` header arguments.
pub fn parse_headers(headers: &[String]) -> Result<Vec<(String, String)>, AppError> {
    headers
        .iter()
        .map(|header| {
            header
                .split_once(':')
                .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| {
                    AppError::InvalidInput(format!(
                        "invalid header `{header}`, expected `Name: value`"
                    ))
                })
        })
        .collect()
}
