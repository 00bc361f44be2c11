use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Name of the profile used when none is requested.
pub const DEFAULT_PROFILE: &str = "default";

/// Container produced by the encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OutputFormat {
    #[default]
    Mp4,
    Ts,
    M4a,
    Srt,
    Mkv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Ts => "ts",
            Self::M4a => "m4a",
            Self::Srt => "srt",
            Self::Mkv => "mkv",
        }
    }

    /// Muxer name passed to the encoder's `-f`.
    pub fn muxer(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Ts => "mpegts",
            Self::M4a => "ipod",
            Self::Srt => "srt",
            Self::Mkv => "matroska",
        }
    }

    /// Whether stream copy is possible. Subtitles are converted.
    pub fn copies_streams(&self) -> bool {
        !matches!(self, Self::Srt)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "ts" | "mpegts" => Ok(Self::Ts),
            "m4a" => Ok(Self::M4a),
            "srt" => Ok(Self::Srt),
            "mkv" | "matroska" => Ok(Self::Mkv),
            other => Err(DownloadError::configuration(format!(
                "unknown output format `{other}`"
            ))),
        }
    }
}

/// Proxy settings of an HTTP profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// e.g. `http://proxy:8080` or `socks5://127.0.0.1:1080`
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// A named HTTP client configuration, selected per job by
/// [`DownloadOptions::http_client_name`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpProfile {
    pub user_agent: String,
    /// Sent with every request of this profile.
    pub headers: BTreeMap<String, String>,
    pub proxy: Option<ProxyConfig>,
    /// Use system/env proxy settings when no explicit proxy is set.
    pub use_system_proxy: bool,
    pub connect_timeout_secs: u64,
    pub follow_redirects: bool,
    pub danger_accept_invalid_certs: bool,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpProfile {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: BTreeMap::new(),
            proxy: None,
            use_system_proxy: true,
            connect_timeout_secs: 30,
            follow_redirects: true,
            danger_accept_invalid_certs: false,
            pool_max_idle_per_host: 10,
        }
    }
}

/// Rendition selection constraints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionOptions {
    pub max_height: Option<u32>,
    pub audio_language: Option<String>,
    /// Take the best rendition when none fits `max_height`, instead of failing.
    pub fallback_to_best: bool,
}

/// Per-job options. Immutable once the job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    /// Key into the client pool.
    pub http_client_name: String,
    /// Container for single-track jobs.
    pub prefer_output_format: OutputFormat,
    /// Container when separate video and audio tracks are muxed.
    pub prefer_mux_output_format: OutputFormat,
    pub output_dir: PathBuf,
    /// Scratch location for segments; defaults to `output_dir`.
    pub work_dir: Option<PathBuf>,
    /// File stem of the output; derived from the manifest URL when unset.
    pub output_name: Option<String>,
    pub thread_count: usize,
    pub retry_count: u32,
    pub retry_wait_secs: f64,
    /// Bytes per second across all workers.
    pub max_speed: Option<u64>,
    /// Per-request timeout in seconds; 0 disables it.
    pub timeout_secs: u64,
    pub overwrite: bool,
    /// Reuse segments already present in the work directory.
    pub check_complete: bool,
    pub max_height: Option<u32>,
    pub audio_language: Option<String>,
    pub fallback_to_best: bool,
    /// Keep scratch segments after a successful assembly.
    pub keep_segments: bool,
    /// Delete scratch segments of a failed job.
    pub cleanup_on_failure: bool,
    /// Explicit encoder executable, skipping the search.
    pub encoder_path: Option<PathBuf>,
    /// Extra request headers for this job, on top of the profile's.
    pub headers: BTreeMap<String, String>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            http_client_name: DEFAULT_PROFILE.to_string(),
            prefer_output_format: OutputFormat::Mp4,
            prefer_mux_output_format: OutputFormat::Mp4,
            output_dir: PathBuf::from("."),
            work_dir: None,
            output_name: None,
            thread_count: 4,
            retry_count: 3,
            retry_wait_secs: 3.0,
            max_speed: None,
            timeout_secs: 100,
            overwrite: false,
            check_complete: true,
            max_height: None,
            audio_language: None,
            fallback_to_best: false,
            keep_segments: false,
            cleanup_on_failure: false,
            encoder_path: None,
            headers: BTreeMap::new(),
        }
    }
}

impl DownloadOptions {
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.thread_count == 0 {
            return Err(DownloadError::configuration("thread_count must be at least 1"));
        }
        if !self.retry_wait_secs.is_finite() || self.retry_wait_secs < 0.0 {
            return Err(DownloadError::configuration(
                "retry_wait_secs must be a non-negative number",
            ));
        }
        if self.max_speed == Some(0) {
            return Err(DownloadError::configuration("max_speed must be positive"));
        }
        if let Some(name) = &self.output_name
            && (name.is_empty() || name.contains(['/', '\\']))
        {
            return Err(DownloadError::configuration(format!(
                "output name `{name}` must be a plain file name"
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_count,
            Duration::from_secs_f64(self.retry_wait_secs.max(0.0)),
        )
    }

    /// `None` when requests are unbounded.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn selection(&self) -> SelectionOptions {
        SelectionOptions {
            max_height: self.max_height,
            audio_language: self.audio_language.clone(),
            fallback_to_best: self.fallback_to_best,
        }
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.output_dir.clone())
    }
}
