// Optional TOML configuration file.
//
// ```toml
// [download]
// thread_count = 8
// prefer_output_format = "mkv"
//
// [profiles.default]
// user_agent = "..."
//
// [profiles.proxied.proxy]
// url = "socks5://127.0.0.1:1080"
// ```
//
// Command-line flags are applied on top of `[download]`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use seghaul_engine::{DownloadOptions, HttpProfile};
use serde::Deserialize;
use tracing::debug;

use crate::error::AppError;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub download: DownloadOptions,
    pub profiles: HashMap<String, HttpProfile>,
}

impl AppConfig {
    /// `<config_dir>/seghaul/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("seghaul").join("config.toml"))
    }

    /// Load `explicit`, which must exist, or the default file if present.
    pub fn load(explicit: Option<&Path>) -> Result<Self, AppError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::parse(&text)
            .map_err(|e| AppError::Config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), profiles = config.profiles.len(), "Loaded config file");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
