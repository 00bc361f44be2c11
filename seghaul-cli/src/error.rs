use seghaul_engine::DownloadError;
use thiserror::Error;

/// Exit status for a run cancelled by the user (128 + SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),
}

impl AppError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Download(e) if e.is_cancelled())
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_cancelled() { EXIT_CANCELLED } else { 1 }
    }
}
