use std::fmt;
use std::path::PathBuf;

use reqwest::StatusCode;

/// Where in a manifest a parse failure was detected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// 1-based line number of an HLS playlist.
    Line(usize),
    /// Name of the DASH element being read.
    Element(String),
    /// Byte offset into an XML document.
    Offset(u64),
    /// The document as a whole (e.g. empty input).
    Document,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line(line) => write!(f, "line {line}"),
            Self::Element(name) => write!(f, "element <{name}>"),
            Self::Offset(offset) => write!(f, "byte {offset}"),
            Self::Document => f.write_str("document"),
        }
    }
}

/// A malformed manifest. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason} (at {location})")]
pub struct ParseError {
    pub reason: String,
    pub location: Location,
}

impl ParseError {
    pub fn new(reason: impl Into<String>, location: Location) -> Self {
        Self {
            reason: reason.into(),
            location,
        }
    }

    pub fn at_line(reason: impl Into<String>, line: usize) -> Self {
        Self::new(reason, Location::Line(line))
    }

    pub fn at_element(reason: impl Into<String>, element: impl Into<String>) -> Self {
        Self::new(reason, Location::Element(element.into()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("manifest parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("no rendition matches the selection: {reason}")]
    NoMatchingRendition { reason: String },

    #[error("unsupported encryption method `{method}`")]
    UnsupportedEncryption { method: String },

    #[error("decryption of segment {index} failed: {reason}")]
    Decryption {
        index: u64,
        reason: String,
        /// The ciphertext looked truncated, so a fresh download may fix it.
        corrupt: bool,
    },

    #[error("transient fetch failure for {url}: {reason}")]
    TransientFetch { url: String, reason: String },

    #[error("segment {index} failed after {attempts} attempts: {source}")]
    SegmentExhausted {
        index: u64,
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("segment {index} failed: {source}")]
    SegmentFailed {
        index: u64,
        #[source]
        source: Box<DownloadError>,
    },

    #[error("decryption key {uri} is unavailable: {reason}")]
    KeyUnavailable { uri: String, reason: String },

    #[error("segment {path} is not a transport stream: {reason}")]
    FormatMismatch { path: PathBuf, reason: String },

    #[error("encoder exited with {status}: {stderr}")]
    EncoderProcess { status: String, stderr: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("output file {path} already exists")]
    OutputExists { path: PathBuf },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn transient(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransientFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn no_rendition(reason: impl Into<String>) -> Self {
        Self::NoMatchingRendition {
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether a segment attempt that failed with this error may be repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientFetch { .. } => true,
            Self::Network { source } => crate::retry::is_retryable_reqwest_error(source),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Decryption { corrupt, .. } => *corrupt,
            Self::Cancelled
            | Self::InvalidUrl { .. }
            | Self::Parse(_)
            | Self::NoMatchingRendition { .. }
            | Self::UnsupportedEncryption { .. }
            | Self::SegmentExhausted { .. }
            | Self::SegmentFailed { .. }
            | Self::KeyUnavailable { .. }
            | Self::FormatMismatch { .. }
            | Self::EncoderProcess { .. }
            | Self::Io { .. }
            | Self::OutputExists { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Index of the segment this error is attributed to, if any.
    pub fn segment_index(&self) -> Option<u64> {
        match self {
            Self::SegmentExhausted { index, .. }
            | Self::SegmentFailed { index, .. }
            | Self::Decryption { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Attribute a fatal error to segment `index`, unless it already names one.
    pub fn for_segment(self, index: u64) -> Self {
        if self.is_cancelled() || self.segment_index().is_some() {
            return self;
        }
        Self::SegmentFailed {
            index,
            source: Box::new(self),
        }
    }

    /// The innermost error, past any segment attribution.
    pub fn root_cause(&self) -> &DownloadError {
        match self {
            Self::SegmentExhausted { source, .. } | Self::SegmentFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}
