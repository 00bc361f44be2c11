//! # Seghaul Engine
//!
//! Segmented media download engine for HLS and DASH.
//!
//! ## Features
//!
//! - HLS master/media playlist and DASH MPD parsing
//! - Rendition selection with height caps and audio language
//! - Concurrent segment downloads with retry, throttling, progress and
//!   cancellation
//! - AES-128-CBC segment decryption
//! - Assembly through an external encoder (ffmpeg)
//!
//! [`MediaDownloader`] ties the pieces together; every stage is also usable
//! on its own.

pub mod assembler;
pub mod client;
pub mod config;
pub mod decryption;
pub mod downloader;
pub mod encoder;
pub mod error;
pub mod fetcher;
pub mod manifest;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod segment;
pub mod select;
pub mod throttle;

pub use assembler::Assembler;
pub use client::{ClientPool, HttpHelper, ReqwestHelper};
pub use config::{DownloadOptions, HttpProfile, OutputFormat, ProxyConfig, SelectionOptions};
pub use decryption::{KeyFetcher, KeySource, SegmentDecryptor, StaticKeySource};
pub use downloader::{DownloadInput, DownloadPlan, MediaDownloader, TrackPlan};
pub use encoder::{Encoder, EncoderInput, FfmpegEncoder};
pub use error::{DownloadError, Location, ParseError};
pub use fetcher::{FetchContext, HttpSegmentSource, SegmentSource};
pub use manifest::{Manifest, ManifestKind};
pub use progress::{ProgressEvent, ProgressTracker};
pub use retry::RetryPolicy;
pub use scheduler::{DownloadJob, JobState, SchedulerConfig, SegmentScheduler};
pub use segment::ResolvedSegment;
pub use select::RenditionSelector;
