//! External encoder invocation.
//!
//! The engine never transcodes by itself. An [`Encoder`] turns an input
//! description and a target [`OutputFormat`] into a ready-to-spawn command;
//! the assembler owns the process lifetime.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use process_utils::tokio_command;
use tokio::process::Command;
use tracing::debug;

use crate::config::OutputFormat;
use crate::error::DownloadError;

/// Executable looked up when no explicit encoder path is configured.
pub const DEFAULT_ENCODER: &str = "ffmpeg";

/// What the encoder reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncoderInput {
    /// One stream of concatenated segment bytes on standard input.
    Stdin,
    /// One file per track, muxed together in the given order.
    Files(Vec<PathBuf>),
}

pub trait Encoder: Send + Sync + fmt::Debug {
    fn program(&self) -> &Path;

    /// Command producing `output` in `format` from `input`. Stdio is left to
    /// the caller.
    fn command(&self, input: &EncoderInput, format: OutputFormat, output: &Path) -> Command;
}

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    path: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Use `explicit` when given, otherwise search for [`DEFAULT_ENCODER`]
    /// in the working directory, next to the running binary, then on `PATH`.
    pub fn locate(explicit: Option<&Path>) -> Result<Self, DownloadError> {
        let path = match explicit {
            Some(path) => process_utils::find_executable(&path.to_string_lossy()).ok_or_else(
                || {
                    DownloadError::configuration(format!(
                        "encoder `{}` is not an executable file",
                        path.display()
                    ))
                },
            )?,
            None => process_utils::find_executable(DEFAULT_ENCODER).ok_or_else(|| {
                DownloadError::configuration(format!(
                    "`{DEFAULT_ENCODER}` was not found in the working directory, \
                     next to this executable, or on PATH"
                ))
            })?,
        };
        debug!(encoder = %path.display(), "Using encoder");
        Ok(Self::new(path))
    }

    pub fn build_args(input: &EncoderInput, format: OutputFormat, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error"]
            .into_iter()
            .map(OsString::from)
            .collect();

        match input {
            EncoderInput::Stdin => {
                args.extend(["-i", "pipe:0"].map(OsString::from));
            }
            EncoderInput::Files(files) => {
                args.push("-nostdin".into());
                for file in files {
                    args.push("-i".into());
                    args.push(file.as_os_str().to_owned());
                }
                for index in 0..files.len() {
                    args.push("-map".into());
                    args.push(index.to_string().into());
                }
            }
        }

        if format.copies_streams() {
            args.extend(["-c", "copy"].map(OsString::from));
        }
        if matches!(format, OutputFormat::Mp4 | OutputFormat::M4a) {
            args.extend(["-movflags", "+faststart"].map(OsString::from));
        }
        args.extend(["-f", format.muxer()].map(OsString::from));
        args.push(output.as_os_str().to_owned());
        args
    }
}

impl Encoder for FfmpegEncoder {
    fn program(&self) -> &Path {
        &self.path
    }

    fn command(&self, input: &EncoderInput, format: OutputFormat, output: &Path) -> Command {
        let mut command = tokio_command(&self.path);
        command
            .args(Self::build_args(input, format, output))
            // Keep diagnostics in a predictable language.
            .env("LC_ALL", "C");
        command
    }
}
