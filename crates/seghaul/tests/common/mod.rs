//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use seghaul_engine::decryption::StaticKeySource;
use seghaul_engine::manifest::SegmentKey;
use seghaul_engine::{
    DownloadError, Encoder, EncoderInput, FetchContext, OutputFormat, ResolvedSegment,
    RetryPolicy, SchedulerConfig, SegmentDecryptor, SegmentScheduler, SegmentSource,
};
use tokio::process::Command;
use url::Url;

/// How a scripted segment behaves.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Delay before the body is written.
    pub delay: Duration,
    /// Attempts that fail with a transient error before one succeeds.
    pub transient_failures: u32,
    /// Fail every attempt with a non-retryable error.
    pub fatal: bool,
    /// Body to serve; `pos:<position>` when unset.
    pub body: Option<Vec<u8>>,
    /// Bodies for the first attempts, before `body` applies.
    pub early_bodies: Vec<Vec<u8>>,
}

/// In-memory [`SegmentSource`] driven by per-position scripts.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: HashMap<usize, Script>,
    attempts: Mutex<HashMap<usize, u32>>,
    completions: Mutex<Vec<usize>>,
    pub calls: AtomicU32,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, position: usize, script: Script) -> Self {
        self.scripts.insert(position, script);
        self
    }

    pub fn attempts(&self, position: usize) -> u32 {
        self.attempts.lock().get(&position).copied().unwrap_or(0)
    }

    /// Positions in the order their bodies were written.
    pub fn completions(&self) -> Vec<usize> {
        self.completions.lock().clone()
    }
}

#[async_trait]
impl SegmentSource for ScriptedSource {
    async fn fetch(
        &self,
        segment: &ResolvedSegment,
        dest: &Path,
        ctx: FetchContext<'_>,
    ) -> Result<u64, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut attempts = self.attempts.lock();
            let entry = attempts.entry(segment.position).or_insert(0);
            *entry += 1;
            *entry
        };
        let script = self.scripts.get(&segment.position).cloned().unwrap_or_default();

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        if script.fatal {
            return Err(DownloadError::configuration(format!(
                "segment {} is forbidden",
                segment.position
            )));
        }
        if attempt <= script.transient_failures {
            return Err(DownloadError::transient(segment.url.as_str(), "HTTP 503"));
        }

        let body = script
            .early_bodies
            .get(attempt as usize - 1)
            .cloned()
            .or(script.body)
            .unwrap_or_else(|| body_for(segment.position));
        ctx.record(body.len()).await;
        tokio::fs::write(dest, &body).await?;
        self.completions.lock().push(segment.position);
        Ok(body.len() as u64)
    }
}

pub fn body_for(position: usize) -> Vec<u8> {
    format!("pos:{position}").into_bytes()
}

pub fn plain_segments(count: usize) -> Vec<ResolvedSegment> {
    (0..count)
        .map(|position| ResolvedSegment {
            position,
            index: position as u64,
            url: Url::parse(&format!("https://cdn.example.com/seg{position}.ts")).unwrap(),
            byte_range: None,
            key: SegmentKey::default(),
            init: false,
            duration: 4.0,
        })
        .collect()
}

pub fn config(thread_count: usize, max_retries: u32, delay: Duration) -> SchedulerConfig {
    SchedulerConfig {
        thread_count,
        retry: RetryPolicy::new(max_retries, delay),
        check_complete: true,
        max_speed: None,
    }
}

pub fn scheduler(source: Arc<dyn SegmentSource>, config: SchedulerConfig) -> SegmentScheduler {
    scheduler_with_keys(source, config, StaticKeySource::default())
}

pub fn scheduler_with_keys(
    source: Arc<dyn SegmentSource>,
    config: SchedulerConfig,
    keys: StaticKeySource,
) -> SegmentScheduler {
    SegmentScheduler::new(
        source,
        Arc::new(SegmentDecryptor::new(Arc::new(keys))),
        config,
    )
}

/// Runs a shell script in place of the encoder. `$1` is the output path and
/// the remaining arguments are input files.
#[derive(Debug, Clone, Copy)]
pub struct ShellEncoder {
    pub script: &'static str,
}

/// Copies stdin to the output.
pub const CAT_STDIN: ShellEncoder = ShellEncoder {
    script: r#"cat > "$1""#,
};

/// Concatenates the input files into the output.
pub const CAT_FILES: ShellEncoder = ShellEncoder {
    script: r#"out="$1"; shift; cat "$@" > "$out""#,
};

impl Encoder for ShellEncoder {
    fn program(&self) -> &Path {
        Path::new("/bin/sh")
    }

    fn command(&self, input: &EncoderInput, _format: OutputFormat, output: &Path) -> Command {
        let mut command = Command::new(self.program());
        command.arg("-c").arg(self.script).arg("sh").arg(output);
        if let EncoderInput::Files(files) = input {
            command.args(files);
        }
        command
    }
}
