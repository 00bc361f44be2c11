// Segment Scheduler: bounded-concurrency download of a job's segment list.
//
// A fixed set of workers drains a shared FIFO of segment positions. Each
// segment is fetched into `<name>.part`, decrypted if needed, and renamed to
// its final name, so the presence of a final file marks a finished segment.
// The first failing segment cancels the rest of the job.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::DownloadOptions;
use crate::decryption::SegmentDecryptor;
use crate::error::DownloadError;
use crate::fetcher::{FetchContext, SegmentSource};
use crate::progress::{ProgressEvent, ProgressTracker};
use crate::retry::{RetryAction, RetryPolicy, retry_with_delay};
use crate::segment::{ResolvedSegment, known_total_bytes};
use crate::throttle::Throttle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub thread_count: usize,
    pub retry: RetryPolicy,
    pub check_complete: bool,
    /// Aggregate bytes per second across workers.
    pub max_speed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&DownloadOptions::default())
    }
}

impl From<&DownloadOptions> for SchedulerConfig {
    fn from(options: &DownloadOptions) -> Self {
        Self {
            thread_count: options.thread_count.max(1),
            retry: options.retry_policy(),
            check_complete: options.check_complete,
            max_speed: options.max_speed,
        }
    }
}

/// Runtime state of one track's download.
///
/// Workers claim disjoint positions from the queue; per-segment counters are
/// only ever touched by the worker holding that position.
#[derive(Debug)]
pub struct DownloadJob {
    track: String,
    segments: Vec<ResolvedSegment>,
    work_dir: PathBuf,
    queue: Mutex<VecDeque<usize>>,
    completed: Mutex<BTreeSet<usize>>,
    retry_counts: Vec<AtomicU32>,
    bytes_total: Option<u64>,
    bytes_done: AtomicU64,
    state: Mutex<JobState>,
}

impl DownloadJob {
    pub fn new(
        track: impl Into<String>,
        segments: Vec<ResolvedSegment>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        let count = segments.len();
        Self {
            track: track.into(),
            bytes_total: known_total_bytes(&segments),
            queue: Mutex::new((0..count).collect()),
            completed: Mutex::new(BTreeSet::new()),
            retry_counts: (0..count).map(|_| AtomicU32::new(0)).collect(),
            bytes_done: AtomicU64::new(0),
            state: Mutex::new(JobState::Pending),
            segments,
            work_dir: work_dir.into(),
        }
    }

    pub fn track(&self) -> &str {
        &self.track
    }

    pub fn segments(&self) -> &[ResolvedSegment] {
        &self.segments
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn state(&self) -> JobState {
        *self.state.lock()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().len()
    }

    pub fn is_completed(&self, position: usize) -> bool {
        self.completed.lock().contains(&position)
    }

    /// Retries used so far by the segment at `position`.
    pub fn retry_count(&self, position: usize) -> u32 {
        self.retry_counts
            .get(position)
            .map_or(0, |count| count.load(Ordering::Relaxed))
    }

    pub fn bytes_total(&self) -> Option<u64> {
        self.bytes_total
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    /// Final path of the segment at `position`.
    pub fn segment_path(&self, position: usize) -> PathBuf {
        self.work_dir.join(self.segments[position].file_name())
    }

    /// Final paths in manifest order.
    pub fn segment_paths(&self) -> Vec<PathBuf> {
        self.segments
            .iter()
            .map(|segment| self.work_dir.join(segment.file_name()))
            .collect()
    }

    fn next_position(&self) -> Option<usize> {
        self.queue.lock().pop_front()
    }

    fn mark_complete(&self, position: usize, bytes: u64) {
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
        self.completed.lock().insert(position);
    }

    fn transition(&self, next: JobState) {
        let mut state = self.state.lock();
        debug!(track = %self.track, from = ?*state, to = ?next, "Job state change");
        *state = next;
    }
}

/// Runs [`DownloadJob`]s against a [`SegmentSource`].
pub struct SegmentScheduler {
    source: Arc<dyn SegmentSource>,
    decryptor: Arc<SegmentDecryptor>,
    config: SchedulerConfig,
}

impl SegmentScheduler {
    pub fn new(
        source: Arc<dyn SegmentSource>,
        decryptor: Arc<SegmentDecryptor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            source,
            decryptor,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Download `segments` into `work_dir` and return their paths in input
    /// order.
    pub async fn download(
        &self,
        track: &str,
        segments: Vec<ResolvedSegment>,
        work_dir: &Path,
        progress: Option<mpsc::Sender<ProgressEvent>>,
        token: &CancellationToken,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        let job = DownloadJob::new(track, segments, work_dir);
        self.run(&job, progress, token).await
    }

    /// Drive `job` to a terminal state.
    ///
    /// Scratch files are left in place on failure and cancellation.
    pub async fn run(
        &self,
        job: &DownloadJob,
        progress: Option<mpsc::Sender<ProgressEvent>>,
        token: &CancellationToken,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        if job.state() != JobState::Pending {
            return Err(DownloadError::Internal {
                reason: format!("job `{}` was already started", job.track),
            });
        }
        job.transition(JobState::Running);

        if let Err(e) = tokio::fs::create_dir_all(&job.work_dir).await {
            job.transition(JobState::Failed);
            return Err(e.into());
        }

        let tracker = ProgressTracker::new(
            job.track.clone(),
            job.segments.len(),
            self.config.retry.max_retries,
            job.bytes_total,
            progress,
        );
        let throttle = self.config.max_speed.map(Throttle::new);
        let ctx = FetchContext::new(&tracker, throttle.as_ref());
        let job_token = token.child_token();
        let workers = self.config.thread_count.max(1).min(job.segments.len());

        info!(
            track = %job.track,
            segments = job.segments.len(),
            workers,
            max_speed = ?self.config.max_speed,
            "Starting segment download"
        );

        let mut pool: FuturesUnordered<_> = (0..workers)
            .map(|_| self.worker(job, ctx, &job_token))
            .collect();

        let mut failure: Option<DownloadError> = None;
        while let Some(result) = pool.next().await {
            if let Err(e) = result {
                // The first real error wins over the cancellations it causes.
                if failure.as_ref().is_none_or(DownloadError::is_cancelled) && !e.is_cancelled() {
                    warn!(track = %job.track, error = %e, "Segment download failed, stopping job");
                    job_token.cancel();
                    failure = Some(e);
                } else if failure.is_none() {
                    failure = Some(e);
                }
            }
        }

        if token.is_cancelled() {
            job.transition(JobState::Canceled);
            info!(track = %job.track, finished = job.completed_count(), "Job cancelled");
            return Err(DownloadError::Cancelled);
        }
        if let Some(e) = failure {
            job.transition(JobState::Failed);
            return Err(e);
        }

        job.transition(JobState::Completed);
        info!(
            track = %job.track,
            bytes = job.bytes_done(),
            "Segment download complete"
        );
        Ok(job.segment_paths())
    }

    async fn worker(
        &self,
        job: &DownloadJob,
        ctx: FetchContext<'_>,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        loop {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let Some(position) = job.next_position() else {
                return Ok(());
            };
            self.download_segment(job, position, ctx, token).await?;
        }
    }

    #[instrument(
        skip_all,
        fields(track = %job.track, index = job.segments[position].index, position = position)
    )]
    async fn download_segment(
        &self,
        job: &DownloadJob,
        position: usize,
        ctx: FetchContext<'_>,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let segment = &job.segments[position];
        let final_path = job.segment_path(position);

        if self.config.check_complete
            && let Some(len) = reusable_len(&final_path, segment).await
        {
            debug!(bytes = len, "Reusing finished segment");
            job.mark_complete(position, len);
            ctx.progress.segment_reused(len);
            return Ok(());
        }

        let part_path = final_path.with_extension("part");
        let part_path = part_path.as_path();
        let final_path = final_path.as_path();
        let retries = &job.retry_counts[position];
        let decrypt_retried = &AtomicBool::new(false);

        let result = retry_with_delay(
            &self.config.retry,
            token,
            |retry, _| {
                retries.store(retry, Ordering::Relaxed);
                ctx.progress.segment_retrying(retry);
            },
            |attempt| async move {
                debug!(attempt, url = %segment.url, "Fetching segment");
                let fetched = tokio::select! {
                    _ = token.cancelled() => Err(DownloadError::Cancelled),
                    result = self.source.fetch(segment, part_path, ctx) => result,
                };
                if let Err(e) = fetched {
                    return RetryAction::from_result(Err(e));
                }
                match self.seal(segment, part_path, final_path, token).await {
                    Ok(len) => RetryAction::Success(len),
                    // A truncated ciphertext earns one fresh download.
                    Err(e @ DownloadError::Decryption { corrupt: true, .. }) => {
                        if decrypt_retried.swap(true, Ordering::Relaxed) {
                            RetryAction::Fail(e)
                        } else {
                            RetryAction::Retry(e)
                        }
                    }
                    Err(e) => RetryAction::from_result(Err(e)),
                }
            },
        )
        .await;

        match result {
            Ok(len) => {
                job.mark_complete(position, len);
                ctx.progress
                    .segment_finished(len, retries.load(Ordering::Relaxed));
                debug!(bytes = len, "Segment finished");
                Ok(())
            }
            Err(failure) if failure.error.is_cancelled() => Err(DownloadError::Cancelled),
            Err(failure) if failure.exhausted => Err(DownloadError::SegmentExhausted {
                index: segment.index,
                attempts: failure.attempts,
                source: Box::new(failure.error),
            }),
            Err(failure) => Err(failure.error.for_segment(segment.index)),
        }
    }

    /// Decrypt the scratch file if needed and move it to its final name.
    async fn seal(
        &self,
        segment: &ResolvedSegment,
        part_path: &Path,
        final_path: &Path,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let len = if segment.key.is_encrypted() {
            let data = tokio::fs::read(part_path).await?;
            let plain = self
                .decryptor
                .decrypt_segment(data, &segment.key, segment.index, token)
                .await?;
            tokio::fs::write(part_path, &plain).await?;
            plain.len() as u64
        } else {
            tokio::fs::metadata(part_path).await?.len()
        };
        tokio::fs::rename(part_path, final_path).await?;
        Ok(len)
    }
}

/// Size of a finished segment file that can be used as is.
async fn reusable_len(path: &Path, segment: &ResolvedSegment) -> Option<u64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() || meta.len() == 0 {
        return None;
    }
    match segment.expected_len() {
        Some(expected) if expected != meta.len() => None,
        _ => Some(meta.len()),
    }
}
