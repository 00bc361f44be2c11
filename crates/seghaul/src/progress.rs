// Progress accounting for a segment job.
//
// Workers report bytes and completions into a `ProgressTracker`; events are
// pushed to the caller over a bounded channel with `try_send`, so a slow
// consumer loses intermediate events instead of stalling downloads.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Trailing window used for the speed estimate.
pub const SPEED_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Label of the track being downloaded (`video`, `audio`, ...).
    pub track: String,
    pub total: usize,
    pub finished: usize,
    /// 0.0 to 100.0
    pub percentage: f64,
    pub total_bytes: Option<u64>,
    /// `total_bytes` is extrapolated from completed segments.
    pub total_bytes_estimated: bool,
    pub downloaded_bytes: u64,
    /// Bytes per second over [`SPEED_WINDOW`].
    pub speed: f64,
    /// Retries used by the segment this event is about.
    pub retry: u32,
    pub max_retry: u32,
    pub eta: Option<Duration>,
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_size = match self.total_bytes {
            Some(total) if self.total_bytes_estimated => format!("~{}", format_bytes(total)),
            Some(total) => format_bytes(total),
            None => "?".to_string(),
        };
        write!(
            f,
            "{}/{} ({:.2}%) -- {}/{} ({}/s @ {}) -- Retry ({}/{})",
            self.finished,
            self.total,
            self.percentage,
            format_bytes(self.downloaded_bytes),
            total_size,
            format_bytes(self.speed as u64),
            format_eta(self.eta),
            self.retry,
            self.max_retry
        )
    }
}

/// Format bytes into a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes}B")
    }
}

pub fn format_eta(eta: Option<Duration>) -> String {
    match eta {
        Some(eta) => {
            let total = eta.as_secs();
            format!(
                "{:02}:{:02}:{:02}",
                total / 3600,
                (total % 3600) / 60,
                total % 60
            )
        }
        None => "--:--:--".to_string(),
    }
}

#[derive(Debug)]
struct TrackerState {
    finished: usize,
    downloaded: u64,
    /// Bytes of finished segments, for extrapolating an unknown total.
    finished_bytes: u64,
    samples: VecDeque<(Instant, u64)>,
    started: Instant,
}

/// Shared progress accumulator for one job.
#[derive(Debug)]
pub struct ProgressTracker {
    track: String,
    total: usize,
    max_retry: u32,
    known_total_bytes: Option<u64>,
    state: Mutex<TrackerState>,
    sender: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressTracker {
    pub fn new(
        track: impl Into<String>,
        total: usize,
        max_retry: u32,
        known_total_bytes: Option<u64>,
        sender: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Self {
        Self {
            track: track.into(),
            total,
            max_retry,
            known_total_bytes,
            state: Mutex::new(TrackerState {
                finished: 0,
                downloaded: 0,
                finished_bytes: 0,
                samples: VecDeque::new(),
                started: Instant::now(),
            }),
            sender,
        }
    }

    /// Record bytes read from the network.
    pub fn add_bytes(&self, bytes: u64) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.downloaded += bytes;
        state.samples.push_back((now, bytes));
        prune(&mut state.samples, now);
    }

    /// Take back bytes of an attempt that failed and will be fetched again.
    pub fn discard_bytes(&self, bytes: u64) {
        let mut state = self.state.lock();
        state.downloaded = state.downloaded.saturating_sub(bytes);
    }

    /// Count a segment that was already present on disk.
    pub fn segment_reused(&self, bytes: u64) {
        self.complete(bytes, 0, true);
    }

    /// Count a finished segment and emit an event.
    pub fn segment_finished(&self, bytes: u64, retries: u32) {
        self.complete(bytes, retries, false);
    }

    /// Emit an event for a segment about to be retried. Counts are unchanged.
    pub fn segment_retrying(&self, retry: u32) {
        let state = self.state.lock();
        self.emit(self.event(&state, retry, Instant::now()));
    }

    fn complete(&self, bytes: u64, retries: u32, reused: bool) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.finished += 1;
        state.finished_bytes += bytes;
        if reused {
            state.downloaded += bytes;
        }
        prune(&mut state.samples, now);
        // Emitted while holding the lock, so `finished` never goes backwards
        // in the channel.
        let event = self.event(&state, retries, now);
        self.emit(event);
    }

    /// Current figures, without emitting.
    pub fn snapshot(&self) -> ProgressEvent {
        let state = self.state.lock();
        self.event(&state, 0, Instant::now())
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.sender {
            // Full or closed: drop. The next event carries cumulative values.
            let _ = sender.try_send(event);
        }
    }

    fn event(&self, state: &TrackerState, retry: u32, now: Instant) -> ProgressEvent {
        let percentage = if self.total == 0 {
            100.0
        } else {
            state.finished as f64 * 100.0 / self.total as f64
        };

        let (total_bytes, estimated) = match self.known_total_bytes {
            Some(total) => (Some(total), false),
            None if state.finished > 0 && self.total > 0 => {
                let average = state.finished_bytes as f64 / state.finished as f64;
                (Some((average * self.total as f64) as u64), state.finished < self.total)
            }
            None => (None, false),
        };

        let speed = speed(&state.samples, state.started, now);
        let eta = match total_bytes {
            Some(total) if speed > 0.0 => Some(Duration::from_secs_f64(
                total.saturating_sub(state.downloaded) as f64 / speed,
            )),
            Some(total) if total <= state.downloaded => Some(Duration::ZERO),
            _ => None,
        };

        ProgressEvent {
            track: self.track.clone(),
            total: self.total,
            finished: state.finished,
            percentage,
            total_bytes,
            total_bytes_estimated: estimated,
            downloaded_bytes: state.downloaded,
            speed,
            retry,
            max_retry: self.max_retry,
            eta,
        }
    }
}

fn prune(samples: &mut VecDeque<(Instant, u64)>, now: Instant) {
    while let Some((at, _)) = samples.front() {
        if now.duration_since(*at) > SPEED_WINDOW {
            samples.pop_front();
        } else {
            break;
        }
    }
}

fn speed(samples: &VecDeque<(Instant, u64)>, started: Instant, now: Instant) -> f64 {
    let bytes: u64 = samples
        .iter()
        .filter(|(at, _)| now.duration_since(*at) <= SPEED_WINDOW)
        .map(|(_, b)| b)
        .sum();
    // Until a full window has passed, average over the time actually elapsed.
    let span = now
        .duration_since(started)
        .min(SPEED_WINDOW)
        .max(Duration::from_millis(10));
    bytes as f64 / span.as_secs_f64()
}
