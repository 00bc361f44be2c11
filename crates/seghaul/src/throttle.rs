// Shared token bucket bounding the aggregate download rate of a job.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Largest burst admitted without waiting, one read buffer.
pub const DEFAULT_BURST: u64 = 64 * 1024;

#[derive(Debug)]
struct Bucket {
    /// Negative while callers are in debt.
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket shared by all workers of a job.
///
/// Callers take tokens for bytes they have already read and then sleep off
/// any debt, so a single read may overshoot by one buffer but the long-run
/// rate never exceeds `bytes_per_sec`.
#[derive(Debug)]
pub struct Throttle {
    bytes_per_sec: u64,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl Throttle {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self::with_burst(bytes_per_sec, DEFAULT_BURST.min(bytes_per_sec))
    }

    pub fn with_burst(bytes_per_sec: u64, burst: u64) -> Self {
        let bytes_per_sec = bytes_per_sec.max(1);
        Self {
            bytes_per_sec,
            capacity: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Account for `bytes` and return how long the caller must wait.
    ///
    /// The lock is held only for the bookkeeping.
    pub fn reserve(&self, bytes: usize) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.bytes_per_sec as f64).min(self.capacity);
        bucket.last_refill = now;
        bucket.tokens -= bytes as f64;

        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.bytes_per_sec as f64)
        }
    }

    /// Consume `bytes` worth of tokens, sleeping off any debt.
    pub async fn consume(&self, bytes: usize) {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_is_free_then_rate_applies() {
        let throttle = Throttle::with_burst(1000, 1000);
        assert_eq!(throttle.reserve(1000), Duration::ZERO);
        let wait = throttle.reserve(500);
        assert_eq!(wait, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn shared_bucket_bounds_every_five_second_window() {
        const RATE: u64 = 100_000;
        const CHUNK: usize = 4096;
        let throttle = Arc::new(Throttle::new(RATE));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let throttle = throttle.clone();
            handles.push(tokio::spawn(async move {
                let mut stamps = Vec::new();
                for _ in 0..75 {
                    // Bytes are counted once the read has completed.
                    throttle.consume(CHUNK).await;
                    stamps.push(start.elapsed());
                }
                stamps
            }));
        }

        let mut stamps = Vec::new();
        for handle in handles {
            stamps.extend(handle.await.unwrap());
        }
        stamps.sort();

        let total = (stamps.len() * CHUNK) as u64;
        let floor = (total - DEFAULT_BURST) as f64 / RATE as f64 - 0.1;
        assert!(start.elapsed() >= Duration::from_secs_f64(floor));

        let window = Duration::from_secs(5);
        let limit = (RATE * 5) as f64 * 1.05 + (DEFAULT_BURST + CHUNK as u64) as f64;
        for (i, from) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .take_while(|t| **t < *from + window)
                .count();
            assert!(
                (in_window * CHUNK) as f64 <= limit,
                "{} bytes in a 5s window",
                in_window * CHUNK
            );
        }
    }

    #[test]
    fn zero_rate_is_clamped() {
        let throttle = Throttle::new(0);
        assert_eq!(throttle.bytes_per_sec(), 1);
    }
}
