// Segment fetching: one HTTP GET per attempt, streamed to a scratch file.
//
// Retrying is the scheduler's business; a fetcher reports a single attempt and
// classifies its failure.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RANGE};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, trace};

use crate::error::DownloadError;
use crate::progress::ProgressTracker;
use crate::retry::is_retryable_reqwest_error;
use crate::segment::ResolvedSegment;
use crate::throttle::Throttle;

/// Shared state a fetch attempt reports into.
#[derive(Clone, Copy)]
pub struct FetchContext<'a> {
    pub throttle: Option<&'a Throttle>,
    pub progress: &'a ProgressTracker,
}

impl<'a> FetchContext<'a> {
    pub fn new(progress: &'a ProgressTracker, throttle: Option<&'a Throttle>) -> Self {
        Self { throttle, progress }
    }

    /// Account for bytes just read: progress first, then any throttle wait.
    pub async fn record(&self, bytes: usize) {
        self.progress.add_bytes(bytes as u64);
        if let Some(throttle) = self.throttle {
            throttle.consume(bytes).await;
        }
    }
}

/// Downloads one segment to `dest`, returning the number of bytes written.
///
/// `dest` is created or truncated. On error its content is unspecified.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch(
        &self,
        segment: &ResolvedSegment,
        dest: &Path,
        ctx: FetchContext<'_>,
    ) -> Result<u64, DownloadError>;
}

/// [`SegmentSource`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSegmentSource {
    client: reqwest::Client,
    headers: HeaderMap,
    timeout: Option<Duration>,
}

impl HttpSegmentSource {
    pub fn new(client: reqwest::Client, headers: HeaderMap, timeout: Option<Duration>) -> Self {
        Self {
            client,
            headers,
            timeout,
        }
    }

    async fn fetch_to(
        &self,
        segment: &ResolvedSegment,
        dest: &Path,
        ctx: FetchContext<'_>,
        written: &mut u64,
    ) -> Result<(), DownloadError> {
        let url = segment.url.as_str();
        let mut request = self.client.get(segment.url.clone()).headers(self.headers.clone());
        if let Some(range) = &segment.byte_range {
            request = request.header(RANGE, range.to_header_value());
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| classify(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::transient(url, format!("HTTP {status}")));
        }

        // A server that ignores Range answers 200 with the whole resource;
        // cut the requested window out of it.
        let (mut skip, expected) = match segment.byte_range {
            Some(range) if status != StatusCode::PARTIAL_CONTENT => {
                debug!(url, "Range ignored by server, slicing full response");
                (range.offset, Some(range.length))
            }
            Some(range) => (0, Some(range.length)),
            None => (0, response.content_length()),
        };
        trace!(url, %status, ?expected, "Segment response");

        let file = File::create(dest).await?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify(url, e))?;
            ctx.record(chunk.len()).await;

            let mut data = &chunk[..];
            if skip > 0 {
                let n = (skip as usize).min(data.len());
                skip -= n as u64;
                data = &data[n..];
            }
            if let Some(limit) = expected.filter(|_| segment.byte_range.is_some()) {
                let room = limit.saturating_sub(*written) as usize;
                data = &data[..data.len().min(room)];
            }
            if !data.is_empty() {
                writer.write_all(data).await?;
                *written += data.len() as u64;
            }
        }
        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        if let Some(expected) = expected
            && *written != expected
        {
            return Err(DownloadError::transient(
                url,
                format!("size mismatch: expected {expected} bytes, got {written}"),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SegmentSource for HttpSegmentSource {
    async fn fetch(
        &self,
        segment: &ResolvedSegment,
        dest: &Path,
        ctx: FetchContext<'_>,
    ) -> Result<u64, DownloadError> {
        let mut written = 0u64;
        match self.fetch_to(segment, dest, ctx, &mut written).await {
            Ok(()) => Ok(written),
            Err(e) => {
                // Partial bytes of a failed attempt do not count as progress.
                ctx.progress.discard_bytes(written);
                Err(e)
            }
        }
    }
}

/// Network-level failures that another attempt may fix become
/// [`DownloadError::TransientFetch`]; the rest keep their reqwest cause.
fn classify(url: &str, e: reqwest::Error) -> DownloadError {
    if is_retryable_reqwest_error(&e) {
        let reason = if e.is_timeout() {
            "request timed out".to_string()
        } else {
            e.to_string()
        };
        DownloadError::transient(url, reason)
    } else {
        DownloadError::from(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ByteRange, SegmentKey};
    use url::Url;

    fn segment(url: &str, byte_range: Option<ByteRange>) -> ResolvedSegment {
        ResolvedSegment {
            position: 0,
            index: 0,
            url: Url::parse(url).unwrap(),
            byte_range,
            key: SegmentKey::default(),
            init: false,
            duration: 4.0,
        }
    }

    #[test]
    fn context_records_progress() {
        let tracker = ProgressTracker::new("video", 1, 0, None, None);
        let ctx = FetchContext::new(&tracker, None);
        futures::executor::block_on(ctx.record(10));
        assert_eq!(tracker.snapshot().downloaded_bytes, 10);
    }

    #[tokio::test]
    async fn unreachable_host_is_transient() {
        crate::client::install_rustls_provider();
        let source = HttpSegmentSource::new(
            reqwest::Client::new(),
            HeaderMap::new(),
            Some(Duration::from_secs(2)),
        );
        let tracker = ProgressTracker::new("video", 1, 0, None, None);
        let dir = tempfile::tempdir().unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let err = source
            .fetch(
                &segment("http://127.0.0.1:9/a.ts", None),
                &dir.path().join("a.part"),
                FetchContext::new(&tracker, None),
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
