// Assembler: hands downloaded segments to the external encoder.
//
// Single-track jobs stream every segment, in order, into the encoder's stdin.
// Multi-track jobs first concatenate each track into one scratch file and let
// the encoder mux the files. Either way the encoder writes a temporary file
// next to the output, which is renamed only after a clean exit.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use memchr::memchr_iter;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OutputFormat;
use crate::encoder::{Encoder, EncoderInput};
use crate::error::DownloadError;

/// Signature some CDNs put in front of transport-stream segments.
pub const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
pub const TS_PACKET_LEN: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;
/// How far past a PNG signature the sync scan looks.
pub const SYNC_SCAN_WINDOW: usize = 1024 * 1024;
/// Consecutive packets that must carry a sync byte (as far as data reaches).
const SYNC_CONFIRM_PACKETS: usize = 5;
/// Tail of encoder stderr kept for error reports.
const STDERR_LIMIT: usize = 16 * 1024;

/// Offset at which transport-stream data starts in `head`, the first bytes
/// of a segment.
///
/// Segments without a PNG signature start at 0. For disguised ones the first
/// offset within [`SYNC_SCAN_WINDOW`] where sync bytes repeat every
/// [`TS_PACKET_LEN`] bytes is returned.
pub fn ts_payload_offset(head: &[u8]) -> Option<usize> {
    if !head.starts_with(&PNG_MAGIC) {
        return Some(0);
    }
    let window = &head[..head.len().min(SYNC_SCAN_WINDOW)];
    memchr_iter(TS_SYNC_BYTE, window)
        .filter(|&offset| offset >= PNG_MAGIC.len())
        .find(|&offset| is_sync_run(head, offset))
}

fn is_sync_run(data: &[u8], offset: usize) -> bool {
    (0..SYNC_CONFIRM_PACKETS)
        .map(|k| offset + k * TS_PACKET_LEN)
        .take_while(|&pos| pos < data.len())
        .all(|pos| data[pos] == TS_SYNC_BYTE)
}

/// Copy one segment into `sink`, dropping a disguising PNG prefix.
///
/// Returns the number of bytes written.
async fn copy_segment<W>(path: &Path, sink: &mut W) -> Result<u64, DownloadError>
where
    W: AsyncWrite + Unpin,
{
    let mut file = File::open(path).await?;
    let head_len = SYNC_SCAN_WINDOW + SYNC_CONFIRM_PACKETS * TS_PACKET_LEN;
    let mut head = Vec::with_capacity(64 * 1024);
    (&mut file).take(head_len as u64).read_to_end(&mut head).await?;

    let offset = ts_payload_offset(&head).ok_or_else(|| DownloadError::FormatMismatch {
        path: path.to_path_buf(),
        reason: format!(
            "PNG signature without a transport-stream sync pattern in the first {SYNC_SCAN_WINDOW} bytes"
        ),
    })?;
    if offset > 0 {
        debug!(path = %path.display(), skipped = offset, "Stripped PNG prefix");
    }

    sink.write_all(&head[offset..]).await?;
    let rest = tokio::io::copy(&mut file, sink).await?;
    Ok((head.len() - offset) as u64 + rest)
}

/// Scoped encoder process: killed when dropped unless it exited.
struct EncoderProcess {
    child: Child,
    stderr: tokio::task::JoinHandle<Vec<u8>>,
}

impl EncoderProcess {
    fn spawn(
        encoder: &dyn Encoder,
        input: &EncoderInput,
        format: OutputFormat,
        output: &Path,
    ) -> Result<Self, DownloadError> {
        let mut command = encoder.command(input, format, output);
        command
            .stdin(match input {
                EncoderInput::Stdin => Stdio::piped(),
                EncoderInput::Files(_) => Stdio::null(),
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            DownloadError::configuration(format!(
                "failed to start encoder `{}`: {e}",
                encoder.program().display()
            ))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| DownloadError::Internal {
            reason: "encoder stderr was not captured".to_string(),
        })?;
        let stderr = tokio::spawn(read_tail(stderr));
        Ok(Self { child, stderr })
    }

    /// Wait for exit, killing the process if `token` fires first.
    async fn wait(mut self, token: &CancellationToken) -> Result<(), DownloadError> {
        let status: ExitStatus = tokio::select! {
            _ = token.cancelled() => {
                warn!("Cancelling encoder");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "Failed to kill encoder");
                }
                return Err(DownloadError::Cancelled);
            }
            status = self.child.wait() => status?,
        };

        let stderr = (&mut self.stderr).await.unwrap_or_default();
        if status.success() {
            return Ok(());
        }
        Err(DownloadError::EncoderProcess {
            status: status.to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim_end().to_string(),
        })
    }
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_LIMIT {
                    tail.drain(..tail.len() - STDERR_LIMIT);
                }
            }
        }
    }
    tail
}

/// Temporary name the encoder writes to before the final rename.
fn staging_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!(".{name}.partial"))
}

pub struct Assembler {
    encoder: Arc<dyn Encoder>,
}

impl Assembler {
    pub fn new(encoder: Arc<dyn Encoder>) -> Self {
        Self { encoder }
    }

    /// Stream `segments`, in order, through the encoder into `output`.
    pub async fn assemble(
        &self,
        segments: &[PathBuf],
        format: OutputFormat,
        output: &Path,
        token: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        info!(
            segments = segments.len(),
            %format,
            output = %output.display(),
            "Assembling output"
        );
        let staging = staging_path(output);
        let result = self.pipe_segments(segments, format, &staging, token).await;
        finish(result, &staging, output).await
    }

    /// Concatenate each track into `work_dir` and mux the tracks into `output`.
    pub async fn mux(
        &self,
        tracks: &[(String, Vec<PathBuf>)],
        format: OutputFormat,
        output: &Path,
        work_dir: &Path,
        token: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        if let [(_, segments)] = tracks {
            return self.assemble(segments, format, output, token).await;
        }

        let mut files = Vec::with_capacity(tracks.len());
        for (name, segments) in tracks {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let path = work_dir.join(format!("{name}.concat"));
            let bytes = concat_segments(segments, &path).await?;
            debug!(track = %name, bytes, path = %path.display(), "Track concatenated");
            files.push(path);
        }

        info!(tracks = tracks.len(), %format, output = %output.display(), "Muxing tracks");
        let staging = staging_path(output);
        let input = EncoderInput::Files(files.clone());
        let result = async {
            EncoderProcess::spawn(self.encoder.as_ref(), &input, format, &staging)?
                .wait(token)
                .await
        }
        .await;
        let result = finish(result, &staging, output).await;

        for file in &files {
            if let Err(e) = tokio::fs::remove_file(file).await {
                debug!(path = %file.display(), error = %e, "Failed to remove concatenated track");
            }
        }
        result
    }

    async fn pipe_segments(
        &self,
        segments: &[PathBuf],
        format: OutputFormat,
        staging: &Path,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let mut process =
            EncoderProcess::spawn(self.encoder.as_ref(), &EncoderInput::Stdin, format, staging)?;
        let stdin = process.child.stdin.take().ok_or_else(|| DownloadError::Internal {
            reason: "encoder stdin was not captured".to_string(),
        })?;

        let feed = async {
            let mut stdin = BufWriter::new(stdin);
            for path in segments {
                copy_segment(path, &mut stdin).await?;
            }
            stdin.shutdown().await?;
            Ok::<_, DownloadError>(())
        };

        let fed = tokio::select! {
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            result = feed => result,
        };
        match fed {
            Ok(()) => process.wait(token).await,
            // The encoder closed its input early; its exit status explains why.
            Err(DownloadError::Io { source })
                if source.kind() == std::io::ErrorKind::BrokenPipe =>
            {
                process.wait(token).await.and(Err(DownloadError::Io { source }))
            }
            Err(e) => Err(e),
        }
    }
}

/// Move the staged output into place on success; remove it otherwise.
async fn finish(
    result: Result<(), DownloadError>,
    staging: &Path,
    output: &Path,
) -> Result<PathBuf, DownloadError> {
    match result {
        Ok(()) => {
            tokio::fs::rename(staging, output).await?;
            info!(output = %output.display(), "Output written");
            Ok(output.to_path_buf())
        }
        Err(e) => {
            if let Err(remove) = tokio::fs::remove_file(staging).await
                && remove.kind() != std::io::ErrorKind::NotFound
            {
                warn!(
                    path = %staging.display(),
                    error = %remove,
                    "Failed to remove partial output"
                );
            }
            Err(e)
        }
    }
}

/// Concatenate `segments` into `dest`, stripping PNG prefixes.
pub async fn concat_segments(segments: &[PathBuf], dest: &Path) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(File::create(dest).await?);
    let mut total = 0;
    for path in segments {
        total += copy_segment(path, &mut writer).await?;
    }
    writer.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_packets(count: usize) -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..count {
            data.push(TS_SYNC_BYTE);
            data.extend(std::iter::repeat_n(i as u8 & 0x3f, TS_PACKET_LEN - 1));
        }
        data
    }

    fn disguised(prefix_len: usize, packets: usize) -> Vec<u8> {
        let mut data = PNG_MAGIC.to_vec();
        data.resize(prefix_len, 0);
        data.extend(ts_packets(packets));
        data
    }

    #[test]
    fn plain_segments_start_at_zero() {
        assert_eq!(ts_payload_offset(&ts_packets(3)), Some(0));
        assert_eq!(ts_payload_offset(b"ftypisom"), Some(0));
    }

    #[test]
    fn png_prefix_is_skipped_up_to_sync() {
        assert_eq!(ts_payload_offset(&disguised(17, 4)), Some(17));
        assert_eq!(ts_payload_offset(&disguised(300, 6)), Some(300));
    }

    #[test]
    fn stray_sync_byte_in_prefix_is_ignored() {
        let mut data = disguised(400, 6);
        data[20] = TS_SYNC_BYTE;
        assert_eq!(ts_payload_offset(&data), Some(400));
    }

    #[test]
    fn png_without_sync_is_rejected() {
        let mut data = PNG_MAGIC.to_vec();
        data.extend(std::iter::repeat_n(0u8, 2048));
        assert_eq!(ts_payload_offset(&data), None);
    }

    #[tokio::test]
    async fn concat_strips_prefixes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("000000.seg");
        let second = dir.path().join("000001.seg");
        std::fs::write(&first, disguised(17, 2)).unwrap();
        std::fs::write(&second, ts_packets(1)).unwrap();

        let dest = dir.path().join("video.concat");
        let total = concat_segments(&[first, second], &dest).await.unwrap();
        let written = std::fs::read(&dest).unwrap();

        let mut expected = ts_packets(2);
        expected.extend(ts_packets(1));
        assert_eq!(written, expected);
        assert_eq!(total, expected.len() as u64);
    }

    #[tokio::test]
    async fn bad_segment_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("000003.seg");
        let mut data = PNG_MAGIC.to_vec();
        data.extend([0u8; 512]);
        std::fs::write(&bad, data).unwrap();

        let err = concat_segments(std::slice::from_ref(&bad), &dir.path().join("out"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::FormatMismatch { ref path, .. } if *path == bad));
    }

    #[test]
    fn staging_is_hidden_next_to_output() {
        assert_eq!(
            staging_path(Path::new("/media/show.mp4")),
            PathBuf::from("/media/.show.mp4.partial")
        );
    }
}
