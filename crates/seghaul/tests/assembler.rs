//! Assembly through a shell stand-in for the encoder.
#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use seghaul_engine::assembler::{PNG_MAGIC, TS_PACKET_LEN, TS_SYNC_BYTE};
use seghaul_engine::{Assembler, DownloadError, OutputFormat};
use tokio_util::sync::CancellationToken;

use common::{CAT_FILES, CAT_STDIN, ShellEncoder};

fn assembler(encoder: ShellEncoder) -> Assembler {
    Assembler::new(Arc::new(encoder))
}

fn ts_packets(count: usize, fill: u8) -> Vec<u8> {
    let mut data = Vec::with_capacity(count * TS_PACKET_LEN);
    for _ in 0..count {
        data.push(TS_SYNC_BYTE);
        data.extend(std::iter::repeat_n(fill, TS_PACKET_LEN - 1));
    }
    data
}

fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

#[tokio::test]
async fn png_prefix_of_exactly_seventeen_bytes_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let payload = ts_packets(4, 0x11);
    let mut disguised = PNG_MAGIC.to_vec();
    disguised.extend([0u8; 9]);
    assert_eq!(disguised.len(), 17);
    disguised.extend(&payload);

    let segment = write(dir.path(), "000000.seg", &disguised);
    let output = dir.path().join("out.ts");
    let path = assembler(CAT_STDIN)
        .assemble(&[segment], OutputFormat::Ts, &output, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(path, output);
    assert_eq!(std::fs::read(&output).unwrap(), payload);
}

#[tokio::test]
async fn segments_are_streamed_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let segments: Vec<PathBuf> = (0..5u8)
        .map(|i| write(dir.path(), &format!("{i:06}.seg"), &ts_packets(2, i)))
        .collect();
    let output = dir.path().join("out.ts");

    assembler(CAT_STDIN)
        .assemble(&segments, OutputFormat::Ts, &output, &CancellationToken::new())
        .await
        .unwrap();

    let expected: Vec<u8> = (0..5u8).flat_map(|i| ts_packets(2, i)).collect();
    assert_eq!(std::fs::read(&output).unwrap(), expected);
}

#[tokio::test]
async fn encoder_failure_surfaces_stderr_and_leaves_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let segment = write(dir.path(), "000000.seg", &ts_packets(1, 0));
    let output = dir.path().join("out.mp4");
    let failing = ShellEncoder {
        script: r#"cat > /dev/null; echo "Invalid data found when processing input" >&2; exit 3"#,
    };

    let err = assembler(failing)
        .assemble(&[segment], OutputFormat::Mp4, &output, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        DownloadError::EncoderProcess { status, stderr } => {
            assert!(status.contains('3'), "{status}");
            assert_eq!(stderr, "Invalid data found when processing input");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!output.exists());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftovers.len(), 1, "{leftovers:?}");
}

#[tokio::test]
async fn unrecognisable_disguised_segment_is_a_format_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let mut data = PNG_MAGIC.to_vec();
    data.extend([0u8; 4096]);
    let segment = write(dir.path(), "000000.seg", &data);
    let output = dir.path().join("out.ts");

    let err = assembler(CAT_STDIN)
        .assemble(&[segment.clone()], OutputFormat::Ts, &output, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DownloadError::FormatMismatch { ref path, .. } if *path == segment));
    assert!(!output.exists());
}

#[tokio::test]
async fn tracks_are_muxed_from_concatenated_files() {
    let dir = tempfile::tempdir().unwrap();
    let video: Vec<PathBuf> = (0..3u8)
        .map(|i| write(dir.path(), &format!("v{i}.seg"), &ts_packets(1, i)))
        .collect();
    let audio: Vec<PathBuf> = (0..2u8)
        .map(|i| write(dir.path(), &format!("a{i}.seg"), &ts_packets(1, 0x80 + i)))
        .collect();
    let output = dir.path().join("out.mp4");

    assembler(CAT_FILES)
        .mux(
            &[("video".to_string(), video), ("audio".to_string(), audio)],
            OutputFormat::Mp4,
            &output,
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let mut expected: Vec<u8> = (0..3u8).flat_map(|i| ts_packets(1, i)).collect();
    expected.extend((0..2u8).flat_map(|i| ts_packets(1, 0x80 + i)));
    assert_eq!(std::fs::read(&output).unwrap(), expected);
    assert!(!dir.path().join("video.concat").exists());
    assert!(!dir.path().join("audio.concat").exists());
}

#[tokio::test]
async fn cancellation_kills_the_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let segment = write(dir.path(), "000000.seg", &ts_packets(1, 0));
    let output = dir.path().join("out.ts");
    let hanging = ShellEncoder {
        script: r#"cat > "$1"; sleep 30"#,
    };
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        canceller.cancel();
    });

    let started = std::time::Instant::now();
    let err = assembler(hanging)
        .assemble(&[segment], OutputFormat::Ts, &output, &token)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!output.exists());
}
