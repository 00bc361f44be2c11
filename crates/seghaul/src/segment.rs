//! Resolution of parsed manifests into the ordered, absolute segment list a
//! job downloads.
//!
//! Everything that can be rejected without touching the network is rejected
//! here: unparsable URLs and encryption methods other than AES-128.

use url::Url;

use crate::error::DownloadError;
use crate::manifest::{
    ByteRange, InitMap, KeyMethod, MediaPlaylist, Representation, SegmentKey,
};

/// One downloadable unit of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSegment {
    /// Position in the job, 0-based. Output order follows it.
    pub position: usize,
    /// Media sequence number (HLS) or segment number (DASH).
    pub index: u64,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    /// Key with its URI made absolute.
    pub key: SegmentKey,
    /// Initialization section (`#EXT-X-MAP` or DASH `Initialization`).
    pub init: bool,
    pub duration: f64,
}

impl ResolvedSegment {
    /// Deterministic scratch file name, so a restarted job finds its work.
    pub fn file_name(&self) -> String {
        if self.init {
            format!("init-{:06}.seg", self.position)
        } else {
            format!("{:06}.seg", self.position)
        }
    }

    /// Size the finished file must have, when the manifest fixes it.
    pub fn expected_len(&self) -> Option<u64> {
        if self.key.is_encrypted() {
            // Padding is stripped after download.
            return None;
        }
        self.byte_range.map(|r| r.length)
    }
}

fn resolve_url(base: &Url, reference: &str) -> Result<Url, DownloadError> {
    base.join(reference)
        .map_err(|e| DownloadError::invalid_url(reference, e.to_string()))
}

fn resolve_key(base: &Url, key: &SegmentKey) -> Result<SegmentKey, DownloadError> {
    match &key.method {
        KeyMethod::None => Ok(SegmentKey::default()),
        KeyMethod::Aes128 => {
            let uri = key
                .uri
                .as_deref()
                .ok_or_else(|| DownloadError::UnsupportedEncryption {
                    method: "AES-128 without key URI".to_string(),
                })?;
            Ok(SegmentKey {
                method: KeyMethod::Aes128,
                uri: Some(resolve_url(base, uri)?.to_string()),
                iv: key.iv,
            })
        }
        other => Err(DownloadError::UnsupportedEncryption {
            method: other.as_str().to_string(),
        }),
    }
}

/// Segments of an HLS media playlist. An init section is inserted ahead of
/// the first segment and wherever `#EXT-X-MAP` changes.
pub fn resolve_hls(
    playlist: &MediaPlaylist,
    base: &Url,
) -> Result<Vec<ResolvedSegment>, DownloadError> {
    let mut resolved = Vec::with_capacity(playlist.segment_count() + 1);
    let mut last_map: Option<&InitMap> = None;

    for segment in playlist.segments() {
        if let Some(map) = &segment.map
            && last_map != Some(map)
        {
            resolved.push(ResolvedSegment {
                position: resolved.len(),
                index: segment.index,
                url: resolve_url(base, &map.uri)?,
                byte_range: map.byte_range,
                key: resolve_key(base, &map.key)?,
                init: true,
                duration: 0.0,
            });
            last_map = Some(map);
        }
        resolved.push(ResolvedSegment {
            position: resolved.len(),
            index: segment.index,
            url: resolve_url(base, &segment.uri)?,
            byte_range: segment.byte_range,
            key: resolve_key(base, &segment.key)?,
            init: false,
            duration: segment.duration,
        });
    }

    Ok(resolved)
}

/// Segments of one representation per period, in period order.
///
/// An initialization section is kept only where it differs from the previous
/// period's.
pub fn resolve_dash(
    representations: &[&Representation],
) -> Result<Vec<ResolvedSegment>, DownloadError> {
    let mut resolved = Vec::new();
    let mut last_init: Option<(&str, Option<ByteRange>)> = None;

    for rep in representations {
        if let Some(init) = &rep.init {
            let this = (init.url.as_str(), init.byte_range);
            if last_init != Some(this) {
                resolved.push(ResolvedSegment {
                    position: resolved.len(),
                    index: init.number,
                    url: parse_absolute(&init.url)?,
                    byte_range: init.byte_range,
                    key: SegmentKey::default(),
                    init: true,
                    duration: 0.0,
                });
                last_init = Some(this);
            }
        }
        for segment in &rep.segments {
            resolved.push(ResolvedSegment {
                position: resolved.len(),
                index: segment.number,
                url: parse_absolute(&segment.url)?,
                byte_range: segment.byte_range,
                key: SegmentKey::default(),
                init: false,
                duration: segment.duration,
            });
        }
    }

    Ok(resolved)
}

fn parse_absolute(url: &str) -> Result<Url, DownloadError> {
    Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e.to_string()))
}

/// Sum of byte-range lengths, when every segment has one.
pub fn known_total_bytes(segments: &[ResolvedSegment]) -> Option<u64> {
    segments
        .iter()
        .map(|s| s.byte_range.map(|r| r.length))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{DashSegment, parse_media};

    fn base() -> Url {
        Url::parse("https://cdn.example.com/hls/v/index.m3u8").unwrap()
    }

    #[test]
    fn resolves_relative_uris_and_keys() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:5
#EXT-X-MAP:URI=\"init.mp4\"
#EXT-X-KEY:METHOD=AES-128,URI=\"../keys/k1\"
#EXTINF:6,
seg5.m4s
#EXTINF:6,
/abs/seg6.m4s
#EXT-X-ENDLIST
";
        let playlist = parse_media(text, &base()).unwrap();
        let segments = resolve_hls(&playlist, &base()).unwrap();
        assert_eq!(segments.len(), 3);

        assert!(segments[0].init);
        assert_eq!(segments[0].url.as_str(), "https://cdn.example.com/hls/v/init.mp4");
        assert_eq!(segments[0].file_name(), "init-000000.seg");

        assert_eq!(segments[1].position, 1);
        assert_eq!(segments[1].index, 5);
        assert_eq!(segments[1].file_name(), "000001.seg");
        assert_eq!(
            segments[1].key.uri.as_deref(),
            Some("https://cdn.example.com/hls/keys/k1")
        );
        assert_eq!(segments[2].url.as_str(), "https://cdn.example.com/abs/seg6.m4s");
    }

    #[test]
    fn init_section_follows_map_changes() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXT-X-MAP:URI=\"a/init.mp4\"
#EXTINF:6,
a/1.m4s
#EXTINF:6,
a/2.m4s
#EXT-X-DISCONTINUITY
#EXT-X-MAP:URI=\"b/init.mp4\"
#EXTINF:6,
b/1.m4s
#EXT-X-ENDLIST
";
        let playlist = parse_media(text, &base()).unwrap();
        let segments = resolve_hls(&playlist, &base()).unwrap();
        let layout: Vec<(bool, &str)> = segments
            .iter()
            .map(|s| (s.init, s.url.path()))
            .collect();
        assert_eq!(
            layout,
            [
                (true, "/hls/v/a/init.mp4"),
                (false, "/hls/v/a/1.m4s"),
                (false, "/hls/v/a/2.m4s"),
                (true, "/hls/v/b/init.mp4"),
                (false, "/hls/v/b/1.m4s"),
            ]
        );
        assert_eq!(segments[3].index, 2);
    }

    #[test]
    fn sample_aes_is_rejected_before_download() {
        let text = "#EXTM3U
#EXT-X-KEY:METHOD=SAMPLE-AES,URI=\"k\"
#EXTINF:6,
a.ts
";
        let playlist = parse_media(text, &base()).unwrap();
        let err = resolve_hls(&playlist, &base()).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::UnsupportedEncryption { ref method } if method == "SAMPLE-AES"
        ));
    }

    fn rep(init: Option<&str>, urls: &[&str]) -> Representation {
        Representation {
            id: "v".into(),
            mime_type: String::new(),
            content_type: String::new(),
            codecs: String::new(),
            bandwidth: 1,
            width: None,
            height: None,
            base_url: String::new(),
            init: init.map(|url| DashSegment {
                number: 0,
                url: url.into(),
                byte_range: None,
                duration: 0.0,
            }),
            segments: urls
                .iter()
                .zip(1..)
                .map(|(url, number)| DashSegment {
                    number,
                    url: url.to_string(),
                    byte_range: None,
                    duration: 2.0,
                })
                .collect(),
        }
    }

    #[test]
    fn dash_periods_share_an_identical_init() {
        let p1 = rep(Some("https://a/init.mp4"), &["https://a/1.m4s", "https://a/2.m4s"]);
        let p2 = rep(Some("https://a/init.mp4"), &["https://a/3.m4s"]);
        let p3 = rep(Some("https://b/init.mp4"), &["https://b/1.m4s"]);
        let segments = resolve_dash(&[&p1, &p2, &p3]).unwrap();
        let inits: Vec<usize> = segments
            .iter()
            .filter(|s| s.init)
            .map(|s| s.position)
            .collect();
        assert_eq!(inits, [0, 4]);
        assert_eq!(segments.len(), 6);
        let positions: Vec<usize> = segments.iter().map(|s| s.position).collect();
        assert_eq!(positions, [0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn total_bytes_known_only_when_every_range_is() {
        let mut segments = resolve_dash(&[&rep(None, &["https://a/1", "https://a/2"])]).unwrap();
        assert_eq!(known_total_bytes(&segments), None);
        for s in &mut segments {
            s.byte_range = Some(ByteRange {
                length: 10,
                offset: 0,
            });
        }
        assert_eq!(known_total_bytes(&segments), Some(20));
    }
}
