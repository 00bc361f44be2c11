//! HLS master/media playlist parsing and writing.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use tracing::{debug, trace};
use url::Url;

use super::attributes::{AttributeList, parse_attribute_list};
use super::{
    ByteRange, InitMap, KeyMethod, MasterPlaylist, MediaGroup, MediaPlaylist, MediaType, Part,
    Resolution, Segment, SegmentKey, StreamInfo,
};
use crate::error::{Location, ParseError};

/// Yields `(line_number, trimmed_line)` for non-empty lines, BOM stripped.
fn numbered_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.trim_start_matches('\u{feff}')
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty())
}

fn attributes_at(value: &str, line: usize) -> Result<AttributeList, ParseError> {
    parse_attribute_list(value).map_err(|reason| ParseError::at_line(reason, line))
}

fn number_at<T: std::str::FromStr>(value: &str, tag: &str, line: usize) -> Result<T, ParseError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ParseError::at_line(format!("{tag} is not numeric: `{value}`"), line))
}

fn parse_resolution(value: &str, line: usize) -> Result<Resolution, ParseError> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| ParseError::at_line(format!("malformed RESOLUTION `{value}`"), line))?;
    Ok(Resolution {
        width: number_at(w, "RESOLUTION width", line)?,
        height: number_at(h, "RESOLUTION height", line)?,
    })
}

/// The document must open with `#EXTM3U`, which keeps HTML error pages and
/// other stray text from being read as a list of segment URIs.
fn check_header(text: &str) -> Result<(), ParseError> {
    match numbered_lines(text).next() {
        Some((_, line)) if line.starts_with("#EXTM3U") => Ok(()),
        Some((line_no, _)) => Err(ParseError::at_line("missing #EXTM3U header", line_no)),
        None => Err(ParseError::new("empty playlist", Location::Document)),
    }
}

fn range_end(offset: u64, length: u64, line: usize) -> Result<u64, ParseError> {
    offset
        .checked_add(length)
        .ok_or_else(|| ParseError::at_line("BYTERANGE exceeds u64", line))
}

/// `n[@o]` as found in `#EXT-X-BYTERANGE` and the `BYTERANGE` attribute.
fn parse_byte_range_spec(value: &str, line: usize) -> Result<(u64, Option<u64>), ParseError> {
    match value.split_once('@') {
        Some((len, off)) => {
            let length = number_at(len, "BYTERANGE length", line)?;
            let offset = number_at(off, "BYTERANGE offset", line)?;
            range_end(offset, length, line)?;
            Ok((length, Some(offset)))
        }
        None => Ok((number_at(value, "BYTERANGE length", line)?, None)),
    }
}

fn parse_iv(value: &str, line: usize) -> Result<[u8; 16], ParseError> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    // Shorter IVs are left-padded, as an integer would be.
    if digits.len() > 32 {
        return Err(ParseError::at_line(format!("IV too long: `{value}`"), line));
    }
    let padded = format!("{digits:0>32}");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(&padded, &mut iv)
        .map_err(|e| ParseError::at_line(format!("invalid IV `{value}`: {e}"), line))?;
    Ok(iv)
}

fn parse_key(attrs: &AttributeList, line: usize) -> Result<SegmentKey, ParseError> {
    let method = attrs
        .get("METHOD")
        .map(KeyMethod::from_attribute)
        .ok_or_else(|| ParseError::at_line("#EXT-X-KEY without METHOD", line))?;
    if method == KeyMethod::None {
        return Ok(SegmentKey::default());
    }
    let uri = attrs.get("URI").map(str::to_string);
    if uri.is_none() {
        return Err(ParseError::at_line(
            format!("#EXT-X-KEY with METHOD={} requires a URI", method.as_str()),
            line,
        ));
    }
    let iv = attrs.get("IV").map(|v| parse_iv(v, line)).transpose()?;
    Ok(SegmentKey { method, uri, iv })
}

fn parse_stream_info(attrs: &AttributeList, line: usize) -> Result<StreamInfo, ParseError> {
    let at = |reason: String| ParseError::at_line(reason, line);
    let text = |name: &str| attrs.get(name).unwrap_or_default().to_string();
    Ok(StreamInfo {
        bandwidth: attrs.get_u64("BANDWIDTH").map_err(at)?.unwrap_or(0),
        frame_rate: attrs.get_f64("FRAME-RATE").map_err(at)?.unwrap_or(0.0),
        program_id: attrs
            .get_u64("PROGRAM-ID")
            .map_err(at)?
            .map_or(0, |v| v as u32),
        uri: String::new(),
        codecs: text("CODECS"),
        audio_group_ref: text("AUDIO"),
        video_group_ref: text("VIDEO"),
        subtitles_group_ref: text("SUBTITLES"),
        closed_captions_group_ref: text("CLOSED-CAPTIONS"),
        resolution: attrs
            .get("RESOLUTION")
            .map(|v| parse_resolution(v, line))
            .transpose()?,
        attributes: attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    })
}

fn parse_media_group(attrs: &AttributeList, line: usize) -> Result<MediaGroup, ParseError> {
    let type_value = attrs
        .get("TYPE")
        .ok_or_else(|| ParseError::at_line("#EXT-X-MEDIA without TYPE", line))?;
    let media_type = MediaType::from_attribute(type_value)
        .ok_or_else(|| ParseError::at_line(format!("unknown media TYPE `{type_value}`"), line))?;
    let text = |name: &str| attrs.get(name).unwrap_or_default().to_string();
    Ok(MediaGroup {
        media_type,
        uri: text("URI"),
        group_id: text("GROUP-ID"),
        language: text("LANGUAGE"),
        name: text("NAME"),
        characteristics: text("CHARACTERISTICS"),
        auto_select: attrs.get_bool("AUTOSELECT"),
        is_default: attrs.get_bool("DEFAULT"),
        forced: attrs.get_bool("FORCED"),
    })
}

/// Parse a master (variant) playlist.
pub fn parse_master(text: &str, source_url: &Url) -> Result<MasterPlaylist, ParseError> {
    let mut playlist = MasterPlaylist {
        source_url: source_url.to_string(),
        ..Default::default()
    };
    let mut pending: Option<(usize, StreamInfo)> = None;
    check_header(text)?;

    for (line_no, line) in numbered_lines(text) {
        if line == "#EXTM3U" {
            playlist.is_m3u = true;
        } else if let Some(value) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            if let Some((prev_line, _)) = pending {
                return Err(ParseError::at_line(
                    "#EXT-X-STREAM-INF is not followed by a URI",
                    prev_line,
                ));
            }
            let attrs = attributes_at(value, line_no)?;
            pending = Some((line_no, parse_stream_info(&attrs, line_no)?));
        } else if let Some(value) = line.strip_prefix("#EXT-X-MEDIA:") {
            let attrs = attributes_at(value, line_no)?;
            playlist
                .media_groups
                .push(parse_media_group(&attrs, line_no)?);
        } else if line.starts_with('#') {
            trace!(line = line_no, tag = line, "Skipping master playlist tag");
        } else if let Some((_, mut info)) = pending.take() {
            info.uri = line.to_string();
            playlist.stream_infos.push(info);
        } else {
            debug!(line = line_no, uri = line, "URI without #EXT-X-STREAM-INF ignored");
        }
    }

    if let Some((line_no, _)) = pending {
        return Err(ParseError::at_line(
            "#EXT-X-STREAM-INF is not followed by a URI",
            line_no,
        ));
    }

    Ok(playlist)
}

/// Running state carried across lines of a media playlist.
struct MediaState {
    key: SegmentKey,
    map: Option<InitMap>,
    pending_range: Option<(u64, Option<u64>)>,
    /// Resource and end offset (exclusive) of the last sub-range, for
    /// ranges that omit `@offset`.
    last_range: Option<(String, u64)>,
    discontinuity: bool,
    pending_inf: Option<(f64, String)>,
    /// `None` once the sequence number space is used up.
    next_index: Option<u64>,
    sequence_locked: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            key: SegmentKey::default(),
            map: None,
            pending_range: None,
            last_range: None,
            discontinuity: false,
            pending_inf: None,
            next_index: Some(0),
            sequence_locked: false,
        }
    }
}

/// Parse a media (segment) playlist.
pub fn parse_media(text: &str, source_url: &Url) -> Result<MediaPlaylist, ParseError> {
    let mut playlist = MediaPlaylist {
        source_url: source_url.to_string(),
        version: 1,
        ..Default::default()
    };
    let mut state = MediaState::default();
    let mut current = Part::default();
    check_header(text)?;

    for (line_no, line) in numbered_lines(text) {
        if !line.starts_with('#') {
            let segment = build_segment(&mut state, line, line_no)?;
            if segment.discontinuity && !current.segments.is_empty() {
                playlist.parts.push(std::mem::take(&mut current));
            }
            playlist.total_duration += segment.duration;
            current.segments.push(segment);
            continue;
        }

        let (tag, value) = line.split_once(':').unwrap_or((line, ""));
        match tag {
            "#EXTM3U" => playlist.is_m3u = true,
            "#EXT-X-VERSION" => playlist.version = number_at(value, tag, line_no)?,
            "#EXT-X-TARGETDURATION" => {
                playlist.target_duration = number_at(value, tag, line_no)?
            }
            "#EXT-X-MEDIA-SEQUENCE" => {
                let sequence = number_at(value, tag, line_no)?;
                playlist.media_sequence = sequence;
                if !state.sequence_locked {
                    state.next_index = Some(sequence);
                }
            }
            "#EXT-X-DISCONTINUITY-SEQUENCE" => {
                playlist.discontinuity_sequence = number_at(value, tag, line_no)?
            }
            "#EXT-X-PLAYLIST-TYPE" => playlist.playlist_type = Some(value.trim().to_string()),
            "#EXT-X-ENDLIST" => playlist.end_list = true,
            "#EXTINF" => {
                let (duration, title) = value.split_once(',').unwrap_or((value, ""));
                state.pending_inf = Some((
                    number_at(duration, tag, line_no)?,
                    title.trim().to_string(),
                ));
            }
            "#EXT-X-BYTERANGE" => {
                state.pending_range = Some(parse_byte_range_spec(value.trim(), line_no)?);
            }
            "#EXT-X-DISCONTINUITY" => state.discontinuity = true,
            "#EXT-X-KEY" => {
                let attrs = attributes_at(value, line_no)?;
                state.key = parse_key(&attrs, line_no)?;
            }
            "#EXT-X-MAP" => {
                let attrs = attributes_at(value, line_no)?;
                let uri = attrs
                    .get("URI")
                    .ok_or_else(|| ParseError::at_line("#EXT-X-MAP without URI", line_no))?
                    .to_string();
                let byte_range = attrs
                    .get("BYTERANGE")
                    .map(|spec| parse_byte_range_spec(spec, line_no))
                    .transpose()?
                    .map(|(length, offset)| ByteRange {
                        length,
                        offset: offset.unwrap_or(0),
                    });
                state.map = Some(InitMap {
                    uri,
                    byte_range,
                    key: state.key.clone(),
                });
            }
            _ => trace!(line = line_no, tag, "Skipping media playlist tag"),
        }
    }

    if !current.segments.is_empty() {
        playlist.parts.push(current);
    }

    Ok(playlist)
}

fn build_segment(state: &mut MediaState, uri: &str, line: usize) -> Result<Segment, ParseError> {
    state.sequence_locked = true;

    let (duration, title) = state.pending_inf.take().unwrap_or_else(|| {
        debug!(line, uri, "Segment without #EXTINF, assuming zero duration");
        (0.0, String::new())
    });

    let byte_range = match state.pending_range.take() {
        None => None,
        Some((length, Some(offset))) => Some(ByteRange { length, offset }),
        Some((length, None)) => {
            let offset = match &state.last_range {
                Some((last_uri, end)) if last_uri == uri => *end,
                Some(_) | None => {
                    return Err(ParseError::at_line(
                        "#EXT-X-BYTERANGE without offset does not follow a range of the same URI",
                        line,
                    ));
                }
            };
            Some(ByteRange { length, offset })
        }
    };
    state.last_range = match byte_range {
        Some(r) => Some((uri.to_string(), range_end(r.offset, r.length, line)?)),
        None => None,
    };

    let index = state
        .next_index
        .ok_or_else(|| ParseError::at_line("media sequence number exceeds u64", line))?;
    state.next_index = index.checked_add(1);

    Ok(Segment {
        index,
        duration,
        uri: uri.to_string(),
        title,
        discontinuity: std::mem::take(&mut state.discontinuity),
        key: state.key.clone(),
        byte_range,
        map: state.map.clone(),
    })
}

fn write_key(out: &mut String, key: &SegmentKey) {
    if !key.is_encrypted() {
        out.push_str("#EXT-X-KEY:METHOD=NONE\n");
        return;
    }
    let _ = write!(out, "#EXT-X-KEY:METHOD={}", key.method.as_str());
    if let Some(uri) = &key.uri {
        let _ = write!(out, ",URI=\"{uri}\"");
    }
    if let Some(iv) = &key.iv {
        let _ = write!(out, ",IV=0x{}", hex::encode_upper(iv));
    }
    out.push('\n');
}

impl MediaPlaylist {
    /// Serialize back to M3U8. Keys and maps are written only where they
    /// change and byte ranges always carry an explicit offset.
    pub fn to_m3u8(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        let _ = writeln!(out, "#EXT-X-VERSION:{}", self.version);
        let _ = writeln!(out, "#EXT-X-TARGETDURATION:{}", self.target_duration);
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence);
        let _ = writeln!(
            out,
            "#EXT-X-DISCONTINUITY-SEQUENCE:{}",
            self.discontinuity_sequence
        );
        if let Some(kind) = &self.playlist_type {
            let _ = writeln!(out, "#EXT-X-PLAYLIST-TYPE:{kind}");
        }
        let mut current_key = SegmentKey::default();
        let mut current_map: Option<&InitMap> = None;

        for segment in self.segments() {
            // A map cannot be withdrawn once declared, so a segment without
            // one keeps the previous map.
            if let Some(map) = &segment.map
                && current_map != Some(map)
            {
                if map.key != current_key {
                    write_key(&mut out, &map.key);
                    current_key = map.key.clone();
                }
                let _ = write!(out, "#EXT-X-MAP:URI=\"{}\"", map.uri);
                if let Some(range) = map.byte_range {
                    let _ = write!(out, ",BYTERANGE=\"{}@{}\"", range.length, range.offset);
                }
                out.push('\n');
                current_map = Some(map);
            }
            if segment.key != current_key {
                write_key(&mut out, &segment.key);
                current_key = segment.key.clone();
            }
            if segment.discontinuity {
                out.push_str("#EXT-X-DISCONTINUITY\n");
            }
            let _ = writeln!(out, "#EXTINF:{},{}", segment.duration, segment.title);
            if let Some(range) = segment.byte_range {
                let _ = writeln!(out, "#EXT-X-BYTERANGE:{}@{}", range.length, range.offset);
            }
            out.push_str(&segment.uri);
            out.push('\n');
        }

        if self.end_list {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }
}

impl MasterPlaylist {
    pub fn to_m3u8(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        for group in &self.media_groups {
            let _ = write!(
                out,
                "#EXT-X-MEDIA:TYPE={},GROUP-ID=\"{}\",NAME=\"{}\"",
                group.media_type.as_str(),
                group.group_id,
                group.name
            );
            if !group.language.is_empty() {
                let _ = write!(out, ",LANGUAGE=\"{}\"", group.language);
            }
            if !group.characteristics.is_empty() {
                let _ = write!(out, ",CHARACTERISTICS=\"{}\"", group.characteristics);
            }
            let yes_no = |b: bool| if b { "YES" } else { "NO" };
            let _ = write!(
                out,
                ",AUTOSELECT={},DEFAULT={},FORCED={}",
                yes_no(group.auto_select),
                yes_no(group.is_default),
                yes_no(group.forced)
            );
            if !group.uri.is_empty() {
                let _ = write!(out, ",URI=\"{}\"", group.uri);
            }
            out.push('\n');
        }
        for info in &self.stream_infos {
            let _ = write!(out, "#EXT-X-STREAM-INF:BANDWIDTH={}", info.bandwidth);
            if let Some(res) = info.resolution {
                let _ = write!(out, ",RESOLUTION={}x{}", res.width, res.height);
            }
            if !info.codecs.is_empty() {
                let _ = write!(out, ",CODECS=\"{}\"", info.codecs);
            }
            if !info.audio_group_ref.is_empty() {
                let _ = write!(out, ",AUDIO=\"{}\"", info.audio_group_ref);
            }
            out.push('\n');
            out.push_str(&info.uri);
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://cdn.example.com/vod/stream.m3u8").unwrap()
    }

    const MASTER: &str = r#"#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aac",NAME="English",LANGUAGE="en",DEFAULT=YES,AUTOSELECT=YES,URI="audio/en.m3u8"
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aac",NAME="Deutsch",LANGUAGE="de",URI="audio/de.m3u8"
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720,CODECS="avc1.64001f,mp4a.40.2",AUDIO="aac",FRAME-RATE=29.970
hd/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=854x480,PROGRAM-ID=1
sd/index.m3u8
"#;

    #[test]
    fn parses_master_variants_and_groups() {
        let master = parse_master(MASTER, &url()).unwrap();
        assert!(master.is_m3u);
        assert_eq!(master.stream_infos.len(), 2);

        let hd = &master.stream_infos[0];
        assert_eq!(hd.bandwidth, 2_000_000);
        assert_eq!(hd.uri, "hd/index.m3u8");
        assert_eq!(
            hd.resolution,
            Some(Resolution {
                width: 1280,
                height: 720
            })
        );
        assert_eq!(hd.codecs, "avc1.64001f,mp4a.40.2");
        assert_eq!(hd.audio_group_ref, "aac");
        assert!((hd.frame_rate - 29.97).abs() < 1e-9);
        assert_eq!(hd.attributes.get("AUDIO").map(String::as_str), Some("aac"));

        let sd = &master.stream_infos[1];
        assert_eq!(sd.program_id, 1);

        assert_eq!(master.media_groups.len(), 2);
        let en = &master.media_groups[0];
        assert_eq!(en.media_type, MediaType::Audio);
        assert_eq!(en.language, "en");
        assert!(en.is_default && en.auto_select && !en.forced);
        assert_eq!(master.source_url, url().to_string());
    }

    #[test]
    fn resolution_absent_when_not_declared() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=64000\naudio.m3u8\n";
        let master = parse_master(text, &url()).unwrap();
        assert!(master.stream_infos[0].resolution.is_none());
    }

    #[test]
    fn stream_inf_without_uri_is_an_error() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\n";
        let err = parse_master(text, &url()).unwrap_err();
        assert_eq!(err.location, crate::error::Location::Line(2));
    }

    #[test]
    fn non_numeric_bandwidth_is_an_error() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=lots\nx.m3u8\n";
        let err = parse_master(text, &url()).unwrap_err();
        assert!(err.reason.contains("BANDWIDTH"));
    }

    #[test]
    fn unterminated_attribute_list_reports_line() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,CODECS=\"avc1\nx.m3u8\n";
        let err = parse_master(text, &url()).unwrap_err();
        assert_eq!(err.location, crate::error::Location::Line(2));
    }

    const MEDIA: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:6
#EXT-X-MEDIA-SEQUENCE:5
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-KEY:METHOD=AES-128,URI=\"https://keys.example.com/k1\"
#EXTINF:6.0,first
seg5.ts
#EXTINF:6.0,
seg6.ts
#EXT-X-DISCONTINUITY
#EXTINF:4.5,
seg7.ts
#EXT-X-KEY:METHOD=AES-128,URI=\"k2.bin\",IV=0x000102030405060708090a0b0c0d0e0f
#EXTINF:6.0,
seg8.ts
#EXT-X-KEY:METHOD=NONE
#EXTINF:2.0,
seg9.ts
#EXT-X-ENDLIST
";

    #[test]
    fn parses_media_playlist_header() {
        let media = parse_media(MEDIA, &url()).unwrap();
        assert!(media.is_m3u);
        assert!(media.end_list);
        assert!(!media.is_live());
        assert_eq!(media.version, 3);
        assert_eq!(media.target_duration, 6);
        assert_eq!(media.media_sequence, 5);
        assert_eq!(media.playlist_type.as_deref(), Some("VOD"));
        assert!((media.total_duration - 24.5).abs() < 1e-9);
    }

    #[test]
    fn indices_start_at_media_sequence() {
        let media = parse_media(MEDIA, &url()).unwrap();
        let indices: Vec<u64> = media.segments().map(|s| s.index).collect();
        assert_eq!(indices, vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn key_is_sticky_until_next_key_tag() {
        let media = parse_media(MEDIA, &url()).unwrap();
        let segments: Vec<&Segment> = media.segments().collect();
        let k1 = &segments[0].key;
        assert_eq!(k1.method, KeyMethod::Aes128);
        assert_eq!(k1.uri.as_deref(), Some("https://keys.example.com/k1"));
        assert!(k1.iv.is_none());
        assert_eq!(&segments[1].key, k1);
        assert_eq!(&segments[2].key, k1);

        let k2 = &segments[3].key;
        assert_eq!(k2.uri.as_deref(), Some("k2.bin"));
        assert_eq!(
            k2.iv,
            Some([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15])
        );
        assert!(!segments[4].key.is_encrypted());
    }

    #[test]
    fn discontinuity_applies_once_and_splits_parts() {
        let media = parse_media(MEDIA, &url()).unwrap();
        assert_eq!(media.parts.len(), 2);
        assert_eq!(media.parts[0].segments.len(), 2);
        let flags: Vec<bool> = media.segments().map(|s| s.discontinuity).collect();
        assert_eq!(flags, vec![false, false, true, false, false]);
    }

    #[test]
    fn byte_range_is_cleared_after_one_segment() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXTINF:4,
#EXT-X-BYTERANGE:1000@0
all.ts
#EXTINF:4,
#EXT-X-BYTERANGE:500
all.ts
#EXTINF:4,
other.ts
";
        let media = parse_media(text, &url()).unwrap();
        let ranges: Vec<Option<ByteRange>> = media.segments().map(|s| s.byte_range).collect();
        assert_eq!(
            ranges,
            vec![
                Some(ByteRange {
                    length: 1000,
                    offset: 0
                }),
                Some(ByteRange {
                    length: 500,
                    offset: 1000
                }),
                None,
            ]
        );
    }

    #[test]
    fn implicit_offset_for_new_resource_is_an_error() {
        let text = "#EXTM3U\n#EXTINF:4,\n#EXT-X-BYTERANGE:500\na.ts\n";
        assert!(parse_media(text, &url()).is_err());
    }

    #[test]
    fn parses_init_map() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-MAP:URI=\"init.mp4\",BYTERANGE=\"720@0\"
#EXTINF:4,
seg0.m4s
";
        let media = parse_media(text, &url()).unwrap();
        let map = media.segments().next().unwrap().map.clone().unwrap();
        assert_eq!(map.uri, "init.mp4");
        assert_eq!(
            map.byte_range,
            Some(ByteRange {
                length: 720,
                offset: 0
            })
        );
    }

    #[test]
    fn each_segment_keeps_the_map_declared_before_it() {
        let text = "#EXTM3U
#EXT-X-TARGETDURATION:4
#EXT-X-MAP:URI=\"init-a.mp4\"
#EXTINF:4,
a0.m4s
#EXTINF:4,
a1.m4s
#EXT-X-DISCONTINUITY
#EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"
#EXT-X-MAP:URI=\"init-b.mp4\"
#EXTINF:4,
b0.m4s
#EXT-X-ENDLIST
";
        let media = parse_media(text, &url()).unwrap();
        let maps: Vec<&str> = media
            .segments()
            .map(|s| s.map.as_ref().map_or("", |m| m.uri.as_str()))
            .collect();
        assert_eq!(maps, ["init-a.mp4", "init-a.mp4", "init-b.mp4"]);

        let last = media.segments().last().unwrap();
        assert!(last.map.as_ref().unwrap().key.is_encrypted());
        assert_eq!(parse_media(&media.to_m3u8(), &url()).unwrap(), media);
    }

    #[test]
    fn document_without_header_is_rejected() {
        let page = "<html>\n<body>403 Forbidden</body>\n</html>\n";
        let err = parse_media(page, &url()).unwrap_err();
        assert_eq!(err.location, crate::error::Location::Line(1));
        assert!(err.reason.contains("#EXTM3U"));
        assert!(parse_master(page, &url()).is_err());

        let headless = "\n#EXTINF:4,\nseg0.ts\n";
        assert_eq!(
            parse_media(headless, &url()).unwrap_err().location,
            crate::error::Location::Line(2)
        );
        assert!(parse_media("\u{feff}#EXTM3U\n#EXTINF:4,\na.ts\n", &url()).is_ok());
    }

    #[test]
    fn byte_range_overflow_is_an_error() {
        let text = "#EXTM3U\n#EXTINF:4,\n#EXT-X-BYTERANGE:10@18446744073709551615\na.ts\n";
        let err = parse_media(text, &url()).unwrap_err();
        assert_eq!(err.location, crate::error::Location::Line(3));

        let implicit = "#EXTM3U
#EXTINF:4,
#EXT-X-BYTERANGE:18446744073709551615@0
a.ts
#EXTINF:4,
#EXT-X-BYTERANGE:1
a.ts
";
        assert!(parse_media(implicit, &url()).is_err());

        let map = "#EXTM3U\n#EXT-X-MAP:URI=\"i.mp4\",BYTERANGE=\"2@18446744073709551615\"\n";
        assert!(parse_media(map, &url()).is_err());
    }

    #[test]
    fn sequence_number_exhaustion_is_an_error() {
        let last = "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:18446744073709551615\n#EXTINF:4,\na.ts\n";
        let media = parse_media(last, &url()).unwrap();
        assert_eq!(media.segments().next().unwrap().index, u64::MAX);

        let past = format!("{last}#EXTINF:4,\nb.ts\n");
        let err = parse_media(&past, &url()).unwrap_err();
        assert_eq!(err.location, crate::error::Location::Line(6));
    }

    #[test]
    fn non_numeric_extinf_is_an_error() {
        let text = "#EXTM3U\n#EXTINF:abc,\nseg.ts\n";
        let err = parse_media(text, &url()).unwrap_err();
        assert_eq!(err.location, crate::error::Location::Line(2));
    }

    #[test]
    fn key_without_uri_is_an_error() {
        let text = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128\n#EXTINF:1,\na.ts\n";
        assert!(parse_media(text, &url()).is_err());
    }

    #[test]
    fn short_iv_is_left_padded() {
        let iv = parse_iv("0x5", 1).unwrap();
        let mut expected = [0u8; 16];
        expected[15] = 5;
        assert_eq!(iv, expected);
    }

    #[test]
    fn written_playlist_parses_back_identically() {
        let media = parse_media(MEDIA, &url()).unwrap();
        let reparsed = parse_media(&media.to_m3u8(), &url()).unwrap();
        assert_eq!(reparsed, media);
    }

    #[test]
    fn written_master_parses_back() {
        let master = parse_master(MASTER, &url()).unwrap();
        let reparsed = parse_master(&master.to_m3u8(), &url()).unwrap();
        assert_eq!(reparsed.stream_infos.len(), 2);
        assert_eq!(reparsed.media_groups, master.media_groups);
        assert_eq!(reparsed.stream_infos[0].uri, master.stream_infos[0].uri);
        assert_eq!(
            reparsed.stream_infos[0].resolution,
            master.stream_infos[0].resolution
        );
    }
}
