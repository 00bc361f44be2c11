//! Parsed manifest model and format sniffing.
//!
//! HLS playlists and DASH MPDs are parsed by two independent parsers behind the
//! [`ManifestParser`] strategy. [`Manifest::parse`] sniffs the document shape
//! and dispatches to the right one.

pub mod attributes;
pub mod dash;
pub mod hls;

use std::collections::BTreeMap;

use url::Url;

use crate::error::{Location, ParseError};

pub use attributes::{AttributeList, parse_attribute_list};
pub use dash::{AdaptationSet, DashSegment, Period, Representation, parse_mpd};
pub use hls::{parse_master, parse_media};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// An inclusive sub-range of a resource, `length` bytes starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub length: u64,
    pub offset: u64,
}

impl ByteRange {
    /// Last byte covered by the range (inclusive), as used in a `Range` header.
    pub fn end_inclusive(&self) -> u64 {
        self.offset.saturating_add(self.length.saturating_sub(1))
    }

    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.offset, self.end_inclusive())
    }
}

/// Top-level HLS variant list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MasterPlaylist {
    pub is_m3u: bool,
    pub stream_infos: Vec<StreamInfo>,
    pub media_groups: Vec<MediaGroup>,
    pub source_url: String,
}

/// One `#EXT-X-STREAM-INF` entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StreamInfo {
    pub bandwidth: u64,
    pub frame_rate: f64,
    pub program_id: u32,
    pub uri: String,
    pub codecs: String,
    pub audio_group_ref: String,
    pub video_group_ref: String,
    pub subtitles_group_ref: String,
    pub closed_captions_group_ref: String,
    pub resolution: Option<Resolution>,
    /// Every attribute as declared, including the ones lifted into fields above.
    pub attributes: BTreeMap<String, String>,
}

impl StreamInfo {
    pub fn height(&self) -> u32 {
        self.resolution.map_or(0, |r| r.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Audio,
    Video,
    Subtitles,
    ClosedCaptions,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "AUDIO",
            Self::Video => "VIDEO",
            Self::Subtitles => "SUBTITLES",
            Self::ClosedCaptions => "CLOSED-CAPTIONS",
        }
    }

    pub fn from_attribute(value: &str) -> Option<Self> {
        match value {
            "AUDIO" => Some(Self::Audio),
            "VIDEO" => Some(Self::Video),
            "SUBTITLES" => Some(Self::Subtitles),
            "CLOSED-CAPTIONS" => Some(Self::ClosedCaptions),
            _ => None,
        }
    }
}

/// One `#EXT-X-MEDIA` rendition.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaGroup {
    pub media_type: MediaType,
    pub uri: String,
    pub group_id: String,
    pub language: String,
    pub name: String,
    pub characteristics: String,
    pub auto_select: bool,
    pub is_default: bool,
    pub forced: bool,
}

/// Leaf HLS playlist.
///
/// `end_list == false` means the playlist is live. Only the segments known at
/// fetch time are downloaded.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaPlaylist {
    pub is_m3u: bool,
    pub end_list: bool,
    pub media_sequence: u64,
    pub discontinuity_sequence: u64,
    pub target_duration: u64,
    pub version: u32,
    pub total_duration: f64,
    pub playlist_type: Option<String>,
    /// Segments grouped into runs separated by `#EXT-X-DISCONTINUITY`.
    pub parts: Vec<Part>,
    pub source_url: String,
}

impl MediaPlaylist {
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.parts.iter().flat_map(|p| p.segments.iter())
    }

    pub fn segment_count(&self) -> usize {
        self.parts.iter().map(|p| p.segments.len()).sum()
    }

    pub fn is_live(&self) -> bool {
        !self.end_list
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Part {
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitMap {
    pub uri: String,
    pub byte_range: Option<ByteRange>,
    /// Key in effect where the map was declared.
    pub key: SegmentKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Media sequence number; strictly increasing from `media_sequence`.
    pub index: u64,
    pub duration: f64,
    pub uri: String,
    pub title: String,
    pub discontinuity: bool,
    pub key: SegmentKey,
    pub byte_range: Option<ByteRange>,
    /// `#EXT-X-MAP` in effect for this segment.
    pub map: Option<InitMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum KeyMethod {
    #[default]
    None,
    Aes128,
    SampleAes,
    Other(String),
}

impl KeyMethod {
    pub fn from_attribute(value: &str) -> Self {
        match value {
            "NONE" => Self::None,
            "AES-128" => Self::Aes128,
            "SAMPLE-AES" => Self::SampleAes,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::None => "NONE",
            Self::Aes128 => "AES-128",
            Self::SampleAes => "SAMPLE-AES",
            Self::Other(name) => name,
        }
    }
}

/// Encryption state applying to a segment. Sticky across segments until the
/// next `#EXT-X-KEY`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SegmentKey {
    pub method: KeyMethod,
    pub uri: Option<String>,
    pub iv: Option<[u8; 16]>,
}

impl SegmentKey {
    pub fn is_encrypted(&self) -> bool {
        self.method != KeyMethod::None
    }
}

/// Declared shape of a manifest document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    HlsMaster,
    HlsMedia,
    Dash,
}

impl ManifestKind {
    /// Sniff the document shape: an `<MPD>` root is DASH, an HLS document
    /// containing `#EXT-X-STREAM-INF` is a master playlist, anything else is
    /// treated as a media playlist.
    pub fn detect(text: &str) -> Self {
        let trimmed = text.trim_start_matches('\u{feff}').trim_start();
        if trimmed.starts_with('<') && dash::root_is_mpd(trimmed) {
            return Self::Dash;
        }
        if text.contains("#EXT-X-STREAM-INF") {
            Self::HlsMaster
        } else {
            Self::HlsMedia
        }
    }
}

/// A parsed manifest of any supported dialect.
#[derive(Debug, Clone, PartialEq)]
pub enum Manifest {
    Master(MasterPlaylist),
    Media(MediaPlaylist),
    Dash(Vec<Period>),
}

impl Manifest {
    /// Sniff `text` and parse it with the matching parser.
    pub fn parse(text: &str, source_url: &Url) -> Result<Self, ParseError> {
        if text.trim().is_empty() {
            return Err(ParseError::new("empty manifest", Location::Document));
        }
        parser_for(ManifestKind::detect(text)).parse(text, source_url)
    }

    pub fn kind(&self) -> ManifestKind {
        match self {
            Self::Master(_) => ManifestKind::HlsMaster,
            Self::Media(_) => ManifestKind::HlsMedia,
            Self::Dash(_) => ManifestKind::Dash,
        }
    }
}

/// One manifest dialect.
pub trait ManifestParser: Send + Sync {
    fn parse(&self, text: &str, source_url: &Url) -> Result<Manifest, ParseError>;
}

pub struct HlsMasterParser;
pub struct HlsMediaParser;
pub struct DashParser;

impl ManifestParser for HlsMasterParser {
    fn parse(&self, text: &str, source_url: &Url) -> Result<Manifest, ParseError> {
        parse_master(text, source_url).map(Manifest::Master)
    }
}

impl ManifestParser for HlsMediaParser {
    fn parse(&self, text: &str, source_url: &Url) -> Result<Manifest, ParseError> {
        parse_media(text, source_url).map(Manifest::Media)
    }
}

impl ManifestParser for DashParser {
    fn parse(&self, text: &str, source_url: &Url) -> Result<Manifest, ParseError> {
        parse_mpd(text, source_url).map(Manifest::Dash)
    }
}

pub fn parser_for(kind: ManifestKind) -> &'static dyn ManifestParser {
    match kind {
        ManifestKind::HlsMaster => &HlsMasterParser,
        ManifestKind::HlsMedia => &HlsMediaParser,
        ManifestKind::Dash => &DashParser,
    }
}
