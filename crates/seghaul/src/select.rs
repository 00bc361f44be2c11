//! Rendition selection.
//!
//! Video candidates rank by height, then bandwidth, both descending. Audio
//! candidates rank by bandwidth only. A height cap removes candidates before
//! ranking; when nothing fits, the free functions return `None` and
//! [`RenditionSelector`] decides between failing and taking the best overall.

use std::cmp::Ordering;

use tracing::{debug, warn};

use crate::config::SelectionOptions;
use crate::error::DownloadError;
use crate::manifest::{AdaptationSet, MediaGroup, MediaType, Period, Representation, StreamInfo};

const AUDIO_CODECS: &[&str] = &["mp4a", "ac-3", "ec-3", "opus", "flac", "mp3", "vorbis"];

/// A variant is video unless it declares only audio codecs and no resolution.
fn is_video_variant(info: &StreamInfo) -> bool {
    if info.resolution.is_some() || info.codecs.is_empty() {
        return true;
    }
    !info.codecs.split(',').all(|codec| {
        let codec = codec.trim().to_ascii_lowercase();
        AUDIO_CODECS.iter().any(|audio| codec.starts_with(audio))
    })
}

fn by_height_then_bandwidth(a: (u32, u64), b: (u32, u64)) -> Ordering {
    b.0.cmp(&a.0).then(b.1.cmp(&a.1))
}

fn fits(height: u32, max_height: Option<u32>) -> bool {
    max_height.is_none_or(|max| height <= max)
}

/// Best HLS variant within `max_height`.
pub fn select_video(stream_infos: &[StreamInfo], max_height: Option<u32>) -> Option<&StreamInfo> {
    let mut candidates: Vec<&StreamInfo> = stream_infos
        .iter()
        .filter(|info| is_video_variant(info) && fits(info.height(), max_height))
        .collect();
    candidates.sort_by(|a, b| {
        by_height_then_bandwidth((a.height(), a.bandwidth), (b.height(), b.bandwidth))
    });
    candidates.first().copied()
}

fn has_type(declared: &[&str], prefix: &str) -> bool {
    declared.iter().any(|value| value.starts_with(prefix))
}

/// Checks the representation's own types, then its adaptation set's.
fn is_kind(set: &AdaptationSet, rep: &Representation, prefix: &str) -> bool {
    let own = [rep.mime_type.as_str(), rep.content_type.as_str()];
    if own.iter().any(|v| !v.is_empty()) {
        return has_type(&own, prefix);
    }
    has_type(&[set.mime_type.as_str(), set.content_type.as_str()], prefix)
}

/// Best DASH video representation within `max_height`, across all periods.
pub fn select_video_from_dash(
    periods: &[Period],
    max_height: Option<u32>,
) -> Option<&Representation> {
    let mut candidates: Vec<&Representation> = periods
        .iter()
        .flat_map(|period| period.representations())
        .filter(|(set, rep)| is_kind(set, rep, "video"))
        .map(|(_, rep)| rep)
        .filter(|rep| fits(rep.height.unwrap_or(0), max_height))
        .collect();
    candidates.sort_by(|a, b| {
        by_height_then_bandwidth(
            (a.height.unwrap_or(0), a.bandwidth),
            (b.height.unwrap_or(0), b.bandwidth),
        )
    });
    candidates.first().copied()
}

/// Best DASH audio representation, restricted to `lang` when given.
pub fn select_audio_from_dash<'a>(
    periods: &'a [Period],
    lang: Option<&str>,
) -> Option<&'a Representation> {
    let mut candidates: Vec<&Representation> = periods
        .iter()
        .flat_map(|period| period.representations())
        .filter(|(set, rep)| is_kind(set, rep, "audio"))
        .filter(|(set, _)| lang.is_none_or(|lang| set.lang == lang))
        .map(|(_, rep)| rep)
        .collect();
    candidates.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
    candidates.first().copied()
}

/// Alternative audio rendition of `group_id`, restricted to `lang` when given.
///
/// Renditions without a URI are muxed into the variant and are skipped.
/// Among equals, `DEFAULT=YES` wins, then `AUTOSELECT=YES`, then manifest order.
pub fn select_hls_audio<'a>(
    media_groups: &'a [MediaGroup],
    group_id: &str,
    lang: Option<&str>,
) -> Option<&'a MediaGroup> {
    let mut candidates: Vec<&MediaGroup> = media_groups
        .iter()
        .filter(|g| g.media_type == MediaType::Audio && g.group_id == group_id)
        .filter(|g| !g.uri.is_empty())
        .filter(|g| lang.is_none_or(|lang| g.language == lang))
        .collect();
    candidates.sort_by_key(|g| (!g.is_default, !g.auto_select));
    candidates.first().copied()
}

/// Applies [`SelectionOptions`] on top of the selection functions.
#[derive(Debug, Clone, Default)]
pub struct RenditionSelector {
    options: SelectionOptions,
}

impl RenditionSelector {
    pub fn new(options: SelectionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SelectionOptions {
        &self.options
    }

    fn cap_missed(&self, what: &str) -> Result<(), DownloadError> {
        let max = self.options.max_height.unwrap_or_default();
        if self.options.fallback_to_best {
            warn!(max_height = max, "No {what} fits the height cap, using the best available");
            Ok(())
        } else {
            Err(DownloadError::no_rendition(format!(
                "no {what} is at most {max} pixels high"
            )))
        }
    }

    pub fn variant<'a>(
        &self,
        stream_infos: &'a [StreamInfo],
    ) -> Result<&'a StreamInfo, DownloadError> {
        if let Some(info) = select_video(stream_infos, self.options.max_height) {
            debug!(
                uri = %info.uri,
                bandwidth = info.bandwidth,
                height = info.height(),
                "Selected variant"
            );
            return Ok(info);
        }
        if self.options.max_height.is_some() && select_video(stream_infos, None).is_some() {
            self.cap_missed("variant")?;
        }
        select_video(stream_infos, None)
            .ok_or_else(|| DownloadError::no_rendition("master playlist has no video variant"))
    }

    pub fn dash_video<'a>(
        &self,
        periods: &'a [Period],
    ) -> Result<&'a Representation, DownloadError> {
        if let Some(rep) = select_video_from_dash(periods, self.options.max_height) {
            debug!(
                id = %rep.id,
                bandwidth = rep.bandwidth,
                height = ?rep.height,
                "Selected video representation"
            );
            return Ok(rep);
        }
        if self.options.max_height.is_some() && select_video_from_dash(periods, None).is_some() {
            self.cap_missed("video representation")?;
        }
        select_video_from_dash(periods, None)
            .ok_or_else(|| DownloadError::no_rendition("MPD has no video representation"))
    }

    /// `Ok(None)` when the MPD carries no audio at all.
    pub fn dash_audio<'a>(
        &self,
        periods: &'a [Period],
    ) -> Result<Option<&'a Representation>, DownloadError> {
        let lang = self.options.audio_language.as_deref();
        if let Some(rep) = select_audio_from_dash(periods, lang) {
            return Ok(Some(rep));
        }
        let any = select_audio_from_dash(periods, None);
        match (lang, any) {
            (Some(lang), Some(rep)) if self.options.fallback_to_best => {
                warn!(lang, chosen = %rep.id, "No audio in the requested language");
                Ok(Some(rep))
            }
            (Some(lang), Some(_)) => Err(DownloadError::no_rendition(format!(
                "no audio representation in language `{lang}`"
            ))),
            _ => Ok(any),
        }
    }

    /// Alternative audio for `variant`, if its `AUDIO` group has one.
    pub fn hls_audio<'a>(
        &self,
        media_groups: &'a [MediaGroup],
        variant: &StreamInfo,
    ) -> Result<Option<&'a MediaGroup>, DownloadError> {
        if variant.audio_group_ref.is_empty() {
            return Ok(None);
        }
        let lang = self.options.audio_language.as_deref();
        if let Some(group) = select_hls_audio(media_groups, &variant.audio_group_ref, lang) {
            return Ok(Some(group));
        }
        let any = select_hls_audio(media_groups, &variant.audio_group_ref, None);
        match (lang, any) {
            (Some(lang), Some(_)) if !self.options.fallback_to_best => Err(
                DownloadError::no_rendition(format!("no audio rendition in language `{lang}`")),
            ),
            _ => Ok(any),
        }
    }
}
