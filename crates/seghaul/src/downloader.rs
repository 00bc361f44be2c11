//! End-to-end download: manifest in, media file out.
//!
//! [`MediaDownloader`] is the composition root of the engine. It fetches and
//! parses the manifest, selects renditions, resolves their segments, runs one
//! [`SegmentScheduler`] job per track, and hands the results to the
//! [`Assembler`]. Everything that can fail without downloading segments
//! (parsing, selection, encryption support, output collisions, encoder
//! lookup) fails before the first segment request.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::assembler::Assembler;
use crate::client::{ClientPool, HttpHelper, ReqwestHelper, header_map};
use crate::config::{DownloadOptions, OutputFormat};
use crate::decryption::{KeyFetcher, KeySource, SegmentDecryptor};
use crate::encoder::{Encoder, FfmpegEncoder};
use crate::error::DownloadError;
use crate::fetcher::{HttpSegmentSource, SegmentSource};
use crate::manifest::{Manifest, MediaPlaylist, Period, Representation, parse_media};
use crate::progress::ProgressEvent;
use crate::scheduler::{SchedulerConfig, SegmentScheduler};
use crate::segment::{ResolvedSegment, resolve_dash, resolve_hls};
use crate::select::{RenditionSelector, select_video_from_dash};

/// Where the manifest comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadInput {
    Url(Url),
    /// Manifest text; relative references resolve against `base_url`.
    Text { text: String, base_url: Url },
}

impl DownloadInput {
    pub fn parse_url(input: &str) -> Result<Self, DownloadError> {
        Url::parse(input)
            .map(Self::Url)
            .map_err(|e| DownloadError::invalid_url(input, e.to_string()))
    }

    pub fn base_url(&self) -> &Url {
        match self {
            Self::Url(url) => url,
            Self::Text { base_url, .. } => base_url,
        }
    }
}

/// One track to download: a label and its segments in order.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackPlan {
    pub name: String,
    pub segments: Vec<ResolvedSegment>,
}

/// Everything decided before the first segment request.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadPlan {
    pub tracks: Vec<TrackPlan>,
    pub format: OutputFormat,
    pub output: PathBuf,
    pub work_dir: PathBuf,
}

pub struct MediaDownloader {
    clients: Arc<ClientPool>,
    http_helper: Option<Arc<dyn HttpHelper>>,
    segment_source: Option<Arc<dyn SegmentSource>>,
    key_source: Option<Arc<dyn KeySource>>,
    encoder: Option<Arc<dyn Encoder>>,
}

impl MediaDownloader {
    pub fn new(clients: Arc<ClientPool>) -> Self {
        Self {
            clients,
            http_helper: None,
            segment_source: None,
            key_source: None,
            encoder: None,
        }
    }

    /// Replace the manifest fetcher.
    pub fn with_http_helper(mut self, helper: Arc<dyn HttpHelper>) -> Self {
        self.http_helper = Some(helper);
        self
    }

    pub fn with_segment_source(mut self, source: Arc<dyn SegmentSource>) -> Self {
        self.segment_source = Some(source);
        self
    }

    pub fn with_key_source(mut self, source: Arc<dyn KeySource>) -> Self {
        self.key_source = Some(source);
        self
    }

    /// Skip the encoder search.
    pub fn with_encoder(mut self, encoder: Arc<dyn Encoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Download `input` and return the path of the assembled file.
    pub async fn download(
        &self,
        input: &DownloadInput,
        options: &DownloadOptions,
        progress: Option<mpsc::Sender<ProgressEvent>>,
        token: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        options.validate()?;
        let client = self.clients.client(&options.http_client_name)?;
        let headers = header_map(&options.headers)?;
        let helper: Arc<dyn HttpHelper> = match &self.http_helper {
            Some(helper) => helper.clone(),
            None => Arc::new(ReqwestHelper::new(
                client.clone(),
                headers.clone(),
                options.request_timeout(),
            )),
        };

        let plan = self.plan(input, options, helper.as_ref(), token).await?;
        let encoder = match &self.encoder {
            Some(encoder) => encoder.clone(),
            None => Arc::new(FfmpegEncoder::locate(options.encoder_path.as_deref())?),
        };

        let source: Arc<dyn SegmentSource> = match &self.segment_source {
            Some(source) => source.clone(),
            None => Arc::new(HttpSegmentSource::new(
                client.clone(),
                headers.clone(),
                options.request_timeout(),
            )),
        };
        let key_source: Arc<dyn KeySource> = match &self.key_source {
            Some(source) => source.clone(),
            None => Arc::new(KeyFetcher::new(
                client,
                headers,
                options.request_timeout(),
                options.retry_policy(),
            )),
        };
        let scheduler = SegmentScheduler::new(
            source,
            Arc::new(SegmentDecryptor::new(key_source)),
            SchedulerConfig::from(options),
        );

        let result = self
            .execute(&plan, &scheduler, encoder, progress, token)
            .await;
        self.cleanup(&plan, options, &result).await;
        result
    }

    /// Fetch, parse, select and resolve without downloading segments.
    pub async fn plan(
        &self,
        input: &DownloadInput,
        options: &DownloadOptions,
        helper: &dyn HttpHelper,
        token: &CancellationToken,
    ) -> Result<DownloadPlan, DownloadError> {
        let base = input.base_url().clone();
        let text = match input {
            DownloadInput::Url(url) => helper.get_text(url, token).await?,
            DownloadInput::Text { text, .. } => text.clone(),
        };
        let manifest = Manifest::parse(&text, &base)?;
        debug!(kind = ?manifest.kind(), url = %base, "Manifest parsed");

        let selector = RenditionSelector::new(options.selection());
        let tracks = match manifest {
            Manifest::Media(playlist) => vec![TrackPlan {
                name: "video".to_string(),
                segments: resolve_media(&playlist, &base)?,
            }],
            Manifest::Master(master) => {
                let variant = selector.variant(&master.stream_infos)?;
                let variant_url = join(&base, &variant.uri)?;
                let audio = selector.hls_audio(&master.media_groups, variant)?;

                let mut tracks = vec![TrackPlan {
                    name: "video".to_string(),
                    segments: fetch_media(helper, &variant_url, token).await?,
                }];
                if let Some(group) = audio {
                    info!(
                        group = %group.group_id,
                        name = %group.name,
                        lang = %group.language,
                        "Selected audio rendition"
                    );
                    let audio_url = join(&base, &group.uri)?;
                    tracks.push(TrackPlan {
                        name: "audio".to_string(),
                        segments: fetch_media(helper, &audio_url, token).await?,
                    });
                }
                tracks
            }
            Manifest::Dash(periods) => dash_tracks(&periods, &selector)?,
        };

        if tracks.iter().all(|track| track.segments.is_empty()) {
            return Err(DownloadError::no_rendition("selected renditions have no segments"));
        }

        let format = if tracks.len() > 1 {
            options.prefer_mux_output_format
        } else {
            options.prefer_output_format
        };
        let name = options
            .output_name
            .clone()
            .unwrap_or_else(|| output_stem(&base));
        let output = options
            .output_dir
            .join(format!("{name}.{}", format.extension()));
        if !options.overwrite && tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(DownloadError::OutputExists { path: output });
        }
        let work_dir = options.work_root().join(format!("{name}.segments"));

        Ok(DownloadPlan {
            tracks,
            format,
            output,
            work_dir,
        })
    }

    async fn execute(
        &self,
        plan: &DownloadPlan,
        scheduler: &SegmentScheduler,
        encoder: Arc<dyn Encoder>,
        progress: Option<mpsc::Sender<ProgressEvent>>,
        token: &CancellationToken,
    ) -> Result<PathBuf, DownloadError> {
        let mut downloaded = Vec::with_capacity(plan.tracks.len());
        for track in &plan.tracks {
            let paths = scheduler
                .download(
                    &track.name,
                    track.segments.clone(),
                    &plan.work_dir.join(&track.name),
                    progress.clone(),
                    token,
                )
                .await?;
            downloaded.push((track.name.clone(), paths));
        }

        if let Some(parent) = plan.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Assembler::new(encoder)
            .mux(&downloaded, plan.format, &plan.output, &plan.work_dir, token)
            .await
    }

    async fn cleanup(
        &self,
        plan: &DownloadPlan,
        options: &DownloadOptions,
        result: &Result<PathBuf, DownloadError>,
    ) {
        let remove = match result {
            Ok(_) => !options.keep_segments,
            Err(DownloadError::Cancelled) => false,
            Err(_) => options.cleanup_on_failure,
        };
        if remove {
            remove_work_dir(&plan.work_dir).await;
        }
    }
}

async fn remove_work_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed scratch segments"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove scratch segments"),
    }
}

fn join(base: &Url, reference: &str) -> Result<Url, DownloadError> {
    base.join(reference)
        .map_err(|e| DownloadError::invalid_url(reference, e.to_string()))
}

fn resolve_media(
    playlist: &MediaPlaylist,
    base: &Url,
) -> Result<Vec<ResolvedSegment>, DownloadError> {
    if playlist.is_live() {
        warn!(
            url = %base,
            segments = playlist.segment_count(),
            "Playlist has no ENDLIST; downloading the segments known now"
        );
    }
    resolve_hls(playlist, base)
}

async fn fetch_media(
    helper: &dyn HttpHelper,
    url: &Url,
    token: &CancellationToken,
) -> Result<Vec<ResolvedSegment>, DownloadError> {
    let text = helper.get_text(url, token).await?;
    let playlist = parse_media(&text, url)?;
    resolve_media(&playlist, url)
}

/// Per period, the representation with the chosen id. A period without it
/// goes through `fallback`, which applies the same selection rules to that
/// period alone; periods where `fallback` finds nothing are skipped.
fn per_period<'a>(
    periods: &'a [Period],
    chosen: &Representation,
    mut fallback: impl FnMut(&'a [Period]) -> Result<Option<&'a Representation>, DownloadError>,
) -> Result<Vec<&'a Representation>, DownloadError> {
    let mut reps = Vec::with_capacity(periods.len());
    for period in periods {
        let same_id = period
            .representations()
            .map(|(_, rep)| rep)
            .find(|rep| rep.id == chosen.id);
        let rep = match same_id {
            Some(rep) => Some(rep),
            None => fallback(std::slice::from_ref(period))?,
        };
        if let Some(rep) = rep {
            if rep.id != chosen.id {
                debug!(period = %period.id, id = %rep.id, "Period lacks the chosen representation");
            }
            reps.push(rep);
        }
    }
    Ok(reps)
}

fn dash_tracks(
    periods: &[Period],
    selector: &RenditionSelector,
) -> Result<Vec<TrackPlan>, DownloadError> {
    let video = selector.dash_video(periods)?;
    let video_reps = per_period(periods, video, |period| {
        if select_video_from_dash(period, None).is_none() {
            return Ok(None);
        }
        selector.dash_video(period).map(Some)
    })?;
    info!(
        id = %video.id,
        bandwidth = video.bandwidth,
        periods = video_reps.len(),
        "Selected DASH video"
    );

    let mut tracks = vec![TrackPlan {
        name: "video".to_string(),
        segments: resolve_dash(&video_reps)?,
    }];

    if let Some(audio) = selector.dash_audio(periods)? {
        let audio_reps = per_period(periods, audio, |period| selector.dash_audio(period))?;
        info!(id = %audio.id, bandwidth = audio.bandwidth, "Selected DASH audio");
        tracks.push(TrackPlan {
            name: "audio".to_string(),
            segments: resolve_dash(&audio_reps)?,
        });
    }
    Ok(tracks)
}

/// File stem derived from the manifest URL: its last path segment without
/// extension, or `output`.
fn output_stem(url: &Url) -> String {
    let stem = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(|last| last.rsplit_once('.').map_or(last, |(stem, _)| stem))
        .unwrap_or_default();
    let cleaned: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "output".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Serves manifests from memory.
    struct Pages(HashMap<String, String>);

    #[async_trait]
    impl HttpHelper for Pages {
        async fn get_text(
            &self,
            url: &Url,
            _token: &CancellationToken,
        ) -> Result<String, DownloadError> {
            self.0.get(url.as_str()).cloned().ok_or_else(|| {
                DownloadError::http_status(
                    reqwest::StatusCode::NOT_FOUND,
                    url.as_str(),
                    "fetch text",
                )
            })
        }
    }

    const MASTER: &str = "#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"English\",LANGUAGE=\"en\",DEFAULT=YES,URI=\"audio/en.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720,AUDIO=\"aud\"
720/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=854x480,AUDIO=\"aud\"
480/index.m3u8
";

    fn media(prefix: &str) -> String {
        format!(
            "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4,\n{prefix}0.ts\n#EXTINF:4,\n{prefix}1.ts\n#EXT-X-ENDLIST\n"
        )
    }

    fn pages() -> Pages {
        let mut map = HashMap::new();
        map.insert("https://cdn.example.com/show/master.m3u8".to_string(), MASTER.to_string());
        map.insert("https://cdn.example.com/show/720/index.m3u8".to_string(), media("v"));
        map.insert("https://cdn.example.com/show/480/index.m3u8".to_string(), media("low"));
        map.insert("https://cdn.example.com/show/audio/en.m3u8".to_string(), media("a"));
        Pages(map)
    }

    fn options(dir: &Path) -> DownloadOptions {
        DownloadOptions {
            output_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn master_plan_has_video_and_audio_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = MediaDownloader::new(Arc::new(ClientPool::default()));
        let input = DownloadInput::parse_url("https://cdn.example.com/show/master.m3u8").unwrap();
        let plan = downloader
            .plan(&input, &options(dir.path()), &pages(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(plan.tracks.len(), 2);
        assert_eq!(
            plan.tracks[0].segments[0].url.as_str(),
            "https://cdn.example.com/show/720/v0.ts"
        );
        assert_eq!(
            plan.tracks[1].segments[1].url.as_str(),
            "https://cdn.example.com/show/audio/a1.ts"
        );
        assert_eq!(plan.format, OutputFormat::Mp4);
        assert_eq!(plan.output, dir.path().join("master.mp4"));
        assert_eq!(plan.work_dir, dir.path().join("master.segments"));
    }

    #[tokio::test]
    async fn height_cap_selects_lower_variant() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = MediaDownloader::new(Arc::new(ClientPool::default()));
        let input = DownloadInput::parse_url("https://cdn.example.com/show/master.m3u8").unwrap();
        let options = DownloadOptions {
            max_height: Some(600),
            ..options(dir.path())
        };
        let plan = downloader
            .plan(&input, &options, &pages(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(plan.tracks[0].segments[0].url.as_str().ends_with("/480/low0.ts"));
    }

    #[tokio::test]
    async fn existing_output_is_refused_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.ts"), b"old").unwrap();
        let downloader = MediaDownloader::new(Arc::new(ClientPool::default()));
        let input = DownloadInput::Text {
            text: media("s"),
            base_url: Url::parse("https://cdn.example.com/x/playlist.m3u8").unwrap(),
        };
        let mut options = DownloadOptions {
            output_name: Some("clip".into()),
            prefer_output_format: OutputFormat::Ts,
            ..options(dir.path())
        };
        let err = downloader
            .plan(&input, &options, &pages(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::OutputExists { .. }));

        options.overwrite = true;
        let plan = downloader
            .plan(&input, &options, &pages(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(plan.tracks.len(), 1);
        assert_eq!(plan.output, dir.path().join("clip.ts"));
    }

    #[tokio::test]
    async fn malformed_manifest_fails_before_downloading() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = MediaDownloader::new(Arc::new(ClientPool::default()));
        let input = DownloadInput::Text {
            text: "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:abc\n#EXTINF:4,\na.ts\n".into(),
            base_url: Url::parse("https://cdn.example.com/a.m3u8").unwrap(),
        };
        let err = downloader
            .plan(&input, &options(dir.path()), &pages(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Parse(_)));
    }

    fn two_period_mpd(second: &str) -> Vec<Period> {
        let text = format!(
            r#"<MPD mediaPresentationDuration="PT8S">
  <Period id="p0" duration="PT4S">
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate media="$RepresentationID$/$Number$.m4s" duration="4"/>
      <Representation id="sd" bandwidth="1000000" height="480"/>
    </AdaptationSet>
  </Period>
  <Period id="p1" duration="PT4S">
    <AdaptationSet mimeType="video/mp4">
      <SegmentTemplate media="$RepresentationID$/$Number$.m4s" duration="4"/>
      {second}
    </AdaptationSet>
  </Period>
</MPD>"#
        );
        let url = Url::parse("https://cdn.example.com/dash/manifest.mpd").unwrap();
        crate::manifest::parse_mpd(&text, &url).unwrap()
    }

    fn capped(max_height: u32, fallback_to_best: bool) -> RenditionSelector {
        RenditionSelector::new(crate::config::SelectionOptions {
            max_height: Some(max_height),
            fallback_to_best,
            ..Default::default()
        })
    }

    fn urls(tracks: &[TrackPlan]) -> Vec<&str> {
        tracks[0].segments.iter().map(|s| s.url.path()).collect()
    }

    #[test]
    fn later_period_respects_the_height_cap() {
        let periods = two_period_mpd(
            r#"<Representation id="fhd" bandwidth="5000000" height="1080"/>
      <Representation id="hd" bandwidth="2500000" height="720"/>"#,
        );
        let tracks = dash_tracks(&periods, &capped(720, false)).unwrap();
        assert_eq!(urls(&tracks), ["/dash/sd/1.m4s", "/dash/hd/1.m4s"]);
    }

    #[test]
    fn later_period_over_the_cap_needs_the_fallback_opt_in() {
        let periods =
            two_period_mpd(r#"<Representation id="fhd" bandwidth="5000000" height="1080"/>"#);
        let err = dash_tracks(&periods, &capped(720, false)).unwrap_err();
        assert!(matches!(err, DownloadError::NoMatchingRendition { .. }));

        let tracks = dash_tracks(&periods, &capped(720, true)).unwrap();
        assert_eq!(urls(&tracks), ["/dash/sd/1.m4s", "/dash/fhd/1.m4s"]);
    }

    #[test]
    fn output_stem_comes_from_the_url() {
        let url = Url::parse("https://a.example/path/My Show.m3u8?token=1").unwrap();
        assert_eq!(output_stem(&url), "My_20Show");
        let url = Url::parse("https://a.example/").unwrap();
        assert_eq!(output_stem(&url), "output");
    }

    #[test]
    fn invalid_input_url_is_reported() {
        assert!(matches!(
            DownloadInput::parse_url("not a url"),
            Err(DownloadError::InvalidUrl { .. })
        ));
    }
}
