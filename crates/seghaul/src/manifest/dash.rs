//! DASH MPD parsing.
//!
//! The document is read into a small element tree with quick-xml and then
//! walked top-down, carrying the `BaseURL` chain and the inherited segment
//! addressing (`SegmentTemplate`, `SegmentList`) from Period to
//! AdaptationSet to Representation. Every representation comes out with a
//! fully expanded list of absolute segment URLs.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, trace};
use url::Url;

use super::ByteRange;
use crate::error::{Location, ParseError};

/// Upper bound on segments generated for one representation.
const MAX_SEGMENTS: u64 = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub id: String,
    /// Seconds, when declared or derivable from the MPD.
    pub duration: Option<f64>,
    pub base_url: String,
    pub adaptation_sets: Vec<AdaptationSet>,
}

impl Period {
    /// Every representation together with the adaptation set that owns it.
    pub fn representations(&self) -> impl Iterator<Item = (&AdaptationSet, &Representation)> {
        self.adaptation_sets
            .iter()
            .flat_map(|set| set.representations.iter().map(move |rep| (set, rep)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationSet {
    pub id: String,
    pub mime_type: String,
    pub content_type: String,
    pub lang: String,
    pub codecs: String,
    pub representations: Vec<Representation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: String,
    /// As declared on the representation itself; may be empty.
    pub mime_type: String,
    pub content_type: String,
    pub codecs: String,
    pub bandwidth: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub base_url: String,
    pub init: Option<DashSegment>,
    pub segments: Vec<DashSegment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DashSegment {
    pub number: u64,
    /// Absolute URL.
    pub url: String,
    pub byte_range: Option<ByteRange>,
    /// Seconds.
    pub duration: f64,
}

#[derive(Debug, Clone, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
    text: String,
}

impl Element {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn error(&self, reason: impl Into<String>) -> ParseError {
        ParseError::at_element(reason, self.name.clone())
    }

    fn attr_u64(&self, name: &str) -> Result<Option<u64>, ParseError> {
        self.attr(name)
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|_| self.error(format!("attribute {name} is not an integer: `{v}`")))
            })
            .transpose()
    }

    fn attr_i64(&self, name: &str) -> Result<Option<i64>, ParseError> {
        self.attr(name)
            .map(|v| {
                v.trim()
                    .parse::<i64>()
                    .map_err(|_| self.error(format!("attribute {name} is not an integer: `{v}`")))
            })
            .transpose()
    }

    fn attr_u32(&self, name: &str) -> Result<Option<u32>, ParseError> {
        self.attr(name)
            .map(|v| {
                v.trim()
                    .parse::<u32>()
                    .map_err(|_| self.error(format!("attribute {name} is not an integer: `{v}`")))
            })
            .transpose()
    }

    fn attr_duration(&self, name: &str) -> Result<Option<f64>, ParseError> {
        self.attr(name)
            .map(|v| parse_iso8601_duration(v).map_err(|reason| self.error(reason)))
            .transpose()
    }

    fn attr_range(&self, name: &str) -> Result<Option<ByteRange>, ParseError> {
        self.attr(name)
            .map(|v| parse_range(v).map_err(|reason| self.error(reason)))
            .transpose()
    }

    fn text_or_default(&self, name: &str) -> String {
        self.attr(name).unwrap_or_default().to_string()
    }
}

fn xml_error(reader: &Reader<&[u8]>, reason: impl std::fmt::Display) -> ParseError {
    ParseError::new(
        format!("malformed XML: {reason}"),
        Location::Offset(reader.buffer_position() as u64),
    )
}

fn element_from(start: &BytesStart<'_>) -> Result<Element, ParseError> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| {
            ParseError::at_element(format!("malformed attribute: {e}"), name.clone())
        })?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| ParseError::at_element(format!("bad value for {key}: {e}"), name.clone()))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(Element {
        name,
        attributes,
        ..Default::default()
    })
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), ParseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(ParseError::at_element(
                "document has more than one root element",
                element.name,
            ));
        }
    }
    Ok(())
}

fn read_tree(text: &str) -> Result<Element, ParseError> {
    let mut reader = Reader::from_str(text.trim_start_matches('\u{feff}'));
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;

    loop {
        let event = reader.read_event().map_err(|e| xml_error(&reader, e))?;
        match event {
            Event::Start(start) => stack.push(element_from(&start)?),
            Event::Empty(start) => {
                let element = element_from(&start)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| xml_error(&reader, "unbalanced closing tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    let value = text.unescape().map_err(|e| xml_error(&reader, e))?;
                    top.text.push_str(&value);
                }
            }
            Event::CData(data) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(open) = stack.last() {
        return Err(ParseError::at_element(
            "document ended inside an open element",
            open.name.clone(),
        ));
    }
    root.ok_or_else(|| ParseError::new("document has no root element", Location::Document))
}

/// Whether the first element of an XML document is `<MPD>`.
pub fn root_is_mpd(text: &str) -> bool {
    let mut reader = Reader::from_str(text);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return e.local_name().as_ref() == b"MPD";
            }
            Ok(Event::Eof) | Err(_) => return false,
            Ok(_) => {}
        }
    }
}

/// Parse an ISO-8601 duration such as `PT1H2M3.5S` into seconds.
///
/// Years and months are approximated as 365 and 30 days.
pub fn parse_iso8601_duration(value: &str) -> Result<f64, String> {
    const DAY: f64 = 86_400.0;
    let invalid = || format!("invalid ISO-8601 duration `{value}`");

    let body = value.trim().strip_prefix('P').ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }
    let (date, time) = match body.split_once('T') {
        Some((date, time)) if !time.is_empty() => (date, Some(time)),
        Some(_) => return Err(invalid()),
        None => (body, None),
    };

    let mut seconds = sum_components(
        date,
        &[('Y', 365.0 * DAY), ('M', 30.0 * DAY), ('W', 7.0 * DAY), ('D', DAY)],
    )
    .ok_or_else(invalid)?;
    if let Some(time) = time {
        seconds += sum_components(time, &[('H', 3600.0), ('M', 60.0), ('S', 1.0)])
            .ok_or_else(invalid)?;
    }
    Ok(seconds)
}

fn sum_components(part: &str, units: &[(char, f64)]) -> Option<f64> {
    let mut total = 0.0;
    let mut number = String::new();
    let mut next_unit = 0;
    for c in part.chars() {
        match c {
            '0'..='9' | '.' => number.push(c),
            ',' => number.push('.'),
            _ => {
                let pos = units[next_unit..].iter().position(|(u, _)| *u == c)? + next_unit;
                total += number.parse::<f64>().ok()? * units[pos].1;
                number.clear();
                next_unit = pos + 1;
            }
        }
    }
    number.is_empty().then_some(total)
}

/// `first-last` (inclusive) into a [`ByteRange`].
fn parse_range(value: &str) -> Result<ByteRange, String> {
    let invalid = || format!("invalid byte range `{value}`");
    let (first, last) = value.trim().split_once('-').ok_or_else(invalid)?;
    let first: u64 = first.trim().parse().map_err(|_| invalid())?;
    let last: u64 = last.trim().parse().map_err(|_| invalid())?;
    if last < first {
        return Err(invalid());
    }
    Ok(ByteRange {
        length: last - first + 1,
        offset: first,
    })
}

fn resolve_base(parent: &Url, element: &Element) -> Result<Url, ParseError> {
    match element.child("BaseURL").map(|b| b.text.trim()) {
        Some(base) if !base.is_empty() => parent.join(base).map_err(|e| {
            ParseError::at_element(format!("invalid BaseURL `{base}`: {e}"), "BaseURL")
        }),
        _ => Ok(parent.clone()),
    }
}

fn join(base: &Url, reference: &str, element: &str) -> Result<String, ParseError> {
    base.join(reference).map(String::from).map_err(|e| {
        ParseError::at_element(format!("invalid segment URL `{reference}`: {e}"), element)
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TimelineEntry {
    t: Option<u64>,
    d: u64,
    r: i64,
}

/// `SegmentTemplate` attributes; unset fields fall through to the parent.
#[derive(Debug, Clone, Default)]
struct TemplateSpec {
    media: Option<String>,
    initialization: Option<String>,
    start_number: Option<u64>,
    timescale: Option<u64>,
    duration: Option<u64>,
    presentation_time_offset: Option<u64>,
    timeline: Option<Vec<TimelineEntry>>,
}

impl TemplateSpec {
    fn inherit(&self, element: &Element) -> Result<Self, ParseError> {
        let Some(el) = element.child("SegmentTemplate") else {
            return Ok(self.clone());
        };
        let timeline = match el.child("SegmentTimeline") {
            Some(timeline) => Some(
                timeline
                    .children_named("S")
                    .map(|s| {
                        Ok(TimelineEntry {
                            t: s.attr_u64("t")?,
                            d: s.attr_u64("d")?.ok_or_else(|| s.error("<S> without @d"))?,
                            r: s.attr_i64("r")?.unwrap_or(0),
                        })
                    })
                    .collect::<Result<Vec<_>, ParseError>>()?,
            ),
            None => self.timeline.clone(),
        };
        Ok(Self {
            media: el.attr("media").map(str::to_string).or_else(|| self.media.clone()),
            initialization: el
                .attr("initialization")
                .map(str::to_string)
                .or_else(|| self.initialization.clone()),
            start_number: el.attr_u64("startNumber")?.or(self.start_number),
            timescale: el.attr_u64("timescale")?.or(self.timescale),
            duration: el.attr_u64("duration")?.or(self.duration),
            presentation_time_offset: el
                .attr_u64("presentationTimeOffset")?
                .or(self.presentation_time_offset),
            timeline,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ListEntry {
    media: Option<String>,
    range: Option<ByteRange>,
}

/// `SegmentList` contents; a child list with entries replaces the parent's.
#[derive(Debug, Clone, Default)]
struct ListSpec {
    timescale: Option<u64>,
    duration: Option<u64>,
    start_number: Option<u64>,
    initialization: Option<ListEntry>,
    entries: Vec<ListEntry>,
}

impl ListSpec {
    fn inherit(&self, element: &Element) -> Result<Self, ParseError> {
        let Some(el) = element.child("SegmentList") else {
            return Ok(self.clone());
        };
        let initialization = match el.child("Initialization") {
            Some(init) => Some(ListEntry {
                media: init.attr("sourceURL").map(str::to_string),
                range: init.attr_range("range")?,
            }),
            None => self.initialization.clone(),
        };
        let entries = el
            .children_named("SegmentURL")
            .map(|s| {
                Ok(ListEntry {
                    media: s.attr("media").map(str::to_string),
                    range: s.attr_range("mediaRange")?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;
        Ok(Self {
            timescale: el.attr_u64("timescale")?.or(self.timescale),
            duration: el.attr_u64("duration")?.or(self.duration),
            start_number: el.attr_u64("startNumber")?.or(self.start_number),
            initialization,
            entries: if entries.is_empty() {
                self.entries.clone()
            } else {
                entries
            },
        })
    }
}

/// Values substituted into `$Identifier$` placeholders.
struct TemplateVars<'a> {
    representation_id: &'a str,
    bandwidth: u64,
    number: Option<u64>,
    time: Option<u64>,
}

/// Expand `$RepresentationID$`, `$Number$`, `$Bandwidth$`, `$Time$` (with
/// optional `%0Nd` width) and `$$`.
fn expand_template(template: &str, vars: &TemplateVars<'_>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(start) = rest.find('$') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('$')
            .ok_or_else(|| format!("unterminated identifier in template `{template}`"))?;
        let identifier = &after[..end];
        rest = &after[end + 1..];

        if identifier.is_empty() {
            out.push('$');
            continue;
        }
        let (name, format) = match identifier.find('%') {
            Some(p) => (&identifier[..p], Some(&identifier[p..])),
            None => (identifier, None),
        };
        let missing = || format!("`${name}$` is not available for this template");
        let value = match name {
            "RepresentationID" if format.is_none() => vars.representation_id.to_string(),
            "Number" => format_number(vars.number.ok_or_else(missing)?, format)?,
            "Time" => format_number(vars.time.ok_or_else(missing)?, format)?,
            "Bandwidth" => format_number(vars.bandwidth, format)?,
            _ => return Err(format!("unsupported template identifier `${identifier}$`")),
        };
        out.push_str(&value);
    }
    out.push_str(rest);
    Ok(out)
}

fn format_number(value: u64, format: Option<&str>) -> Result<String, String> {
    let Some(format) = format else {
        return Ok(value.to_string());
    };
    let width = format
        .strip_prefix('%')
        .and_then(|f| f.strip_suffix('d'))
        .ok_or_else(|| format!("unsupported format tag `{format}`"))?;
    let width: usize = if width.is_empty() {
        0
    } else {
        width
            .parse()
            .map_err(|_| format!("unsupported format tag `{format}`"))?
    };
    Ok(format!("{value:0width$}"))
}

struct RepresentationContext<'a> {
    id: &'a str,
    bandwidth: u64,
    base: &'a Url,
    period_duration: Option<f64>,
}

fn template_error(reason: String) -> ParseError {
    ParseError::at_element(reason, "SegmentTemplate")
}

fn expand_segment_template(
    spec: &TemplateSpec,
    media: &str,
    ctx: &RepresentationContext<'_>,
) -> Result<(Option<DashSegment>, Vec<DashSegment>), ParseError> {
    let timescale = spec.timescale.unwrap_or(1).max(1);
    let start_number = spec.start_number.unwrap_or(1);
    let offset = spec.presentation_time_offset.unwrap_or(0);

    let vars = |number: Option<u64>, time: Option<u64>| TemplateVars {
        representation_id: ctx.id,
        bandwidth: ctx.bandwidth,
        number,
        time,
    };

    let init = spec
        .initialization
        .as_deref()
        .map(|init| -> Result<DashSegment, ParseError> {
            let path = expand_template(init, &vars(None, None)).map_err(template_error)?;
            Ok(DashSegment {
                number: 0,
                url: join(ctx.base, &path, "SegmentTemplate")?,
                byte_range: None,
                duration: 0.0,
            })
        })
        .transpose()?;

    let mut segments = Vec::new();
    let mut push = |number: u64, time: u64, ticks: u64| -> Result<(), ParseError> {
        if segments.len() as u64 >= MAX_SEGMENTS {
            return Err(template_error(format!(
                "representation {} expands to more than {MAX_SEGMENTS} segments",
                ctx.id
            )));
        }
        let path =
            expand_template(media, &vars(Some(number), Some(time))).map_err(template_error)?;
        segments.push(DashSegment {
            number,
            url: join(ctx.base, &path, "SegmentTemplate")?,
            byte_range: None,
            duration: ticks as f64 / timescale as f64,
        });
        Ok(())
    };

    if let Some(timeline) = &spec.timeline {
        let period_end = ctx
            .period_duration
            .map(|d| offset + (d * timescale as f64).round() as u64);
        let mut time = offset;
        let mut number = start_number;
        for (i, entry) in timeline.iter().enumerate() {
            if entry.d == 0 {
                return Err(ParseError::at_element("<S> with zero duration", "S"));
            }
            if let Some(t) = entry.t {
                time = t;
            }
            let repeats = if entry.r >= 0 {
                entry.r as u64
            } else {
                let end = timeline
                    .get(i + 1)
                    .and_then(|next| next.t)
                    .or(period_end)
                    .ok_or_else(|| {
                        ParseError::at_element("open-ended @r without a known end time", "S")
                    })?;
                end.saturating_sub(time).div_ceil(entry.d).saturating_sub(1)
            };
            for _ in 0..=repeats {
                push(number, time, entry.d)?;
                time += entry.d;
                number += 1;
            }
        }
    } else if let Some(duration) = spec.duration {
        if duration == 0 {
            return Err(template_error("@duration must be positive".to_string()));
        }
        let total = ctx.period_duration.ok_or_else(|| {
            template_error(format!(
                "cannot count segments of {}: no period or presentation duration",
                ctx.id
            ))
        })?;
        let count = ((total * timescale as f64) / duration as f64).ceil() as u64;
        for k in 0..count {
            push(start_number + k, offset + k * duration, duration)?;
        }
    } else {
        push(start_number, offset, 0)?;
    }

    Ok((init, segments))
}

fn expand_segment_list(
    spec: &ListSpec,
    ctx: &RepresentationContext<'_>,
) -> Result<(Option<DashSegment>, Vec<DashSegment>), ParseError> {
    let timescale = spec.timescale.unwrap_or(1).max(1);
    let seconds = spec.duration.unwrap_or(0) as f64 / timescale as f64;
    let start_number = spec.start_number.unwrap_or(1);
    let base = String::from(ctx.base.clone());

    let resolve = |entry: &ListEntry| -> Result<String, ParseError> {
        match entry.media.as_deref() {
            Some(media) => join(ctx.base, media, "SegmentURL"),
            None => Ok(base.clone()),
        }
    };

    let init = spec
        .initialization
        .as_ref()
        .map(|entry| -> Result<DashSegment, ParseError> {
            Ok(DashSegment {
                number: 0,
                url: resolve(entry)?,
                byte_range: entry.range,
                duration: 0.0,
            })
        })
        .transpose()?;

    let segments = spec
        .entries
        .iter()
        .zip(start_number..)
        .map(|(entry, number)| {
            Ok(DashSegment {
                number,
                url: resolve(entry)?,
                byte_range: entry.range,
                duration: seconds,
            })
        })
        .collect::<Result<Vec<_>, ParseError>>()?;

    Ok((init, segments))
}

/// Parse an MPD document into its periods, with every representation's
/// segments expanded to absolute URLs.
pub fn parse_mpd(text: &str, source_url: &Url) -> Result<Vec<Period>, ParseError> {
    let root = read_tree(text)?;
    if root.name != "MPD" {
        return Err(root.error("root element is not <MPD>"));
    }
    if root.attr("type") == Some("dynamic") {
        debug!("Dynamic MPD: only the currently listed segments are used");
    }

    let mpd_base = resolve_base(source_url, &root)?;
    let presentation_duration = root.attr_duration("mediaPresentationDuration")?;

    let period_elements: Vec<&Element> = root.children_named("Period").collect();
    let starts = period_elements
        .iter()
        .map(|p| p.attr_duration("start"))
        .collect::<Result<Vec<_>, _>>()?;

    let mut periods = Vec::with_capacity(period_elements.len());
    for (i, element) in period_elements.iter().enumerate() {
        let duration = match element.attr_duration("duration")? {
            Some(d) => Some(d),
            None => {
                let start = starts[i].unwrap_or(0.0);
                let end = starts.get(i + 1).copied().flatten().or(presentation_duration);
                end.map(|end| (end - start).max(0.0))
            }
        };
        periods.push(parse_period(element, &mpd_base, duration)?);
    }

    Ok(periods)
}

fn parse_period(
    element: &Element,
    parent_base: &Url,
    duration: Option<f64>,
) -> Result<Period, ParseError> {
    let base = resolve_base(parent_base, element)?;
    let template = TemplateSpec::default().inherit(element)?;
    let list = ListSpec::default().inherit(element)?;

    let adaptation_sets = element
        .children_named("AdaptationSet")
        .map(|set| parse_adaptation_set(set, &base, &template, &list, duration))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Period {
        id: element.text_or_default("id"),
        duration,
        base_url: base.into(),
        adaptation_sets,
    })
}

fn parse_adaptation_set(
    element: &Element,
    parent_base: &Url,
    parent_template: &TemplateSpec,
    parent_list: &ListSpec,
    period_duration: Option<f64>,
) -> Result<AdaptationSet, ParseError> {
    let base = resolve_base(parent_base, element)?;
    let template = parent_template.inherit(element)?;
    let list = parent_list.inherit(element)?;
    let codecs = element.text_or_default("codecs");

    let representations = element
        .children_named("Representation")
        .map(|rep| parse_representation(rep, &base, &template, &list, &codecs, period_duration))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(AdaptationSet {
        id: element.text_or_default("id"),
        mime_type: element.text_or_default("mimeType"),
        content_type: element.text_or_default("contentType"),
        lang: element.text_or_default("lang"),
        codecs,
        representations,
    })
}

fn parse_representation(
    element: &Element,
    parent_base: &Url,
    parent_template: &TemplateSpec,
    parent_list: &ListSpec,
    set_codecs: &str,
    period_duration: Option<f64>,
) -> Result<Representation, ParseError> {
    let id = element.text_or_default("id");
    let bandwidth = element.attr_u64("bandwidth")?.unwrap_or(0);
    let base = resolve_base(parent_base, element)?;
    let template = parent_template.inherit(element)?;
    let list = parent_list.inherit(element)?;

    let ctx = RepresentationContext {
        id: &id,
        bandwidth,
        base: &base,
        period_duration,
    };

    let (init, segments) = if let Some(media) = template.media.as_deref() {
        expand_segment_template(&template, media, &ctx)?
    } else if !list.entries.is_empty() {
        expand_segment_list(&list, &ctx)?
    } else {
        // SegmentBase or a bare BaseURL: the whole resource is one segment.
        trace!(representation = %id, "Single-resource representation");
        let segment = DashSegment {
            number: 1,
            url: base.to_string(),
            byte_range: None,
            duration: period_duration.unwrap_or(0.0),
        };
        (None, vec![segment])
    };

    Ok(Representation {
        mime_type: element.text_or_default("mimeType"),
        content_type: element.text_or_default("contentType"),
        codecs: element
            .attr("codecs")
            .unwrap_or(set_codecs)
            .to_string(),
        bandwidth,
        width: element.attr_u32("width")?,
        height: element.attr_u32("height")?,
        base_url: base.into(),
        init,
        segments,
        id,
    })
}
