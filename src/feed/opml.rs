use std::io::Cursor;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

use crate::util::HostPolicy;

/// SEC-003: Maximum nesting depth for outline elements.
const MAX_OPML_DEPTH: usize = 50;

/// Non-standard outline attribute carrying a channel's update schedule.
const SCHEDULE_ATTR: &str = "feedlineSchedule";

#[derive(Debug, Error)]
pub enum OpmlError {
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to write OPML: {0}")]
    Write(String),

    #[error("OPML file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One subscription in an OPML document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlChannel {
    /// From `title`, else `text`, else the URL itself.
    pub title: String,
    pub xml_url: String,
    /// Seconds-of-day update times, `/`-delimited.
    pub schedule: Option<String>,
}

/// Extracts every `<outline>` with an `xmlUrl`, at any depth.
///
/// URLs with non-HTTP schemes, or hosts that `hosts` refuses, are skipped
/// with a warning.
pub fn parse_opml(content: &str, hosts: HostPolicy) -> Result<Vec<OpmlChannel>, OpmlError> {
    // SEC-002: quick-xml 0.37 never expands <!ENTITY> declarations; unknown
    // entity references fail in decode_and_unescape_value.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut channels = Vec::new();
    let mut depth: usize = 0;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                depth += 1;
                if depth > MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH));
                }
                if let Some(channel) = outline_channel(&e, &reader, hosts)? {
                    channels.push(channel);
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Some(channel) = outline_channel(&e, &reader, hosts)? {
                    channels.push(channel);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string())),
            _ => {}
        }
    }

    Ok(channels)
}

fn outline_channel(
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
    hosts: HostPolicy,
) -> Result<Option<OpmlChannel>, OpmlError> {
    let mut xml_url = None;
    let mut title = None;
    let mut text = None;
    let mut schedule = None;

    for attr in e.attributes() {
        let attr = match attr {
            Ok(attr) => attr,
            Err(err) => {
                tracing::warn!(error = %err, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let value = attr
            .decode_and_unescape_value(reader.decoder())
            .map_err(|err| OpmlError::XmlParse(err.to_string()))?
            .into_owned();
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(value),
            b"title" => title = Some(value),
            b"text" => text = Some(value),
            key if key == SCHEDULE_ATTR.as_bytes() => schedule = Some(value),
            _ => {}
        }
    }

    let Some(url) = xml_url else {
        return Ok(None);
    };
    if let Err(err) = hosts.parse(&url) {
        tracing::warn!(url = %url, error = %err, "Skipping invalid feed URL");
        return Ok(None);
    }
    let title = title
        .filter(|t| !t.is_empty())
        .or(text.filter(|t| !t.is_empty()))
        .unwrap_or_else(|| url.clone());
    Ok(Some(OpmlChannel {
        title,
        xml_url: url,
        schedule: schedule.filter(|s| !s.is_empty()),
    }))
}

fn write_event(writer: &mut Writer<Cursor<Vec<u8>>>, event: Event<'_>) -> Result<(), OpmlError> {
    writer
        .write_event(event)
        .map_err(|e| OpmlError::Write(e.to_string()))
}

/// Renders subscriptions as an OPML 2.0 document.
pub fn export_opml(channels: &[OpmlChannel]) -> Result<String, OpmlError> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    write_event(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)),
    )?;
    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "2.0"));
    write_event(&mut writer, Event::Start(opml))?;

    write_event(&mut writer, Event::Start(BytesStart::new("head")))?;
    write_event(&mut writer, Event::Start(BytesStart::new("title")))?;
    write_event(&mut writer, Event::Text(BytesText::new("feedline subscriptions")))?;
    write_event(&mut writer, Event::End(BytesEnd::new("title")))?;
    write_event(&mut writer, Event::End(BytesEnd::new("head")))?;

    write_event(&mut writer, Event::Start(BytesStart::new("body")))?;
    for channel in channels {
        let mut outline = BytesStart::new("outline");
        outline.push_attribute(("type", "rss"));
        outline.push_attribute(("text", channel.title.as_str()));
        outline.push_attribute(("title", channel.title.as_str()));
        outline.push_attribute(("xmlUrl", channel.xml_url.as_str()));
        if let Some(schedule) = &channel.schedule {
            outline.push_attribute((SCHEDULE_ATTR, schedule.as_str()));
        }
        write_event(&mut writer, Event::Empty(outline))?;
    }
    write_event(&mut writer, Event::End(BytesEnd::new("body")))?;
    write_event(&mut writer, Event::End(BytesEnd::new("opml")))?;

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| OpmlError::Write(e.to_string()))
}

pub async fn read_file(path: &Path, hosts: HostPolicy) -> Result<Vec<OpmlChannel>, OpmlError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_opml(&content, hosts)
}

/// Writes the document next to `path` and renames it into place, so a
/// crash never leaves a truncated export behind.
pub async fn write_file(channels: &[OpmlChannel], path: &Path) -> Result<(), OpmlError> {
    let content = export_opml(channels)?;
    let temp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    if let Err(e) = tokio::fs::write(&temp_path, content.as_bytes()).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}
