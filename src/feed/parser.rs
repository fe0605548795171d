//! Feed parsing engine.
//!
//! Turns an RSS 2.0 or Atom document into a [`FeedParseResult`]. The work is
//! split between a default parser for the dialect and optional namespace
//! parsers (see [`super::namespace`]); every element is offered to the
//! installed parsers in priority order until one handles it.
//!
//! Parsing is tolerant: items that fail validation are dropped, not reported,
//! because one broken item must not cost the user the rest of the channel.
use tokio_util::sync::CancellationToken;

use super::atom::AtomParser;
use super::dom::{parse_document, Element};
use super::model::{ChannelValues, FeedParseResult, FeedType, ItemValues, ParsedItem};
use super::namespace::{
    DcParser, ItunesParser, MediaParser, NamespaceParser, ParseContext, DC_URI, ITUNES_URI,
    MEDIA_URI, YOUTUBE_URI,
};
use super::policy;
use super::rss::RssParser;
use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Rss,
    Atom,
}

impl Dialect {
    fn item_element(self) -> &'static str {
        match self {
            Dialect::Rss => "item",
            Dialect::Atom => "entry",
        }
    }
}

/// Parses a feed document.
///
/// # Errors
///
/// - [`ErrorCode::UnsupportedFormat`] when the root is neither `rss` nor
///   `feed`, or the XML is malformed
/// - [`ErrorCode::Interrupted`] when `cancel` fires during parsing
/// - [`ErrorCode::Unknown`] when text cannot be decoded
pub fn parse_feed(
    bytes: &[u8],
    cancel: Option<&CancellationToken>,
) -> Result<FeedParseResult, ErrorCode> {
    let root = parse_document(bytes)?;
    let cx = ParseContext::new(cancel);
    cx.check_interrupted()?;

    let dialect = match root.local_name() {
        "rss" => Dialect::Rss,
        "feed" => Dialect::Atom,
        other => {
            tracing::debug!(root = %other, "Unsupported feed root element");
            return Err(ErrorCode::UnsupportedFormat);
        }
    };

    let (parsers, feed_type) = namespace_parsers(&root, dialect);

    let channel_el = match dialect {
        Dialect::Rss => root.child("channel").ok_or(ErrorCode::UnsupportedFormat)?,
        Dialect::Atom => &root,
    };

    let mut cv = ChannelValues {
        feed_type,
        ..ChannelValues::default()
    };
    let mut items = Vec::new();
    let mut dropped = 0usize;

    for el in channel_el.elements() {
        if el.name == dialect.item_element() {
            match parse_item(&cx, &parsers, el)? {
                Some(item) => items.push(item),
                None => dropped += 1,
            }
            continue;
        }
        offer(&parsers, |p| p.parse_channel(&cx, &mut cv, el))?;
    }

    if dropped > 0 {
        tracing::debug!(dropped, kept = items.len(), "Dropped invalid feed items");
    }

    Ok(FeedParseResult {
        channel: cv.into_channel(),
        items,
    })
}

/// Offers an element to each parser in order until one handles it.
fn offer<F>(parsers: &[Box<dyn NamespaceParser>], mut f: F) -> Result<(), ErrorCode>
where
    F: FnMut(&dyn NamespaceParser) -> Result<bool, ErrorCode>,
{
    for p in parsers {
        if f(p.as_ref())? {
            break;
        }
    }
    Ok(())
}

fn parse_item(
    cx: &ParseContext<'_>,
    parsers: &[Box<dyn NamespaceParser>],
    item_el: &Element,
) -> Result<Option<ParsedItem>, ErrorCode> {
    let mut iv = ItemValues::default();
    for el in item_el.elements() {
        offer(parsers, |p| p.parse_item(cx, &mut iv, el))?;
    }

    let item = iv.to_item();
    if policy::verify_item(&item) {
        return Ok(Some(item));
    }
    if iv.repair_from_guid() {
        let repaired = iv.to_item();
        if policy::verify_item(&repaired) {
            tracing::trace!(guid = %repaired.guid, "Repaired feed item from guid");
            return Ok(Some(repaired));
        }
    }
    Ok(None)
}

/// Builds the parser chain for a document, default parser first.
///
/// A declared YouTube namespace switches the media parser to its YouTube
/// priorities and marks the channel as embedded media.
fn namespace_parsers(
    root: &Element,
    dialect: Dialect,
) -> (Vec<Box<dyn NamespaceParser>>, FeedType) {
    let mut itunes = None;
    let mut dc = None;
    let mut media = None;
    let mut youtube = false;

    for (key, value) in &root.attrs {
        let Some(prefix) = key.strip_prefix("xmlns:") else {
            continue;
        };
        let value = value.trim();
        if prefix == "itunes" || value == ITUNES_URI {
            itunes = Some(prefix.to_string());
        } else if prefix == "dc" || value == DC_URI {
            dc = Some(prefix.to_string());
        } else if prefix == "media" || value == MEDIA_URI {
            media = Some(prefix.to_string());
        } else if prefix == "yt" || value == YOUTUBE_URI {
            youtube = true;
        }
    }

    let mut parsers: Vec<Box<dyn NamespaceParser>> = Vec::with_capacity(4);
    match dialect {
        Dialect::Rss => parsers.push(Box::new(RssParser)),
        Dialect::Atom => parsers.push(Box::new(AtomParser)),
    }
    if let Some(prefix) = media {
        parsers.push(Box::new(MediaParser::new(prefix, youtube)));
    }
    if let Some(prefix) = itunes {
        parsers.push(Box::new(ItunesParser::new(prefix)));
    }
    if let Some(prefix) = dc {
        parsers.push(Box::new(DcParser::new(prefix)));
    }
    let feed_type = if youtube {
        FeedType::EmbeddedMedia
    } else {
        FeedType::Normal
    };
    (parsers, feed_type)
}
