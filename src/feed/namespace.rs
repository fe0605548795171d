//! Namespace sub-parsers.
//!
//! Every feed is handled by one default parser ([`super::rss::RssParser`] or
//! [`super::atom::AtomParser`]) plus the optional parsers below, enabled by
//! the namespaces the root element declares. Parsers write through
//! [`NodeValue`](super::node_value::NodeValue) slots, so when several of them
//! describe the same field the highest combined priority wins regardless of
//! element order.
use tokio_util::sync::CancellationToken;

use super::dom::Element;
use super::model::{ChannelValues, ItemValues};
use super::node_value::priority;
use crate::error::ErrorCode;
use crate::util::beautify;

/// Namespace priorities. Higher wins.
pub const NS_DC: u32 = 1;
pub const NS_ITUNES: u32 = 2;
pub const NS_MEDIA: u32 = 3;
pub const NS_DEFAULT: u32 = 4;
/// Media values that outrank the default namespace on YouTube feeds, whose
/// Atom entries carry their real description only in `media:group`.
pub const NS_MEDIA_YOUTUBE: u32 = 5;

pub const ITUNES_URI: &str = "http://www.itunes.com/dtds/podcast-1.0.dtd";
pub const DC_URI: &str = "http://purl.org/dc/elements/1.1/";
pub const MEDIA_URI: &str = "http://search.yahoo.com/mrss/";
pub const YOUTUBE_URI: &str = "http://www.youtube.com/xml/schemas/2015";

/// Per-parse state shared with the sub-parsers.
pub struct ParseContext<'a> {
    cancel: Option<&'a CancellationToken>,
}

impl<'a> ParseContext<'a> {
    pub fn new(cancel: Option<&'a CancellationToken>) -> Self {
        Self { cancel }
    }

    /// Fails with [`ErrorCode::Interrupted`] once cancellation was requested.
    pub fn check_interrupted(&self) -> Result<(), ErrorCode> {
        match self.cancel {
            Some(token) if token.is_cancelled() => Err(ErrorCode::Interrupted),
            _ => Ok(()),
        }
    }

    /// Cleaned text content of `el`.
    ///
    /// Uses the text children, falling back to CDATA children when the text
    /// is missing or blank. The result is beautified and trimmed; an empty
    /// element yields `""`.
    pub fn text(&self, el: &Element) -> Result<String, ErrorCode> {
        self.check_interrupted()?;
        let raw = el.raw_text();
        let raw = if raw.trim().is_empty() {
            el.cdata_text()
        } else {
            raw
        };
        Ok(beautify(&raw))
    }

    /// Cleaned attribute value, or `""`.
    pub fn attr(&self, el: &Element, name: &str) -> String {
        el.attr(name).map(|v| v.trim().to_string()).unwrap_or_default()
    }
}

pub trait NamespaceParser {
    /// Offers a channel-level element. Returns whether it was handled.
    fn parse_channel(
        &self,
        cx: &ParseContext<'_>,
        cv: &mut ChannelValues,
        el: &Element,
    ) -> Result<bool, ErrorCode>;

    /// Offers an element inside an item. Returns whether it was handled.
    fn parse_item(
        &self,
        cx: &ParseContext<'_>,
        iv: &mut ItemValues,
        el: &Element,
    ) -> Result<bool, ErrorCode>;
}

fn has_prefix(el: &Element, prefix: &str) -> bool {
    el.prefix() == Some(prefix)
}

// ============================================================================
// iTunes
// ============================================================================

pub struct ItunesParser {
    prefix: String,
}

impl ItunesParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl NamespaceParser for ItunesParser {
    fn parse_channel(
        &self,
        cx: &ParseContext<'_>,
        cv: &mut ChannelValues,
        el: &Element,
    ) -> Result<bool, ErrorCode> {
        if !has_prefix(el, &self.prefix) {
            return Ok(false);
        }
        match el.local_name() {
            "summary" => cv.description.set(priority(NS_ITUNES, 1), cx.text(el)?),
            "subtitle" => cv.description.set(priority(NS_ITUNES, 0), cx.text(el)?),
            "image" => cv.image_ref.set(priority(NS_ITUNES, 0), cx.attr(el, "href")),
            _ => return Ok(false),
        };
        Ok(true)
    }

    fn parse_item(
        &self,
        cx: &ParseContext<'_>,
        iv: &mut ItemValues,
        el: &Element,
    ) -> Result<bool, ErrorCode> {
        if !has_prefix(el, &self.prefix) {
            return Ok(false);
        }
        match el.local_name() {
            "summary" => iv.description.set(priority(NS_ITUNES, 1), cx.text(el)?),
            "subtitle" => iv.description.set(priority(NS_ITUNES, 0), cx.text(el)?),
            "title" => iv.title.set(priority(NS_ITUNES, 0), cx.text(el)?),
            _ => return Ok(false),
        };
        Ok(true)
    }
}

// ============================================================================
// Dublin Core
// ============================================================================

pub struct DcParser {
    prefix: String,
}

impl DcParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl NamespaceParser for DcParser {
    fn parse_channel(
        &self,
        cx: &ParseContext<'_>,
        cv: &mut ChannelValues,
        el: &Element,
    ) -> Result<bool, ErrorCode> {
        if !has_prefix(el, &self.prefix) {
            return Ok(false);
        }
        match el.local_name() {
            "title" => cv.title.set(priority(NS_DC, 0), cx.text(el)?),
            "description" => cv.description.set(priority(NS_DC, 0), cx.text(el)?),
            _ => return Ok(false),
        };
        Ok(true)
    }

    fn parse_item(
        &self,
        cx: &ParseContext<'_>,
        iv: &mut ItemValues,
        el: &Element,
    ) -> Result<bool, ErrorCode> {
        if !has_prefix(el, &self.prefix) {
            return Ok(false);
        }
        match el.local_name() {
            "title" => iv.title.set(priority(NS_DC, 0), cx.text(el)?),
            "description" => iv.description.set(priority(NS_DC, 0), cx.text(el)?),
            "date" => iv.pub_date.set(priority(NS_DC, 0), cx.text(el)?),
            "identifier" => iv.guid.set(priority(NS_DC, 0), cx.text(el)?),
            _ => return Ok(false),
        };
        Ok(true)
    }
}

// ============================================================================
// Media RSS (with the YouTube variant)
// ============================================================================

pub struct MediaParser {
    prefix: String,
    youtube: bool,
}

impl MediaParser {
    pub fn new(prefix: impl Into<String>, youtube: bool) -> Self {
        Self {
            prefix: prefix.into(),
            youtube,
        }
    }

    fn description_priority(&self) -> u32 {
        if self.youtube {
            priority(NS_MEDIA_YOUTUBE, 0)
        } else {
            priority(NS_MEDIA, 0)
        }
    }
}

impl NamespaceParser for MediaParser {
    fn parse_channel(
        &self,
        cx: &ParseContext<'_>,
        cv: &mut ChannelValues,
        el: &Element,
    ) -> Result<bool, ErrorCode> {
        if !has_prefix(el, &self.prefix) {
            return Ok(false);
        }
        match el.local_name() {
            "thumbnail" => cv.image_ref.set(priority(NS_MEDIA, 0), cx.attr(el, "url")),
            "description" => cv.description.set(self.description_priority(), cx.text(el)?),
            _ => return Ok(false),
        };
        Ok(true)
    }

    fn parse_item(
        &self,
        cx: &ParseContext<'_>,
        iv: &mut ItemValues,
        el: &Element,
    ) -> Result<bool, ErrorCode> {
        if !has_prefix(el, &self.prefix) {
            return Ok(false);
        }
        match el.local_name() {
            "group" => {
                for child in el.elements() {
                    self.parse_item(cx, iv, child)?;
                }
            }
            "title" => {
                iv.title.set(priority(NS_MEDIA, 0), cx.text(el)?);
            }
            "description" => {
                iv.description.set(self.description_priority(), cx.text(el)?);
            }
            "content" => {
                let url = cx.attr(el, "url");
                if url.is_empty() {
                    return Ok(true);
                }
                // YouTube's media:content points at the flash player; the
                // watch link is the item's link and no enclosure is wanted.
                if self.youtube {
                    return Ok(true);
                }
                let p = priority(NS_MEDIA, 0);
                iv.enclosure_url.set(p, url);
                iv.enclosure_type.set(p, cx.attr(el, "type"));
                iv.enclosure_length.set(p, cx.attr(el, "fileSize"));
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}
