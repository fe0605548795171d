//! Parsed feed values.
//!
//! [`ChannelValues`] and [`ItemValues`] are the mutable accumulators the
//! namespace parsers write into; [`ParsedChannel`] and [`ParsedItem`] are what
//! the engine hands back once a document is fully visited.
use serde::Serialize;

use super::node_value::NodeValue;
use crate::util::is_web_url;

/// How a channel's content is meant to be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    /// Articles and podcasts: items link to pages or downloadable media.
    #[default]
    Normal,
    /// Video sites (YouTube-style) whose items are played by an embedding viewer.
    EmbeddedMedia,
}

impl FeedType {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedType::Normal => "normal",
            FeedType::EmbeddedMedia => "embedded_media",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "embedded_media" => FeedType::EmbeddedMedia,
            _ => FeedType::Normal,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Enclosure {
    pub url: String,
    pub length: String,
    #[serde(rename = "type")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedChannel {
    pub title: String,
    pub description: String,
    pub image_ref: String,
    pub feed_type: FeedType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub pub_date: String,
    pub enclosure: Enclosure,
    /// Source guid, used for deduplication. Not part of the display model.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub guid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeedParseResult {
    pub channel: ParsedChannel,
    pub items: Vec<ParsedItem>,
}

#[derive(Debug, Default)]
pub struct ChannelValues {
    pub title: NodeValue,
    pub description: NodeValue,
    pub image_ref: NodeValue,
    pub feed_type: FeedType,
}

impl ChannelValues {
    pub fn into_channel(self) -> ParsedChannel {
        ParsedChannel {
            title: self.title.into_value(),
            description: self.description.into_value(),
            image_ref: self.image_ref.into_value(),
            feed_type: self.feed_type,
        }
    }
}

#[derive(Debug, Default)]
pub struct ItemValues {
    pub title: NodeValue,
    pub link: NodeValue,
    pub description: NodeValue,
    pub pub_date: NodeValue,
    pub guid: NodeValue,
    pub enclosure_url: NodeValue,
    pub enclosure_length: NodeValue,
    pub enclosure_type: NodeValue,
}

impl ItemValues {
    pub fn to_item(&self) -> ParsedItem {
        ParsedItem {
            title: self.title.value().to_string(),
            link: self.link.value().to_string(),
            description: self.description.value().to_string(),
            pub_date: self.pub_date.value().to_string(),
            enclosure: Enclosure {
                url: self.enclosure_url.value().to_string(),
                length: self.enclosure_length.value().to_string(),
                mime_type: self.enclosure_type.value().to_string(),
            },
            guid: self.guid.value().to_string(),
        }
    }

    /// Promotes a URL-shaped guid into the slot the item is missing.
    ///
    /// Some feeds carry the only usable URL in `<guid>`. If an enclosure type
    /// was declared without a url, the guid becomes the enclosure url;
    /// otherwise, if no link was set, it becomes the link. Returns whether a
    /// slot was filled.
    pub fn repair_from_guid(&mut self) -> bool {
        let guid = self.guid.value().trim().to_string();
        if !is_web_url(&guid) {
            return false;
        }
        let slot = if !self.enclosure_type.is_empty() && self.enclosure_url.is_empty() {
            &mut self.enclosure_url
        } else if self.link.is_empty() {
            &mut self.link
        } else {
            return false;
        };
        // A blank slot may hold a higher priority than the guid (`<link/>`
        // next to `dc:identifier`); the repair has to win over it.
        let priority = self.guid.priority().max(slot.priority());
        slot.set(priority, guid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values_with_guid(guid: &str) -> ItemValues {
        let mut v = ItemValues::default();
        v.title.set(0, "Title");
        v.guid.set(0, guid);
        v
    }

    #[test]
    fn test_repair_overrides_blank_higher_priority_link() {
        let mut v = values_with_guid("http://example.com/x");
        v.link.set(u32::MAX, "");
        assert!(v.repair_from_guid());
        assert_eq!(v.link.value(), "http://example.com/x");
    }

    #[test]
    fn test_repair_fills_link() {
        let mut v = values_with_guid("http://example.com/x");
        assert!(v.repair_from_guid());
        assert_eq!(v.link.value(), "http://example.com/x");
        assert!(v.enclosure_url.is_empty());
    }

    #[test]
    fn test_repair_prefers_enclosure_when_type_declared() {
        let mut v = values_with_guid("https://cdn.example.com/ep1.mp3");
        v.enclosure_type.set(0, "audio/mpeg");
        assert!(v.repair_from_guid());
        assert_eq!(v.enclosure_url.value(), "https://cdn.example.com/ep1.mp3");
        assert!(v.link.is_empty());
    }

    #[test]
    fn test_repair_ignores_non_url_guid() {
        let mut v = values_with_guid("urn:uuid:abcd");
        assert!(!v.repair_from_guid());
        assert!(v.link.is_empty());
    }

    #[test]
    fn test_repair_does_not_overwrite_link() {
        let mut v = values_with_guid("http://example.com/guid");
        v.link.set(0, "http://example.com/link");
        assert!(!v.repair_from_guid());
        assert_eq!(v.link.value(), "http://example.com/link");
    }

    #[test]
    fn test_feed_type_db_round_trip_names() {
        assert_eq!(FeedType::from_db(FeedType::EmbeddedMedia.as_str()), FeedType::EmbeddedMedia);
        assert_eq!(FeedType::from_db("garbage"), FeedType::Normal);
    }
}
