//! Feed policy: what counts as a usable channel or item, and what happens
//! when the user activates an item.
//!
//! Everything here is pure. The update job calls these after parsing and
//! persists the resulting [`ActionFlags`] with the channel.
use serde::{Deserialize, Serialize};

use super::model::{Enclosure, FeedType, ParsedChannel, ParsedItem};

/// An item is usable when it has a title and something to open.
pub fn verify_item(item: &ParsedItem) -> bool {
    !item.title.is_empty() && (!item.link.is_empty() || !item.enclosure.url.is_empty())
}

pub fn verify_channel(channel: &ParsedChannel) -> bool {
    !channel.title.is_empty()
}

/// Decides what kind of content a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Pick between link and enclosure per item.
    Dynamic,
    /// Items are played by an embedding viewer.
    EmbeddedMedia,
}

/// Who handles an item once its target is chosen. Chosen by the user after
/// the first decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionProgram {
    InApp,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFlags {
    pub kind: ActionType,
    pub program: ActionProgram,
}

impl ActionFlags {
    pub fn new(kind: ActionType, program: ActionProgram) -> Self {
        Self { kind, program }
    }

    /// Compact form stored in the `channels.action` column.
    pub fn to_db(self) -> String {
        let kind = match self.kind {
            ActionType::Dynamic => "dynamic",
            ActionType::EmbeddedMedia => "embedded_media",
        };
        let program = match self.program {
            ActionProgram::InApp => "in_app",
            ActionProgram::External => "external",
        };
        format!("{kind}/{program}")
    }

    pub fn from_db(s: &str) -> Option<Self> {
        let (kind, program) = s.split_once('/')?;
        let kind = match kind {
            "dynamic" => ActionType::Dynamic,
            "embedded_media" => ActionType::EmbeddedMedia,
            _ => return None,
        };
        let program = match program {
            "in_app" => ActionProgram::InApp,
            "external" => ActionProgram::External,
            _ => return None,
        };
        Some(Self { kind, program })
    }
}

fn action_type_for(feed_type: FeedType) -> ActionType {
    match feed_type {
        FeedType::Normal => ActionType::Dynamic,
        FeedType::EmbeddedMedia => ActionType::EmbeddedMedia,
    }
}

fn default_program(kind: ActionType) -> ActionProgram {
    match kind {
        ActionType::Dynamic => ActionProgram::InApp,
        ActionType::EmbeddedMedia => ActionProgram::External,
    }
}

/// Re-decides a channel's action flags after an update.
///
/// The first decision (`current` is `None`) picks both the type and a
/// default program. Later decisions only follow the feed type and keep the
/// program the user may have changed. A channel with no items and no prior
/// decision stays undecided; one with prior flags keeps them.
pub fn decide_action_type(
    current: Option<ActionFlags>,
    channel: &ParsedChannel,
    item: Option<&ParsedItem>,
) -> Option<ActionFlags> {
    if item.is_none() {
        return current;
    }
    let kind = action_type_for(channel.feed_type);
    Some(match current {
        None => ActionFlags::new(kind, default_program(kind)),
        Some(prev) => ActionFlags::new(kind, prev.program),
    })
}

fn is_playable(mime_type: &str) -> bool {
    let mime_type = mime_type.trim().to_ascii_lowercase();
    mime_type.starts_with("audio/") || mime_type.starts_with("video/")
}

/// Picks the URL a dynamic action should open.
///
/// Playable enclosures win, then the link, then any enclosure. Returns
/// `None` for non-dynamic actions or when the item has nothing to open.
pub fn dynamic_action_target_url<'a>(
    kind: ActionType,
    link: &'a str,
    enclosure: &'a Enclosure,
) -> Option<&'a str> {
    if kind != ActionType::Dynamic {
        return None;
    }
    if !enclosure.url.is_empty() && is_playable(&enclosure.mime_type) {
        return Some(&enclosure.url);
    }
    if !link.is_empty() {
        return Some(link);
    }
    if !enclosure.url.is_empty() {
        return Some(&enclosure.url);
    }
    None
}

/// What activating an item does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ItemAction {
    /// Hand the URL to a viewer.
    Open { url: String },
    /// Fetch the enclosure first, then open the local copy.
    DownloadOpen { url: String },
}

/// Resolves an item click under the channel's action flags.
pub fn resolve_item_action(
    flags: ActionFlags,
    link: &str,
    enclosure: &Enclosure,
) -> Option<ItemAction> {
    match flags.kind {
        ActionType::EmbeddedMedia => {
            let url = if link.is_empty() { &enclosure.url } else { link };
            (!url.is_empty()).then(|| ItemAction::Open { url: url.to_string() })
        }
        ActionType::Dynamic => {
            let url = dynamic_action_target_url(flags.kind, link, enclosure)?;
            let is_enclosure = url == enclosure.url;
            let action = if is_enclosure && flags.program == ActionProgram::InApp {
                ItemAction::DownloadOpen {
                    url: url.to_string(),
                }
            } else {
                ItemAction::Open {
                    url: url.to_string(),
                }
            };
            Some(action)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item(title: &str, link: &str, enclosure_url: &str) -> ParsedItem {
        ParsedItem {
            title: title.into(),
            link: link.into(),
            enclosure: Enclosure {
                url: enclosure_url.into(),
                ..Enclosure::default()
            },
            ..ParsedItem::default()
        }
    }

    fn enclosure(url: &str, mime_type: &str) -> Enclosure {
        Enclosure {
            url: url.into(),
            length: String::new(),
            mime_type: mime_type.into(),
        }
    }

    fn channel(feed_type: FeedType) -> ParsedChannel {
        ParsedChannel {
            title: "C".into(),
            feed_type,
            ..ParsedChannel::default()
        }
    }

    #[test]
    fn test_verify_item() {
        assert!(verify_item(&item("T", "L", "")));
        assert!(verify_item(&item("T", "", "E")));
        assert!(!verify_item(&item("", "L", "E")));
        assert!(!verify_item(&item("T", "", "")));
    }

    #[test]
    fn test_verify_channel() {
        assert!(verify_channel(&channel(FeedType::Normal)));
        assert!(!verify_channel(&ParsedChannel::default()));
    }

    #[test]
    fn test_first_decision_sets_type_and_program() {
        let i = item("T", "L", "");
        assert_eq!(
            decide_action_type(None, &channel(FeedType::Normal), Some(&i)),
            Some(ActionFlags::new(ActionType::Dynamic, ActionProgram::InApp))
        );
        assert_eq!(
            decide_action_type(None, &channel(FeedType::EmbeddedMedia), Some(&i)),
            Some(ActionFlags::new(
                ActionType::EmbeddedMedia,
                ActionProgram::External
            ))
        );
    }

    #[test]
    fn test_later_decision_keeps_program() {
        let i = item("T", "L", "");
        let prev = ActionFlags::new(ActionType::Dynamic, ActionProgram::External);
        assert_eq!(
            decide_action_type(Some(prev), &channel(FeedType::EmbeddedMedia), Some(&i)),
            Some(ActionFlags::new(
                ActionType::EmbeddedMedia,
                ActionProgram::External
            ))
        );
    }

    #[test]
    fn test_no_item_keeps_whatever_was_there() {
        let c = channel(FeedType::Normal);
        assert_eq!(decide_action_type(None, &c, None), None);
        let prev = ActionFlags::new(ActionType::EmbeddedMedia, ActionProgram::InApp);
        assert_eq!(decide_action_type(Some(prev), &c, None), Some(prev));
    }

    #[test]
    fn test_target_prefers_playable_enclosure() {
        let e = enclosure("http://e/a.mp3", "audio/mpeg");
        assert_eq!(
            dynamic_action_target_url(ActionType::Dynamic, "http://e/page", &e),
            Some("http://e/a.mp3")
        );
    }

    #[test]
    fn test_target_falls_back_to_link_then_enclosure() {
        let pdf = enclosure("http://e/a.pdf", "application/pdf");
        assert_eq!(
            dynamic_action_target_url(ActionType::Dynamic, "http://e/page", &pdf),
            Some("http://e/page")
        );
        assert_eq!(
            dynamic_action_target_url(ActionType::Dynamic, "", &pdf),
            Some("http://e/a.pdf")
        );
        assert_eq!(
            dynamic_action_target_url(ActionType::Dynamic, "", &Enclosure::default()),
            None
        );
    }

    #[test]
    fn test_target_only_for_dynamic() {
        let e = enclosure("http://e/a.mp3", "audio/mpeg");
        assert_eq!(
            dynamic_action_target_url(ActionType::EmbeddedMedia, "http://e/page", &e),
            None
        );
    }

    #[test]
    fn test_resolve_item_action() {
        let flags = ActionFlags::new(ActionType::Dynamic, ActionProgram::InApp);
        let e = enclosure("http://e/a.mp3", "audio/mpeg");
        assert_eq!(
            resolve_item_action(flags, "http://e/page", &e),
            Some(ItemAction::DownloadOpen {
                url: "http://e/a.mp3".into()
            })
        );
        assert_eq!(
            resolve_item_action(flags, "http://e/page", &Enclosure::default()),
            Some(ItemAction::Open {
                url: "http://e/page".into()
            })
        );

        let external = ActionFlags::new(ActionType::Dynamic, ActionProgram::External);
        assert_eq!(
            resolve_item_action(external, "", &e),
            Some(ItemAction::Open {
                url: "http://e/a.mp3".into()
            })
        );

        let embedded = ActionFlags::new(ActionType::EmbeddedMedia, ActionProgram::External);
        assert_eq!(
            resolve_item_action(embedded, "http://yt/watch?v=1", &Enclosure::default()),
            Some(ItemAction::Open {
                url: "http://yt/watch?v=1".into()
            })
        );
    }

    #[test]
    fn test_action_flags_db_form() {
        let flags = ActionFlags::new(ActionType::EmbeddedMedia, ActionProgram::InApp);
        assert_eq!(flags.to_db(), "embedded_media/in_app");
        assert_eq!(ActionFlags::from_db(&flags.to_db()), Some(flags));
        assert_eq!(ActionFlags::from_db("nonsense"), None);
    }
}
