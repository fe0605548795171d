//! Default-namespace parser for Atom 1.0.
use super::dom::Element;
use super::model::{ChannelValues, ItemValues};
use super::namespace::{NamespaceParser, ParseContext, NS_DEFAULT};
use super::node_value::priority;
use crate::error::ErrorCode;

pub struct AtomParser;

impl AtomParser {
    fn link(cx: &ParseContext<'_>, iv: &mut ItemValues, el: &Element) {
        let href = cx.attr(el, "href");
        if href.is_empty() {
            return;
        }
        match el.attr("rel").unwrap_or("alternate") {
            "alternate" => {
                iv.link.set(priority(NS_DEFAULT, 1), href);
            }
            "enclosure" => {
                let p = priority(NS_DEFAULT, 0);
                iv.enclosure_url.set(p, href);
                iv.enclosure_type.set(p, cx.attr(el, "type"));
                iv.enclosure_length.set(p, cx.attr(el, "length"));
            }
            // "related", "via" and friends are a last resort for the link.
            _ => {
                iv.link.set(priority(NS_DEFAULT, 0), href);
            }
        }
    }
}

impl NamespaceParser for AtomParser {
    fn parse_channel(
        &self,
        cx: &ParseContext<'_>,
        cv: &mut ChannelValues,
        el: &Element,
    ) -> Result<bool, ErrorCode> {
        if el.prefix().is_some() {
            return Ok(false);
        }
        match el.name.as_str() {
            "title" => cv.title.set(priority(NS_DEFAULT, 0), cx.text(el)?),
            "subtitle" => cv.description.set(priority(NS_DEFAULT, 0), cx.text(el)?),
            "logo" => cv.image_ref.set(priority(NS_DEFAULT, 1), cx.text(el)?),
            "icon" => cv.image_ref.set(priority(NS_DEFAULT, 0), cx.text(el)?),
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
        if el.prefix().is_some() {
            return Ok(false);
        }
        match el.name.as_str() {
            "title" => {
                iv.title.set(priority(NS_DEFAULT, 0), cx.text(el)?);
            }
            "link" => Self::link(cx, iv, el),
            "summary" => {
                iv.description.set(priority(NS_DEFAULT, 0), cx.text(el)?);
            }
            "content" => {
                iv.description.set(priority(NS_DEFAULT, 1), cx.text(el)?);
            }
            "updated" => {
                iv.pub_date.set(priority(NS_DEFAULT, 0), cx.text(el)?);
            }
            "published" => {
                iv.pub_date.set(priority(NS_DEFAULT, 1), cx.text(el)?);
            }
            "id" => {
                iv.guid.set(priority(NS_DEFAULT, 0), cx.text(el)?);
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}
