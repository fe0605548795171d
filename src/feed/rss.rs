//! Default-namespace parser for RSS 2.0.
use super::dom::Element;
use super::model::{ChannelValues, ItemValues};
use super::namespace::{NamespaceParser, ParseContext, NS_DEFAULT};
use super::node_value::priority;
use crate::error::ErrorCode;

pub struct RssParser;

impl NamespaceParser for RssParser {
    fn parse_channel(
        &self,
        cx: &ParseContext<'_>,
        cv: &mut ChannelValues,
        el: &Element,
    ) -> Result<bool, ErrorCode> {
        if el.prefix().is_some() {
            return Ok(false);
        }
        let p = priority(NS_DEFAULT, 0);
        match el.name.as_str() {
            "title" => cv.title.set(p, cx.text(el)?),
            "description" => cv.description.set(p, cx.text(el)?),
            "image" => match el.child("url") {
                Some(url) => cv.image_ref.set(p, cx.text(url)?),
                None => false,
            },
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
        let p = priority(NS_DEFAULT, 0);
        match el.name.as_str() {
            "title" => iv.title.set(p, cx.text(el)?),
            "link" => iv.link.set(p, cx.text(el)?),
            "description" => iv.description.set(p, cx.text(el)?),
            "pubDate" => iv.pub_date.set(p, cx.text(el)?),
            "guid" => iv.guid.set(p, cx.text(el)?),
            "enclosure" => {
                // An enclosure without url still records its type so the
                // guid repair can fill the url.
                let url = cx.attr(el, "url");
                if !url.is_empty() {
                    iv.enclosure_url.set(p, url);
                }
                iv.enclosure_type.set(p, cx.attr(el, "type"));
                iv.enclosure_length.set(p, cx.attr(el, "length"))
            }
            _ => return Ok(false),
        };
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::dom::parse_document;

    fn el(xml: &str) -> Element {
        parse_document(xml.as_bytes()).unwrap()
    }

    #[test]
    fn test_channel_image_url() {
        let cx = ParseContext::new(None);
        let mut cv = ChannelValues::default();
        let handled = RssParser
            .parse_channel(
                &cx,
                &mut cv,
                &el("<image><url> http://e/logo.png </url><title>x</title></image>"),
            )
            .unwrap();
        assert!(handled);
        assert_eq!(cv.image_ref.value(), "http://e/logo.png");
    }

    #[test]
    fn test_item_enclosure_attributes() {
        let cx = ParseContext::new(None);
        let mut iv = ItemValues::default();
        RssParser
            .parse_item(
                &cx,
                &mut iv,
                &el(r#"<enclosure url="http://e/a.mp3" length="1024" type="audio/mpeg"/>"#),
            )
            .unwrap();
        assert_eq!(iv.enclosure_url.value(), "http://e/a.mp3");
        assert_eq!(iv.enclosure_length.value(), "1024");
        assert_eq!(iv.enclosure_type.value(), "audio/mpeg");
    }

    #[test]
    fn test_prefixed_elements_not_handled() {
        let cx = ParseContext::new(None);
        let mut iv = ItemValues::default();
        assert!(!RssParser
            .parse_item(&cx, &mut iv, &el("<dc:title>x</dc:title>"))
            .unwrap());
        assert!(iv.title.is_empty());
    }

    #[test]
    fn test_unknown_element_not_handled() {
        let cx = ParseContext::new(None);
        let mut iv = ItemValues::default();
        assert!(!RssParser
            .parse_item(&cx, &mut iv, &el("<comments>http://e/c</comments>"))
            .unwrap());
    }
}
