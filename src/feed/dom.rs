//! Minimal XML element tree for feed documents.
//!
//! The namespace parsers look at one element at a time together with its
//! attributes, text and CDATA children, so the document is first read into a
//! small owned tree. Element names keep their prefix (`itunes:summary`);
//! namespace resolution happens in the parsers from the declarations on the
//! root element.
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::ErrorCode;

/// SEC-003: Maximum element nesting accepted in a feed document.
/// Prevents resource exhaustion from maliciously deep documents.
const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
    CData(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    /// Qualified name as written in the document.
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        self.name
            .split_once(':')
            .map(|(_, local)| local)
            .unwrap_or(&self.name)
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value, or `""` when absent.
    pub fn attr_or_empty(&self, name: &str) -> &str {
        self.attr(name).unwrap_or("")
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    /// First child element with the given qualified name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// Concatenation of the direct text children.
    pub fn raw_text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenation of the direct CDATA children.
    pub fn cdata_text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::CData(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// Reads `bytes` into an element tree and returns the root element.
///
/// Content after the root element is ignored. Entity references that are not
/// XML builtins (common in feeds that paste HTML, e.g. `&nbsp;`) are kept
/// verbatim for the text cleanup to decode instead of failing the document.
///
/// # Errors
///
/// - [`ErrorCode::UnsupportedFormat`] for malformed XML, a missing root, or
///   nesting deeper than the safety limit
/// - [`ErrorCode::Unknown`] for text that cannot be decoded
pub fn parse_document(bytes: &[u8]) -> Result<Element, ErrorCode> {
    // SEC-002: quick-xml (0.37) never expands <!ENTITY> declarations from a
    // DOCTYPE, so external entity attacks are structurally impossible here.
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(false);

    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if stack.len() >= MAX_DEPTH {
                    tracing::warn!(max = MAX_DEPTH, "Feed nesting depth exceeded");
                    return Err(ErrorCode::UnsupportedFormat);
                }
                stack.push(start_element(&e, &reader));
            }
            Ok(Event::Empty(e)) => {
                let element = start_element(&e, &reader);
                if attach(&mut stack, &mut root, element) {
                    break;
                }
            }
            Ok(Event::End(_)) => {
                let element = stack.pop().ok_or(ErrorCode::UnsupportedFormat)?;
                if attach(&mut stack, &mut root, element) {
                    break;
                }
            }
            Ok(Event::Text(t)) => {
                if let Some(top) = stack.last_mut() {
                    let text = match t.unescape() {
                        Ok(s) => s.into_owned(),
                        Err(_) => reader
                            .decoder()
                            .decode(&t)
                            .map(|s| s.into_owned())
                            .map_err(|_| ErrorCode::Unknown)?,
                    };
                    top.children.push(Node::Text(text));
                }
            }
            Ok(Event::CData(c)) => {
                if let Some(top) = stack.last_mut() {
                    let text = reader
                        .decoder()
                        .decode(&c)
                        .map(|s| s.into_owned())
                        .map_err(|_| ErrorCode::Unknown)?;
                    top.children.push(Node::CData(text));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!(
                    position = reader.buffer_position(),
                    error = %e,
                    "Malformed feed XML"
                );
                return Err(ErrorCode::UnsupportedFormat);
            }
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        tracing::debug!(open = stack.len(), "Feed document ended inside an element");
        return Err(ErrorCode::UnsupportedFormat);
    }
    root.ok_or(ErrorCode::UnsupportedFormat)
}

/// Adds a completed element to its parent. Returns true once the root closed.
fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) -> bool {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Element(element));
            false
        }
        None => {
            *root = Some(element);
            true
        }
    }
}

fn start_element(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Element {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr_result in e.attributes().with_checks(false) {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(err) => {
                tracing::debug!(element = %name, error = %err, "Skipping malformed attribute");
                continue;
            }
        };
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = match attr.decode_and_unescape_value(reader.decoder()) {
            Ok(v) => v.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        };
        attrs.push((key, value));
    }
    Element {
        name,
        attrs,
        children: Vec::new(),
    }
}
