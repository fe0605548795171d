use scraper::{ElementRef, Html, Node};
use std::borrow::Cow;

/// Elements whose end starts a new line.
const BLOCK_ELEMENTS: [&str; 10] = [
    "p", "div", "li", "tr", "h1", "h2", "h3", "h4", "blockquote", "pre",
];

/// Elements whose content is never text.
const SKIPPED_ELEMENTS: [&str; 3] = ["script", "style", "template"];

/// Cleans feed text for display and storage.
///
/// Feed fields frequently carry literal HTML (CDATA-wrapped descriptions,
/// escaped markup in titles of regional feeds). The text is parsed as an
/// HTML fragment, which decodes every named and numeric character
/// reference and drops tags. `<br>` and the end of block elements become
/// line breaks. Terminal control characters are then removed (see
/// [`strip_control_chars`]), whitespace is collapsed and the result is
/// trimmed.
///
/// # Examples
///
/// ```
/// use feedline::util::beautify;
///
/// assert_eq!(beautify("  <p>Hello&nbsp;<b>world</b></p> "), "Hello world");
/// assert_eq!(beautify("Caf&eacute; &amp; cr&egrave;me"), "Café & crème");
/// assert_eq!(beautify("1 < 2"), "1 < 2");
/// ```
pub fn beautify(s: &str) -> String {
    let text = if s.contains(|c: char| c == '<' || c == '&') {
        Cow::Owned(html_to_text(s))
    } else {
        Cow::Borrowed(s)
    };
    let clean = strip_control_chars(&text);
    normalize_whitespace(&clean)
}

/// Text content of an HTML fragment with line breaks for `<br>` and block
/// ends.
fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::with_capacity(html.len());
    push_text(fragment.root_element(), &mut out);
    out
}

fn push_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if SKIPPED_ELEMENTS.contains(&name) {
                    continue;
                }
                if name == "br" {
                    out.push('\n');
                    continue;
                }
                if let Some(inner) = ElementRef::wrap(child) {
                    push_text(inner, out);
                }
                if BLOCK_ELEMENTS.contains(&name) {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// SEC-001: Strip control characters and ANSI escape sequences from text.
///
/// Feed text is rendered by front ends that may be terminals; escape
/// sequences embedded in a feed must not reach them.
///
/// Strips:
/// - ASCII control chars: 0x00-0x08, 0x0B-0x0C, 0x0E-0x1F, 0x7F
/// - ANSI CSI sequences: `\x1b[` ... (terminal byte 0x40-0x7E)
/// - ANSI OSC sequences: `\x1b]` ... (until BEL 0x07 or ST `\x1b\\`)
/// - Bare ESC (0x1b) not followed by `[` or `]`
///
/// Preserves: tab (0x09), newline (0x0A), carriage return (0x0D).
///
/// Returns `Cow::Borrowed` when the input contains no control characters.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    let len = bytes.len();

    let is_control = |b: u8| b == 0x7f || (b < 0x20 && b != 0x09 && b != 0x0a && b != 0x0d);

    if !bytes.iter().any(|&b| b == 0x1b || is_control(b)) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(len);
    let mut i = 0;

    while i < len {
        let b = bytes[i];

        if b == 0x1b {
            if i + 1 < len && bytes[i + 1] == b'[' {
                i += 2;
                while i < len {
                    let c = bytes[i];
                    i += 1;
                    if (0x40..=0x7e).contains(&c) {
                        break;
                    }
                }
            } else if i + 1 < len && bytes[i + 1] == b']' {
                i += 2;
                while i < len {
                    if bytes[i] == 0x07 {
                        i += 1;
                        break;
                    }
                    if bytes[i] == 0x1b && i + 1 < len && bytes[i + 1] == b'\\' {
                        i += 2;
                        break;
                    }
                    i += 1;
                }
            } else {
                i += 1;
            }
        } else if is_control(b) {
            i += 1;
        } else {
            let start = i;
            i += 1;
            while i < len && bytes[i] != 0x1b && !is_control(bytes[i]) {
                i += 1;
            }
            // SAFETY: we only break on ASCII bytes, which cannot appear
            // mid-codepoint in valid UTF-8, so s[start..i] is valid UTF-8.
            out.push_str(&s[start..i]);
        }
    }

    Cow::Owned(out)
}
