//! Utility functions for common operations.
//!
//! - **Text cleanup**: HTML-to-text conversion and control character removal
//!   for feed text
//! - **Host policy**: which hosts feed and enclosure URLs may point at, and
//!   web-URL detection for repair heuristics

mod host_policy;
mod text;

pub use host_policy::{is_web_url, HostPolicy, UrlRejected};
pub use text::{beautify, strip_control_chars};
