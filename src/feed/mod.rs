//! Feed handling: parsing RSS/Atom documents, the policy applied to what was
//! parsed, and the network and OPML collaborators around them.
//!
//! # Architecture
//!
//! - [`dom`] reads a document into an owned element tree
//! - [`parser`] drives a default parser ([`rss`] or [`atom`]) and the
//!   [`namespace`] parsers over that tree, merging values through
//!   [`node_value::NodeValue`] priorities
//! - [`policy`] decides item validity and what activating an item does
//! - [`fetcher`] retrieves documents and enclosures, interruptible by a
//!   cancellation token
//! - [`opml`] reads and writes subscription lists
//!
//! # Example
//!
//! ```
//! use feedline::feed::parse_feed;
//!
//! let xml = br#"<rss version="2.0"><channel><title>C</title>
//!     <item><title>T</title><link>http://example.com/1</link></item>
//! </channel></rss>"#;
//! let result = parse_feed(xml, None).unwrap();
//! assert_eq!(result.items[0].title, "T");
//! ```

pub mod atom;
pub mod dom;
pub mod fetcher;
pub mod model;
pub mod namespace;
pub mod node_value;
pub mod opml;
pub mod parser;
pub mod policy;
pub mod rss;

pub use fetcher::{parse_url, FetchError, Fetcher};
pub use model::{Enclosure, FeedParseResult, FeedType, ParsedChannel, ParsedItem};
pub use opml::{OpmlChannel, OpmlError};
pub use parser::parse_feed;
pub use policy::{ActionFlags, ActionProgram, ActionType, ItemAction};
