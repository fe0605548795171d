//! feedline: RSS/Atom parsing, background channel updates and scheduled
//! refresh.
//!
//! - [`feed`]: tolerant RSS 2.0 / Atom parsing, feed policy, HTTP fetching
//!   and OPML
//! - [`task`]: cancellable background jobs tracked by a registry actor
//! - [`schedule`]: daily per-channel update times driven by a single alarm
//! - [`storage`]: SQLite persistence with change notifications

pub mod config;
pub mod error;
pub mod feed;
pub mod schedule;
pub mod storage;
pub mod task;
pub mod util;
