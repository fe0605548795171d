//! SQLite persistence for channels, items and categories.
//!
//! Every committed write is announced on a broadcast channel
//! ([`Database::subscribe`]) as an [`UpdateType`].

mod channels;
mod items;
mod schema;
mod types;

pub use schema::Database;
pub use types::{Category, Channel, DatabaseError, Item, UpdateType};
