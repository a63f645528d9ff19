//! Data model shared by the feed engine and the collaborators it talks to:
//! the persistence store and the channel sender.

pub mod defs;
pub mod sqlite;
pub mod state;

pub use defs::*;
pub use sqlite::SqliteFeedStore;
pub use state::{FeedStore, MemoryFeedStore, StoreError, StoreResult};
