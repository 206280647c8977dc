//! Per-title feed files.
//!
//! - [`rss`]: RSS 2.0 rendering and parsing
//! - [`store`]: the merge/cap/atomic-write store that owns the files

pub mod rss;
pub mod store;

pub use store::{FeedStore, MergeOutcome};
