//! Feed processing: fetching, entry identity, change tracking, and the
//! per-feed run orchestration.
//!
//! The module is organized into four submodules:
//!
//! - [`fetcher`] - Deadline-bounded conditional HTTP fetch, parsed with `feed-rs`
//! - [`identity`] - Stable dedup keys and content hashes for entries
//! - [`throttle`] - Pacing between consecutive fetches against one host
//! - [`runner`] - The per-feed pipeline: fetch, dedup, build, deliver, record

mod fetcher;
mod identity;
mod runner;
mod throttle;

pub use fetcher::{build_client, fetch_feed, FetchError, FetchedFeed, RawEntry};
pub use identity::{resolve_identity, EntryIdentity};
pub use runner::{run_feed, RunContext, RunError, RunOptions, RunOutcome};
pub use throttle::FetchThrottle;
