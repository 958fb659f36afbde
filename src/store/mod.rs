//! Persistent feed store: an ordered, name-keyed collection of
//! [`FeedState`] backed by the versioned JSON datafile.
//!
//! A run goes `load -> mutate in memory -> save atomically`; the
//! process-wide [`StoreLock`] (acquired before load, held until after
//! save) keeps concurrent runs from losing updates to each other.

mod datafile;
mod lock;
mod state;

pub use datafile::{StoreError, DATAFILE_VERSION};
pub use lock::StoreLock;
pub use state::{FeedState, SeenEntry, STALE_KEEP};

use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// The full collection of feed states, keyed by feed name, in
/// processing order. Both positional iteration and name lookup are
/// first-class; there is no list-that-is-secretly-a-dictionary.
#[derive(Debug)]
pub struct FeedStore {
    path: PathBuf,
    feeds: IndexMap<String, FeedState>,
}

impl FeedStore {
    /// Load the store from `path`. `require` makes a missing datafile
    /// fatal; commands that can sensibly start from nothing pass
    /// `false`.
    pub fn load(path: &Path, require: bool) -> Result<Self, StoreError> {
        let states = datafile::load(path, require)?;
        let mut feeds = IndexMap::with_capacity(states.len());
        for state in states {
            feeds.insert(state.name.clone(), state);
        }
        Ok(Self {
            path: path.to_path_buf(),
            feeds,
        })
    }

    /// Atomically persist the whole collection.
    pub fn save(&self) -> Result<(), StoreError> {
        let states: Vec<FeedState> = self.feeds.values().cloned().collect();
        datafile::save(&self.path, &states)
    }

    /// Conventional lock-file path for a given datafile.
    pub fn lock_path(datafile: &Path) -> PathBuf {
        let mut name = datafile
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        datafile.with_file_name(name)
    }

    /// Reorder to match the configured feed list: configured names
    /// first (in config order, creating empty states for new feeds),
    /// then any states with no config entry. Those orphans are kept and
    /// re-saved so pausing-by-removal does not silently discard history.
    pub fn sync_order<'a>(&mut self, configured: impl IntoIterator<Item = &'a str>) {
        let mut ordered: IndexMap<String, FeedState> = IndexMap::with_capacity(self.feeds.len());
        for name in configured {
            let state = self
                .feeds
                .shift_remove(name)
                .unwrap_or_else(|| FeedState::new(name));
            ordered.insert(name.to_string(), state);
        }
        for (name, state) in self.feeds.drain(..) {
            tracing::debug!(feed = %name, "state present in datafile but not in config, keeping");
            ordered.insert(name, state);
        }
        self.feeds = ordered;
    }

    pub fn get(&self, name: &str) -> Option<&FeedState> {
        self.feeds.get(name)
    }

    /// State for `name`, created empty if absent.
    pub fn state_mut(&mut self, name: &str) -> &mut FeedState {
        self.feeds
            .entry(name.to_string())
            .or_insert_with(|| FeedState::new(name))
    }

    pub fn remove(&mut self, name: &str) -> Option<FeedState> {
        self.feeds.shift_remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeedState> {
        self.feeds.values()
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }
}
