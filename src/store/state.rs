//! Per-feed dynamic state: the part of a feed that changes between
//! runs and must survive them. Static configuration (url, addresses,
//! policy flags) lives in the config file, not here.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How many stale guids a `--clean` run keeps around.
///
/// Some feeds transiently drop their newest items and re-add them on
/// the next fetch; pruning those immediately would re-send them as new.
/// Keeping the three most recent stale entries bounds that duplicate
/// window at 3. The value is inherited, not derived.
pub const STALE_KEEP: usize = 3;

fn is_false(b: &bool) -> bool {
    !b
}

/// What we remember about one delivered guid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    /// Content hash used for change detection.
    pub hash: String,
    /// Message-ID of the last *delivered* message for this guid; the
    /// anchor for reply-chain threading. Never advanced by dry runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Marked when the guid disappeared from the feed; stale entries
    /// beyond [`STALE_KEEP`] are pruned on `--clean`.
    #[serde(default, skip_serializing_if = "is_false")]
    pub old: bool,
}

/// Dynamic state for one feed, persisted in the datafile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedState {
    pub name: String,
    /// HTTP conditional-fetch validators from the last successful
    /// fetch.
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub modified: Option<String>,
    /// guid -> last-seen state, in insertion (first-seen) order.
    #[serde(default)]
    pub seen: IndexMap<String, SeenEntry>,
}

impl FeedState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Forget everything dynamic: validators and the seen map. The next
    /// run re-delivers the whole feed.
    pub fn reset(&mut self) {
        self.etag = None;
        self.modified = None;
        self.seen.clear();
    }

    /// Record a delivered (or dry-run-processed) entry state.
    ///
    /// `message_id` is `None` on dry runs so the stored id still points
    /// at the last message that actually went out.
    pub fn record(&mut self, guid: &str, hash: &str, message_id: Option<String>) {
        let entry = self.seen.entry(guid.to_string()).or_default();
        entry.hash = hash.to_string();
        entry.old = false;
        if let Some(id) = message_id {
            entry.message_id = Some(id);
        }
    }

    /// Clean-pruning policy: mark every remembered guid that is absent
    /// from `live` as stale, keep the [`STALE_KEEP`] most recently
    /// inserted stale entries (unmarked), and drop the rest. Returns
    /// the number of pruned guids.
    ///
    /// Callers must only invoke this when the fetch returned at least
    /// one entry; an empty (or failed) fetch says nothing about which
    /// guids are gone.
    pub fn prune_stale(&mut self, live: &HashSet<&str>) -> usize {
        for (guid, entry) in self.seen.iter_mut() {
            entry.old = !live.contains(guid.as_str());
        }

        let mut kept = 0usize;
        let mut doomed: Vec<String> = Vec::new();
        // Newest insertions last, so walk in reverse.
        for (guid, entry) in self.seen.iter_mut().rev() {
            if !entry.old {
                continue;
            }
            if kept < STALE_KEEP {
                entry.old = false;
                kept += 1;
            } else {
                doomed.push(guid.clone());
            }
        }
        for guid in &doomed {
            // shift_remove keeps the insertion order of the survivors.
            self.seen.shift_remove(guid);
        }
        doomed.len()
    }
}
