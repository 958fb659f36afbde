//! Stable identity for feed entries.
//!
//! Every entry gets two strings: a `guid` (the dedup key the store is
//! indexed by) and a `hash` (a content digest used to detect edits to
//! an already-seen entry). Which field becomes the guid is a per-feed
//! policy choice; feeds with broken or recycled ids can fall back to
//! the content hash itself.

use sha1::{Digest, Sha1};

use super::fetcher::RawEntry;

/// The resolved identity of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryIdentity {
    /// Dedup key: link, native id, or the content hash, per policy.
    pub guid: String,
    /// SHA-1 hex digest of the entry's most substantial field.
    pub hash: String,
}

/// Resolve an entry's identity under the feed's trust policy.
///
/// The hash digests the first non-empty of body, link, title (trimmed).
/// The guid prefers the link when `trust_link` is set, then the native
/// id when `trust_guid` is set, and otherwise falls back to the hash.
/// An entry with no usable content at all yields `None` and should be
/// skipped.
pub fn resolve_identity(
    entry: &RawEntry,
    trust_guid: bool,
    trust_link: bool,
) -> Option<EntryIdentity> {
    let basis = [&entry.body, &entry.link, &entry.title]
        .into_iter()
        .filter_map(|f| f.as_deref())
        .map(str::trim)
        .find(|s| !s.is_empty())?;

    let mut hasher = Sha1::new();
    hasher.update(basis.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    let link = entry.link.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let id = entry.id.as_deref().map(str::trim).filter(|s| !s.is_empty());

    let guid = if trust_link && link.is_some() {
        link.map(str::to_string)
    } else if trust_guid && id.is_some() {
        id.map(str::to_string)
    } else {
        None
    }
    .unwrap_or_else(|| hash.clone());

    Some(EntryIdentity { guid, hash })
}
