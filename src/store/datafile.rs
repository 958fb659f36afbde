//! The versioned on-disk document holding every feed's dynamic state.
//!
//! Format: `{"version": <int>, "feeds": [FeedState...]}`. Loading
//! migrates older versions forward through an explicit chain of pure
//! migration steps; an unrecognized version is fatal rather than
//! guessed at. Saving is atomic: serialize to a temp file in the same
//! directory, fsync, rename over the datafile.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::state::FeedState;
use crate::util::write_atomic;

/// Current schema version.
pub const DATAFILE_VERSION: u64 = 2;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("datafile I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("datafile is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no datafile at {0}")]
    Missing(PathBuf),

    #[error("datafile is corrupt: {0}")]
    Corrupt(String),

    #[error(
        "datafile version {found} is not supported (current is {DATAFILE_VERSION}); \
         migrate it manually"
    )]
    UnsupportedVersion { found: u64 },

    #[error("another feedmail instance holds the lock at {0}")]
    Locked(PathBuf),
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u64,
    feeds: Vec<FeedState>,
}

/// Parse a datafile's JSON text, migrating old versions forward.
pub fn parse_document(text: &str) -> Result<Vec<FeedState>, StoreError> {
    let mut value: Value = serde_json::from_str(text)?;
    let version = value
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| StoreError::Corrupt("missing or non-integer 'version'".into()))?;

    // Explicit migration chain: each step lifts the document one
    // version. Anything outside the chain fails fast.
    if version == 1 {
        migrate_v1_to_v2(&mut value)?;
    } else if version != DATAFILE_VERSION {
        return Err(StoreError::UnsupportedVersion { found: version });
    }

    let document: Document = serde_json::from_value(value)?;
    for feed in &document.feeds {
        if feed.name.is_empty() {
            return Err(StoreError::Corrupt("feed state with empty name".into()));
        }
    }
    Ok(document.feeds)
}

/// v1 kept `seen` as a flat `guid -> id` map. The id was the dedup key,
/// which is what `hash` means in v2 when no native id is trusted, so
/// the upgrade wraps each id as `{"hash": id}`.
fn migrate_v1_to_v2(value: &mut Value) -> Result<(), StoreError> {
    let feeds = value
        .get_mut("feeds")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| StoreError::Corrupt("missing 'feeds' array".into()))?;
    for feed in feeds {
        let Some(seen) = feed.get_mut("seen").and_then(Value::as_object_mut) else {
            continue;
        };
        for (guid, state) in seen.iter_mut() {
            match state {
                Value::String(id) => {
                    *state = serde_json::json!({ "hash": id });
                }
                Value::Object(_) => {} // already structured
                other => {
                    return Err(StoreError::Corrupt(format!(
                        "v1 seen entry for guid '{guid}' is neither string nor object: {other}"
                    )));
                }
            }
        }
    }
    value["version"] = Value::from(DATAFILE_VERSION);
    Ok(())
}

/// Serialize feed states into the current-version document text.
pub fn render_document(feeds: &[FeedState]) -> Result<String, StoreError> {
    let document = Document {
        version: DATAFILE_VERSION,
        feeds: feeds.to_vec(),
    };
    let mut text = serde_json::to_string_pretty(&document)?;
    text.push('\n');
    Ok(text)
}

/// Read and parse a datafile.
///
/// A missing file is an error when `require` is set; otherwise it
/// yields an empty collection (first run).
pub fn load(path: &Path, require: bool) -> Result<Vec<FeedState>, StoreError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if require {
                return Err(StoreError::Missing(path.to_path_buf()));
            }
            tracing::info!(path = %path.display(), "no datafile yet, starting empty");
            return Ok(Vec::new());
        }
        Err(e) => return Err(StoreError::Io(e)),
    };
    parse_document(&text)
}

/// Atomically write the full collection back to disk.
pub fn save(path: &Path, feeds: &[FeedState]) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let text = render_document(feeds)?;
    write_atomic(path, text.as_bytes())?;
    tracing::debug!(path = %path.display(), feeds = feeds.len(), "saved datafile");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::state::SeenEntry;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_current_version_round_trip() {
        let mut state = FeedState::new("f1");
        state.etag = Some("\"abc\"".into());
        state.record("g1", "h1", Some("<m1@x>".into()));
        let text = render_document(&[state.clone()]).unwrap();
        let feeds = parse_document(&text).unwrap();
        assert_eq!(feeds, vec![state]);
    }

    #[test]
    fn test_v1_flat_seen_map_migrates() {
        let v1 = r#"{
            "version": 1,
            "feeds": [
                {"name": "old-feed", "etag": null, "modified": null,
                 "seen": {"guid-a": "id-a", "guid-b": "id-b"}}
            ]
        }"#;
        let feeds = parse_document(v1).unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(
            feeds[0].seen["guid-a"],
            SeenEntry {
                hash: "id-a".into(),
                message_id: None,
                old: false
            }
        );
        assert_eq!(feeds[0].seen["guid-b"].hash, "id-b");
    }

    #[test]
    fn test_v1_migration_round_trips_losslessly() {
        let v1 = r#"{"version": 1, "feeds": [{"name": "f", "seen": {"g": "dedup-key"}}]}"#;
        let migrated = parse_document(v1).unwrap();
        let text = render_document(&migrated).unwrap();
        let reloaded = parse_document(&text).unwrap();
        assert_eq!(reloaded, migrated);
        assert_eq!(reloaded[0].seen["g"].hash, "dedup-key");
    }

    #[test]
    fn test_future_version_is_fatal() {
        let doc = r#"{"version": 99, "feeds": []}"#;
        let err = parse_document(doc).unwrap_err();
        assert!(matches!(
            err,
            StoreError::UnsupportedVersion { found: 99 }
        ));
        assert!(err.to_string().contains("migrate it manually"));
    }

    #[test]
    fn test_missing_version_is_corrupt() {
        let err = parse_document(r#"{"feeds": []}"#).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn test_garbage_is_a_parse_error() {
        assert!(matches!(
            parse_document("not json at all"),
            Err(StoreError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let path = Path::new("/tmp/feedmail_test_missing_datafile.json");
        assert!(matches!(
            load(path, true),
            Err(StoreError::Missing(_))
        ));
        assert!(load(path, false).unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join("feedmail_datafile_save_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feeds.json");

        let mut state = FeedState::new("f1");
        state.record("g", "h", None);
        save(&path, &[state.clone()]).unwrap();
        let loaded = load(&path, true).unwrap();
        assert_eq!(loaded, vec![state]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
