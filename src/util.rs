//! Shared filesystem helpers.

use std::io::Write;
use std::path::Path;

/// Atomically replace `dst` with `bytes` using write-to-temp-then-rename.
///
/// The temp file lives in the same directory as `dst` (rename is only
/// atomic within one filesystem) and carries a randomized suffix so a
/// concurrent writer cannot collide with it. The destination is never
/// observable in a partially-written state: a crash at any point leaves
/// either the old file or the new one.
pub fn write_atomic(dst: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let tmp_path = dst.with_extension(format!("tmp.{nonce:016x}"));

    let mut tmp = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true) // fails atomically if the file exists
        .open(&tmp_path)?;

    let result = (|| {
        tmp.write_all(bytes)?;
        // Data must be durable before the rename makes it visible.
        tmp.sync_all()?;
        drop(tmp);
        std::fs::rename(&tmp_path, dst)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_creates_and_replaces() {
        let dir = std::env::temp_dir().join("feedmail_write_atomic_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("data.json");

        write_atomic(&path, b"first").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        // No temp files left behind
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "data.json")
            .collect();
        assert!(leftovers.is_empty(), "leftover temp files: {leftovers:?}");

        std::fs::remove_dir_all(&dir).ok();
    }
}
