use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::snapshot::Snapshot;

/// Derive the snapshot file path for a cache key. The digest is stable
/// across runs and changes whenever any key part changes.
pub fn snapshot_path(cache_dir: &Path, name_prefix: &str, key_parts: &[String]) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    for part in key_parts {
        part.hash(&mut hasher);
    }
    let prefix: String = name_prefix
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    cache_dir.join(format!("{prefix}-{:016x}", hasher.finish()))
}

/// Handle to one on-disk snapshot blob.
#[derive(Clone)]
pub(crate) struct CacheHandle {
    path: PathBuf,
}

impl CacheHandle {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted snapshot. Any failure (missing file, stale layout,
    /// corrupt bytes) yields an empty snapshot; a cache miss is never fatal.
    pub fn read(&self) -> Snapshot {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) => {
                log::debug!(
                    "hastemap: no usable snapshot at {}: {error}",
                    self.path.display()
                );
                return Snapshot::empty();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                log::warn!(
                    "hastemap: discarding corrupt snapshot at {}: {error}",
                    self.path.display()
                );
                Snapshot::empty()
            }
        }
    }

    /// Persist the snapshot atomically: write to a sibling temp file, then
    /// rename over the destination.
    pub fn write(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create cache directory: {}", dir.display()))?;
        }

        let data =
            serde_json::to_vec(snapshot).context("failed to serialize haste map snapshot")?;
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create cache file: {}", tmp_path.display()))?;
            file.write_all(&data)
                .with_context(|| format!("failed to write cache file: {}", tmp_path.display()))?;
            file.sync_all().ok();
        }

        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to move cache file from {} to {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FileEntry;

    fn parts(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn snapshot_path_is_deterministic() {
        let dir = Path::new("/tmp/cache");
        let a = snapshot_path(dir, "proj", &parts(&["1.0", "js,json"]));
        let b = snapshot_path(dir, "proj", &parts(&["1.0", "js,json"]));
        assert_eq!(a, b);
    }

    #[test]
    fn snapshot_path_changes_with_any_key_part() {
        let dir = Path::new("/tmp/cache");
        let base = snapshot_path(dir, "proj", &parts(&["1.0", "js"]));
        assert_ne!(base, snapshot_path(dir, "proj", &parts(&["1.1", "js"])));
        assert_ne!(base, snapshot_path(dir, "proj", &parts(&["1.0", "ts"])));
    }

    #[test]
    fn snapshot_path_sanitizes_the_prefix() {
        let dir = Path::new("/tmp/cache");
        let path = snapshot_path(dir, "my project!", &parts(&["k"]));
        let name = path.file_name().and_then(|n| n.to_str()).expect("file name");
        assert!(name.starts_with("my-project--"));
    }

    #[test]
    fn read_missing_or_corrupt_yields_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = CacheHandle::new(dir.path().join("absent"));
        assert!(handle.read().files.is_empty());

        let corrupt = dir.path().join("corrupt");
        fs::write(&corrupt, b"not json").expect("write");
        let handle = CacheHandle::new(corrupt);
        assert!(handle.read().files.is_empty());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = CacheHandle::new(dir.path().join("snapshot"));
        let mut snapshot = Snapshot::empty();
        snapshot
            .files
            .insert("a.js".to_string(), FileEntry::placeholder(10, 20));
        snapshot
            .clocks
            .insert("/root".to_string(), "c:1:2".to_string());
        handle.write(&snapshot).expect("write");

        let loaded = handle.read();
        assert_eq!(loaded.files.get("a.js"), snapshot.files.get("a.js"));
        assert_eq!(loaded.clocks.get("/root"), snapshot.clocks.get("/root"));
    }
}
