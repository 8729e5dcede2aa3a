//! Rollup result cache collaborator.
//!
//! Caches rendered range-query responses so repeated dashboards do not
//! re-run the whole scatter/merge pipeline. The cache is keyed on the
//! full request shape and never stores partial results.
//!
//! With a backing directory configured, [`RollupResultCache::stop`]
//! saves the entries at shutdown and [`RollupResultCache::new`] loads
//! them back on the next start; without one the cache is purely
//! in-memory and nothing is saved.
//!
//! `/internal/resetRollupResultCache` clears it, both the in-memory map
//! and the on-disk directory.

use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

/// Saved cache entries are named `<key hash>.entry` under the cache
/// directory.
const ENTRY_SUFFIX: &str = ".entry";

#[derive(Debug, Default)]
pub struct RollupResultCache {
    dir: Option<PathBuf>,
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl RollupResultCache {
    /// Creates the cache rooted at `dir`, creating the directory when
    /// one is given and loading any entries saved by a previous run.
    pub fn new(dir: Option<PathBuf>) -> Self {
        let mut entries = HashMap::new();
        if let Some(dir) = &dir {
            if let Err(error) = std::fs::create_dir_all(dir) {
                warn!(%error, dir = %dir.display(), "cannot create rollup result cache directory");
            }
            entries = load_entries(dir);
        }
        Self {
            dir,
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn put(&self, key: String, value: Vec<u8>) {
        self.entries.lock().insert(key, value);
    }

    /// Drops every cached entry and clears the backing directory.
    pub fn reset(&self) {
        self.entries.lock().clear();
        if let Some(dir) = &self.dir {
            if let Ok(read_dir) = std::fs::read_dir(dir) {
                for entry in read_dir.flatten() {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }
        info!("rollup result cache has been reset");
    }

    /// Drains the cache at shutdown, saving the entries to the backing
    /// directory. Without a directory there is nothing to save.
    pub fn stop(&self) {
        let Some(dir) = &self.dir else {
            return;
        };

        let entries = self.entries.lock();
        let mut saved = 0usize;
        for (key, value) in entries.iter() {
            match save_entry(dir, key, value) {
                Ok(()) => saved += 1,
                Err(error) => {
                    warn!(%error, "cannot save rollup result cache entry");
                }
            }
        }
        info!(saved, "saved the rollup result cache");
    }
}

fn entry_path(dir: &Path, key: &str) -> PathBuf {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    dir.join(format!("{:016x}{ENTRY_SUFFIX}", hasher.finish()))
}

/// One entry per file: `u64` key length, the key, then the value.
fn save_entry(dir: &Path, key: &str, value: &[u8]) -> std::io::Result<()> {
    let mut data = Vec::with_capacity(8 + key.len() + value.len());
    data.extend_from_slice(&(key.len() as u64).to_le_bytes());
    data.extend_from_slice(key.as_bytes());
    data.extend_from_slice(value);
    std::fs::write(entry_path(dir, key), data)
}

fn load_entries(dir: &Path) -> HashMap<String, Vec<u8>> {
    let mut entries = HashMap::new();
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return entries;
    };

    for entry in read_dir.flatten() {
        let path = entry.path();
        if !path.to_string_lossy().ends_with(ENTRY_SUFFIX) {
            continue;
        }
        match std::fs::read(&path).map(parse_entry) {
            Ok(Some((key, value))) => {
                entries.insert(key, value);
            }
            Ok(None) => {
                warn!(path = %path.display(), "dropping malformed rollup result cache entry");
                let _ = std::fs::remove_file(&path);
            }
            Err(error) => {
                warn!(%error, path = %path.display(), "cannot read rollup result cache entry");
            }
        }
    }
    entries
}

fn parse_entry(data: Vec<u8>) -> Option<(String, Vec<u8>)> {
    let key_len = u64::from_le_bytes(data.get(..8)?.try_into().ok()?) as usize;
    let key = data.get(8..8 + key_len)?;
    let key = String::from_utf8(key.to_vec()).ok()?;
    let value = data[8 + key_len..].to_vec();
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_put_reset() {
        let cache = RollupResultCache::new(None);
        assert!(cache.get("k").is_none());

        cache.put("k".to_owned(), b"value".to_vec());
        assert_eq!(cache.get("k").unwrap(), b"value");

        cache.reset();
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn stop_without_a_directory_saves_nothing() {
        let cache = RollupResultCache::new(None);
        cache.put("k".to_owned(), b"value".to_vec());
        cache.stop();
    }

    #[test]
    fn stop_saves_entries_and_new_reloads_them() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("rollupResult");

        let cache = RollupResultCache::new(Some(cache_dir.clone()));
        cache.put("tenant|up|0|10|15000".to_owned(), b"body-a".to_vec());
        cache.put("tenant|cpu|0|10|15000".to_owned(), b"body-b".to_vec());
        cache.stop();

        let reloaded = RollupResultCache::new(Some(cache_dir));
        assert_eq!(reloaded.get("tenant|up|0|10|15000").unwrap(), b"body-a");
        assert_eq!(reloaded.get("tenant|cpu|0|10|15000").unwrap(), b"body-b");
        assert!(reloaded.get("tenant|other|0|10|15000").is_none());
    }

    #[test]
    fn reset_clears_the_backing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("rollupResult");
        let cache = RollupResultCache::new(Some(cache_dir.clone()));

        cache.put("k".to_owned(), b"value".to_vec());
        cache.stop();
        assert!(std::fs::read_dir(&cache_dir).unwrap().count() > 0);

        cache.reset();
        assert!(cache.get("k").is_none());
        assert_eq!(std::fs::read_dir(&cache_dir).unwrap().count(), 0);
    }
}
