use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{RenderError, RenderResult};

/// Content-addressed artifact cache shared by all pipeline phases.
///
/// Entries live at `<cache_dir>/<name>_<sha256>.<ext>`. The hash covers a
/// canonical-JSON rendering of the key data (serde_json serializes object
/// keys in sorted order), so any map with the same contents addresses the
/// same artifact.
pub struct CacheManager {
    cache_dir: PathBuf,
    no_cache: bool,
    cache_refresh: bool,
    max_size_mb: Option<u64>,
    ttl_hours: Option<u64>,
    key_locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    in_flight: Mutex<HashSet<PathBuf>>,
}

impl CacheManager {
    pub fn new(
        cache_dir: PathBuf,
        no_cache: bool,
        cache_refresh: bool,
        max_size_mb: Option<u64>,
        ttl_hours: Option<u64>,
    ) -> RenderResult<Self> {
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| RenderError::Cache(format!("failed to create cache dir: {e}")))?;
        info!(dir = %cache_dir.display(), "cache directory initialized");

        if no_cache || cache_refresh {
            let reason = if no_cache { "--no-cache" } else { "--cache-refresh" };
            info!("{reason}: all files will be regenerated");
            std::fs::remove_dir_all(&cache_dir)
                .and_then(|_| std::fs::create_dir_all(&cache_dir))
                .map_err(|e| RenderError::Cache(format!("failed to reset cache dir: {e}")))?;
        }

        let manager = Self {
            cache_dir,
            no_cache,
            cache_refresh,
            max_size_mb,
            ttl_hours,
            key_locks: tokio::sync::Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        };
        manager.clean();
        Ok(manager)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// SHA-256 of the canonical JSON rendering of `key_data`.
    pub fn generate_hash(key_data: &Value) -> String {
        let canonical = serde_json::to_string(key_data).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        let mut s = String::with_capacity(64);
        for b in digest {
            use std::fmt::Write;
            let _ = write!(s, "{b:02x}");
        }
        s
    }

    /// Expected cache path for a key, without checking existence.
    pub fn entry_path(&self, key_data: &Value, name: &str, ext: &str) -> PathBuf {
        let hash = Self::generate_hash(key_data);
        self.cache_dir.join(format!("{name}_{hash}.{ext}"))
    }

    /// Cached path for the key if present. No side effects.
    pub fn get_cached_path(&self, key_data: &Value, name: &str, ext: &str) -> Option<PathBuf> {
        if self.no_cache {
            return None;
        }
        let path = self.entry_path(key_data, name, ext);
        if path.exists() {
            debug!(name, "cache HIT -> {}", path.display());
            Some(path)
        } else {
            debug!(name, "cache MISS");
            None
        }
    }

    /// Copy an externally produced file into the cache and return its path.
    pub fn save_to_cache(
        &self,
        source: &Path,
        key_data: &Value,
        name: &str,
        ext: &str,
    ) -> RenderResult<PathBuf> {
        let path = self.entry_path(key_data, name, ext);
        std::fs::copy(source, &path)
            .map_err(|e| RenderError::Cache(format!("failed to cache {name}.{ext}: {e}")))?;
        debug!("cached file -> {}", path.display());
        self.clean();
        Ok(path)
    }

    /// Return the cached artifact for the key, creating it when absent.
    ///
    /// The creator receives the final cache path and may write there directly
    /// or return another path, which is then moved in. Concurrent calls for
    /// the same key are serialized by a per-key lock, so a key is created at
    /// most once per process. The lock map itself is only held long enough to
    /// clone the per-key handle.
    pub async fn get_or_create<F, Fut>(
        &self,
        key_data: &Value,
        name: &str,
        ext: &str,
        creator: F,
    ) -> RenderResult<PathBuf>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = RenderResult<PathBuf>>,
    {
        let hash = Self::generate_hash(key_data);
        let cached_path = self.cache_dir.join(format!("{name}_{hash}.{ext}"));

        if self.no_cache {
            let temp_path = self.cache_dir.join(format!("temp_{name}_{hash}.{ext}"));
            debug!("cache disabled; generating temporary file {}", temp_path.display());
            return creator(temp_path).await;
        }

        let key_lock = {
            let mut locks = self.key_locks.lock().await;
            locks
                .entry(format!("{name}_{hash}"))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = key_lock.lock().await;

        if self.cache_refresh && cached_path.exists() {
            debug!("cache refresh: removing {}", cached_path.display());
            let _ = std::fs::remove_file(&cached_path);
        }

        if cached_path.exists() {
            debug!(name, "cache HIT -> {}", cached_path.display());
            return Ok(cached_path);
        }

        debug!(name, "cache MISS; invoking creator -> {}", cached_path.display());
        self.in_flight.lock().unwrap().insert(cached_path.clone());
        let result = creator(cached_path.clone()).await;
        self.in_flight.lock().unwrap().remove(&cached_path);

        let generated = result.map_err(|e| {
            RenderError::Cache(format!("failed to generate {name}.{ext}: {e}"))
        })?;
        if generated != cached_path {
            std::fs::copy(&generated, &cached_path).map_err(|e| {
                RenderError::Cache(format!("failed to move artifact into cache: {e}"))
            })?;
            let _ = std::fs::remove_file(&generated);
        }
        self.clean();
        Ok(cached_path)
    }

    /// Evict expired and over-budget entries. TTL first (by atime), then
    /// oldest-atime-first until the total size fits. Files currently being
    /// written are never touched.
    fn clean(&self) {
        if self.max_size_mb.is_none() && self.ttl_hours.is_none() {
            return;
        }
        let Ok(entries) = std::fs::read_dir(&self.cache_dir) else {
            return;
        };

        let in_flight = self.in_flight.lock().unwrap().clone();
        let mut files: Vec<(PathBuf, u64, SystemTime)> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if !path.is_file() || in_flight.contains(&path) {
                    return None;
                }
                let meta = e.metadata().ok()?;
                let atime = meta.accessed().or_else(|_| meta.modified()).ok()?;
                Some((path, meta.len(), atime))
            })
            .collect();

        if let Some(ttl_hours) = self.ttl_hours {
            let threshold = SystemTime::now()
                .checked_sub(std::time::Duration::from_secs(ttl_hours * 3600));
            if let Some(threshold) = threshold {
                let (expired, kept): (Vec<_>, Vec<_>) =
                    files.into_iter().partition(|(_, _, atime)| *atime < threshold);
                let count = expired.len();
                for (path, _, _) in expired {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("failed to delete expired cache file {}: {e}", path.display());
                    }
                }
                if count > 0 {
                    info!("deleted {count} expired cache files (TTL {ttl_hours}h)");
                }
                files = kept;
            }
        }

        if let Some(max_mb) = self.max_size_mb {
            let max_bytes = max_mb * 1024 * 1024;
            let mut total: u64 = files.iter().map(|(_, size, _)| size).sum();
            if total > max_bytes {
                files.sort_by_key(|(_, _, atime)| *atime);
                let mut deleted = 0usize;
                for (path, size, _) in files {
                    if total <= max_bytes {
                        break;
                    }
                    match std::fs::remove_file(&path) {
                        Ok(()) => {
                            total -= size;
                            deleted += 1;
                        }
                        Err(e) => {
                            warn!("failed to delete cache file {}: {e}", path.display())
                        }
                    }
                }
                if deleted > 0 {
                    info!("deleted {deleted} cache files to stay within {max_mb} MB");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(dir: &Path) -> CacheManager {
        CacheManager::new(dir.to_path_buf(), false, false, None, None).unwrap()
    }

    #[test]
    fn test_hash_is_key_order_independent() {
        let a = json!({"speaker": 1, "text": "hello", "speed": 1.0});
        let b = json!({"text": "hello", "speed": 1.0, "speaker": 1});
        assert_eq!(CacheManager::generate_hash(&a), CacheManager::generate_hash(&b));
        assert_eq!(CacheManager::generate_hash(&a).len(), 64);
    }

    #[test]
    fn test_hash_varies_on_content() {
        let a = json!({"text": "hello"});
        let b = json!({"text": "goodbye"});
        assert_ne!(CacheManager::generate_hash(&a), CacheManager::generate_hash(&b));
    }

    #[test]
    fn test_entry_path_layout() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let key = json!({"k": 1});
        let path = m.entry_path(&key, "clip_s1_1", "mp4");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("clip_s1_1_"));
        assert!(name.ends_with(".mp4"));
        assert_eq!(name.len(), "clip_s1_1_".len() + 64 + ".mp4".len());
    }

    #[tokio::test]
    async fn test_get_or_create_creates_once() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let key = json!({"op": "test"});

        let p1 = m
            .get_or_create(&key, "artifact", "txt", |out| async move {
                std::fs::write(&out, "first")?;
                Ok(out)
            })
            .await
            .unwrap();
        // Second call must hit the cache; a creator that would change the
        // content proves it never ran.
        let p2 = m
            .get_or_create(&key, "artifact", "txt", |out| async move {
                std::fs::write(&out, "second")?;
                Ok(out)
            })
            .await
            .unwrap();
        assert_eq!(p1, p2);
        assert_eq!(std::fs::read_to_string(&p2).unwrap(), "first");
    }

    #[tokio::test]
    async fn test_get_or_create_relocates_foreign_output() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path());
        let elsewhere = dir.path().join("elsewhere.txt");
        let key = json!({"op": "relocate"});

        let cached = m
            .get_or_create(&key, "artifact", "txt", |_out| {
                let elsewhere = elsewhere.clone();
                async move {
                    std::fs::write(&elsewhere, "content")?;
                    Ok(elsewhere)
                }
            })
            .await
            .unwrap();
        assert!(cached.starts_with(dir.path()));
        assert_eq!(std::fs::read_to_string(&cached).unwrap(), "content");
        assert!(!elsewhere.exists());
    }

    #[tokio::test]
    async fn test_no_cache_bypasses_cache_dir_entries() {
        let dir = tempfile::tempdir().unwrap();
        let m = CacheManager::new(dir.path().to_path_buf(), true, false, None, None).unwrap();
        let key = json!({"op": "nocache"});
        let path = m
            .get_or_create(&key, "artifact", "txt", |out| async move {
                std::fs::write(&out, "x")?;
                Ok(out)
            })
            .await
            .unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("temp_"));
        assert!(m.get_cached_path(&key, "artifact", "txt").is_none());
    }

    #[tokio::test]
    async fn test_cache_refresh_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let key = json!({"op": "refresh"});
        {
            let m = manager(dir.path());
            m.get_or_create(&key, "artifact", "txt", |out| async move {
                std::fs::write(&out, "old")?;
                Ok(out)
            })
            .await
            .unwrap();
        }
        // cache_refresh resets the directory at construction and deletes any
        // remaining entry before invoking the creator.
        let m = CacheManager::new(dir.path().to_path_buf(), false, true, None, None).unwrap();
        let path = m
            .get_or_create(&key, "artifact", "txt", |out| async move {
                std::fs::write(&out, "new")?;
                Ok(out)
            })
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new");
    }

    #[tokio::test]
    async fn test_concurrent_same_key_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let m = Arc::new(manager(dir.path()));
        let key = json!({"op": "concurrent"});
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = m.clone();
            let key = key.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                m.get_or_create(&key, "artifact", "txt", |out| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                        std::fs::write(&out, "once")?;
                        Ok(out)
                    }
                })
                .await
                .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_size_eviction_removes_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        // 1 MB budget; three ~600 KB files exceed it.
        let m = CacheManager::new(dir.path().to_path_buf(), false, false, Some(1), None).unwrap();
        let payload = vec![0u8; 600 * 1024];
        let old = dir.path().join("a_000.bin");
        let newer = dir.path().join("b_000.bin");
        std::fs::write(&old, &payload).unwrap();
        // Make `old` clearly older by atime/mtime.
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::OpenOptions::new()
            .write(true)
            .open(&old)
            .unwrap()
            .set_times(
                std::fs::FileTimes::new()
                    .set_accessed(past)
                    .set_modified(past),
            )
            .unwrap();
        std::fs::write(&newer, &payload).unwrap();

        let key = json!({"op": "evict"});
        m.save_to_cache(&newer, &key, "c", "bin").unwrap();

        let total: u64 = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter_map(|e| e.metadata().ok().map(|m| m.len()))
            .sum();
        assert!(total <= 1024 * 1024 + 1024, "total {total} exceeds budget");
        assert!(!old.exists(), "oldest entry should have been evicted");
    }
}
