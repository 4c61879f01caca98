//! Content-addressed embedding cache.
//!
//! Entries are keyed by [`CacheKey`] (model name + text) and are written
//! once: a key that already exists is never rewritten. Each entry is a
//! vector plus a small JSON sidecar recording the model, creation time and
//! dimensionality.
//!
//! The filesystem backend writes every file to a unique temp path and
//! hard-links it into place, which fails if the destination exists. Two
//! processes racing on the same uncached key both compute the vector; the
//! first link wins and the other copy is dropped. There is no locking
//! beyond that.

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    cache_key::CacheKey,
    data_dir::DataDir,
    error::{Error, Result},
};

/// Metadata stored next to each cached vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSidecar {
    pub model: String,
    /// Unix timestamp (seconds) of the write.
    pub created_at: u64,
    pub dimensions: usize,
}

impl CacheSidecar {
    pub fn now(model: &str, dimensions: usize) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self {
            model: model.to_string(),
            created_at,
            dimensions,
        }
    }
}

/// Storage for cached vectors.
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>>;

    fn sidecar(&self, key: &CacheKey) -> Result<Option<CacheSidecar>>;

    /// Store a vector. Returns `false` without writing if the key exists.
    fn put(
        &self,
        key: &CacheKey,
        vector: &[f32],
        sidecar: &CacheSidecar,
    ) -> Result<bool>;

    fn contains(&self, key: &CacheKey) -> Result<bool>;

    /// Delete one entry. Returns `false` if the key was absent.
    fn remove(&self, key: &CacheKey) -> Result<bool>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every entry, returning how many were removed.
    fn clear(&self) -> Result<usize>;

    /// Where the cache lives, for status output.
    fn location(&self) -> String;
}

/// Which [`CacheBackend`] to use.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackendKind {
    #[default]
    Fs,
    Redb,
}

impl CacheBackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fs => "fs",
            Self::Redb => "redb",
        }
    }
}

impl FromStr for CacheBackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fs" | "filesystem" | "file" => Ok(Self::Fs),
            "redb" | "kv" => Ok(Self::Redb),
            _ => Err(Error::unsupported("cache backend", s)),
        }
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One `<key>.bin` vector file and one `<key>.json` sidecar per key,
/// sharded into subdirectories by the first two hex characters of the key.
///
/// Vectors are stored as raw `f32` values in native byte order
/// (little-endian on every supported target).
#[derive(Debug, Clone)]
pub struct FsCacheBackend {
    root: PathBuf,
}

impl FsCacheBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn shard(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.hex[..2])
    }

    fn vector_path(&self, key: &CacheKey) -> PathBuf {
        self.shard(key).join(format!("{}.bin", key.hex))
    }

    fn sidecar_path(&self, key: &CacheKey) -> PathBuf {
        self.shard(key).join(format!("{}.json", key.hex))
    }

    /// Write `bytes` to a unique temp file and link it to `dest`.
    /// Returns `false` without touching `dest` if it already exists.
    fn write_atomic(dest: &Path, bytes: &[u8]) -> Result<bool> {
        let tmp = dest.with_extension(format!(
            "tmp-{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, bytes)?;

        let linked = match fs::hard_link(&tmp, dest) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Ok(false)
            }
            Err(e) => Err(e),
        };
        fs::remove_file(&tmp)?;
        Ok(linked?)
    }

    fn shard_dirs(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut dirs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }
        Ok(dirs)
    }
}

impl CacheBackend for FsCacheBackend {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> {
        let path = self.vector_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if bytes.is_empty() || bytes.len() % size_of::<f32>() != 0 {
            warn!(
                path = %path.display(),
                len = bytes.len(),
                "ignoring corrupt cache entry"
            );
            return Ok(None);
        }
        Ok(Some(bytemuck::pod_collect_to_vec(&bytes)))
    }

    fn sidecar(&self, key: &CacheKey) -> Result<Option<CacheSidecar>> {
        let path = self.sidecar_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    fn put(
        &self,
        key: &CacheKey,
        vector: &[f32],
        sidecar: &CacheSidecar,
    ) -> Result<bool> {
        let dest = self.vector_path(key);
        if dest.exists() {
            return Ok(false);
        }
        fs::create_dir_all(self.shard(key))?;

        // The sidecar goes first so a visible vector always has metadata.
        Self::write_atomic(
            &self.sidecar_path(key),
            &serde_json::to_vec(sidecar)?,
        )?;
        Self::write_atomic(&dest, bytemuck::cast_slice(vector))
    }

    fn contains(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.vector_path(key).exists())
    }

    fn remove(&self, key: &CacheKey) -> Result<bool> {
        let mut removed = false;
        for path in [self.vector_path(key), self.sidecar_path(key)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        let mut count = 0;
        for dir in self.shard_dirs()? {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "bin") {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    fn clear(&self) -> Result<usize> {
        let count = self.len()?;
        for dir in self.shard_dirs()? {
            fs::remove_dir_all(dir)?;
        }
        Ok(count)
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

const VECTORS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("vectors");
const SIDECARS: TableDefinition<&str, &str> = TableDefinition::new("sidecars");

/// Cache entries in a redb database, one table for vectors and one for the
/// JSON sidecars.
pub struct RedbCacheBackend {
    db: Database,
    path: PathBuf,
}

impl RedbCacheBackend {
    /// Open or create a cache database at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use docrag::embedding_cache::{CacheBackend, RedbCacheBackend};
    ///
    /// let cache = RedbCacheBackend::open(&tmp.path().join("cache.redb")).unwrap();
    /// assert_eq!(cache.len().unwrap(), 0);
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(VECTORS)?;
        txn.open_table(SIDECARS)?;
        txn.commit()?;

        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    fn keys(&self) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;
        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (k, _) = entry?;
            keys.push(k.value().to_string());
        }
        Ok(keys)
    }
}

impl CacheBackend for RedbCacheBackend {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<f32>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;

        let Some(guard) = table.get(key.hex.as_str())? else {
            return Ok(None);
        };
        let bytes = guard.value();
        if bytes.is_empty() || bytes.len() % size_of::<f32>() != 0 {
            return Ok(None);
        }
        Ok(Some(bytemuck::pod_collect_to_vec(bytes)))
    }

    fn sidecar(&self, key: &CacheKey) -> Result<Option<CacheSidecar>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SIDECARS)?;
        match table.get(key.hex.as_str())? {
            Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
            None => Ok(None),
        }
    }

    fn put(
        &self,
        key: &CacheKey,
        vector: &[f32],
        sidecar: &CacheSidecar,
    ) -> Result<bool> {
        let sidecar = serde_json::to_string(sidecar)?;

        let txn = self.db.begin_write()?;
        let written = {
            let mut vectors = txn.open_table(VECTORS)?;
            if vectors.get(key.hex.as_str())?.is_some() {
                false
            } else {
                let mut guard = vectors
                    .insert_reserve(key.hex.as_str(), size_of_val(vector))?;
                guard.as_mut().copy_from_slice(bytemuck::cast_slice(vector));
                drop(guard);

                let mut sidecars = txn.open_table(SIDECARS)?;
                sidecars.insert(key.hex.as_str(), sidecar.as_str())?;
                true
            }
        };
        txn.commit()?;
        Ok(written)
    }

    fn contains(&self, key: &CacheKey) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;
        Ok(table.get(key.hex.as_str())?.is_some())
    }

    fn remove(&self, key: &CacheKey) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut vectors = txn.open_table(VECTORS)?;
            let mut sidecars = txn.open_table(SIDECARS)?;
            sidecars.remove(key.hex.as_str())?;
            vectors.remove(key.hex.as_str())?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    fn clear(&self) -> Result<usize> {
        let keys = self.keys()?;
        if keys.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write()?;
        {
            let mut vectors = txn.open_table(VECTORS)?;
            let mut sidecars = txn.open_table(SIDECARS)?;
            for key in &keys {
                vectors.remove(key.as_str())?;
                sidecars.remove(key.as_str())?;
            }
        }
        txn.commit()?;
        Ok(keys.len())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

impl std::fmt::Debug for RedbCacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbCacheBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Cache counters for status output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// The cache service handed to the embedder.
///
/// Backend failures never propagate out of [`get`](Self::get) or
/// [`put`](Self::put): they are logged and treated as a miss or a skipped
/// write.
pub struct EmbeddingCache {
    backend: Box<dyn CacheBackend>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    pub fn new(backend: Box<dyn CacheBackend>) -> Self {
        Self {
            backend,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Open the configured backend inside the data directory.
    pub fn open(kind: CacheBackendKind, data_dir: &DataDir) -> Result<Self> {
        let backend: Box<dyn CacheBackend> = match kind {
            CacheBackendKind::Fs => {
                Box::new(FsCacheBackend::new(data_dir.embedding_cache_dir()?))
            }
            CacheBackendKind::Redb => {
                Box::new(RedbCacheBackend::open(&data_dir.cache_db())?)
            }
        };
        Ok(Self::new(backend))
    }

    pub fn get(&self, model: &str, text: &str) -> Option<Vec<f32>> {
        let key = CacheKey::new(model, text);
        match self.backend.get(&key) {
            Ok(Some(vector)) => {
                debug!(key = %key, "embedding cache hit");
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(vector)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "embedding cache read failed");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, model: &str, text: &str, vector: &[f32]) {
        let key = CacheKey::new(model, text);
        let sidecar = CacheSidecar::now(model, vector.len());
        match self.backend.put(&key, vector, &sidecar) {
            Ok(true) => debug!(key = %key, "cached embedding"),
            Ok(false) => debug!(key = %key, "embedding already cached"),
            Err(e) => {
                warn!(key = %key, error = %e, "embedding cache write failed")
            }
        }
    }

    /// Drop one entry so the next [`put`](Self::put) can replace it.
    pub fn evict(&self, model: &str, text: &str) {
        let key = CacheKey::new(model, text);
        match self.backend.remove(&key) {
            Ok(true) => debug!(key = %key, "evicted cached embedding"),
            Ok(false) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "embedding cache evict failed")
            }
        }
    }

    pub fn backend(&self) -> &dyn CacheBackend {
        self.backend.as_ref()
    }

    pub fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            entries: self.backend.len()?,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }

    pub fn clear(&self) -> Result<usize> {
        self.backend.clear()
    }
}

impl std::fmt::Debug for EmbeddingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingCache")
            .field("location", &self.backend.location())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends(tmp: &tempfile::TempDir) -> Vec<Box<dyn CacheBackend>> {
        vec![
            Box::new(FsCacheBackend::new(tmp.path().join("fs"))),
            Box::new(
                RedbCacheBackend::open(&tmp.path().join("cache.redb")).unwrap(),
            ),
        ]
    }

    #[test]
    fn put_and_get() {
        let tmp = tempfile::tempdir().unwrap();
        for backend in backends(&tmp) {
            let key = CacheKey::new("m", "hello");
            let vector = vec![0.25_f32, -1.5, 3.0];
            let sidecar = CacheSidecar::now("m", 3);

            assert!(backend.get(&key).unwrap().is_none());
            assert!(!backend.contains(&key).unwrap());
            assert!(backend.put(&key, &vector, &sidecar).unwrap());

            assert_eq!(backend.get(&key).unwrap(), Some(vector));
            assert_eq!(backend.sidecar(&key).unwrap(), Some(sidecar));
            assert!(backend.contains(&key).unwrap());
            assert_eq!(backend.len().unwrap(), 1);
        }
    }

    #[test]
    fn write_once_per_key() {
        let tmp = tempfile::tempdir().unwrap();
        for backend in backends(&tmp) {
            let key = CacheKey::new("m", "hello");
            let sidecar = CacheSidecar::now("m", 2);
            assert!(backend.put(&key, &[1.0, 2.0], &sidecar).unwrap());
            assert!(!backend.put(&key, &[9.0, 9.0], &sidecar).unwrap());
            assert_eq!(backend.get(&key).unwrap(), Some(vec![1.0, 2.0]));
        }
    }

    #[test]
    fn remove_frees_the_key_for_a_new_write() {
        let tmp = tempfile::tempdir().unwrap();
        for backend in backends(&tmp) {
            let key = CacheKey::new("m", "hello");
            let sidecar = CacheSidecar::now("m", 2);
            backend.put(&key, &[1.0, 2.0], &sidecar).unwrap();

            assert!(backend.remove(&key).unwrap());
            assert!(!backend.remove(&key).unwrap());
            assert!(backend.sidecar(&key).unwrap().is_none());
            assert!(backend.put(&key, &[3.0, 4.0], &sidecar).unwrap());
            assert_eq!(backend.get(&key).unwrap(), Some(vec![3.0, 4.0]));
        }
    }

    #[test]
    fn fs_publish_never_overwrites_an_existing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("entry.bin");
        fs::write(&dest, b"first").unwrap();

        assert!(!FsCacheBackend::write_atomic(&dest, b"second").unwrap());
        assert_eq!(fs::read(&dest).unwrap(), b"first");
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 1);

        let fresh = tmp.path().join("fresh.bin");
        assert!(FsCacheBackend::write_atomic(&fresh, b"new").unwrap());
        assert_eq!(fs::read(&fresh).unwrap(), b"new");
    }

    #[test]
    fn clear_removes_everything() {
        let tmp = tempfile::tempdir().unwrap();
        for backend in backends(&tmp) {
            for text in ["a", "b", "c"] {
                let key = CacheKey::new("m", text);
                backend
                    .put(&key, &[1.0], &CacheSidecar::now("m", 1))
                    .unwrap();
            }
            assert_eq!(backend.len().unwrap(), 3);
            assert_eq!(backend.clear().unwrap(), 3);
            assert!(backend.is_empty().unwrap());
            assert!(backend.get(&CacheKey::new("m", "a")).unwrap().is_none());
        }
    }

    #[test]
    fn fs_layout_is_sharded_with_sidecar() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FsCacheBackend::new(tmp.path());
        let key = CacheKey::new("m", "hello");
        backend
            .put(&key, &[1.0, 2.0], &CacheSidecar::now("m", 2))
            .unwrap();

        let shard = tmp.path().join(&key.hex[..2]);
        assert!(shard.join(format!("{}.bin", key.hex)).exists());
        let raw =
            fs::read_to_string(shard.join(format!("{}.json", key.hex))).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["model"], "m");
        assert_eq!(json["dimensions"], 2);
        assert!(json["created_at"].is_u64());

        // No temp files left behind.
        let leftovers = fs::read_dir(&shard)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains("tmp-")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn fs_ignores_corrupt_vector_file() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FsCacheBackend::new(tmp.path());
        let key = CacheKey::new("m", "hello");
        fs::create_dir_all(tmp.path().join(&key.hex[..2])).unwrap();
        fs::write(backend.vector_path(&key), [1u8, 2, 3]).unwrap();
        assert!(backend.get(&key).unwrap().is_none());
    }

    #[test]
    fn redb_reopen_preserves_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.redb");
        let key = CacheKey::new("m", "x");
        {
            let backend = RedbCacheBackend::open(&path).unwrap();
            backend
                .put(&key, &[4.0, 5.0], &CacheSidecar::now("m", 2))
                .unwrap();
        }
        let backend = RedbCacheBackend::open(&path).unwrap();
        assert_eq!(backend.get(&key).unwrap(), Some(vec![4.0, 5.0]));
    }

    #[test]
    fn service_counts_hits_and_misses() {
        let tmp = tempfile::tempdir().unwrap();
        let cache =
            EmbeddingCache::new(Box::new(FsCacheBackend::new(tmp.path())));

        assert!(cache.get("m", "text").is_none());
        cache.put("m", "text", &[1.0, 2.0]);
        assert_eq!(cache.get("m", "text"), Some(vec![1.0, 2.0]));
        assert!(cache.get("other", "text").is_none());

        let stats = cache.stats().unwrap();
        assert_eq!(
            stats,
            CacheStats {
                entries: 1,
                hits: 1,
                misses: 2
            }
        );
    }

    #[test]
    fn backend_kind_parses() {
        assert_eq!("fs".parse::<CacheBackendKind>().unwrap(), CacheBackendKind::Fs);
        assert_eq!("REDB".parse::<CacheBackendKind>().unwrap(), CacheBackendKind::Redb);
        assert!("s3".parse::<CacheBackendKind>().is_err());
    }
}
