use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::core::model::{ContentHash, Embedding, EmbeddingKind};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Store(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Process-wide store of embeddings keyed by content hash.
///
/// A miss is a normal outcome. Callers follow read-then-compute-then-write;
/// two writers racing on the same key store the same vector, so the cache
/// needs no coordination beyond its own storage.
pub trait EmbeddingCache: Send + Sync {
    fn get(&self, kind: EmbeddingKind, hash: &ContentHash) -> Option<Embedding>;

    fn put(&self, hash: &ContentHash, embedding: Embedding);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}

fn cache_key(kind: EmbeddingKind, hash: &ContentHash) -> String {
    format!("{}:{}", kind.as_str(), hash.as_str())
}

/// In-memory cache, unbounded or LRU-bounded.
pub struct MemoryEmbeddingCache {
    cache: Mutex<LruCache<String, Embedding>>,
}

impl MemoryEmbeddingCache {
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        let cache = match capacity.and_then(NonZeroUsize::new) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            cache: Mutex::new(cache),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Embedding>> {
        // Entries are plain values, a panic elsewhere cannot leave them torn.
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryEmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingCache for MemoryEmbeddingCache {
    fn get(&self, kind: EmbeddingKind, hash: &ContentHash) -> Option<Embedding> {
        self.lock().get(&cache_key(kind, hash)).cloned()
    }

    fn put(&self, hash: &ContentHash, embedding: Embedding) {
        let key = cache_key(embedding.kind, hash);
        self.lock().put(key, embedding);
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

/// Persistent cache backed by sled; survives restarts.
pub struct SledEmbeddingCache {
    db: sled::Db,
}

impl SledEmbeddingCache {
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let db = sled::open(path)?;
        log::debug!("Opened embedding cache at {}", path.display());
        Ok(Self { db })
    }

    pub fn flush(&self) -> Result<(), CacheError> {
        self.db.flush()?;
        Ok(())
    }

    fn try_get(&self, key: &str) -> Result<Option<Embedding>, CacheError> {
        match self.db.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn try_put(&self, key: &str, embedding: &Embedding) -> Result<(), CacheError> {
        let value = serde_json::to_vec(embedding)?;
        self.db.insert(key, value)?;
        Ok(())
    }
}

impl EmbeddingCache for SledEmbeddingCache {
    fn get(&self, kind: EmbeddingKind, hash: &ContentHash) -> Option<Embedding> {
        match self.try_get(&cache_key(kind, hash)) {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Embedding cache read failed for {}: {}", hash.short(), e);
                None
            }
        }
    }

    fn put(&self, hash: &ContentHash, embedding: Embedding) {
        let key = cache_key(embedding.kind, hash);
        if let Err(e) = self.try_put(&key, &embedding) {
            log::warn!("Embedding cache write failed for {}: {}", hash.short(), e);
        }
    }

    fn len(&self) -> usize {
        self.db.len()
    }

    fn clear(&self) {
        if let Err(e) = self.db.clear() {
            log::warn!("Failed to clear embedding cache: {}", e);
        }
    }
}

/// Build the cache described by `config`: sled when a path is set, memory
/// otherwise. Call once at startup and share the handle across batches.
pub fn open_cache(config: &EngineConfig) -> Result<Arc<dyn EmbeddingCache>, CacheError> {
    match &config.cache_path {
        Some(path) => Ok(Arc::new(SledEmbeddingCache::open(path)?)),
        None => Ok(Arc::new(MemoryEmbeddingCache::with_capacity(
            config.cache_capacity,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn embedding(kind: EmbeddingKind, hash: &str, value: f32) -> Embedding {
        Embedding {
            file_id: "f".to_string(),
            kind,
            vector: vec![value, 1.0],
            source_hash: ContentHash(hash.to_string()),
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = MemoryEmbeddingCache::new();
        let hash = ContentHash("abc".to_string());
        assert!(cache.get(EmbeddingKind::Text, &hash).is_none());

        cache.put(&hash, embedding(EmbeddingKind::Text, "abc", 0.5));
        let hit = cache.get(EmbeddingKind::Text, &hash).unwrap();
        assert_eq!(hit.vector, vec![0.5, 1.0]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_kinds_do_not_collide() {
        let cache = MemoryEmbeddingCache::new();
        let hash = ContentHash("same".to_string());
        cache.put(&hash, embedding(EmbeddingKind::Text, "same", 0.1));
        assert!(cache.get(EmbeddingKind::Image, &hash).is_none());
    }

    #[test]
    fn test_put_is_idempotent() {
        let cache = MemoryEmbeddingCache::new();
        let hash = ContentHash("abc".to_string());
        cache.put(&hash, embedding(EmbeddingKind::Text, "abc", 0.5));
        cache.put(&hash, embedding(EmbeddingKind::Text, "abc", 0.5));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = MemoryEmbeddingCache::with_capacity(Some(2));
        let (a, b, c) = (
            ContentHash("a".to_string()),
            ContentHash("b".to_string()),
            ContentHash("c".to_string()),
        );
        cache.put(&a, embedding(EmbeddingKind::Text, "a", 1.0));
        cache.put(&b, embedding(EmbeddingKind::Text, "b", 2.0));
        // touch a so b becomes the least recently used
        assert!(cache.get(EmbeddingKind::Text, &a).is_some());
        cache.put(&c, embedding(EmbeddingKind::Text, "c", 3.0));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(EmbeddingKind::Text, &a).is_some());
        assert!(cache.get(EmbeddingKind::Text, &b).is_none());
        assert!(cache.get(EmbeddingKind::Text, &c).is_some());
    }

    #[test]
    fn test_bounded_cache_keeps_most_recent_under_churn() {
        let cache = MemoryEmbeddingCache::with_capacity(Some(64));
        for i in 0..10_000 {
            let hash = ContentHash(format!("h{}", i));
            cache.put(&hash, embedding(EmbeddingKind::Text, "churn", i as f32));
        }

        assert_eq!(cache.len(), 64);
        assert!(cache.get(EmbeddingKind::Text, &ContentHash("h9999".to_string())).is_some());
        assert!(cache.get(EmbeddingKind::Text, &ContentHash("h9936".to_string())).is_some());
        assert!(cache.get(EmbeddingKind::Text, &ContentHash("h9935".to_string())).is_none());
        assert!(cache.get(EmbeddingKind::Text, &ContentHash("h0".to_string())).is_none());
    }

    #[test]
    fn test_concurrent_puts_same_key() {
        let cache = Arc::new(MemoryEmbeddingCache::new());
        let hash = ContentHash("shared".to_string());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let hash = hash.clone();
                std::thread::spawn(move || {
                    cache.put(&hash, embedding(EmbeddingKind::Image, "shared", 0.25));
                    cache.get(EmbeddingKind::Image, &hash)
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().is_some());
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sled_cache_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("embeddings");
        let hash = ContentHash("persisted".to_string());
        {
            let cache = SledEmbeddingCache::open(&path).unwrap();
            cache.put(&hash, embedding(EmbeddingKind::Image, "persisted", 0.75));
            cache.flush().unwrap();
        }

        let reopened = SledEmbeddingCache::open(&path).unwrap();
        let hit = reopened.get(EmbeddingKind::Image, &hash).unwrap();
        assert_eq!(hit.vector, vec![0.75, 1.0]);
        assert_eq!(reopened.len(), 1);

        reopened.clear();
        assert!(reopened.is_empty());
    }
}
