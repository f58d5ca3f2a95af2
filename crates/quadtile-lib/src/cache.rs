//! Texture cache shared between tile trees
//!
//! Textures of released nodes are parked here so that a node recreated for
//! the same tile (after a zoom restructures the tree, for example) can pick
//! them up again without another read. The cache is bounded by a byte budget
//! and evicts least recently inserted or touched entries first. Evicted
//! entries are handed back to the caller, who owns releasing their textures
//! on the render thread.

use crate::mesh::MeshBuffers;
use crate::state::CacheHints;
use crate::texture::Texture;
use lru::LruCache;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Default cache budget: 256 MiB
pub const DEFAULT_CACHE_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Cache handle shared by every tree drawing from it
pub type SharedTextureCache = Arc<Mutex<TextureCache>>;

/// Key of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Pixels of one tile of a dataset
    Tile {
        uri: Arc<str>,
        level: u32,
        column: i64,
        row: i64,
    },
    /// Persisted precise vertex coordinates of a dataset
    Coords { uri: Arc<str> },
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Tile {
                uri,
                level,
                column,
                row,
            } => write!(f, "{uri},{level},{column},{row}"),
            CacheKey::Coords { uri } => write!(f, "{uri},coords"),
        }
    }
}

/// A parked texture plus its mesh, or an opaque payload
#[derive(Debug, Default)]
pub struct CacheEntry {
    pub texture: Option<Texture>,
    pub mesh: Option<MeshBuffers>,
    pub hints: CacheHints,
    pub payload: Option<Vec<u8>>,
}

impl CacheEntry {
    #[inline]
    pub fn has_hint(&self, hint: CacheHints) -> bool {
        self.hints.contains(hint)
    }

    pub fn size_bytes(&self) -> usize {
        self.texture.as_ref().map_or(0, Texture::size_bytes)
            + self.mesh.as_ref().map_or(0, MeshBuffers::size_bytes)
            + self.payload.as_ref().map_or(0, Vec::len)
    }
}

/// Byte-budgeted LRU store of [`CacheEntry`]s
pub struct TextureCache {
    entries: LruCache<CacheKey, CacheEntry>,
    budget_bytes: usize,
    used_bytes: usize,
}

impl fmt::Debug for TextureCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureCache")
            .field("entries", &self.entries.len())
            .field("used_bytes", &self.used_bytes)
            .field("budget_bytes", &self.budget_bytes)
            .finish()
    }
}

impl Default for TextureCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_BUDGET_BYTES)
    }
}

impl TextureCache {
    pub fn new(budget_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            budget_bytes,
            used_bytes: 0,
        }
    }

    /// Wrap a new cache for sharing between trees
    pub fn shared(budget_bytes: usize) -> SharedTextureCache {
        Arc::new(Mutex::new(Self::new(budget_bytes)))
    }

    /// Insert an entry, returning whatever it displaced
    ///
    /// The result holds the previous entry under `key` (if any) followed by
    /// entries evicted to get back under budget. An entry larger than the
    /// whole budget is returned immediately instead of being stored.
    pub fn put(&mut self, key: CacheKey, entry: CacheEntry) -> Vec<CacheEntry> {
        let mut displaced = Vec::new();
        let size = entry.size_bytes();
        if size > self.budget_bytes {
            tracing::debug!("cache entry {key} ({size} bytes) exceeds budget, not cached");
            displaced.push(entry);
            return displaced;
        }

        if let Some(previous) = self.entries.put(key, entry) {
            self.used_bytes -= previous.size_bytes();
            displaced.push(previous);
        }
        self.used_bytes += size;

        while self.used_bytes > self.budget_bytes {
            match self.entries.pop_lru() {
                Some((evicted_key, evicted)) => {
                    tracing::trace!("evicting cache entry {evicted_key}");
                    self.used_bytes -= evicted.size_bytes();
                    displaced.push(evicted);
                }
                None => break,
            }
        }
        displaced
    }

    /// Peek at an entry without changing its recency
    #[inline]
    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.peek(key)
    }

    #[inline]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains(key)
    }

    /// Detach an entry; ownership moves to the caller
    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.used_bytes -= entry.size_bytes();
        Some(entry)
    }

    /// Detach every tile entry of one dataset, keeping its coordinate snapshot
    pub fn remove_dataset(&mut self, uri: &str) -> Vec<CacheEntry> {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter_map(|(key, _)| match key {
                CacheKey::Tile { uri: tile_uri, .. } if &**tile_uri == uri => Some(key.clone()),
                _ => None,
            })
            .collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Drop every entry, returning them for release
    pub fn clear(&mut self) -> Vec<CacheEntry> {
        self.used_bytes = 0;
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some((_, entry)) = self.entries.pop_lru() {
            drained.push(entry);
        }
        drained
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }

    #[inline]
    pub fn budget_bytes(&self) -> usize {
        self.budget_bytes
    }
}
