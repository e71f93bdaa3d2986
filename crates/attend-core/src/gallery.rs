//! Enrolled reference embeddings, held as an explicit snapshot.
//!
//! The gallery is owned by whoever runs recognition and is reloaded from
//! its [`GalleryStore`] after writes; there is no process-wide cache.

use crate::types::GalleryEntry;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("store backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Persistent source of gallery entries.
pub trait GalleryStore: Send {
    fn load_all(&self) -> Result<Vec<GalleryEntry>, StoreError>;
    /// Insert or replace the reference `(identity_id, label)`.
    fn upsert(&self, entry: &GalleryEntry) -> Result<(), StoreError>;
    /// Remove every reference of an identity. Returns the number removed.
    fn delete(&self, identity_id: &str) -> Result<usize, StoreError>;
}

/// In-memory snapshot of the enrolled gallery.
#[derive(Debug, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
    generation: u64,
    stale: bool,
}

impl Gallery {
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        let mut gallery = Self::default();
        gallery.replace(entries);
        gallery
    }

    /// Load a fresh snapshot from the store.
    pub fn load(store: &dyn GalleryStore) -> Result<Self, StoreError> {
        let mut gallery = Self::default();
        gallery.refresh(store)?;
        Ok(gallery)
    }

    /// Reload from the store unconditionally. Returns the new entry count.
    pub fn refresh(&mut self, store: &dyn GalleryStore) -> Result<usize, StoreError> {
        let entries = store.load_all()?;
        self.replace(entries);
        tracing::info!(
            entries = self.entries.len(),
            identities = self.identity_count(),
            generation = self.generation,
            "gallery loaded"
        );
        Ok(self.entries.len())
    }

    /// Mark the snapshot as outdated; the next [`ensure_fresh`](Self::ensure_fresh) reloads it.
    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Reload only if invalidated. Returns whether a reload happened.
    ///
    /// On failure the previous snapshot stays in place and remains stale.
    pub fn ensure_fresh(&mut self, store: &dyn GalleryStore) -> Result<bool, StoreError> {
        if !self.stale {
            return Ok(false);
        }
        self.refresh(store)?;
        Ok(true)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identity_count(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.identity_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Incremented on every reload.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Most common embedding dimension, or `None` for an empty gallery.
    ///
    /// Ties resolve to the dimension seen first.
    pub fn dimension(&self) -> Option<usize> {
        let mut counts: HashMap<usize, usize> = HashMap::new();
        let mut order = Vec::new();
        for e in &self.entries {
            let n = counts.entry(e.embedding.dim()).or_insert(0);
            if *n == 0 {
                order.push(e.embedding.dim());
            }
            *n += 1;
        }
        let mut best: Option<(usize, usize)> = None;
        for dim in order {
            let n = counts[&dim];
            if best.map_or(true, |(_, best_n)| n > best_n) {
                best = Some((dim, n));
            }
        }
        best.map(|(dim, _)| dim)
    }

    fn replace(&mut self, entries: Vec<GalleryEntry>) {
        self.entries = entries;
        self.generation += 1;
        self.stale = false;

        if let Some(dim) = self.dimension() {
            let mismatched = self
                .entries
                .iter()
                .filter(|e| e.embedding.dim() != dim)
                .count();
            if mismatched > 0 {
                tracing::warn!(
                    mismatched,
                    dim,
                    "gallery contains entries with a different embedding dimension; they will never match"
                );
            }
        }
    }
}
