//! In-memory record buffers

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{AppendStore, StoreError, TimeRange, Timestamped};

/// Records per chunk
const CHUNK_SIZE: usize = 256;

/// Append-only buffer split into fixed-size chunks
///
/// Each chunk sits behind its own `Arc`. Readers clone the chunk list and
/// work on it without holding the lock. An append writes into the last chunk
/// in place; if a reader still holds that chunk, only that one chunk is
/// copied. Full chunks are never written again. Purging builds a filtered
/// copy and swaps the list, so a reader sees either the pre- or post-purge set.
pub struct MemoryStore<T> {
    chunks: RwLock<Vec<Arc<Vec<T>>>>,
}

/// Point-in-time view of a [`MemoryStore`]
#[derive(Debug)]
pub struct Snapshot<T> {
    chunks: Vec<Arc<Vec<T>>>,
}

impl<T> Snapshot<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.is_empty())
    }

    /// Records in append order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.chunks.iter().flat_map(|c| c.iter())
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&T> {
        self.chunks
            .get(index / CHUNK_SIZE)
            .and_then(|c| c.get(index % CHUNK_SIZE))
    }
}

impl<T: Clone> MemoryStore<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
        }
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Snapshot<T> {
        Snapshot {
            chunks: self.chunks.read().clone(),
        }
    }

    fn push(&self, record: T) {
        let mut chunks = self.chunks.write();
        match chunks.last_mut() {
            Some(last) if last.len() < CHUNK_SIZE => Arc::make_mut(last).push(record),
            _ => {
                let mut chunk = Vec::with_capacity(CHUNK_SIZE);
                chunk.push(record);
                chunks.push(Arc::new(chunk));
            }
        }
    }
}

impl<T: Clone> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> AppendStore<T> for MemoryStore<T>
where
    T: Timestamped + Clone + Send + Sync + 'static,
{
    async fn append(&self, record: T) -> Result<(), StoreError> {
        self.push(record);
        Ok(())
    }

    async fn range(&self, range: TimeRange) -> Result<Vec<T>, StoreError> {
        Ok(self
            .snapshot()
            .iter()
            .filter(|r| range.contains(r.timestamp()))
            .cloned()
            .collect())
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut chunks = self.chunks.write();
        let before: usize = chunks.iter().map(|c| c.len()).sum();
        let retained: Vec<T> = chunks
            .iter()
            .flat_map(|c| c.iter())
            .filter(|r| r.timestamp() >= cutoff)
            .cloned()
            .collect();
        let removed = before - retained.len();
        if removed > 0 {
            *chunks = retained
                .chunks(CHUNK_SIZE)
                .map(|c| {
                    let mut chunk = Vec::with_capacity(CHUNK_SIZE);
                    chunk.extend_from_slice(c);
                    Arc::new(chunk)
                })
                .collect();
        }
        Ok(removed)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.chunks.read().iter().map(|c| c.len()).sum())
    }
}

/// Store that accepts and discards every record
pub struct NullStore;

#[async_trait]
impl<T> AppendStore<T> for NullStore
where
    T: Timestamped + Clone + Send + Sync + 'static,
{
    async fn append(&self, _record: T) -> Result<(), StoreError> {
        Ok(())
    }

    async fn range(&self, _range: TimeRange) -> Result<Vec<T>, StoreError> {
        Ok(Vec::new())
    }

    async fn purge_before(&self, _cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}
