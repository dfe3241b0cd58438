//! Record Persistence Seam
//!
//! The core only needs two things from storage: append a record, and read
//! back the records inside a time range. [`AppendStore`] captures that, and
//! [`StoreBackend`] is the closed set of implementations selectable from
//! configuration. Durable engines live outside the core and implement the
//! same trait.
//!
//! Records are owned values keyed by identifiers (request id, user id,
//! API-key id, model id); relationships are followed by querying, never by
//! holding references between records.

mod memory;

pub use memory::{MemoryStore, NullStore, Snapshot};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a record store
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Backend could not be reached
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// Backend refused the write
    #[error("record rejected by store: {0}")]
    Rejected(String),
}

/// Records that carry a creation timestamp
pub trait Timestamped {
    /// When the record was created
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Inclusive time range
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Earliest timestamp included
    pub start: DateTime<Utc>,
    /// Latest timestamp included
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Range between two instants
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Every representable timestamp
    #[must_use]
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    /// The trailing window ending now
    #[must_use]
    pub fn last(window: ChronoDuration) -> Self {
        let end = Utc::now();
        Self {
            start: end - window,
            end,
        }
    }

    /// Whether `ts` falls inside the range
    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Append + range-query contract for audit and usage records
#[async_trait]
pub trait AppendStore<T>: Send + Sync
where
    T: Timestamped + Clone + Send + Sync + 'static,
{
    /// Append one record
    async fn append(&self, record: T) -> Result<(), StoreError>;

    /// Records whose timestamp falls inside `range`, in append order
    async fn range(&self, range: TimeRange) -> Result<Vec<T>, StoreError>;

    /// Drop records older than `cutoff`, returning how many were removed
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Number of records currently held
    async fn len(&self) -> Result<usize, StoreError>;
}

/// Store implementations selectable from configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process chunked buffer
    #[default]
    Memory,
    /// Discard everything
    Null,
}

impl StoreBackend {
    /// Instantiate the backend for a record type
    #[must_use]
    pub fn build<T>(self) -> Arc<dyn AppendStore<T>>
    where
        T: Timestamped + Clone + Send + Sync + 'static,
    {
        match self {
            Self::Memory => Arc::new(MemoryStore::<T>::new()),
            Self::Null => Arc::new(NullStore),
        }
    }
}
