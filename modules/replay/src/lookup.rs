//! The height lookup index: maps a block height to the location (and hash)
//! of its archived contents. Batch reads may leave keys unprocessed under
//! load; the producer retries those.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fjall::{Database, Keyspace};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

/// One row of the lookup index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeightRecord {
    pub height: u64,
    /// Hex-encoded block hash
    pub hash: String,
    /// Object key relative to the block directory
    pub location: String,
}

/// Result of a batch read: rows that were found, plus keys the store asked
/// us to re-issue. Heights in neither list do not exist in the index.
#[derive(Debug, Default)]
pub struct BatchLookup {
    pub found: Vec<HeightRecord>,
    pub unprocessed: Vec<u64>,
}

#[async_trait]
pub trait LookupTable: Send + Sync {
    async fn batch_get(&self, heights: &[u64]) -> Result<BatchLookup>;
}

/// In-memory lookup for tests and local replays. Heights can be primed to
/// come back as unprocessed a number of times to exercise the retry path.
#[derive(Default)]
pub struct MemoryLookup {
    rows: Mutex<HashMap<u64, HeightRecord>>,
    unprocessed_budget: Mutex<HashMap<u64, usize>>,
}

impl MemoryLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: HeightRecord) {
        self.rows.lock().unwrap().insert(record.height, record);
    }

    /// Make `height` come back as unprocessed for the next `times` reads
    pub fn defer(&self, height: u64, times: usize) {
        self.unprocessed_budget.lock().unwrap().insert(height, times);
    }
}

#[async_trait]
impl LookupTable for MemoryLookup {
    async fn batch_get(&self, heights: &[u64]) -> Result<BatchLookup> {
        let rows = self.rows.lock().unwrap();
        let mut budget = self.unprocessed_budget.lock().unwrap();

        let mut result = BatchLookup::default();
        for height in heights {
            if let Some(remaining) = budget.get_mut(height) {
                if *remaining > 0 {
                    *remaining -= 1;
                    result.unprocessed.push(*height);
                    continue;
                }
            }
            if let Some(record) = rows.get(height) {
                result.found.push(record.clone());
            }
        }
        Ok(result)
    }
}

const LOOKUP_KEYSPACE: &str = "lookup";

/// Fjall-backed lookup index using the same pk/sk row shape as the hosted
/// table: pk `height:{N}`, sk `height`.
pub struct FjallLookup {
    #[allow(dead_code)]
    database: Database,
    lookup: Keyspace,
}

impl FjallLookup {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let database = Database::builder(path.as_ref())
            .open()
            .context("opening lookup database")?;
        let lookup = database.keyspace(LOOKUP_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        Ok(Self { database, lookup })
    }

    fn key(height: u64) -> String {
        format!("height:{height}\u{0}height")
    }

    pub fn insert(&self, record: &HeightRecord) -> Result<()> {
        self.lookup
            .insert(Self::key(record.height), serde_json::to_vec(record)?)?;
        Ok(())
    }
}

#[async_trait]
impl LookupTable for FjallLookup {
    async fn batch_get(&self, heights: &[u64]) -> Result<BatchLookup> {
        let mut result = BatchLookup::default();
        for height in heights {
            if let Some(bytes) = self.lookup.get(Self::key(*height))? {
                result
                    .found
                    .push(serde_json::from_slice(&bytes).context("decoding lookup record")?);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(height: u64) -> HeightRecord {
        HeightRecord {
            height,
            hash: format!("{height:016x}"),
            location: format!("blocks/by-height/{height}.cbor"),
        }
    }

    #[tokio::test]
    async fn memory_lookup_partitions_found_and_missing() {
        let lookup = MemoryLookup::new();
        lookup.insert(record(5));

        let result = lookup.batch_get(&[4, 5, 6]).await.unwrap();
        assert_eq!(result.found, vec![record(5)]);
        assert!(result.unprocessed.is_empty());
    }

    #[tokio::test]
    async fn deferred_heights_come_back_unprocessed() {
        let lookup = MemoryLookup::new();
        lookup.insert(record(5));
        lookup.defer(5, 2);

        for _ in 0..2 {
            let result = lookup.batch_get(&[5]).await.unwrap();
            assert!(result.found.is_empty());
            assert_eq!(result.unprocessed, vec![5]);
        }
        let result = lookup.batch_get(&[5]).await.unwrap();
        assert_eq!(result.found, vec![record(5)]);
    }

    #[tokio::test]
    async fn fjall_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let lookup = FjallLookup::new(dir.path()).unwrap();
        lookup.insert(&record(7)).unwrap();

        let result = lookup.batch_get(&[6, 7]).await.unwrap();
        assert_eq!(result.found, vec![record(7)]);
    }
}
