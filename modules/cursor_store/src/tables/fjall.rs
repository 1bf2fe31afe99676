//! Fjall-backed cursor table. Rows live in a single keyspace keyed by
//! big-endian block number followed by the usage string; pair writes go
//! through an atomic batch.

use super::{CursorRecord, CursorTable, StorageError, BLOCK_HIGH_WATER};
use anyhow::{Context, Result};
use async_trait::async_trait;
use fjall::{Database, Keyspace};
use std::path::Path;

const CURSORS_KEYSPACE: &str = "cursors";

pub struct FjallTable {
    database: Database,
    cursors: Keyspace,
}

impl FjallTable {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let database = Database::builder(path.as_ref())
            .open()
            .context("opening cursor database")?;
        let cursors = database.keyspace(CURSORS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        Ok(Self { database, cursors })
    }

    fn key(block: u64, usage: &str) -> Vec<u8> {
        let mut key = block.to_be_bytes().to_vec();
        key.extend_from_slice(usage.as_bytes());
        key
    }

    fn encode(record: &CursorRecord) -> Result<Vec<u8>> {
        serde_json::to_vec(record).context("encoding cursor record")
    }
}

#[async_trait]
impl CursorTable for FjallTable {
    async fn get(&self, block: u64, usage: &str) -> Result<Option<CursorRecord>, StorageError> {
        let Some(bytes) = self
            .cursors
            .get(Self::key(block, usage))
            .map_err(anyhow::Error::from)?
        else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes)
            .context("decoding cursor record")
            .map_err(StorageError)?;
        Ok(Some(record))
    }

    async fn put_pair(&self, row: CursorRecord, tip: CursorRecord) -> Result<(), StorageError> {
        let mut batch = self.database.batch();
        batch.insert(
            &self.cursors,
            Self::key(row.block, &row.usage),
            Self::encode(&row)?,
        );
        batch.insert(
            &self.cursors,
            Self::key(tip.block, &tip.usage),
            Self::encode(&tip)?,
        );
        batch.commit().map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn rollback_step(
        &self,
        tip: Option<CursorRecord>,
        block: u64,
        usage: &str,
    ) -> Result<(), StorageError> {
        let mut batch = self.database.batch();
        batch.remove(&self.cursors, Self::key(block, usage));
        match tip {
            Some(tip) => {
                batch.insert(
                    &self.cursors,
                    Self::key(tip.block, &tip.usage),
                    Self::encode(&tip)?,
                );
            }
            None => {
                batch.remove(&self.cursors, Self::key(BLOCK_HIGH_WATER, usage));
            }
        }
        batch.commit().map_err(anyhow::Error::from)?;
        Ok(())
    }
}
