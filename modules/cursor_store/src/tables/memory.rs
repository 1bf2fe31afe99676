//! In-memory cursor table for tests and local runs

use super::{CursorRecord, CursorTable, StorageError, BLOCK_HIGH_WATER};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryTable {
    rows: Mutex<BTreeMap<(String, u64), CursorRecord>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows, tip rows included
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CursorTable for MemoryTable {
    async fn get(&self, block: u64, usage: &str) -> Result<Option<CursorRecord>, StorageError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(&(usage.to_string(), block)).cloned())
    }

    async fn put_pair(&self, row: CursorRecord, tip: CursorRecord) -> Result<(), StorageError> {
        let mut rows = self.rows.lock().unwrap();
        rows.insert((row.usage.clone(), row.block), row);
        rows.insert((tip.usage.clone(), tip.block), tip);
        Ok(())
    }

    async fn rollback_step(
        &self,
        tip: Option<CursorRecord>,
        block: u64,
        usage: &str,
    ) -> Result<(), StorageError> {
        let mut rows = self.rows.lock().unwrap();
        rows.remove(&(usage.to_string(), block));
        match tip {
            Some(tip) => {
                rows.insert((tip.usage.clone(), tip.block), tip);
            }
            None => {
                rows.remove(&(usage.to_string(), BLOCK_HIGH_WATER));
            }
        }
        Ok(())
    }
}
