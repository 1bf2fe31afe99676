//! Storage seam for the cursor store: a two-key table with atomic pair
//! writes, implemented over an embedded fjall database or in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sundae_sync_common::Point;
use thiserror::Error;

pub mod fjall;
pub mod memory;

/// Virtual block number reserved for the per-usage tip row
pub const BLOCK_HIGH_WATER: u64 = u64::MAX;

#[derive(Debug, Error)]
#[error("storage fault: {0}")]
pub struct StorageError(#[from] pub anyhow::Error);

/// One row of the cursor table, keyed by (block, usage)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    pub block: u64,
    pub usage: String,
    pub point: Point,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tx_hashes: Vec<String>,

    /// Height of the newest saved block; present on tip rows only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_block: Option<u64>,

    /// Row expiry, unix seconds; absent on tip rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

/// Operations the cursor store needs from its table. Both mutations are
/// atomic: either every write in the call lands or none does.
#[async_trait]
pub trait CursorTable: Send + Sync {
    /// Consistent read of one row
    async fn get(&self, block: u64, usage: &str) -> Result<Option<CursorRecord>, StorageError>;

    /// Write an ordinary row and its tip row together
    async fn put_pair(&self, row: CursorRecord, tip: CursorRecord) -> Result<(), StorageError>;

    /// Delete the row at `block` while installing `tip` as the new tip row
    /// (or deleting the tip row when `tip` is `None`)
    async fn rollback_step(
        &self,
        tip: Option<CursorRecord>,
        block: u64,
        usage: &str,
    ) -> Result<(), StorageError>;
}
