//! Rewindable cursor persistence.
//!
//! Each usage keeps one ordinary row per saved block plus a tip row at the
//! [`BLOCK_HIGH_WATER`] sentinel recording the highest point ever saved.
//! Advancing writes both rows atomically; rolling back walks the structure
//! from the tip downward, undoing one block per atomic step until it meets
//! a block at or below the target slot.

pub mod tables;

use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use sundae_sync_common::Point;
use thiserror::Error;
use tracing::info;

pub use tables::{CursorRecord, CursorTable, StorageError, BLOCK_HIGH_WATER};

/// How long ordinary cursor rows are retained
const ROW_TTL_SECS: i64 = 15 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("no cursor for block {block} and usage {usage}")]
    NotFound { block: u64, usage: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("rollback callback failed at block {block}: {source}")]
    Callback { block: u64, source: anyhow::Error },
}

/// Cursor store over a [`CursorTable`]
#[derive(Clone)]
pub struct CursorStore {
    table: Arc<dyn CursorTable>,
}

impl CursorStore {
    pub fn new(table: Arc<dyn CursorTable>) -> Self {
        Self { table }
    }

    /// Consistent point read by (block, usage)
    pub async fn find_cursor(&self, block: u64, usage: &str) -> Result<Point, CursorError> {
        Ok(self.find_full_cursor(block, usage).await?.point)
    }

    /// Consistent full-record read by (block, usage)
    pub async fn find_full_cursor(
        &self,
        block: u64,
        usage: &str,
    ) -> Result<CursorRecord, CursorError> {
        self.table
            .get(block, usage)
            .await?
            .ok_or_else(|| CursorError::NotFound {
                block,
                usage: usage.to_string(),
            })
    }

    /// The highest point ever saved for this usage
    pub async fn tip(&self, usage: &str) -> Result<Point, CursorError> {
        self.find_cursor(BLOCK_HIGH_WATER, usage).await
    }

    /// Save an advance: the block's own row plus the rewritten tip row, in
    /// one atomic write
    pub async fn save(
        &self,
        point: &Point,
        usage: &str,
        tx_hashes: &[String],
    ) -> Result<(), CursorError> {
        let begin = Instant::now();
        let height = point.height_or_zero();

        let row = CursorRecord {
            block: height,
            usage: usage.to_string(),
            point: point.clone(),
            tx_hashes: tx_hashes.to_vec(),
            last_block: None,
            ttl: Some(unix_now() + ROW_TTL_SECS),
        };
        let tip = CursorRecord {
            block: BLOCK_HIGH_WATER,
            usage: usage.to_string(),
            point: point.clone(),
            tx_hashes: vec![],
            last_block: Some(height),
            ttl: None,
        };

        let result = self.table.put_pair(row, tip).await;
        info!(
            elapsed = ?begin.elapsed(),
            usage,
            height,
            ok = result.is_ok(),
            "saved point"
        );
        Ok(result?)
    }

    /// Roll the cursor back to the newest block whose slot is at or below
    /// `stop_at_slot`, invoking `callback` once per undone block with its tx
    /// hashes reversed. A missing tip row means there is nothing to do;
    /// missing intermediate rows are skipped (long replays do not save every
    /// block).
    pub async fn rollback<F, Fut>(
        &self,
        stop_at_slot: u64,
        usage: &str,
        mut callback: F,
    ) -> Result<(), CursorError>
    where
        F: FnMut(u64, Vec<String>) -> Fut + Send,
        Fut: Future<Output = Result<()>> + Send,
    {
        let Some(tip) = self.table.get(BLOCK_HIGH_WATER, usage).await? else {
            return Ok(()); // nothing ever saved, nothing to roll back
        };

        let mut block = tip.point.height_or_zero();
        loop {
            let Some(record) = self.table.get(block, usage).await? else {
                if block == 0 {
                    return Ok(());
                }
                block -= 1;
                continue;
            };

            if record.point.slot <= stop_at_slot {
                return Ok(());
            }

            let begin = Instant::now();
            let mut hashes = record.tx_hashes.clone();
            hashes.reverse();
            callback(block, hashes)
                .await
                .map_err(|source| CursorError::Callback { block, source })?;

            // The new tip is the nearest surviving row below this one; with
            // none left the tip row goes away too.
            let previous = self.find_below(block, usage).await?;
            let tip = previous.as_ref().map(|prev| CursorRecord {
                block: BLOCK_HIGH_WATER,
                usage: usage.to_string(),
                point: prev.point.clone(),
                tx_hashes: vec![],
                last_block: Some(prev.block),
                ttl: None,
            });
            self.table.rollback_step(tip, block, usage).await?;
            info!(elapsed = ?begin.elapsed(), block, usage, "rolled back block");

            match previous {
                Some(prev) => block = prev.block,
                None => return Ok(()),
            }
        }
    }

    async fn find_below(
        &self,
        block: u64,
        usage: &str,
    ) -> Result<Option<CursorRecord>, StorageError> {
        let mut candidate = block;
        while candidate > 0 {
            candidate -= 1;
            if let Some(record) = self.table.get(candidate, usage).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
