//! User-callback seams: what a host service implements to receive chain
//! events from the consumer, syncer and replayer.

use crate::context::SyncContext;
use crate::types::{Point, SyncBlock, SyncTx};
use anyhow::Result;
use async_trait::async_trait;

/// Callbacks invoked by the chain-sync consumer. All default to no-ops so a
/// service implements only the granularity it cares about.
#[async_trait]
pub trait ChainSyncCallbacks: Send + Sync {
    /// A block rolled forward
    async fn roll_forward_block(&self, _block: &SyncBlock) -> Result<()> {
        Ok(())
    }

    /// A transaction rolled forward; called once per transaction in source
    /// order, after [`Self::roll_forward_block`]
    async fn roll_forward_tx(&self, _point: &Point, _tx: &SyncTx) -> Result<()> {
        Ok(())
    }

    /// A block was rolled back. `tx_ids` are the block's transactions in
    /// reverse of their apply order.
    async fn roll_backward(&self, _block: u64, _tx_ids: &[String]) -> Result<()> {
        Ok(())
    }
}

/// Per-transaction apply/undo logic driven by the syncer and the replayer
#[async_trait]
pub trait TxProcessor<Tx: Send + Sync>: Send + Sync {
    async fn advance(&self, cx: &SyncContext, tx: &Tx, slot: u64, index: usize) -> Result<()>;

    async fn undo(&self, _cx: &SyncContext, _tx: &Tx, _slot: u64, _index: usize) -> Result<()> {
        Ok(())
    }
}
