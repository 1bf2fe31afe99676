//! Chain-sync consumer: interprets roll-forward / roll-backward frames,
//! keeps the cursor current, and dispatches to user callbacks.

pub mod frames;
pub mod points;

use anyhow::{Context, Result};
use async_trait::async_trait;
use frames::{ChainSyncFrame, Direction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sundae_sync_common::{slots, ChainSyncCallbacks, SyncBlock, SyncOptions};
use sundae_sync_cursor_store::CursorStore;
use tracing::{debug, info, warn};

/// Alternative to [`ChainSyncCallbacks`] for services that want the raw
/// frame, bypassing interpretation and cursor management entirely
#[async_trait]
pub trait RawFrameHandler: Send + Sync {
    async fn handle(&self, raw: &[u8]) -> Result<()>;
}

enum Mode {
    Interpreted {
        cursor: CursorStore,
        usage: String,
        callbacks: Arc<dyn ChainSyncCallbacks>,
    },
    Generic(Arc<dyn RawFrameHandler>),
}

pub struct Consumer {
    options: SyncOptions,
    mode: Mode,

    /// Set once the first backward frame of this session has been seen;
    /// patch-replay mode swallows exactly that frame
    saw_first_backward: AtomicBool,
}

impl Consumer {
    /// A consumer that interprets frames and manages the cursor. The cursor
    /// usage defaults to the service name; override it with
    /// [`Self::with_cursor_usage`] to share the table across services.
    pub fn new(
        options: SyncOptions,
        cursor: CursorStore,
        service_name: &str,
        callbacks: Arc<dyn ChainSyncCallbacks>,
    ) -> Self {
        Self {
            options,
            mode: Mode::Interpreted {
                cursor,
                usage: service_name.to_string(),
                callbacks,
            },
            saw_first_backward: AtomicBool::new(false),
        }
    }

    /// A consumer that hands every raw frame to `handler`
    pub fn generic(options: SyncOptions, handler: Arc<dyn RawFrameHandler>) -> Self {
        Self {
            options,
            mode: Mode::Generic(handler),
            saw_first_backward: AtomicBool::new(false),
        }
    }

    pub fn with_cursor_usage(mut self, usage: &str) -> Self {
        if let Mode::Interpreted { usage: u, .. } = &mut self.mode {
            *u = usage.to_string();
        }
        self
    }

    /// Process a batch of frames in order, stopping at the first error
    pub async fn handle_batch(&self, frames: &[impl AsRef<[u8]>]) -> Result<()> {
        for frame in frames {
            self.handle_frame(frame.as_ref()).await?;
        }
        Ok(())
    }

    /// Process one serialized frame
    pub async fn handle_frame(&self, raw: &[u8]) -> Result<()> {
        if let Mode::Generic(handler) = &self.mode {
            return handler.handle(raw).await;
        }

        let frame: ChainSyncFrame =
            serde_json::from_slice(raw).context("failed to decode chain-sync frame")?;

        if let Some(find) = &frame.find_intersection {
            if let Some(point) = find.intersection.as_ref().and_then(|i| i.point()) {
                return self.on_roll_backward(point.slot, &point.id).await;
            }
            return Ok(());
        }

        if let Some(next) = &frame.next_block {
            match next.direction {
                Direction::Backward => {
                    if let Some(point) = next.point.as_ref().and_then(|p| p.point()) {
                        return self.on_roll_backward(point.slot, &point.id).await;
                    }
                }
                Direction::Forward => {
                    if let Some(block) = &next.block {
                        return self.on_roll_forward(block).await;
                    }
                }
            }
        }

        debug!("ignoring frame with no intersection or block");
        Ok(())
    }

    fn interpreted(&self) -> (&CursorStore, &str, &Arc<dyn ChainSyncCallbacks>) {
        match &self.mode {
            Mode::Interpreted {
                cursor,
                usage,
                callbacks,
            } => (cursor, usage, callbacks),
            // handle_frame diverts generic mode before interpretation
            Mode::Generic(_) => unreachable!("generic consumers do not interpret frames"),
        }
    }

    async fn on_roll_forward(&self, block: &SyncBlock) -> Result<()> {
        let (cursor, usage, callbacks) = self.interpreted();

        let block_time = slots::slot_to_time(block.slot, &self.options)?;
        info!(
            slot = block.slot,
            block_time,
            block_hash = %block.id,
            "roll forward"
        );

        if !self.options.dry_mode && !self.options.patch_replay {
            let tx_hashes: Vec<String> =
                block.transactions.iter().map(|tx| tx.id.clone()).collect();
            if let Err(e) = cursor.save(&block.point(), usage, &tx_hashes).await {
                warn!(slot = block.slot, error = %e, "failed to save point");
                return Err(e.into());
            }
        }

        callbacks.roll_forward_block(block).await?;

        let point = block.point();
        for tx in &block.transactions {
            callbacks.roll_forward_tx(&point, tx).await?;
        }
        Ok(())
    }

    async fn on_roll_backward(&self, slot: u64, id: &str) -> Result<()> {
        let (cursor, usage, callbacks) = self.interpreted();

        info!(slot, block = %id, "rolling backward");

        if self.options.patch_replay && !self.saw_first_backward.swap(true, Ordering::SeqCst) {
            // An upstream replay session always opens with a backward to its
            // start point; committed work must survive it.
            info!(slot, "patch-replay: ignoring first backward");
            return Ok(());
        }

        if self.options.dry_mode || self.options.patch_replay {
            return callbacks.roll_backward(0, &[]).await;
        }

        cursor
            .rollback(slot, usage, |block, txs| {
                let callbacks = callbacks.clone();
                async move { callbacks.roll_backward(block, &txs).await }
            })
            .await?;
        Ok(())
    }
}
