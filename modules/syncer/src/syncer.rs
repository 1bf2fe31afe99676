//! Pipelined block syncer: block contents download in parallel while whole
//! blocks apply strictly in order. Within a block, transactions advance in
//! source order and undo in reverse order.

pub mod downloader;
pub mod single;

use anyhow::{anyhow, bail, Context, Result};
use downloader::Downloader;
use futures::FutureExt;
use serde::Deserialize;
use serde_with::{hex::Hex, serde_as};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use sundae_sync_common::{BlockDecoder, ChainBlock, SyncContext, TxProcessor};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// One message from the sync stream: blocks to undo, then one to apply
#[derive(Debug, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub undo: Vec<WireBlock>,
    pub advance: WireBlock,
}

#[serde_as]
#[derive(Debug, Deserialize)]
pub struct WireBlock {
    #[serde(default)]
    pub index: u64,
    #[serde_as(as = "Hex")]
    pub hash: Vec<u8>,
}

/// A block whose contents arrive asynchronously from a downloader task
struct PendingBlock {
    hash: Vec<u8>,
    contents: oneshot::Receiver<Result<Vec<u8>>>,
}

struct Submitted {
    undo: Vec<PendingBlock>,
    advance: PendingBlock,
    finished: oneshot::Sender<Result<()>>,
}

/// Submission half of the syncer. Dropping it ends the consumer task once
/// the queue drains.
pub struct Syncer {
    downloader: Arc<dyn Downloader>,
    events: mpsc::Sender<Submitted>,
    cancel: CancellationToken,
}

impl Syncer {
    /// Create the syncer and spawn its single consumer task. The task runs
    /// until the syncer is dropped, a message fails, or `cancel` fires; its
    /// handle resolves to the first error.
    pub fn spawn<D>(
        downloader: Arc<dyn Downloader>,
        decoder: Arc<D>,
        processor: Arc<dyn TxProcessor<<D::Block as ChainBlock>::Tx>>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<Result<()>>)
    where
        D: BlockDecoder + 'static,
    {
        let (events, receiver) = mpsc::channel(16);
        let consumer = tokio::spawn(consume(receiver, decoder, processor, cancel.clone()));
        (
            Self {
                downloader,
                events,
                cancel,
            },
            consumer,
        )
    }

    /// Submit one serialized message: schedule its downloads, queue it for
    /// in-order application, and return the channel its result arrives on.
    pub async fn handle_one(&self, data: &[u8]) -> oneshot::Receiver<Result<()>> {
        let (finished, result) = oneshot::channel();

        let message: WireMessage = match serde_json::from_slice(data)
            .context("failed to decode sync message")
        {
            Ok(message) => message,
            Err(e) => {
                let _ = finished.send(Err(e));
                return result;
            }
        };

        let undo = message.undo.into_iter().map(|b| self.fetch(b)).collect();
        let advance = self.fetch(message.advance);

        let submitted = Submitted {
            undo,
            advance,
            finished,
        };
        if let Err(send_error) = self.events.send(submitted).await {
            // the consumer stopped on an earlier error
            let _ = send_error.0.finished.send(Err(anyhow!("syncer stopped")));
        }
        result
    }

    /// Start a parallel download feeding the block's contents slot
    fn fetch(&self, block: WireBlock) -> PendingBlock {
        let (sender, contents) = oneshot::channel();
        let downloader = self.downloader.clone();
        let cancel = self.cancel.clone();
        let hash = block.hash.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(anyhow!("cancelled")),
                fetched = downloader.download_block(&hash) => fetched,
            };
            let _ = sender.send(outcome);
        });
        PendingBlock {
            hash: block.hash,
            contents,
        }
    }
}

async fn consume<D>(
    mut events: mpsc::Receiver<Submitted>,
    decoder: Arc<D>,
    processor: Arc<dyn TxProcessor<<D::Block as ChainBlock>::Tx>>,
    cancel: CancellationToken,
) -> Result<()>
where
    D: BlockDecoder + 'static,
{
    while let Some(message) = events.recv().await {
        let Submitted {
            undo,
            advance,
            finished,
        } = message;

        let work = process_message(decoder.as_ref(), processor.as_ref(), &cancel, undo, advance);
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let cause = panic_message(&panic);
                warn!(cause, "panic while processing blocks, aborting");
                Err(anyhow!("panic while processing blocks, aborting: {cause}"))
            }
        };

        match outcome {
            Ok(()) => {
                let _ = finished.send(Ok(()));
            }
            Err(e) => {
                let text = e.to_string();
                let _ = finished.send(Err(e));
                bail!(text);
            }
        }
    }
    Ok(())
}

async fn process_message<D>(
    decoder: &D,
    processor: &dyn TxProcessor<<D::Block as ChainBlock>::Tx>,
    cancel: &CancellationToken,
    undo: Vec<PendingBlock>,
    advance: PendingBlock,
) -> Result<()>
where
    D: BlockDecoder,
{
    let cx = SyncContext::live(cancel.clone());

    for block in undo {
        let decoded = receive_block(decoder, cancel, block).await.map_err(|e| {
            warn!(error = %e, "error decoding block for undo");
            e
        })?;
        let slot = decoded.slot();
        // undo in reverse of the order the transactions were applied
        for (index, tx) in decoded.transactions().iter().rev().enumerate() {
            processor.undo(&cx, tx, slot, index).await.map_err(|e| {
                warn!(error = %e, "error executing undo logic for transaction");
                e
            })?;
        }
    }

    let decoded = receive_block(decoder, cancel, advance).await.map_err(|e| {
        warn!(error = %e, "error decoding block for advance");
        e
    })?;
    let slot = decoded.slot();
    for (index, tx) in decoded.transactions().iter().enumerate() {
        processor.advance(&cx, tx, slot, index).await.map_err(|e| {
            warn!(error = %e, "error executing advance logic for transaction");
            e
        })?;
    }

    Ok(())
}

async fn receive_block<D>(
    decoder: &D,
    cancel: &CancellationToken,
    block: PendingBlock,
) -> Result<D::Block>
where
    D: BlockDecoder,
{
    let contents = tokio::select! {
        _ = cancel.cancelled() => bail!("cancelled"),
        received = block.contents => {
            received.map_err(|_| anyhow!("downloader dropped without delivering block"))??
        }
    };
    decode_block(decoder, &block.hash, &contents)
}

/// Byte 0 is the container marker, byte 1 the era tag, the rest the body
fn decode_block<D>(decoder: &D, hash: &[u8], contents: &[u8]) -> Result<D::Block>
where
    D: BlockDecoder,
{
    if contents.len() < 2 {
        bail!(
            "block {} is too short ({} bytes)",
            hex::encode(hash),
            contents.len()
        );
    }
    decoder
        .decode(contents[1], &contents[2..])
        .with_context(|| format!("decoding block {} (era {})", hex::encode(hash), contents[1]))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
