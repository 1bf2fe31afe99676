//! Replay of a single transaction, for debugging a consumer against one
//! block without standing up the whole pipeline.

use crate::downloader::Downloader;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sundae_sync_common::{BlockDecoder, ChainBlock, ChainTx, SyncContext, TxProcessor};
use tokio_util::sync::CancellationToken;

/// Resolves a transaction hash to the hash of its containing block
#[async_trait]
pub trait TxLocator: Send + Sync {
    async fn block_of(&self, tx_hash: &str) -> Result<Option<Vec<u8>>>;
}

/// Fetch the block holding `tx_hash`, decode it, and run the advance
/// callback for just that transaction.
pub async fn run_one<D>(
    locator: &dyn TxLocator,
    downloader: &dyn Downloader,
    decoder: &D,
    processor: &dyn TxProcessor<<D::Block as ChainBlock>::Tx>,
    tx_hash: &str,
) -> Result<()>
where
    D: BlockDecoder,
{
    let block_hash = locator
        .block_of(tx_hash)
        .await?
        .with_context(|| format!("transaction {tx_hash} not found"))?;

    let contents = downloader
        .download_block(&block_hash)
        .await
        .context("failed to download block")?;
    if contents.len() < 2 {
        bail!("block {} is too short", hex::encode(&block_hash));
    }

    let block = decoder
        .decode(contents[1], &contents[2..])
        .context("failed to parse block")?;

    let slot = block.slot();
    let cx = SyncContext::live(CancellationToken::new());
    for (index, tx) in block.transactions().iter().enumerate() {
        if tx.hash() == tx_hash {
            return processor
                .advance(&cx, tx, slot, index)
                .await
                .context("failed to advance tx");
        }
    }

    bail!(
        "unable to find transaction {tx_hash} in block {}",
        hex::encode(&block_hash)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{encode_container, TestBlock, TestDecoder, TestTx};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MapLocator(HashMap<String, Vec<u8>>);

    #[async_trait]
    impl TxLocator for MapLocator {
        async fn block_of(&self, tx_hash: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.0.get(tx_hash).cloned())
        }
    }

    struct MapDownloader(HashMap<Vec<u8>, Vec<u8>>);

    #[async_trait]
    impl Downloader for MapDownloader {
        async fn download_block(&self, hash: &[u8]) -> Result<Vec<u8>> {
            self.0
                .get(hash)
                .cloned()
                .with_context(|| format!("unknown block {}", hex::encode(hash)))
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, u64, usize)>>);

    #[async_trait]
    impl TxProcessor<TestTx> for Recorder {
        async fn advance(
            &self,
            _cx: &SyncContext,
            tx: &TestTx,
            slot: u64,
            index: usize,
        ) -> Result<()> {
            self.0.lock().unwrap().push((tx.hash.clone(), slot, index));
            Ok(())
        }
    }

    fn fixture() -> (MapLocator, MapDownloader) {
        let block = TestBlock {
            slot: 42,
            hash: "01".into(),
            txs: vec![
                TestTx { hash: "aa".into() },
                TestTx { hash: "bb".into() },
            ],
        };
        let locator = MapLocator(HashMap::from([
            ("aa".to_string(), vec![0x01]),
            ("bb".to_string(), vec![0x01]),
            ("lost".to_string(), vec![0x09]),
        ]));
        let downloader = MapDownloader(HashMap::from([(vec![0x01], encode_container(&block))]));
        (locator, downloader)
    }

    #[tokio::test]
    async fn advances_exactly_the_requested_tx() {
        let (locator, downloader) = fixture();
        let recorder = Recorder::default();

        run_one(&locator, &downloader, &TestDecoder, &recorder, "bb")
            .await
            .unwrap();

        assert_eq!(recorder.0.into_inner().unwrap(), vec![("bb".to_string(), 42, 1)]);
    }

    #[tokio::test]
    async fn unknown_tx_is_an_error() {
        let (locator, downloader) = fixture();
        let err = run_one(&locator, &downloader, &TestDecoder, &Recorder::default(), "zz")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn missing_block_is_an_error() {
        let (locator, downloader) = fixture();
        let err = run_one(&locator, &downloader, &TestDecoder, &Recorder::default(), "lost")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("download"));
    }
}
