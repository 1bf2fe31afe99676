//! Parallel replay of archived blocks.
//!
//! A single producer walks the lookup index from the start height and feeds
//! a worker pool in strictly ascending height order. Workers read each
//! block from the local mount, decode it, and run the advance callback per
//! transaction. Cross-height data dependencies are expressed by the
//! callbacks through [`SyncContext::wait_for_tx`] and
//! [`SyncContext::wait_for_height`]; the height tracker's watermark keeps
//! those waits bounded and deadlock-free, since dependencies only ever
//! point backwards and the producer emits every earlier height first.

pub mod lookup;
pub mod tracker;

use anyhow::{bail, Context, Result};
use lookup::{HeightRecord, LookupTable};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sundae_sync_common::{BlockDecoder, ChainBlock, ChainTx, SyncContext, TxProcessor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracker::{HeightTracker, WaitStats};
use tracing::{info, warn};

/// Keys per lookup round trip
const LOOKUP_BATCH: usize = 100;

/// Lookup retry attempts before giving up on a batch
const LOOKUP_ATTEMPTS: u32 = 5;

/// Consecutive absent heights before the producer declares the tip reached
const MAX_CONSECUTIVE_MISSES: usize = 100;

#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Local mount of the block archive
    pub block_dir: PathBuf,
    /// First height to process
    pub start_height: u64,
    /// Parallel workers (64 when zero)
    pub workers: usize,
}

impl ReplayConfig {
    pub fn new(block_dir: impl Into<PathBuf>, start_height: u64) -> Self {
        Self {
            block_dir: block_dir.into(),
            start_height,
            workers: 0,
        }
    }

    fn worker_count(&self) -> usize {
        if self.workers == 0 {
            64
        } else {
            self.workers
        }
    }

    /// Heights between progress log lines
    fn progress_interval(&self) -> u64 {
        (10 * self.worker_count() as u64).clamp(100, 10_000)
    }
}

/// Outcome of a completed replay
#[derive(Debug, Clone, Copy)]
pub struct ReplayStats {
    pub processed: u64,
    pub watermark: u64,
    pub waits: WaitStats,
}

pub struct Replayer<D: BlockDecoder> {
    lookup: Arc<dyn LookupTable>,
    decoder: Arc<D>,
    processor: Arc<dyn TxProcessor<<D::Block as ChainBlock>::Tx>>,
    config: ReplayConfig,
}

impl<D: BlockDecoder + 'static> Replayer<D> {
    pub fn new(
        lookup: Arc<dyn LookupTable>,
        decoder: Arc<D>,
        processor: Arc<dyn TxProcessor<<D::Block as ChainBlock>::Tx>>,
        config: ReplayConfig,
    ) -> Self {
        Self {
            lookup,
            decoder,
            processor,
            config,
        }
    }

    /// Replay every archived height from the start height to the tip.
    /// Returns after the producer has exhausted the index and all workers
    /// have drained, or at the first error.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ReplayStats> {
        let workers = self.config.worker_count();
        let tracker = Arc::new(HeightTracker::new(self.config.start_height));

        // the first error cancels everything, producer included, so a
        // worker parked in the tracker can never wait on a dead pipeline
        let cancel = cancel.child_token();

        let (work_sender, work_receiver) = mpsc::channel::<HeightRecord>(workers * 2);
        let work_receiver = Arc::new(tokio::sync::Mutex::new(work_receiver));

        let producer = {
            let lookup = self.lookup.clone();
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            let start = self.config.start_height;
            tokio::spawn(async move {
                let result = produce_heights(lookup, tracker, work_sender, cancel.clone(), start).await;
                if result.is_err() {
                    cancel.cancel();
                }
                result
            })
        };

        let processed = Arc::new(AtomicU64::new(0));
        let first_error: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
        let interval = self.config.progress_interval();

        let mut worker_handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let work_receiver = work_receiver.clone();
            let tracker = tracker.clone();
            let cancel = cancel.clone();
            let processed = processed.clone();
            let first_error = first_error.clone();
            let block_dir = self.config.block_dir.clone();
            let decoder = self.decoder.clone();
            let processor = self.processor.clone();

            worker_handles.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let record = { work_receiver.lock().await.recv().await };
                    let Some(record) = record else {
                        return; // producer closed the queue
                    };

                    let height = record.height;
                    let outcome = process_height(
                        &block_dir,
                        decoder.as_ref(),
                        processor.as_ref(),
                        &tracker,
                        &cancel,
                        record,
                    )
                    .await;

                    if let Err(e) = outcome {
                        let mut slot = first_error.lock().unwrap();
                        if slot.is_none() {
                            *slot = Some(e.context(format!("height {height}")));
                        }
                        drop(slot);
                        cancel.cancel();
                        return;
                    }

                    let n = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % interval == 0 {
                        info!(
                            processed = n,
                            height,
                            watermark = tracker.watermark(),
                            "replay progress"
                        );
                    }
                }
            }));
        }

        for handle in worker_handles {
            let _ = handle.await;
        }
        let producer_result = producer.await.unwrap_or_else(|e| Err(e.into()));

        let stats = ReplayStats {
            processed: processed.load(Ordering::Relaxed),
            watermark: tracker.watermark(),
            waits: tracker.wait_stats(),
        };
        info!(total = stats.processed, "replay complete");

        if let Some(e) = first_error.lock().unwrap().take() {
            return Err(e);
        }
        producer_result?;
        Ok(stats)
    }
}

/// Walk consecutive heights from `start`, dispatching index hits to the
/// work queue in ascending order. Absent heights are marked done at once so
/// nothing ever waits on them; enough consecutive absences mean the archive
/// has run out.
async fn produce_heights(
    lookup: Arc<dyn LookupTable>,
    tracker: Arc<HeightTracker>,
    work: mpsc::Sender<HeightRecord>,
    cancel: CancellationToken,
    start: u64,
) -> Result<()> {
    let mut misses = 0usize;
    let mut next = start;

    loop {
        if cancel.is_cancelled() {
            bail!("replay cancelled");
        }

        let window: Vec<u64> = (next..next + LOOKUP_BATCH as u64).collect();
        let found = batch_get_with_retry(lookup.as_ref(), &cancel, &window).await?;

        for height in window {
            match found.get(&height) {
                Some(record) => {
                    misses = 0;
                    tokio::select! {
                        _ = cancel.cancelled() => bail!("replay cancelled"),
                        sent = work.send(record.clone()) => {
                            if sent.is_err() {
                                bail!("replay workers are gone");
                            }
                        }
                    }
                }
                None => {
                    misses += 1;
                    // waiters must not block on a height that will never run
                    tracker.mark_done(height);
                    if misses >= MAX_CONSECUTIVE_MISSES {
                        info!(
                            last_height = height.saturating_sub(misses as u64),
                            "reached chain tip"
                        );
                        return Ok(());
                    }
                }
            }
        }
        next += LOOKUP_BATCH as u64;
    }
}

async fn batch_get_with_retry(
    lookup: &dyn LookupTable,
    cancel: &CancellationToken,
    window: &[u64],
) -> Result<HashMap<u64, HeightRecord>> {
    let mut found = HashMap::new();
    let mut pending: Vec<u64> = window.to_vec();

    for attempt in 0..LOOKUP_ATTEMPTS {
        if attempt > 0 {
            let backoff = Duration::from_millis(100) * 2u32.pow(attempt - 1);
            tokio::select! {
                _ = cancel.cancelled() => bail!("replay cancelled"),
                _ = tokio::time::sleep(backoff) => {}
            }
            warn!(attempt, keys = pending.len(), "retrying unprocessed lookup keys");
        }

        let batch = lookup
            .batch_get(&pending)
            .await
            .with_context(|| format!("lookup batch at {}..", window[0]))?;
        for record in batch.found {
            found.insert(record.height, record);
        }
        if batch.unprocessed.is_empty() {
            return Ok(found);
        }
        pending = batch.unprocessed;
    }

    bail!(
        "lookup left {} keys unprocessed after {LOOKUP_ATTEMPTS} attempts",
        pending.len()
    )
}

/// Read, decode and advance one block, then mark its height done
async fn process_height<D>(
    block_dir: &std::path::Path,
    decoder: &D,
    processor: &dyn TxProcessor<<D::Block as ChainBlock>::Tx>,
    tracker: &Arc<HeightTracker>,
    cancel: &CancellationToken,
    record: HeightRecord,
) -> Result<()>
where
    D: BlockDecoder,
{
    let path = block_dir.join(&record.location);
    let contents = tokio::fs::read(&path)
        .await
        .with_context(|| format!("read block {}", path.display()))?;
    if contents.len() < 2 {
        bail!("block file too short: {}", path.display());
    }

    // byte 0 is the container marker, byte 1 the era tag
    let block = decoder
        .decode(contents[1], &contents[2..])
        .with_context(|| format!("decode block {} (era {})", record.hash, contents[1]))?;

    let slot = block.slot();
    let cx = SyncContext::replay(tracker.clone(), cancel.clone());

    for (index, tx) in block.transactions().iter().enumerate() {
        if cancel.is_cancelled() {
            bail!("replay cancelled");
        }
        let tx_hash = tx.hash();
        let tx_cx = cx.at(record.height, tx_hash.clone());
        processor
            .advance(&tx_cx, tx, slot, index)
            .await
            .with_context(|| format!("tx {tx_hash}"))?;
        // other workers parked in wait_for_tx may now proceed
        tracker.mark_tx_processed(&tx_hash, record.height);
    }

    tracker.mark_done(record.height);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::lookup::MemoryLookup;
    use super::*;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestTx {
        hash: String,
    }

    impl ChainTx for TestTx {
        fn hash(&self) -> String {
            self.hash.clone()
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestBlock {
        slot: u64,
        hash: String,
        txs: Vec<TestTx>,
    }

    impl ChainBlock for TestBlock {
        type Tx = TestTx;

        fn slot(&self) -> u64 {
            self.slot
        }

        fn hash(&self) -> String {
            self.hash.clone()
        }

        fn transactions(&self) -> &[TestTx] {
            &self.txs
        }
    }

    struct TestDecoder;

    impl BlockDecoder for TestDecoder {
        type Block = TestBlock;

        fn decode(&self, _era: u8, body: &[u8]) -> Result<Self::Block> {
            Ok(serde_json::from_slice(body)?)
        }
    }

    /// An archive on disk plus its lookup index
    struct Archive {
        dir: TempDir,
        lookup: Arc<MemoryLookup>,
    }

    impl Archive {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                lookup: Arc::new(MemoryLookup::new()),
            }
        }

        fn add_block(&self, height: u64, slot: u64, txs: &[&str]) {
            let block = TestBlock {
                slot,
                hash: format!("{height:08x}"),
                txs: txs.iter().map(|h| TestTx { hash: h.to_string() }).collect(),
            };
            let location = format!("blocks/{height}.cbor");
            let path = self.dir.path().join(&location);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let mut bytes = vec![0x82, 0x06];
            bytes.extend(serde_json::to_vec(&block).unwrap());
            std::fs::write(path, bytes).unwrap();

            self.lookup.insert(HeightRecord {
                height,
                hash: block.hash.clone(),
                location,
            });
        }

        fn replayer(
            &self,
            start_height: u64,
            workers: usize,
            processor: Arc<dyn TxProcessor<TestTx>>,
        ) -> Replayer<TestDecoder> {
            let mut config = ReplayConfig::new(self.dir.path(), start_height);
            config.workers = workers;
            Replayer::new(self.lookup.clone(), Arc::new(TestDecoder), processor, config)
        }
    }

    /// Advance callback assembled from closures-by-name behaviours
    #[derive(Default)]
    struct Script {
        seen: StdMutex<Vec<String>>,
        wait_tx: StdMutex<HashMap<String, String>>,
        delay: StdMutex<HashMap<String, Duration>>,
        fail_on: Option<String>,
        self_wait_on: Option<String>,
    }

    impl Script {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TxProcessor<TestTx> for Script {
        async fn advance(
            &self,
            cx: &SyncContext,
            tx: &TestTx,
            _slot: u64,
            _index: usize,
        ) -> Result<()> {
            assert!(cx.is_replay());

            let delay = self.delay.lock().unwrap().get(&tx.hash).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_on.as_deref() == Some(tx.hash.as_str()) {
                bail!("scripted failure for {}", tx.hash);
            }
            if self.self_wait_on.as_deref() == Some(tx.hash.as_str()) {
                cx.wait_for_tx(&tx.hash).await?;
            }
            let dependency = self.wait_tx.lock().unwrap().get(&tx.hash).cloned();
            if let Some(dependency) = dependency {
                cx.wait_for_tx(&dependency).await?;
            }

            self.seen.lock().unwrap().push(tx.hash.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn replays_all_archived_heights() {
        let archive = Archive::new();
        for height in 10..15 {
            archive.add_block(height, height * 10, &[&format!("tx{height}")]);
        }

        let script = Arc::new(Script::default());
        let replayer = archive.replayer(10, 4, script.clone());
        let stats = replayer.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.processed, 5);
        assert_eq!(stats.watermark, 10 + 4 + MAX_CONSECUTIVE_MISSES as u64);
        let mut seen = script.seen();
        seen.sort();
        assert_eq!(seen, vec!["tx10", "tx11", "tx12", "tx13", "tx14"]);
    }

    #[tokio::test]
    async fn empty_archive_reaches_tip_immediately() {
        let archive = Archive::new();
        let script = Arc::new(Script::default());
        let replayer = archive.replayer(0, 2, script);
        let stats = replayer.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats.processed, 0);
    }

    #[tokio::test]
    async fn unindexed_heights_do_not_block_waiters() {
        let archive = Archive::new();
        archive.add_block(100, 1000, &["a"]);
        // gap at 101..=102
        archive.add_block(103, 1030, &["b"]);

        let script = Arc::new(Script::default());
        let replayer = archive.replayer(100, 2, script.clone());
        let stats = replayer.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(script.seen().len(), 2);
    }

    // The S5 scenario: a dependency from before the replay window
    #[tokio::test]
    async fn wait_for_tx_bails_out_for_pre_replay_hashes() {
        let archive = Archive::new();
        archive.add_block(100, 1000, &["first"]);

        let script = Arc::new(Script::default());
        script
            .wait_tx
            .lock()
            .unwrap()
            .insert("first".to_string(), "pre-replay-hash".to_string());

        let replayer = archive.replayer(100, 2, script.clone());
        let stats = replayer.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.processed, 1);
        assert_eq!(stats.waits.calls, 1);
        assert_eq!(stats.waits.bailouts, 1);
        assert_eq!(script.seen(), vec!["first"]);
    }

    // The S6 scenario: a later block waits on an earlier block's tx
    #[tokio::test]
    async fn wait_for_tx_parks_until_the_dependency_lands() {
        let _ = tracing_subscriber::fmt::try_init();

        let archive = Archive::new();
        archive.add_block(200, 2000, &["x"]);
        archive.add_block(201, 2010, &["y"]);

        let script = Arc::new(Script::default());
        // the 201 worker reaches its wait while 200 is still sleeping
        script
            .delay
            .lock()
            .unwrap()
            .insert("x".to_string(), Duration::from_millis(50));
        script
            .wait_tx
            .lock()
            .unwrap()
            .insert("y".to_string(), "x".to_string());

        let replayer = archive.replayer(200, 2, script.clone());
        let stats = replayer.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(script.seen(), vec!["x", "y"]);
        assert!(stats.waits.parked >= 1);
        assert!(stats.waits.parked_duration() > Duration::ZERO);
    }

    #[tokio::test]
    async fn wait_for_height_holds_until_earlier_blocks_finish() {
        let archive = Archive::new();
        archive.add_block(300, 3000, &["slow"]);
        archive.add_block(301, 3010, &["dependent"]);

        struct HeightWaiter {
            seen: StdMutex<Vec<String>>,
        }

        #[async_trait]
        impl TxProcessor<TestTx> for HeightWaiter {
            async fn advance(
                &self,
                cx: &SyncContext,
                tx: &TestTx,
                _slot: u64,
                _index: usize,
            ) -> Result<()> {
                if tx.hash == "slow" {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                } else {
                    // everything below this block must be materialised first
                    cx.wait_for_height(300).await?;
                }
                self.seen.lock().unwrap().push(tx.hash.clone());
                Ok(())
            }
        }

        let waiter = Arc::new(HeightWaiter {
            seen: StdMutex::new(vec![]),
        });
        let mut config = ReplayConfig::new(archive.dir.path(), 300);
        config.workers = 2;
        let replayer = Replayer::new(
            archive.lookup.clone(),
            Arc::new(TestDecoder),
            waiter.clone(),
            config,
        );

        replayer.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            waiter.seen.lock().unwrap().as_slice(),
            ["slow".to_string(), "dependent".to_string()]
        );
    }

    #[tokio::test]
    async fn waiting_on_your_own_tx_is_an_error() {
        let archive = Archive::new();
        archive.add_block(100, 1000, &["selfish"]);

        let script = Arc::new(Script {
            self_wait_on: Some("selfish".to_string()),
            ..Default::default()
        });
        let replayer = archive.replayer(100, 2, script);
        let err = replayer.run(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("height 100"));
    }

    #[tokio::test]
    async fn first_failure_cancels_the_whole_replay() {
        let archive = Archive::new();
        for height in 50..60 {
            archive.add_block(height, height * 10, &[&format!("tx{height}")]);
        }

        let script = Arc::new(Script {
            fail_on: Some("tx53".to_string()),
            ..Default::default()
        });
        let replayer = archive.replayer(50, 3, script);
        let err = replayer.run(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("height 53"));
    }

    #[tokio::test]
    async fn transiently_unprocessed_keys_are_retried() {
        let archive = Archive::new();
        archive.add_block(10, 100, &["a"]);
        archive.lookup.defer(10, 2);

        let script = Arc::new(Script::default());
        let replayer = archive.replayer(10, 2, script.clone());
        let stats = replayer.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(stats.processed, 1);
    }

    #[tokio::test]
    async fn corrupt_block_file_fails_the_run() {
        let archive = Archive::new();
        archive.add_block(10, 100, &["a"]);
        // truncate the file under the index entry
        std::fs::write(archive.dir.path().join("blocks/10.cbor"), [0x82]).unwrap();

        let script = Arc::new(Script::default());
        let replayer = archive.replayer(10, 2, script);
        let err = replayer.run(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("height 10"));
    }
}
