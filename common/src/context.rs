//! Execution context handed to per-transaction callbacks.
//!
//! The same callback code runs during live sync and during historical
//! replay. In replay the context carries a [`DependencyWaits`] capability
//! (backed by the replayer's height tracker); live it carries none and both
//! wait primitives succeed immediately.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("cancelled while waiting")]
    Cancelled,

    /// Waiting on the transaction currently being processed would never
    /// complete; it is only marked processed after its callback returns.
    #[error("transaction {0} cannot wait on itself")]
    SelfWait(String),
}

/// Dependency primitives implemented by the replay engine's height tracker
#[async_trait]
pub trait DependencyWaits: Send + Sync {
    /// Block until every height up to and including `height` has finished
    async fn wait_for_height(
        &self,
        height: u64,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError>;

    /// Block until `tx_hash` has been processed. `current_height` bounds the
    /// wait: once the watermark reaches `current_height - 1` an unknown hash
    /// must predate the replay window and the wait succeeds.
    async fn wait_for_tx(
        &self,
        tx_hash: &str,
        current_height: u64,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError>;
}

/// Position of the transaction a callback is currently handling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxPosition {
    pub height: u64,
    pub tx_hash: String,
}

#[derive(Clone, Default)]
pub struct SyncContext {
    waits: Option<Arc<dyn DependencyWaits>>,
    cancel: CancellationToken,
    position: Option<TxPosition>,
}

impl SyncContext {
    /// A live-sync context: no tracker, wait primitives are no-ops
    pub fn live(cancel: CancellationToken) -> Self {
        Self {
            waits: None,
            cancel,
            position: None,
        }
    }

    /// A replay context backed by a tracker
    pub fn replay(waits: Arc<dyn DependencyWaits>, cancel: CancellationToken) -> Self {
        Self {
            waits: Some(waits),
            cancel,
            position: None,
        }
    }

    /// The same context scoped to one transaction
    pub fn at(&self, height: u64, tx_hash: impl Into<String>) -> Self {
        Self {
            waits: self.waits.clone(),
            cancel: self.cancel.clone(),
            position: Some(TxPosition {
                height,
                tx_hash: tx_hash.into(),
            }),
        }
    }

    pub fn is_replay(&self) -> bool {
        self.waits.is_some()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn position(&self) -> Option<&TxPosition> {
        self.position.as_ref()
    }

    /// Wait until all heights `<= height` are fully processed. No-op outside
    /// replay.
    pub async fn wait_for_height(&self, height: u64) -> Result<(), WaitError> {
        match &self.waits {
            Some(waits) => waits.wait_for_height(height, &self.cancel).await,
            None => Ok(()),
        }
    }

    /// Wait until `tx_hash` has been processed. No-op outside replay.
    pub async fn wait_for_tx(&self, tx_hash: &str) -> Result<(), WaitError> {
        let Some(waits) = &self.waits else {
            return Ok(());
        };
        let Some(position) = &self.position else {
            return Ok(());
        };
        if position.tx_hash == tx_hash {
            return Err(WaitError::SelfWait(tx_hash.to_string()));
        }
        waits.wait_for_tx(tx_hash, position.height, &self.cancel).await
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("replay", &self.is_replay())
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NeverWaits;

    #[async_trait]
    impl DependencyWaits for NeverWaits {
        async fn wait_for_height(
            &self,
            _height: u64,
            _cancel: &CancellationToken,
        ) -> Result<(), WaitError> {
            panic!("should not be consulted")
        }

        async fn wait_for_tx(
            &self,
            _tx_hash: &str,
            _current_height: u64,
            _cancel: &CancellationToken,
        ) -> Result<(), WaitError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn live_context_waits_are_noops() {
        let cx = SyncContext::live(CancellationToken::new());
        assert!(!cx.is_replay());
        cx.wait_for_height(1_000_000).await.unwrap();
        cx.wait_for_tx("anything").await.unwrap();
    }

    #[tokio::test]
    async fn replay_context_rejects_self_wait() {
        let cx = SyncContext::replay(Arc::new(NeverWaits), CancellationToken::new());
        let cx = cx.at(5, "abc");
        assert_eq!(
            cx.wait_for_tx("abc").await,
            Err(WaitError::SelfWait("abc".into()))
        );
        // a different hash goes through to the tracker
        cx.wait_for_tx("def").await.unwrap();
    }
}
