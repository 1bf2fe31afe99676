//! Block-content retrieval seam. Live deployments implement this against
//! their object store; [`DirDownloader`] serves a local mount of the same
//! bucket layout.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::warn;

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch the raw contents of the block with this hash
    async fn download_block(&self, hash: &[u8]) -> Result<Vec<u8>>;
}

/// Reads blocks from `<root>/blocks/by-hash/<2-hex-prefix>/<hash-hex>.cbor`
pub struct DirDownloader {
    root: PathBuf,
}

impl DirDownloader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, hash: &[u8]) -> PathBuf {
        let hex = hex::encode(hash);
        let prefix = &hex[..2.min(hex.len())];
        self.root
            .join("blocks")
            .join("by-hash")
            .join(prefix)
            .join(format!("{hex}.cbor"))
    }
}

#[async_trait]
impl Downloader for DirDownloader {
    async fn download_block(&self, hash: &[u8]) -> Result<Vec<u8>> {
        let path = self.path_for(hash);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed downloading block");
                Err(e).with_context(|| format!("reading block {}", path.display()))
            }
        }
    }
}
