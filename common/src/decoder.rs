//! Seam to the external block codec.
//!
//! The toolkit never decodes block bodies itself; hosts wrap whatever codec
//! they use in these traits. A block is a finite sequence of transactions in
//! canonical order plus its slot and id.

use anyhow::Result;

pub trait ChainTx: Send + Sync {
    /// Hex-encoded transaction hash
    fn hash(&self) -> String;
}

pub trait ChainBlock: Send + Sync {
    type Tx: ChainTx;

    fn slot(&self) -> u64;

    /// Hex-encoded block hash
    fn hash(&self) -> String;

    /// Transactions in canonical block order
    fn transactions(&self) -> &[Self::Tx];
}

/// Decodes a block body. `era` is the era tag byte from the block container;
/// `body` is handed over verbatim.
pub trait BlockDecoder: Send + Sync {
    type Block: ChainBlock;

    fn decode(&self, era: u8, body: &[u8]) -> Result<Self::Block>;
}
