//! Core type definitions shared across the sundae-sync crates

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

/// Canonical chain position: slot, block id and (where known) block height.
///
/// `slot` is the time-anchored ordinal used for rollback comparisons;
/// `height` is the logical block ordinal used as the cursor partition key.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub slot: u64,

    /// Hex-encoded block hash
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
}

impl Point {
    pub fn new(slot: u64, id: impl Into<String>, height: u64) -> Self {
        Self {
            slot,
            id: id.into(),
            height: Some(height),
        }
    }

    /// Block height, defaulting to zero for pre-height (origin-adjacent) points
    pub fn height_or_zero(&self) -> u64 {
        self.height.unwrap_or(0)
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.slot, self.id)
    }
}

impl Ord for Point {
    fn cmp(&self, other: &Self) -> Ordering {
        self.slot.cmp(&other.slot).then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Point {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A block as carried on the chain-sync wire (roll-forward frames)
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBlock {
    pub slot: u64,

    /// Hex-encoded block hash
    pub id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,

    #[serde(default)]
    pub transactions: Vec<SyncTx>,
}

impl SyncBlock {
    pub fn point(&self) -> Point {
        Point {
            slot: self.slot,
            id: self.id.clone(),
            height: self.height,
        }
    }
}

/// A transaction as carried on the chain-sync wire
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTx {
    /// Hex-encoded transaction hash
    pub id: String,

    /// Raw transaction body, passed through untouched for the callback's use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl SyncTx {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            raw: None,
        }
    }
}
