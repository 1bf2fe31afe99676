//! Runtime options shared by every subsystem.
//!
//! Everything that used to live in ambient flag globals is carried in an
//! explicit [`SyncOptions`] value handed to each constructor.

use anyhow::Result;
use config::Config;
use serde::Deserialize;
use std::fmt::{Display, Formatter};

pub const CONFIG_KEY_NETWORK: &str = "network";
pub const CONFIG_KEY_SLOT_OFFSET: &str = "slot-offset";
pub const CONFIG_KEY_DRY: &str = "dry";
pub const CONFIG_KEY_PATCH_REPLAY: &str = "patch-replay";

/// Named Cardano network the service indexes
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Preview,
    Preprod,
    Mainnet,
    /// Any other network name; slot conversion requires an explicit offset
    #[serde(untagged)]
    Custom(String),
}

impl Network {
    pub fn name(&self) -> &str {
        match self {
            Network::Preview => "preview",
            Network::Preprod => "preprod",
            Network::Mainnet => "mainnet",
            Network::Custom(name) => name,
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Options consumed by the chain-sync consumer, replayer, dispatcher and
/// publisher. Built once from config and passed by value.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub network: Network,

    /// Overrides the built-in slot offset for custom networks
    pub slot_offset_override: Option<u64>,

    /// Suppress all writes; user callbacks are still invoked
    pub dry_mode: bool,

    /// Swallow the first backward frame of a forced replay session
    pub patch_replay: bool,
}

impl SyncOptions {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            slot_offset_override: None,
            dry_mode: false,
            patch_replay: false,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let network = config
            .get::<Network>(CONFIG_KEY_NETWORK)
            .unwrap_or(Network::Mainnet);
        Ok(Self {
            network,
            slot_offset_override: config.get::<u64>(CONFIG_KEY_SLOT_OFFSET).ok(),
            dry_mode: config.get_bool(CONFIG_KEY_DRY).unwrap_or(false),
            patch_replay: config.get_bool(CONFIG_KEY_PATCH_REPLAY).unwrap_or(false),
        })
    }

    /// Conventional cursor table name for this network
    pub fn cursor_table_name(&self) -> String {
        format!("{}-sundae-sync--cursor", self.network)
    }

    /// Conventional replay lookup table name for this network
    pub fn lookup_table_name(&self) -> String {
        format!("{}-sundae-sync-v2--lookup", self.network)
    }

    /// Conventional WebSocket events stream name for this network
    pub fn events_stream_name(&self) -> String {
        format!("{}-sundae-ws-events", self.network)
    }
}
