//! Linear slot / wall-clock conversion, per named network.
//!
//! Post-Byron Cardano slots tick once per second, so conversion is a fixed
//! per-network offset: `time = slot + offset`.

use crate::configuration::{Network, SyncOptions};
use thiserror::Error;

/// Unix timestamp of slot zero on preview
pub const SLOT_OFFSET_PREVIEW: u64 = 1666656000;

/// Unix timestamp of slot zero on preprod
pub const SLOT_OFFSET_PREPROD: u64 = 1655769600;

/// Unix timestamp of slot zero on mainnet (Shelley-adjusted)
pub const SLOT_OFFSET_MAINNET: u64 = 1591566291;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("unrecognized network {0} and no slot offset configured")]
    UnknownNetwork(String),
}

/// The slot offset for a network, honouring any configured override
pub fn slot_offset(options: &SyncOptions) -> Result<u64, SlotError> {
    match &options.network {
        Network::Preview => Ok(SLOT_OFFSET_PREVIEW),
        Network::Preprod => Ok(SLOT_OFFSET_PREPROD),
        Network::Mainnet => Ok(SLOT_OFFSET_MAINNET),
        Network::Custom(name) => options
            .slot_offset_override
            .ok_or_else(|| SlotError::UnknownNetwork(name.clone())),
    }
}

/// Convert a slot number to a unix timestamp
pub fn slot_to_time(slot: u64, options: &SyncOptions) -> Result<u64, SlotError> {
    Ok(slot + slot_offset(options)?)
}

/// Convert a unix timestamp to a slot number (zero before slot zero)
pub fn time_to_slot(unix: u64, options: &SyncOptions) -> Result<u64, SlotError> {
    Ok(unix.saturating_sub(slot_offset(options)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_networks_convert_both_ways() {
        let opts = SyncOptions::new(Network::Preview);
        assert_eq!(slot_to_time(100, &opts).unwrap(), SLOT_OFFSET_PREVIEW + 100);
        assert_eq!(time_to_slot(SLOT_OFFSET_PREVIEW + 100, &opts).unwrap(), 100);

        let opts = SyncOptions::new(Network::Mainnet);
        assert_eq!(slot_to_time(0, &opts).unwrap(), SLOT_OFFSET_MAINNET);
    }

    #[test]
    fn custom_network_requires_override() {
        let mut opts = SyncOptions::new(Network::Custom("devnet".into()));
        assert_eq!(
            slot_to_time(1, &opts),
            Err(SlotError::UnknownNetwork("devnet".into()))
        );

        opts.slot_offset_override = Some(5000);
        assert_eq!(slot_to_time(1, &opts).unwrap(), 5001);
        assert_eq!(time_to_slot(5001, &opts).unwrap(), 1);
    }

    #[test]
    fn time_before_slot_zero_clamps() {
        let opts = SyncOptions::new(Network::Preprod);
        assert_eq!(time_to_slot(0, &opts).unwrap(), 0);
    }
}
