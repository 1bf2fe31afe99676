//! Registry of the protocol's on-chain scripts: versioned validator
//! blueprints, plus the identity rules for pool NFTs and LP tokens minted by
//! the `pool.mint` validator.

use crate::address::{self, AddressError};
use crate::asset::AssetId;
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use thiserror::Error;

pub const ORDER_SCRIPT_KEY: &str = "order.spend";
pub const POOL_SCRIPT_KEY: &str = "pool.spend";
pub const POOL_MINT_KEY: &str = "pool.mint";
pub const SETTINGS_SCRIPT_KEY: &str = "settings.spend";
pub const STAKE_SCRIPT_KEY: &str = "stake.stake";

const V1_POOL_NFT_HEX_PREFIX: &str = "7020";
const V1_LP_HEX_PREFIX: &str = "6c7020";
const V3_POOL_NFT_HEX_PREFIX: &str = "000de140";
const V3_LP_HEX_PREFIX: &str = "0014df10";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("{key} not found in protocol {version}")]
    MissingValidator { key: String, version: ProtocolVersion },

    #[error("unrecognized protocol version {0}")]
    UnsupportedVersion(ProtocolVersion),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V1,
    V3,
    Stableswaps,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A reference to the transaction output holding a deployed script
#[serde_as]
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    #[serde_as(as = "Hex")]
    pub hash: Vec<u8>,
    #[serde(default)]
    pub index: u32,
}

#[serde_as]
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub title: String,
    #[serde_as(as = "Hex")]
    #[serde(rename = "compiledCode")]
    pub compiled_code: Vec<u8>,
    #[serde_as(as = "Hex")]
    pub hash: Vec<u8>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blueprint {
    pub validators: Vec<Validator>,
}

impl Blueprint {
    pub fn find(&self, key: &str) -> Option<&Validator> {
        self.validators.iter().find(|v| v.title == key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptReference {
    pub key: String,
    #[serde(rename = "txIn")]
    pub tx_in: TxIn,
}

/// One deployed protocol version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Protocol {
    pub version: ProtocolVersion,
    pub blueprint: Blueprint,
    #[serde(default)]
    pub references: Vec<ScriptReference>,
}

impl Protocol {
    /// Does this payment credential belong to one of our validators?
    pub fn is_relevant(&self, payment_credential: &[u8]) -> bool {
        self.blueprint.validators.iter().any(|v| v.hash == payment_credential)
    }

    fn pool_mint_hash(&self) -> Result<String, ScriptError> {
        let validator = self.blueprint.find(POOL_MINT_KEY).ok_or_else(|| {
            ScriptError::MissingValidator {
                key: POOL_MINT_KEY.to_string(),
                version: self.version,
            }
        })?;
        Ok(hex::encode(&validator.hash))
    }

    fn nft_prefix(&self) -> Result<&'static str, ScriptError> {
        match self.version {
            ProtocolVersion::V1 => Ok(V1_POOL_NFT_HEX_PREFIX),
            ProtocolVersion::V3 => Ok(V3_POOL_NFT_HEX_PREFIX),
            other => Err(ScriptError::UnsupportedVersion(other)),
        }
    }

    fn lp_prefix(&self) -> Result<&'static str, ScriptError> {
        match self.version {
            ProtocolVersion::V1 => Ok(V1_LP_HEX_PREFIX),
            ProtocolVersion::V3 => Ok(V3_LP_HEX_PREFIX),
            other => Err(ScriptError::UnsupportedVersion(other)),
        }
    }

    /// The pool NFT asset id for a pool identifier
    pub fn pool_nft(&self, ident: &str) -> Result<AssetId, ScriptError> {
        let policy = self.pool_mint_hash()?;
        Ok(AssetId::from_separate(&policy, &format!("{}{ident}", self.nft_prefix()?)))
    }

    /// The LP token asset id for a pool identifier
    pub fn lp_asset(&self, ident: &str) -> Result<AssetId, ScriptError> {
        let policy = self.pool_mint_hash()?;
        Ok(AssetId::from_separate(&policy, &format!("{}{ident}", self.lp_prefix()?)))
    }

    pub fn is_pool_nft(&self, asset_id: &AssetId) -> Result<bool, ScriptError> {
        if self.pool_mint_hash()? != asset_id.policy_id() {
            return Ok(false);
        }
        Ok(asset_id.asset_name().starts_with(self.nft_prefix()?))
    }

    pub fn is_lp_asset(&self, asset_id: &AssetId) -> Result<bool, ScriptError> {
        if self.pool_mint_hash()? != asset_id.policy_id() {
            return Ok(false);
        }
        Ok(asset_id.asset_name().starts_with(self.lp_prefix()?))
    }

    /// Does any asset in the set carry this protocol's pool NFT policy?
    pub fn has_pool_nft<'a>(
        &self,
        assets: impl IntoIterator<Item = &'a AssetId>,
    ) -> Result<bool, ScriptError> {
        for asset in assets {
            if self.is_pool_nft(asset)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Extract the pool identifier from a pool NFT or LP asset name
    pub fn pool_ident(&self, asset_id: &AssetId) -> Result<Option<String>, ScriptError> {
        if self.pool_mint_hash()? != asset_id.policy_id() {
            return Ok(None);
        }
        let name = asset_id.asset_name();
        for prefix in [self.nft_prefix()?, self.lp_prefix()?] {
            if let Some(ident) = name.strip_prefix(prefix) {
                return Ok(Some(ident.to_string()));
            }
        }
        Ok(None)
    }

    fn script(&self, key: &str) -> Result<&[u8], ScriptError> {
        self.blueprint
            .find(key)
            .map(|v| v.compiled_code.as_slice())
            .ok_or_else(|| ScriptError::MissingValidator {
                key: key.to_string(),
                version: self.version,
            })
    }

    pub fn order_script(&self) -> Result<&[u8], ScriptError> {
        self.script(ORDER_SCRIPT_KEY)
    }

    pub fn pool_script(&self) -> Result<&[u8], ScriptError> {
        self.script(POOL_SCRIPT_KEY)
    }

    pub fn settings_script(&self) -> Result<&[u8], ScriptError> {
        self.script(SETTINGS_SCRIPT_KEY)
    }

    pub fn stake_script(&self) -> Result<&[u8], ScriptError> {
        self.script(STAKE_SCRIPT_KEY)
    }
}

/// The set of deployed protocol versions known to a service
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Protocols(pub Vec<Protocol>);

impl Protocols {
    /// Find a version; the empty string defaults to V1
    pub fn find(&self, version: Option<ProtocolVersion>) -> Option<&Protocol> {
        let version = version.unwrap_or(ProtocolVersion::V1);
        self.0.iter().find(|p| p.version == version)
    }

    /// Which protocol, if any, does this address belong to? Legacy addresses
    /// are never relevant rather than an error.
    pub fn relevant_to(&self, addr: &str) -> Result<Option<&Protocol>, AddressError> {
        let creds = match address::split_address(addr) {
            Ok(creds) => creds,
            Err(AddressError::LegacyFormat(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(self.0.iter().find(|p| p.is_relevant(&creds.payment)))
    }

    pub fn is_lp_asset(&self, asset_id: &AssetId) -> Result<Option<&Protocol>, ScriptError> {
        for p in &self.0 {
            if p.is_lp_asset(asset_id)? {
                return Ok(Some(p));
            }
        }
        Ok(None)
    }

    pub fn pool_ident(&self, asset_id: &AssetId) -> Result<Option<(String, &Protocol)>, ScriptError> {
        for p in &self.0 {
            if let Some(ident) = p.pool_ident(asset_id)? {
                return Ok(Some((ident, p)));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol(version: ProtocolVersion) -> Protocol {
        Protocol {
            version,
            blueprint: Blueprint {
                validators: vec![
                    Validator {
                        title: POOL_MINT_KEY.to_string(),
                        compiled_code: vec![0x01],
                        hash: vec![0xab; 28],
                    },
                    Validator {
                        title: ORDER_SCRIPT_KEY.to_string(),
                        compiled_code: vec![0x02, 0x03],
                        hash: vec![0xcd; 28],
                    },
                ],
            },
            references: vec![],
        }
    }

    fn mint_policy() -> String {
        hex::encode([0xab; 28])
    }

    #[test]
    fn pool_nft_round_trips_through_identity() {
        let p = protocol(ProtocolVersion::V3);
        let nft = p.pool_nft("cafe").unwrap();
        assert_eq!(nft.policy_id(), mint_policy());
        assert!(nft.asset_name().starts_with("000de140"));
        assert!(p.is_pool_nft(&nft).unwrap());
        assert!(!p.is_lp_asset(&nft).unwrap());
        assert_eq!(p.pool_ident(&nft).unwrap().as_deref(), Some("cafe"));
    }

    #[test]
    fn lp_asset_round_trips_through_identity() {
        let p = protocol(ProtocolVersion::V1);
        let lp = p.lp_asset("cafe").unwrap();
        assert!(lp.asset_name().starts_with("6c7020"));
        assert!(p.is_lp_asset(&lp).unwrap());
        assert_eq!(p.pool_ident(&lp).unwrap().as_deref(), Some("cafe"));
    }

    #[test]
    fn foreign_policy_is_not_ours() {
        let p = protocol(ProtocolVersion::V1);
        let other = AssetId::from_separate(&hex::encode([0x11; 28]), "7020cafe");
        assert!(!p.is_pool_nft(&other).unwrap());
        assert_eq!(p.pool_ident(&other).unwrap(), None);
    }

    #[test]
    fn stableswaps_has_no_nft_rules() {
        let p = protocol(ProtocolVersion::Stableswaps);
        assert_eq!(
            p.pool_nft("cafe"),
            Err(ScriptError::UnsupportedVersion(ProtocolVersion::Stableswaps))
        );
    }

    #[test]
    fn missing_pool_mint_is_an_error() {
        let mut p = protocol(ProtocolVersion::V1);
        p.blueprint.validators.retain(|v| v.title != POOL_MINT_KEY);
        assert!(matches!(
            p.pool_nft("cafe"),
            Err(ScriptError::MissingValidator { .. })
        ));
    }

    #[test]
    fn script_accessors_find_compiled_code() {
        let p = protocol(ProtocolVersion::V1);
        assert_eq!(p.order_script().unwrap(), &[0x02, 0x03]);
        assert!(matches!(
            p.pool_script(),
            Err(ScriptError::MissingValidator { .. })
        ));
    }

    #[test]
    fn has_pool_nft_scans_a_value() {
        let p = protocol(ProtocolVersion::V3);
        let nft = p.pool_nft("01").unwrap();
        let noise = AssetId::new("ada.lovelace");
        assert!(p.has_pool_nft([&noise, &nft]).unwrap());
        assert!(!p.has_pool_nft([&noise]).unwrap());
    }

    #[test]
    fn find_defaults_to_v1() {
        let ps = Protocols(vec![protocol(ProtocolVersion::V1), protocol(ProtocolVersion::V3)]);
        assert_eq!(ps.find(None).unwrap().version, ProtocolVersion::V1);
        assert_eq!(
            ps.find(Some(ProtocolVersion::V3)).unwrap().version,
            ProtocolVersion::V3
        );
    }
}
