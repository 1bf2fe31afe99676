//! Asset identity: `"{policy-id-hex}.{asset-name-hex}"` strings with ADA
//! normalised to its canonical spelling, plus the multiasset value carried
//! by transaction outputs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::ops::AddAssign;

/// Canonical asset id for ADA
pub const ADA_ASSET_ID: &str = "ada.lovelace";

/// Hex length of a minting policy id (28 bytes)
const POLICY_HEX_LEN: usize = 56;

/// An asset id in `policy.assetName` form, canonicalized on construction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(canonicalize(&id.into()))
    }

    pub fn from_separate(policy_id: &str, asset_name: &str) -> Self {
        Self::new(format!("{policy_id}.{asset_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Everything before the first dot (the whole id if there is none)
    pub fn policy_id(&self) -> &str {
        match self.0.find('.') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Everything after the first dot; empty for policy-only assets
    pub fn asset_name(&self) -> &str {
        match self.0.find('.') {
            Some(idx) => &self.0[idx + 1..],
            None => "",
        }
    }

    pub fn is_ada(&self) -> bool {
        self.0 == ADA_ASSET_ID
    }
}

impl Display for AssetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalise an asset id string to canonical form.
///
/// Every known spelling of ADA becomes [`ADA_ASSET_ID`]. A concatenated hex
/// string longer than a policy id gets its separating dot inserted. Non-hex
/// asset names are passed through unchanged; callers are expected to supply
/// hex-encoded names.
pub fn canonicalize(id: &str) -> String {
    match id {
        "" | "." | ADA_ASSET_ID | "cardano.ada" => return ADA_ASSET_ID.to_string(),
        // hex-encoded "ada.lovelace"
        "616461.6c6f76656c616365" => return ADA_ASSET_ID.to_string(),
        _ => {}
    }

    if let Some(idx) = id.find('.') {
        let policy_id = &id[..idx];
        if policy_id == "ada" || policy_id == "cardano" {
            return ADA_ASSET_ID.to_string();
        }
        return id.to_string();
    }

    // No dot: a bare policy id stands alone, anything longer gets split
    if id.len() > POLICY_HEX_LEN && is_hex(id) {
        return format!("{}.{}", &id[..POLICY_HEX_LEN], &id[POLICY_HEX_LEN..]);
    }

    id.to_string()
}

pub fn is_ada_asset_id(id: &str) -> bool {
    canonicalize(id) == ADA_ASSET_ID
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Native asset quantities by policy id, then asset name (both hex)
pub type AssetAmounts = BTreeMap<String, BTreeMap<String, u64>>;

/// Lovelace plus native assets, as carried by a transaction output
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub lovelace: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub assets: AssetAmounts,
}

impl Value {
    pub fn new(lovelace: u64) -> Self {
        Self {
            lovelace,
            assets: AssetAmounts::new(),
        }
    }

    pub fn with_asset(mut self, asset_id: &AssetId, amount: u64) -> Self {
        self.add_asset(asset_id, amount);
        self
    }

    pub fn add_asset(&mut self, asset_id: &AssetId, amount: u64) {
        *self
            .assets
            .entry(asset_id.policy_id().to_string())
            .or_default()
            .entry(asset_id.asset_name().to_string())
            .or_default() += amount;
    }

    pub fn amount_of(&self, asset_id: &AssetId) -> u64 {
        if asset_id.is_ada() {
            return self.lovelace;
        }
        self.assets
            .get(asset_id.policy_id())
            .and_then(|names| names.get(asset_id.asset_name()))
            .copied()
            .unwrap_or(0)
    }

    /// Every non-ADA asset id present in this value
    pub fn asset_ids(&self) -> impl Iterator<Item = AssetId> + '_ {
        self.assets.iter().flat_map(|(policy, names)| {
            names
                .keys()
                .map(move |name| AssetId::from_separate(policy, name))
        })
    }
}

impl AddAssign<&Value> for Value {
    fn add_assign(&mut self, other: &Value) {
        self.lovelace += other.lovelace;
        for (policy, names) in &other.assets {
            let entry = self.assets.entry(policy.clone()).or_default();
            for (name, amount) in names {
                *entry.entry(name.clone()).or_default() += amount;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = "9a9693a9a37912a5097918f97918d15264838cfd653ca16f147e4d77";

    #[test]
    fn ada_spellings_canonicalize() {
        for id in ["", ".", "ada.lovelace", "cardano.ada", "616461.6c6f76656c616365"] {
            assert_eq!(canonicalize(id), ADA_ASSET_ID, "{id:?}");
            assert!(is_ada_asset_id(id));
        }
    }

    #[test]
    fn separated_hex_id_is_unchanged() {
        let id = format!("{POLICY}.53554e444145");
        assert_eq!(canonicalize(&id), id);
    }

    #[test]
    fn concatenated_hex_id_gets_a_dot() {
        let id = format!("{POLICY}53554e444145");
        assert_eq!(canonicalize(&id), format!("{POLICY}.53554e444145"));
    }

    #[test]
    fn bare_policy_id_is_unchanged() {
        assert_eq!(canonicalize(POLICY), POLICY);
    }

    #[test]
    fn non_hex_suffix_passes_through() {
        let id = format!("{POLICY}.SUNDAE");
        assert_eq!(canonicalize(&id), id);
    }

    #[test]
    fn value_accumulates_assets() {
        let nft = AssetId::from_separate(POLICY, "7020cafe");
        let lp = AssetId::from_separate(POLICY, "6c7020cafe");

        let mut value = Value::new(2_000_000).with_asset(&nft, 1);
        value += &Value::new(500_000).with_asset(&nft, 2).with_asset(&lp, 7);

        assert_eq!(value.lovelace, 2_500_000);
        assert_eq!(value.amount_of(&nft), 3);
        assert_eq!(value.amount_of(&lp), 7);
        assert_eq!(value.amount_of(&AssetId::new("ada.lovelace")), 2_500_000);

        let ids: Vec<AssetId> = value.asset_ids().collect();
        assert_eq!(ids, vec![lp.clone(), nft.clone()]);
    }

    #[test]
    fn accessors_split_on_first_dot() {
        let asset = AssetId::from_separate(POLICY, "53554e444145");
        assert_eq!(asset.policy_id(), POLICY);
        assert_eq!(asset.asset_name(), "53554e444145");
        assert!(!asset.is_ada());

        let bare = AssetId::new(POLICY);
        assert_eq!(bare.policy_id(), POLICY);
        assert_eq!(bare.asset_name(), "");
    }
}
