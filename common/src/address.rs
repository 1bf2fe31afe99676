//! Shelley address decoding, reduced to what the indexers need: the payment
//! credential and, when one is present, the staking credential.

use thiserror::Error;

/// Length of a key or script hash credential
pub const CREDENTIAL_LEN: usize = 28;

/// Enterprise / reward address payload: header byte + one credential
const ENTERPRISE_LEN: usize = 1 + CREDENTIAL_LEN;

/// Base address payload: header byte + two credentials
const BASE_LEN: usize = 1 + 2 * CREDENTIAL_LEN;

/// Header bit distinguishing pointer addresses from base addresses
const POINTER_BIT: u8 = 0b0100_0000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// Byron and other pre-Shelley formats carry no credentials we can use
    #[error("legacy address format: {0}")]
    LegacyFormat(String),

    #[error("unable to decode address {address}: {reason}")]
    Malformed { address: String, reason: String },

    #[error("address payload is {0} bytes, expected {ENTERPRISE_LEN} or {BASE_LEN}")]
    BadLength(usize),
}

/// Payment credential and optional staking credential of an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub payment: [u8; CREDENTIAL_LEN],
    pub staking: Option<[u8; CREDENTIAL_LEN]>,
}

/// Bech32-decode an address, refusing anything that is not a Shelley
/// `addr...` or `stake...` string. Byron base58 addresses in particular are
/// reported as [`AddressError::LegacyFormat`] so callers can skip them.
pub fn bech32_decode(address: &str) -> Result<Vec<u8>, AddressError> {
    if !address.starts_with("addr") && !address.starts_with("stake") {
        return Err(AddressError::LegacyFormat(address.to_string()));
    }
    let (_hrp, data) = bech32::decode(address).map_err(|e| AddressError::Malformed {
        address: address.to_string(),
        reason: e.to_string(),
    })?;
    Ok(data)
}

/// Split an address into its payment and staking credentials.
///
/// A 29-byte payload carries the payment credential only. A 57-byte payload
/// carries both unless the header marks the trailing part as a delegation
/// pointer, which we ignore.
pub fn split_address(address: &str) -> Result<Credentials, AddressError> {
    let bytes = bech32_decode(address)?;
    split_decoded(&bytes)
}

/// [`split_address`] for an already-decoded payload
pub fn split_decoded(bytes: &[u8]) -> Result<Credentials, AddressError> {
    match bytes.len() {
        ENTERPRISE_LEN => Ok(Credentials {
            payment: credential(&bytes[1..ENTERPRISE_LEN]),
            staking: None,
        }),
        BASE_LEN => {
            let staking = if bytes[0] & POINTER_BIT == 0 {
                Some(credential(&bytes[ENTERPRISE_LEN..BASE_LEN]))
            } else {
                None
            };
            Ok(Credentials {
                payment: credential(&bytes[1..ENTERPRISE_LEN]),
                staking,
            })
        }
        n => Err(AddressError::BadLength(n)),
    }
}

fn credential(bytes: &[u8]) -> [u8; CREDENTIAL_LEN] {
    let mut out = [0u8; CREDENTIAL_LEN];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bech32::{Bech32, Hrp};

    fn encode(hrp: &str, payload: &[u8]) -> String {
        bech32::encode::<Bech32>(Hrp::parse(hrp).unwrap(), payload).unwrap()
    }

    fn payload(header: u8, len: usize) -> Vec<u8> {
        let mut bytes = vec![header];
        bytes.extend(1..len as u8);
        bytes
    }

    #[test]
    fn enterprise_address_has_payment_only() {
        let creds = split_decoded(&payload(0x61, ENTERPRISE_LEN)).unwrap();
        assert_eq!(creds.payment[0], 1);
        assert_eq!(creds.staking, None);
    }

    #[test]
    fn base_address_has_both_credentials() {
        let bytes = payload(0x01, BASE_LEN);
        let creds = split_decoded(&bytes).unwrap();
        assert_eq!(creds.payment.as_slice(), &bytes[1..29]);
        assert_eq!(creds.staking.unwrap().as_slice(), &bytes[29..57]);
    }

    #[test]
    fn pointer_address_drops_the_pointer() {
        let creds = split_decoded(&payload(0x41, BASE_LEN)).unwrap();
        assert_eq!(creds.staking, None);
    }

    #[test]
    fn other_lengths_are_rejected() {
        assert_eq!(
            split_decoded(&payload(0x01, 30)),
            Err(AddressError::BadLength(30))
        );
        assert_eq!(
            split_decoded(&[0x01]),
            Err(AddressError::BadLength(1))
        );
    }

    #[test]
    fn round_trips_through_bech32() {
        let bytes = payload(0x01, BASE_LEN);
        let addr = encode("addr_test", &bytes);
        let creds = split_address(&addr).unwrap();
        assert_eq!(creds.payment.as_slice(), &bytes[1..29]);
        assert!(creds.staking.is_some());
    }

    #[test]
    fn byron_addresses_are_legacy() {
        let err = split_address("DdzFFzCqrht4wFnWC5TJA5UUVE54JC9xZWq589iKyCrWa6hek3KKevyaXzQt").unwrap_err();
        assert!(matches!(err, AddressError::LegacyFormat(_)));
    }

    #[test]
    fn stake_prefix_is_accepted() {
        let addr = encode("stake", &payload(0xe1, ENTERPRISE_LEN));
        assert!(split_address(&addr).is_ok());
    }
}
