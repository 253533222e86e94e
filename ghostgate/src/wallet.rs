//! Canonical wallet keys.
//!
//! Balances, nonces and ledger rows are keyed by the lowercase `0x`-prefixed
//! hex form of an EVM address, regardless of how the caller spelled it.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use alloy_primitives::Address;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A wallet address in canonical storage form (lowercase hex with `0x` prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletKey {
    key: String,
    address: Address,
}

/// The input could not be parsed as a 20-byte EVM address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid wallet address: {0}")]
pub struct InvalidWallet(pub String);

impl WalletKey {
    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// Returns the wallet as an [`Address`].
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }
}

impl From<Address> for WalletKey {
    fn from(address: Address) -> Self {
        Self {
            key: format!("{address:#x}"),
            address,
        }
    }
}

impl FromStr for WalletKey {
    type Err = InvalidWallet;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let address = Address::from_str(trimmed).map_err(|_| InvalidWallet(s.to_owned()))?;
        Ok(Self::from(address))
    }
}

impl Display for WalletKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key)
    }
}

impl Serialize for WalletKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key)
    }
}

impl<'de> Deserialize<'de> for WalletKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_key_is_lowercased() {
        let key: WalletKey = "0xAbCdEf0123456789aBcDeF0123456789AbCdEf01".parse().unwrap();
        assert_eq!(key.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn test_wallet_key_accepts_missing_prefix() {
        let key: WalletKey = "abcdef0123456789abcdef0123456789abcdef01".parse().unwrap();
        assert_eq!(key.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
    }

    #[test]
    fn test_wallet_key_rejects_garbage() {
        assert!("0x1234".parse::<WalletKey>().is_err());
        assert!("not-a-wallet".parse::<WalletKey>().is_err());
    }

    #[test]
    fn test_wallet_key_roundtrips_address() {
        let address = Address::repeat_byte(0xAB);
        let key = WalletKey::from(address);
        assert_eq!(key.address(), address);
    }
}
