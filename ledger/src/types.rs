use hex::FromHex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// 32-byte block hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const fn zero() -> Self {
        Hash([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// SHA-256 of `data`.
    pub fn digest(data: &[u8]) -> Self {
        Hash(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Hash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes: [u8; 32] = <[u8; 32]>::from_hex(s)?;
        Ok(Hash(bytes))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// 20-byte account address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl FromStr for Address {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("vite_").unwrap_or(s);
        let bytes: [u8; 20] = <[u8; 20]>::from_hex(s)?;
        Ok(Address(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vite_{}", hex::encode(self.0))
    }
}

/// A (hash, height) pair identifying a block on some chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HashHeight {
    pub hash: Hash,
    pub height: u64,
}

impl HashHeight {
    pub fn new(hash: Hash, height: u64) -> Self {
        Self { hash, height }
    }

    /// Reference by height only; the hash is left zero.
    pub fn at_height(height: u64) -> Self {
        Self {
            hash: Hash::zero(),
            height,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex_roundtrip_accepts_prefix() {
        let hash = Hash::digest(b"genesis");
        let text = hash.to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(Hash::from_str(&text).unwrap(), hash);
        assert_eq!(Hash::from_str(&format!("0x{text}")).unwrap(), hash);
    }

    #[test]
    fn test_zero_hash() {
        assert!(Hash::zero().is_zero());
        assert!(!Hash::digest(b"x").is_zero());
    }

    #[test]
    fn test_address_display_has_prefix() {
        let addr = Address([0xab; 20]);
        let text = addr.to_string();
        assert!(text.starts_with("vite_"));
        assert_eq!(Address::from_str(&text).unwrap(), addr);
    }
}
