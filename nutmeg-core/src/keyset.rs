//! This module defines the `MintKeyset` struct and the deterministic key derivation used by the
//! mint, as described in [Nut-02](https://github.com/cashubtc/nuts/blob/main/02.md).
//!
//! A keyset holds one keypair per amount `2^0 .. 2^59`. All keypairs of keyset index `i` are
//! derived from the mint seed along `m/0'/0'/i'/j'` where `j` is the amount exponent, so a mint
//! can always restore every keyset it ever generated from the seed alone.
//!
//! The keyset id is content addressed: version byte `"00"` followed by the first 14 hex chars of
//! the SHA-256 of the compressed public keys concatenated in ascending amount order.

use std::collections::BTreeMap;

use bip32::{ChildNumber, DerivationPath, XPrv};
use bitcoin_hashes::{sha256, Hash};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::NutmegCoreError;
use crate::primitives::CurrencyUnit;

/// Number of keys per keyset, one per power of two.
pub const MAX_ORDER: u32 = 60;

const KEYSET_ID_VERSION: &str = "00";

#[derive(Debug, Clone)]
pub struct MintKeyset {
    pub private_keys: BTreeMap<u64, SecretKey>,
    pub public_keys: BTreeMap<u64, PublicKey>,
    pub keyset_id: String,
    pub derivation_path_idx: u32,
    pub input_fee_ppk: u64,
}

impl MintKeyset {
    /// Derives the keyset with the given index from the mint seed.
    pub fn derive(
        seed: &[u8],
        derivation_path_idx: u32,
        input_fee_ppk: u64,
    ) -> Result<Self, NutmegCoreError> {
        let private_keys = derive_keys(seed, derivation_path_idx)?;
        let public_keys = derive_pubkeys(&private_keys);
        Ok(Self {
            keyset_id: derive_keyset_id(&public_keys),
            private_keys,
            public_keys,
            derivation_path_idx,
            input_fee_ppk,
        })
    }

    pub fn private_key_for_amount(&self, amount: u64) -> Option<&SecretKey> {
        self.private_keys.get(&amount)
    }
}

/// Derives the 60 secret keys of keyset `index` along `m/0'/0'/index'/j'`.
pub fn derive_keys(seed: &[u8], index: u32) -> Result<BTreeMap<u64, SecretKey>, NutmegCoreError> {
    let path: DerivationPath = format!("m/0'/0'/{index}'")
        .parse()
        .map_err(|_| NutmegCoreError::InvalidKeysetId)?;
    let xprv = XPrv::derive_from_path(seed, &path)?;

    let mut keys = BTreeMap::new();
    for exponent in 0..MAX_ORDER {
        let child = xprv.derive_child(ChildNumber::new(exponent, true)?)?;
        let key = SecretKey::from_slice(child.private_key().to_bytes().as_slice())?;
        keys.insert(2u64.pow(exponent), key);
    }
    Ok(keys)
}

pub fn derive_pubkeys(keys: &BTreeMap<u64, SecretKey>) -> BTreeMap<u64, PublicKey> {
    let secp = Secp256k1::new();
    keys.iter()
        .map(|(amount, key)| (*amount, key.public_key(&secp)))
        .collect()
}

/// `"00" || hex(SHA256(concat_amount_ascending(compressed_pubkey)))[..14]`
pub fn derive_keyset_id(keys: &BTreeMap<u64, PublicKey>) -> String {
    let pubkeys_concat = keys
        .values()
        .flat_map(|pubkey| pubkey.serialize())
        .collect::<Vec<u8>>();
    let hashed_pubkeys = hex::encode(sha256::Hash::hash(&pubkeys_concat).to_byte_array());
    format!("{KEYSET_ID_VERSION}{}", &hashed_pubkeys[..14])
}

/// The mint's identity key, shown in `/v1/info`.
pub fn derive_mint_pubkey(seed: &[u8]) -> Result<PublicKey, NutmegCoreError> {
    let hash = sha256::Hash::hash(seed);
    let key = SecretKey::from_slice(hash.as_byte_array())?;
    let secp = Secp256k1::new();
    Ok(key.public_key(&secp))
}

/// Keyset metadata as held in the store. The key material itself is never
/// persisted, it is re-derived from the seed and `derivation_path_idx`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeysetInfo {
    pub id: String,
    pub unit: CurrencyUnit,
    pub active: bool,
    pub derivation_path_idx: u32,
    pub input_fee_ppk: u64,
    pub valid_from: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct V1Keyset {
    pub id: String,
    pub unit: CurrencyUnit,
    pub active: bool,
    pub input_fee_ppk: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct V1Keysets {
    pub keysets: Vec<V1Keyset>,
}

impl From<&KeysetInfo> for V1Keyset {
    fn from(info: &KeysetInfo) -> Self {
        Self {
            id: info.id.clone(),
            unit: info.unit.clone(),
            active: info.active,
            input_fee_ppk: info.input_fee_ppk,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{derive_keyset_id, MintKeyset, MAX_ORDER};

    const TEST_SEED: [u8; 32] = [7u8; 32];

    #[test]
    fn test_derive_keyset() -> anyhow::Result<()> {
        let keyset = MintKeyset::derive(&TEST_SEED, 0, 0)?;

        assert_eq!(keyset.private_keys.len() as u32, MAX_ORDER);
        assert_eq!(keyset.public_keys.len() as u32, MAX_ORDER);
        assert!(keyset.private_keys.contains_key(&1));
        assert!(keyset.private_keys.contains_key(&(1 << 59)));
        assert!(!keyset.private_keys.contains_key(&3));

        assert_eq!(keyset.keyset_id.len(), 16);
        assert!(keyset.keyset_id.starts_with("00"));
        Ok(())
    }

    #[test]
    fn test_derivation_is_deterministic() -> anyhow::Result<()> {
        let one = MintKeyset::derive(&TEST_SEED, 0, 0)?;
        let two = MintKeyset::derive(&TEST_SEED, 0, 100)?;

        // the fee does not change the key material
        assert_eq!(one.keyset_id, two.keyset_id);
        assert_eq!(one.public_keys, two.public_keys);
        Ok(())
    }

    #[test]
    fn test_rotation_changes_id() -> anyhow::Result<()> {
        let one = MintKeyset::derive(&TEST_SEED, 0, 0)?;
        let two = MintKeyset::derive(&TEST_SEED, 1, 0)?;

        assert_ne!(one.keyset_id, two.keyset_id);
        assert_ne!(
            one.public_keys.get(&1).unwrap(),
            two.public_keys.get(&1).unwrap()
        );
        Ok(())
    }

    #[test]
    fn test_keyset_id_is_pure_function_of_keys() -> anyhow::Result<()> {
        let keyset = MintKeyset::derive(&TEST_SEED, 3, 0)?;
        assert_eq!(keyset.keyset_id, derive_keyset_id(&keyset.public_keys));
        Ok(())
    }
}
