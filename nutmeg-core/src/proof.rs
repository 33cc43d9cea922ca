//! This module defines the `Proof` and `Proofs` structs, which represent the bearer tokens held
//! by wallets as described in [Nut-00](https://github.com/cashubtc/nuts/blob/main/00.md).
//!
//! For bookkeeping a proof is identified by `Y = hash_to_curve(secret)`: two proofs with the
//! same secret are the same proof, which is the double-spend key of the mint.

use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use utoipa::ToSchema;

use crate::amount::checked_sum;
use crate::dhke::Dhke;
use crate::error::NutmegCoreError;

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Proof {
    pub amount: u64,
    #[serde(rename = "id")]
    pub keyset_id: String,
    pub secret: String,
    #[serde(rename = "C")]
    #[schema(value_type = String)]
    pub c: PublicKey,
    /// JSON encoded P2PK or HTLC witness.
    pub witness: Option<String>,
    pub dleq: Option<ProofDleq>,
}

impl Proof {
    pub fn new(amount: u64, secret: String, c: PublicKey, keyset_id: String) -> Self {
        Self {
            amount,
            keyset_id,
            secret,
            c,
            witness: None,
            dleq: None,
        }
    }

    /// `Y = hash_to_curve(secret)`, the canonical identity of this proof.
    pub fn y(&self) -> Result<PublicKey, NutmegCoreError> {
        Dhke::hash_to_curve(self.secret.as_bytes())
    }

    pub fn y_hex(&self) -> Result<String, NutmegCoreError> {
        Ok(self.y()?.to_string())
    }
}

/// Wallet side DLEQ data: the blind-signature proof plus the blinding factor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ProofDleq {
    #[schema(value_type = String)]
    pub e: SecretKey,
    #[schema(value_type = String)]
    pub s: SecretKey,
    #[schema(value_type = String)]
    pub r: SecretKey,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Proofs(pub(super) Vec<Proof>);

impl Proofs {
    pub fn new(proofs: Vec<Proof>) -> Self {
        Self(proofs)
    }

    pub const fn empty() -> Self {
        Self(vec![])
    }

    pub fn total_amount(&self) -> Result<u64, NutmegCoreError> {
        checked_sum(self.0.iter().map(|proof| proof.amount))
    }

    pub fn proofs(&self) -> Vec<Proof> {
        self.0.clone()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Proof> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `Y` values of all proofs, in proof order.
    pub fn ys(&self) -> Result<Vec<String>, NutmegCoreError> {
        self.0.iter().map(|proof| proof.y_hex()).collect()
    }
}

impl From<Vec<Proof>> for Proofs {
    fn from(from: Vec<Proof>) -> Self {
        Self(from)
    }
}

impl From<Proof> for Proofs {
    fn from(from: Proof) -> Self {
        Self(vec![from])
    }
}

impl<'a> IntoIterator for &'a Proofs {
    type Item = &'a Proof;
    type IntoIter = std::slice::Iter<'a, Proof>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use crate::proof::Proof;

    #[test]
    fn test_proof_deserialize() -> anyhow::Result<()> {
        let js = json!(
            {
              "id": "009a1f293253e41e",
              "amount": 2,
              "secret": "EhpennC9qB3iFlW8FZ_pZw",
              "C": "02c020067db727d586bc3183aecf97fcb800c3f4cc4759f69c626c9db5d8f5b5d4"
            }
        );

        let proof = serde_json::from_value::<Proof>(js)?;
        assert_eq!(proof.amount, 2);
        assert_eq!(proof.keyset_id, "009a1f293253e41e".to_string());
        assert_eq!(proof.secret, "EhpennC9qB3iFlW8FZ_pZw".to_string());
        assert!(proof.witness.is_none());
        Ok(())
    }

    #[test]
    fn test_proof_y_is_stable() -> anyhow::Result<()> {
        let c = crate::crypto::public_key_from_hex(
            "02c020067db727d586bc3183aecf97fcb800c3f4cc4759f69c626c9db5d8f5b5d4",
        )?;
        let one = Proof::new(2, "mysecret".to_string(), c, "009a1f293253e41e".to_string());
        let mut two = one.clone();
        two.amount = 4;
        two.keyset_id = "00ffd48b8f5ecf80".to_string();

        // identity only depends on the secret
        assert_eq!(one.y_hex()?, two.y_hex()?);
        Ok(())
    }
}
