//! Hash-time-locked spending conditions as described in
//! [Nut-14](https://github.com/cashubtc/nuts/blob/main/14.md).

use std::str::FromStr;

use bitcoin_hashes::{sha256, Hash};
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};

use crate::crypto::{sign_message, unix_time};
use crate::error::NutmegCoreError;
use crate::p2pk::valid_signatures;
use crate::proof::Proof;
use crate::secret::{Kind, WellKnownSecret};

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HTLCWitness {
    pub preimage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures: Option<Vec<String>>,
}

impl HTLCWitness {
    pub fn from_witness(witness: &str) -> Result<Self, NutmegCoreError> {
        serde_json::from_str(witness)
            .map_err(|_| NutmegCoreError::InvalidWitness("not an htlc witness".to_string()))
    }
}

impl Proof {
    /// Sets the HTLC witness to the given preimage, dropping any signatures.
    pub fn add_preimage(&mut self, preimage: impl Into<String>) -> Result<(), NutmegCoreError> {
        self.witness = Some(serde_json::to_string(&HTLCWitness {
            preimage: preimage.into(),
            signatures: None,
        })?);
        Ok(())
    }

    /// Appends a signature over `SHA256(secret)` to the HTLC witness.
    pub fn sign_htlc(&mut self, key: &SecretKey) -> Result<(), NutmegCoreError> {
        let witness = self
            .witness
            .as_ref()
            .ok_or_else(|| NutmegCoreError::InvalidWitness("preimage missing".to_string()))?;
        let mut witness = HTLCWitness::from_witness(witness)?;
        let signature = sign_message(key, self.secret.as_bytes())?;
        witness
            .signatures
            .get_or_insert_with(Vec::new)
            .push(signature.to_string());
        self.witness = Some(serde_json::to_string(&witness)?);
        Ok(())
    }

    /// Checks only the preimage commitment. Used for swaps where `SIG_ALL`
    /// moves the signature domain to the whole transaction.
    pub fn verify_htlc_preimage(&self) -> Result<(), NutmegCoreError> {
        let secret = WellKnownSecret::from_secret(&self.secret)?;
        let witness = self
            .witness
            .as_ref()
            .ok_or_else(|| NutmegCoreError::InvalidWitness("witness missing".to_string()))?;
        let witness = HTLCWitness::from_witness(witness)?;

        let hash_lock = sha256::Hash::from_str(&secret.secret_data.data)
            .map_err(|_| NutmegCoreError::InvalidHash)?;
        if hash_lock != sha256::Hash::hash(witness.preimage.as_bytes()) {
            return Err(NutmegCoreError::InvalidPreimage);
        }
        Ok(())
    }

    /// Checks the HTLC conditions of this proof against its witness: the
    /// preimage must match the hash commitment, then the signature policy of
    /// the tags applies.
    pub fn verify_htlc(&self) -> Result<(), NutmegCoreError> {
        let secret = WellKnownSecret::from_secret(&self.secret)?;
        if secret.kind != Kind::HTLC {
            return Err(NutmegCoreError::InvalidWitness(
                "not an htlc secret".to_string(),
            ));
        }
        let conditions = secret.conditions()?;

        let witness = self
            .witness
            .as_ref()
            .ok_or_else(|| NutmegCoreError::InvalidWitness("witness missing".to_string()))?;
        let witness = HTLCWitness::from_witness(witness)?;

        let hash_lock =
            sha256::Hash::from_str(&secret.secret_data.data).map_err(|_| NutmegCoreError::InvalidHash)?;
        let preimage_hash = sha256::Hash::hash(witness.preimage.as_bytes());
        if hash_lock != preimage_hash {
            return Err(NutmegCoreError::InvalidPreimage);
        }

        let msg = self.secret.as_bytes();
        let locktime_passed = conditions
            .locktime
            .is_some_and(|locktime| unix_time() >= locktime);

        if locktime_passed {
            return match &conditions.refund_keys {
                None => Ok(()),
                Some(refund_keys) => {
                    let signatures = parse_signatures(witness.signatures.as_deref())?;
                    if valid_signatures(msg, refund_keys, &signatures) >= 1 {
                        Ok(())
                    } else {
                        Err(NutmegCoreError::NotEnoughSignatures)
                    }
                }
            };
        }

        // without a pubkey policy the preimage alone unlocks the proof
        let Some(pubkeys) = &conditions.pubkeys else {
            return Ok(());
        };
        let signatures = parse_signatures(witness.signatures.as_deref())?;
        if valid_signatures(msg, pubkeys, &signatures) >= conditions.num_sigs.unwrap_or(1) {
            Ok(())
        } else {
            Err(NutmegCoreError::NotEnoughSignatures)
        }
    }
}

fn parse_signatures(
    signatures: Option<&[String]>,
) -> Result<Vec<secp256k1::schnorr::Signature>, NutmegCoreError> {
    signatures
        .ok_or_else(|| NutmegCoreError::InvalidWitness("signatures missing".to_string()))?
        .iter()
        .map(|sig| {
            secp256k1::schnorr::Signature::from_str(sig)
                .map_err(|_| NutmegCoreError::InvalidWitness("malformed signature".to_string()))
        })
        .collect()
}
