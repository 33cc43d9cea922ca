//! Pay-to-public-key spending conditions as described in
//! [Nut-11](https://github.com/cashubtc/nuts/blob/main/11.md).
//!
//! Signatures are BIP-340 Schnorr signatures over `SHA256(proof.secret)`, or over the
//! aggregated swap transcript when the `SIG_ALL` flag binds the outputs as well.

use std::collections::HashSet;
use std::str::FromStr;

use secp256k1::schnorr::Signature;
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use crate::blind::BlindedMessage;
use crate::crypto::{sign_message, unix_time, verify_signature};
use crate::error::NutmegCoreError;
use crate::proof::{Proof, Proofs};
use crate::secret::{Kind, SigFlag, WellKnownSecret};

#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P2PKWitness {
    pub signatures: Vec<String>,
}

impl P2PKWitness {
    pub fn from_witness(witness: &str) -> Result<Self, NutmegCoreError> {
        serde_json::from_str(witness)
            .map_err(|_| NutmegCoreError::InvalidWitness("not a p2pk witness".to_string()))
    }
}

/// Parses the schnorr signatures out of a serialized witness.
pub fn witness_signatures(witness: Option<&String>) -> Result<Vec<Signature>, NutmegCoreError> {
    let witness =
        witness.ok_or_else(|| NutmegCoreError::InvalidWitness("witness missing".to_string()))?;
    let parsed = P2PKWitness::from_witness(witness)?;
    parsed
        .signatures
        .iter()
        .map(|sig| {
            Signature::from_str(sig)
                .map_err(|_| NutmegCoreError::InvalidWitness("malformed signature".to_string()))
        })
        .collect()
}

/// Parses signatures regardless of the witness shape. HTLC witnesses carry
/// their signatures next to the preimage.
pub fn any_witness_signatures(witness: Option<&String>) -> Result<Vec<Signature>, NutmegCoreError> {
    let raw =
        witness.ok_or_else(|| NutmegCoreError::InvalidWitness("witness missing".to_string()))?;
    if let Ok(parsed) = P2PKWitness::from_witness(raw) {
        return parsed
            .signatures
            .iter()
            .map(|sig| {
                Signature::from_str(sig)
                    .map_err(|_| NutmegCoreError::InvalidWitness("malformed signature".to_string()))
            })
            .collect();
    }
    let parsed = crate::htlc::HTLCWitness::from_witness(raw)?;
    parsed
        .signatures
        .unwrap_or_default()
        .iter()
        .map(|sig| {
            Signature::from_str(sig)
                .map_err(|_| NutmegCoreError::InvalidWitness("malformed signature".to_string()))
        })
        .collect()
}

/// Number of DISTINCT pubkeys with at least one valid signature over `msg`.
pub fn valid_signatures(msg: &[u8], pubkeys: &[PublicKey], signatures: &[Signature]) -> u64 {
    let mut matched = HashSet::new();
    for pubkey in pubkeys {
        for signature in signatures {
            if verify_signature(pubkey, msg, signature) {
                matched.insert(*pubkey);
            }
        }
    }
    matched.len() as u64
}

impl Proof {
    /// Appends a signature over `SHA256(secret)` to the witness.
    pub fn sign_p2pk(&mut self, key: &SecretKey) -> Result<(), NutmegCoreError> {
        let signature = sign_message(key, self.secret.as_bytes())?;
        let mut witness = match &self.witness {
            Some(witness) => P2PKWitness::from_witness(witness)?,
            None => P2PKWitness::default(),
        };
        witness.signatures.push(signature.to_string());
        self.witness = Some(serde_json::to_string(&witness)?);
        Ok(())
    }

    /// Checks the P2PK conditions of this proof against its witness.
    pub fn verify_p2pk(&self) -> Result<(), NutmegCoreError> {
        let secret = WellKnownSecret::from_secret(&self.secret)?;
        if secret.kind != Kind::P2PK {
            return Err(NutmegCoreError::InvalidWitness(
                "not a p2pk secret".to_string(),
            ));
        }
        let conditions = secret.conditions()?;
        let msg = self.secret.as_bytes();

        let locktime_passed = conditions
            .locktime
            .is_some_and(|locktime| unix_time() >= locktime);

        if locktime_passed {
            // after the locktime the refund keys take over; without refund
            // keys the proof is spendable by anyone
            return match &conditions.refund_keys {
                None => Ok(()),
                Some(refund_keys) => {
                    let signatures = witness_signatures(self.witness.as_ref())?;
                    if valid_signatures(msg, refund_keys, &signatures) >= 1 {
                        Ok(())
                    } else {
                        Err(NutmegCoreError::NotEnoughSignatures)
                    }
                }
            };
        }

        let mut pubkeys = conditions.pubkeys.clone().unwrap_or_default();
        pubkeys.push(PublicKey::from_str(&secret.secret_data.data)?);

        let signatures = witness_signatures(self.witness.as_ref())?;
        if valid_signatures(msg, &pubkeys, &signatures) >= conditions.num_sigs.unwrap_or(1) {
            Ok(())
        } else {
            Err(NutmegCoreError::NotEnoughSignatures)
        }
    }
}

impl BlindedMessage {
    /// Appends a signature over `msg` to the witness. Used for swaps whose
    /// inputs carry the `SIG_ALL` flag.
    pub fn sign_p2pk(&mut self, key: &SecretKey, msg: &[u8]) -> Result<(), NutmegCoreError> {
        let signature = sign_message(key, msg)?;
        let mut witness = match &self.witness {
            Some(witness) => P2PKWitness::from_witness(witness)?,
            None => P2PKWitness::default(),
        };
        witness.signatures.push(signature.to_string());
        self.witness = Some(serde_json::to_string(&witness)?);
        Ok(())
    }

    /// Requires `required` distinct signatures over `msg` in this output's witness.
    pub fn verify_p2pk(
        &self,
        pubkeys: &[PublicKey],
        msg: &[u8],
        required: u64,
    ) -> Result<(), NutmegCoreError> {
        let signatures = witness_signatures(self.witness.as_ref())?;
        if valid_signatures(msg, pubkeys, &signatures) >= required {
            Ok(())
        } else {
            Err(NutmegCoreError::NotEnoughSignatures)
        }
    }
}

/// The signature policy a set of inputs imposes on the whole transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforceSigFlag {
    pub sig_flag: SigFlag,
    pub pubkeys: HashSet<PublicKey>,
    pub sigs_required: u64,
}

/// Aggregates the sig flag over all inputs: one `SIG_ALL` input makes the
/// whole transaction `SIG_ALL`, and the strictest `n_sigs` wins.
pub fn enforce_sig_flag(proofs: &Proofs) -> EnforceSigFlag {
    let mut sig_flag = SigFlag::SigInputs;
    let mut pubkeys = HashSet::new();
    let mut sigs_required = 1;

    for proof in proofs {
        let Ok(secret) = WellKnownSecret::from_secret(&proof.secret) else {
            continue;
        };
        if secret.kind == Kind::P2PK {
            if let Ok(key) = PublicKey::from_str(&secret.secret_data.data) {
                pubkeys.insert(key);
            }
        }
        let Ok(conditions) = secret.conditions() else {
            continue;
        };
        if conditions.sig_flag == SigFlag::SigAll {
            sig_flag = SigFlag::SigAll;
        }
        if let Some(num_sigs) = conditions.num_sigs {
            sigs_required = sigs_required.max(num_sigs);
        }
        if let Some(keys) = conditions.pubkeys {
            pubkeys.extend(keys);
        }
    }

    EnforceSigFlag {
        sig_flag,
        pubkeys,
        sigs_required,
    }
}

/// The message a `SIG_ALL` signature commits to: all input secrets followed
/// by the hex encodings of all output `B_` values.
pub fn sig_all_message(inputs: &Proofs, outputs: &[BlindedMessage]) -> Vec<u8> {
    let mut msg = Vec::new();
    for proof in inputs {
        msg.extend_from_slice(proof.secret.as_bytes());
    }
    for output in outputs {
        msg.extend_from_slice(output.b_.to_string().as_bytes());
    }
    msg
}

#[cfg(test)]
mod tests {
    use secp256k1::{Secp256k1, SecretKey};

    use crate::crypto::public_key_from_hex;
    use crate::error::NutmegCoreError;
    use crate::proof::Proof;
    use crate::secret::{Conditions, Kind, SigFlag, WellKnownSecret};

    fn keypair(hex_key: &str) -> (SecretKey, secp256k1::PublicKey) {
        let secp = Secp256k1::new();
        let key: SecretKey = hex_key.parse().expect("invalid secret key");
        let pubkey = key.public_key(&secp);
        (key, pubkey)
    }

    fn p2pk_proof(data: &str, conditions: Option<&Conditions>) -> Proof {
        let secret = WellKnownSecret::new(Kind::P2PK, data, conditions)
            .to_secret_string()
            .expect("serializable secret");
        Proof::new(
            8,
            secret,
            public_key_from_hex(
                "02c020067db727d586bc3183aecf97fcb800c3f4cc4759f69c626c9db5d8f5b5d4",
            )
            .unwrap(),
            "009a1f293253e41e".to_string(),
        )
    }

    #[test]
    fn test_verify_p2pk_missing_witness() {
        let (_, pubkey) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");
        let proof = p2pk_proof(&pubkey.to_string(), None);

        assert!(matches!(
            proof.verify_p2pk(),
            Err(NutmegCoreError::InvalidWitness(_))
        ));
    }

    #[test]
    fn test_verify_p2pk_wrong_key() -> anyhow::Result<()> {
        let (_, pubkey) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");
        let (other_key, _) =
            keypair("0000000000000000000000000000000000000000000000000000000000000001");

        let mut proof = p2pk_proof(&pubkey.to_string(), None);
        proof.sign_p2pk(&other_key)?;

        assert!(matches!(
            proof.verify_p2pk(),
            Err(NutmegCoreError::NotEnoughSignatures)
        ));
        Ok(())
    }

    #[test]
    fn test_verify_p2pk_valid() -> anyhow::Result<()> {
        let (key, pubkey) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");

        let mut proof = p2pk_proof(&pubkey.to_string(), None);
        proof.sign_p2pk(&key)?;

        proof.verify_p2pk()?;
        Ok(())
    }

    #[test]
    fn test_verify_p2pk_multisig() -> anyhow::Result<()> {
        let (key_one, pubkey_one) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");
        let (key_two, pubkey_two) =
            keypair("0000000000000000000000000000000000000000000000000000000000000001");

        let conditions = Conditions {
            pubkeys: Some(vec![pubkey_two]),
            num_sigs: Some(2),
            ..Default::default()
        };
        let mut proof = p2pk_proof(&pubkey_one.to_string(), Some(&conditions));

        proof.sign_p2pk(&key_one)?;
        assert!(matches!(
            proof.verify_p2pk(),
            Err(NutmegCoreError::NotEnoughSignatures)
        ));

        proof.sign_p2pk(&key_two)?;
        proof.verify_p2pk()?;
        Ok(())
    }

    #[test]
    fn test_same_key_does_not_count_twice() -> anyhow::Result<()> {
        let (key, pubkey) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");

        let conditions = Conditions {
            num_sigs: Some(2),
            ..Default::default()
        };
        let mut proof = p2pk_proof(&pubkey.to_string(), Some(&conditions));
        proof.sign_p2pk(&key)?;
        proof.sign_p2pk(&key)?;

        assert!(matches!(
            proof.verify_p2pk(),
            Err(NutmegCoreError::NotEnoughSignatures)
        ));
        Ok(())
    }

    #[test]
    fn test_locktime_without_refund_keys() -> anyhow::Result<()> {
        let (_, pubkey) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");

        let conditions = Conditions {
            locktime: Some(21),
            ..Default::default()
        };
        // locktime long in the past, no refund keys: spendable without witness
        let proof = p2pk_proof(&pubkey.to_string(), Some(&conditions));
        proof.verify_p2pk()?;
        Ok(())
    }

    #[test]
    fn test_locktime_with_refund_keys() -> anyhow::Result<()> {
        let (_, pubkey) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");
        let (refund_key, refund_pubkey) =
            keypair("0000000000000000000000000000000000000000000000000000000000000001");

        let conditions = Conditions {
            locktime: Some(21),
            refund_keys: Some(vec![refund_pubkey]),
            ..Default::default()
        };
        let mut proof = p2pk_proof(&pubkey.to_string(), Some(&conditions));

        assert!(proof.verify_p2pk().is_err());

        proof.sign_p2pk(&refund_key)?;
        proof.verify_p2pk()?;
        Ok(())
    }

    #[test]
    fn test_enforce_sig_flag() -> anyhow::Result<()> {
        let (_, pubkey_one) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");
        let (_, pubkey_two) =
            keypair("0000000000000000000000000000000000000000000000000000000000000001");

        let plain = Proof::new(
            2,
            "opaque-secret".to_string(),
            public_key_from_hex(
                "02c020067db727d586bc3183aecf97fcb800c3f4cc4759f69c626c9db5d8f5b5d4",
            )?,
            "009a1f293253e41e".to_string(),
        );
        let conditions = Conditions {
            pubkeys: Some(vec![pubkey_two]),
            num_sigs: Some(2),
            sig_flag: SigFlag::SigAll,
            ..Default::default()
        };
        let locked = p2pk_proof(&pubkey_one.to_string(), Some(&conditions));

        let enforced = super::enforce_sig_flag(&vec![plain, locked].into());
        assert_eq!(enforced.sig_flag, SigFlag::SigAll);
        assert_eq!(enforced.sigs_required, 2);
        assert!(enforced.pubkeys.contains(&pubkey_one));
        assert!(enforced.pubkeys.contains(&pubkey_two));
        Ok(())
    }
}
