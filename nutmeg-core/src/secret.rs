//! Well-known secrets as described in [Nut-10](https://github.com/cashubtc/nuts/blob/main/10.md).
//!
//! A proof secret that parses as the JSON tuple `[kind, {"nonce", "data", "tags"}]` carries
//! spending conditions; any other secret is opaque and spendable by possession alone.

use std::fmt;
use std::str::FromStr;

use secp256k1::PublicKey;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};

use crate::amount::generate_random_string;
use crate::error::NutmegCoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    P2PK,
    HTLC,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretData {
    /// Unique random string
    pub nonce: String,
    /// Expresses the spending condition specific to each kind
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WellKnownSecret {
    pub kind: Kind,
    pub secret_data: SecretData,
}

impl WellKnownSecret {
    pub fn new(kind: Kind, data: impl Into<String>, conditions: Option<&Conditions>) -> Self {
        Self {
            kind,
            secret_data: SecretData {
                nonce: generate_random_string(),
                data: data.into(),
                tags: conditions.map(Conditions::to_tags),
            },
        }
    }

    /// Parses a proof secret. Fails with `NotWellKnownSecret` for opaque
    /// secrets, which is not an error condition for callers.
    pub fn from_secret(secret: &str) -> Result<Self, NutmegCoreError> {
        serde_json::from_str(secret).map_err(|_| NutmegCoreError::NotWellKnownSecret)
    }

    pub fn to_secret_string(&self) -> Result<String, NutmegCoreError> {
        Ok(serde_json::to_string(&self)?)
    }

    pub fn conditions(&self) -> Result<Conditions, NutmegCoreError> {
        match &self.secret_data.tags {
            Some(tags) => Conditions::try_from(tags),
            None => Ok(Conditions::default()),
        }
    }
}

impl Serialize for WellKnownSecret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.kind)?;
        tuple.serialize_element(&self.secret_data)?;
        tuple.end()
    }
}

/// Signature flag, see [Nut-11](https://github.com/cashubtc/nuts/blob/main/11.md).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SigFlag {
    /// Signatures are required on all inputs. Applied even when the
    /// `sigflag` tag is absent.
    #[default]
    SigInputs,
    /// Signatures are required on all inputs and all outputs.
    SigAll,
}

impl fmt::Display for SigFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SigInputs => write!(f, "SIG_INPUTS"),
            Self::SigAll => write!(f, "SIG_ALL"),
        }
    }
}

impl FromStr for SigFlag {
    type Err = NutmegCoreError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "SIG_INPUTS" => Ok(Self::SigInputs),
            "SIG_ALL" => Ok(Self::SigAll),
            _ => Err(NutmegCoreError::UnknownSigFlag),
        }
    }
}

/// Spending conditions shared by P2PK and HTLC secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conditions {
    /// Unix timestamp after which the refund keys can spend
    pub locktime: Option<u64>,
    /// Additional required public keys
    pub pubkeys: Option<Vec<PublicKey>>,
    /// Keys that can spend after the locktime passed
    pub refund_keys: Option<Vec<PublicKey>>,
    /// Number of required signatures, defaults to 1
    pub num_sigs: Option<u64>,
    pub sig_flag: SigFlag,
}

impl Conditions {
    pub fn to_tags(&self) -> Vec<Vec<String>> {
        let mut tags = Vec::new();
        if let Some(pubkeys) = &self.pubkeys {
            let mut tag = vec!["pubkeys".to_string()];
            tag.extend(pubkeys.iter().map(ToString::to_string));
            tags.push(tag);
        }
        if let Some(locktime) = self.locktime {
            tags.push(vec!["locktime".to_string(), locktime.to_string()]);
        }
        if let Some(num_sigs) = self.num_sigs {
            tags.push(vec!["n_sigs".to_string(), num_sigs.to_string()]);
        }
        if let Some(refund_keys) = &self.refund_keys {
            let mut tag = vec!["refund".to_string()];
            tag.extend(refund_keys.iter().map(ToString::to_string));
            tags.push(tag);
        }
        tags.push(vec!["sigflag".to_string(), self.sig_flag.to_string()]);
        tags
    }

    fn parse_keys(tag: &[String]) -> Result<Vec<PublicKey>, NutmegCoreError> {
        tag.iter()
            .skip(1)
            .map(|key| PublicKey::from_str(key).map_err(NutmegCoreError::from))
            .collect()
    }
}

impl TryFrom<&Vec<Vec<String>>> for Conditions {
    type Error = NutmegCoreError;

    fn try_from(tags: &Vec<Vec<String>>) -> Result<Self, Self::Error> {
        let mut conditions = Conditions::default();
        for tag in tags {
            let (kind, values) = match tag.split_first() {
                Some((kind, values)) if !values.is_empty() => (kind.as_str(), values),
                _ => continue,
            };
            match kind {
                "pubkeys" => conditions.pubkeys = Some(Self::parse_keys(tag)?),
                "refund" => conditions.refund_keys = Some(Self::parse_keys(tag)?),
                "locktime" => {
                    conditions.locktime = Some(
                        values[0]
                            .parse()
                            .map_err(|_| NutmegCoreError::InvalidWitness("locktime".to_string()))?,
                    )
                }
                "n_sigs" => {
                    conditions.num_sigs = Some(
                        values[0]
                            .parse()
                            .map_err(|_| NutmegCoreError::InvalidWitness("n_sigs".to_string()))?,
                    )
                }
                "sigflag" => conditions.sig_flag = values[0].parse()?,
                // unknown tags are allowed and carry no meaning for the mint
                _ => {}
            }
        }
        Ok(conditions)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use pretty_assertions::assert_eq;
    use secp256k1::PublicKey;

    use super::{Conditions, Kind, SecretData, SigFlag, WellKnownSecret};

    #[test]
    fn test_secret_serialize() -> anyhow::Result<()> {
        let secret = WellKnownSecret {
            kind: Kind::P2PK,
            secret_data: SecretData {
                nonce: "5d11913ee0f92fefdc82a6764fd2457a".to_string(),
                data: "026562efcfadc8e86d44da6a8adf80633d974302e62c850774db1fb36ff4cc7198"
                    .to_string(),
                tags: Some(vec![vec![
                    "key".to_string(),
                    "value1".to_string(),
                    "value2".to_string(),
                ]]),
            },
        };

        let expected = r#"["P2PK",{"nonce":"5d11913ee0f92fefdc82a6764fd2457a","data":"026562efcfadc8e86d44da6a8adf80633d974302e62c850774db1fb36ff4cc7198","tags":[["key","value1","value2"]]}]"#;
        assert_eq!(secret.to_secret_string()?, expected);

        let parsed = WellKnownSecret::from_secret(expected)?;
        assert_eq!(parsed, secret);
        Ok(())
    }

    #[test]
    fn test_opaque_secret_is_not_well_known() {
        assert!(WellKnownSecret::from_secret("EhpennC9qB3iFlW8FZ_pZw").is_err());
        assert!(WellKnownSecret::from_secret(r#"["FOO",{"nonce":"x","data":"y"}]"#).is_err());
    }

    #[test]
    fn test_parse_conditions() -> anyhow::Result<()> {
        let secret_str = r#"["P2PK",{"nonce":"abc","data":"0249098aa8b9d2fbec49ff8598feb17b592b986e62319a4fa488a3dc36387157a7","tags":[["pubkeys","0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798","02142715675faf8da1ecc4d51e0b9e539fa0d52fdd96ed60dbe99adb15d6b05ad9"],["n_sigs","2"],["locktime","21"],["refund","0249098aa8b9d2fbec49ff8598feb17b592b986e62319a4fa488a3dc36387157a7"],["sigflag","SIG_ALL"]]}]"#;

        let secret = WellKnownSecret::from_secret(secret_str)?;
        let conditions = secret.conditions()?;

        assert_eq!(conditions.num_sigs, Some(2));
        assert_eq!(conditions.locktime, Some(21));
        assert_eq!(conditions.sig_flag, SigFlag::SigAll);
        assert_eq!(conditions.pubkeys.as_ref().map(Vec::len), Some(2));
        assert_eq!(conditions.refund_keys.as_ref().map(Vec::len), Some(1));
        Ok(())
    }

    #[test]
    fn test_conditions_roundtrip() -> anyhow::Result<()> {
        let conditions = Conditions {
            locktime: Some(21000000000),
            pubkeys: Some(vec![PublicKey::from_str(
                "02698c4e2b5f9534cd0687d87513c759790cf829aa5739184a3e3735471fbda904",
            )?]),
            refund_keys: None,
            num_sigs: Some(1),
            sig_flag: SigFlag::SigInputs,
        };

        let parsed = Conditions::try_from(&conditions.to_tags())?;
        assert_eq!(parsed, conditions);
        Ok(())
    }

    #[test]
    fn test_unknown_tags_are_ignored() -> anyhow::Result<()> {
        let tags = vec![
            vec!["whatever".to_string(), "value".to_string()],
            vec!["n_sigs".to_string(), "3".to_string()],
        ];
        let conditions = Conditions::try_from(&tags)?;
        assert_eq!(conditions.num_sigs, Some(3));
        Ok(())
    }
}
