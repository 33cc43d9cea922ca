//! This module contains all the request and response objects that are used for interacting
//! between the mint and its clients on the v1 api. All of these structs are serializable and
//! deserializable using serde.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use secp256k1::schnorr::Signature;
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use utoipa::ToSchema;

use crate::blind::{BlindedMessage, BlindedSignature};
use crate::crypto::{sign_message, verify_signature};
use crate::error::NutmegCoreError;
use crate::proof::Proofs;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyUnit {
    #[default]
    Sat,
}

impl fmt::Display for CurrencyUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sat => write!(f, "sat"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    #[default]
    Bolt11,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bolt11 => write!(f, "bolt11"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum MintQuoteState {
    Unpaid,
    Paid,
    Issued,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeltQuoteState {
    Unpaid,
    Pending,
    Paid,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProofState {
    Unspent,
    Pending,
    Spent,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostMintQuoteBolt11Request {
    pub amount: u64,
    pub unit: CurrencyUnit,
    /// When set, minting against this quote requires a signature by this key.
    #[schema(value_type = Option<String>)]
    pub pubkey: Option<PublicKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostMintQuoteBolt11Response {
    pub quote: String,
    pub request: String,
    pub state: MintQuoteState,
    pub expiry: u64,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostMintBolt11Request {
    pub quote: String,
    pub outputs: Vec<BlindedMessage>,
    /// NUT-20 schnorr signature over the quote id and all blinded messages.
    pub signature: Option<String>,
}

impl PostMintBolt11Request {
    /// `quote_id || B_0 || .. || B_n`, each `B_` hex encoded.
    pub fn msg_to_sign(&self) -> Vec<u8> {
        let mut msg = self.quote.clone().into_bytes();
        for output in &self.outputs {
            msg.extend_from_slice(output.b_.to_string().as_bytes());
        }
        msg
    }

    pub fn sign(&mut self, key: &SecretKey) -> Result<(), NutmegCoreError> {
        let signature = sign_message(key, &self.msg_to_sign())?;
        self.signature = Some(signature.to_string());
        Ok(())
    }

    pub fn verify_signature(&self, pubkey: &PublicKey) -> Result<(), NutmegCoreError> {
        let signature = self
            .signature
            .as_ref()
            .ok_or(NutmegCoreError::SignatureMissing)?;
        let signature =
            Signature::from_str(signature).map_err(|_| NutmegCoreError::InvalidSignature)?;
        if verify_signature(pubkey, &self.msg_to_sign(), &signature) {
            Ok(())
        } else {
            Err(NutmegCoreError::InvalidSignature)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostMintBolt11Response {
    pub signatures: Vec<BlindedSignature>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostMeltQuoteBolt11Request {
    /// bolt11 invoice to be paid by the mint
    pub request: String,
    pub unit: CurrencyUnit,
    /// Partial amount for multi-path payments, in millisats.
    pub mpp_amount_msat: Option<u64>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostMeltQuoteBolt11Response {
    pub quote: String,
    pub amount: u64,
    pub fee_reserve: u64,
    pub state: MeltQuoteState,
    pub expiry: u64,
    pub payment_preimage: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostMeltBolt11Request {
    pub quote: String,
    pub inputs: Proofs,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostMeltBolt11Response {
    pub state: MeltQuoteState,
    pub payment_preimage: Option<String>,
    pub change: Option<Vec<BlindedSignature>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostSwapRequest {
    pub inputs: Proofs,
    pub outputs: Vec<BlindedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostSwapResponse {
    pub signatures: Vec<BlindedSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostCheckStateRequest {
    #[serde(rename = "Ys")]
    pub ys: Vec<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ProofCheckState {
    #[serde(rename = "Y")]
    pub y: String,
    pub state: ProofState,
    pub witness: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostCheckStateResponse {
    pub states: Vec<ProofCheckState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostRestoreRequest {
    pub outputs: Vec<BlindedMessage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct PostRestoreResponse {
    pub outputs: Vec<BlindedMessage>,
    pub signatures: Vec<BlindedSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct KeyResponse {
    pub id: String,
    pub unit: CurrencyUnit,
    #[schema(value_type = BTreeMap<String, String>)]
    pub keys: BTreeMap<u64, PublicKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct KeysResponse {
    pub keysets: Vec<KeyResponse>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MintInfoResponse {
    pub name: Option<String>,
    #[schema(value_type = Option<String>)]
    pub pubkey: Option<PublicKey>,
    pub version: Option<String>,
    pub description: Option<String>,
    pub description_long: Option<String>,
    pub contact: Option<Vec<Vec<String>>>,
    pub motd: Option<String>,
    pub nuts: Nuts,
}

/// Supported protocol settings, keyed by NUT number.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Nuts {
    #[serde(rename = "4")]
    pub nut4: MethodSettings,
    #[serde(rename = "5")]
    pub nut5: MethodSettings,
    #[serde(rename = "7")]
    pub nut7: SupportedSettings,
    #[serde(rename = "8")]
    pub nut8: SupportedSettings,
    #[serde(rename = "9")]
    pub nut9: SupportedSettings,
    #[serde(rename = "10")]
    pub nut10: SupportedSettings,
    #[serde(rename = "11")]
    pub nut11: SupportedSettings,
    #[serde(rename = "12")]
    pub nut12: SupportedSettings,
    #[serde(rename = "14")]
    pub nut14: SupportedSettings,
    #[serde(rename = "17")]
    pub nut17: SupportedSettings,
    #[serde(rename = "20")]
    pub nut20: SupportedSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MethodSettings {
    pub methods: Vec<MethodEntry>,
    pub disabled: bool,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct MethodEntry {
    pub method: PaymentMethod,
    pub unit: CurrencyUnit,
    pub min_amount: Option<u64>,
    pub max_amount: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct SupportedSettings {
    pub supported: bool,
}
