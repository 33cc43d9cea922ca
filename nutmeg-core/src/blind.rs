//! This module defines the `BlindedMessage` and `BlindedSignature` structs, which are used for
//! representing blinded messages and signatures in cashu as described in
//! [Nut-00](https://github.com/cashubtc/nuts/blob/main/00.md).
//!
//! A `BlindedSignature` optionally carries the DLEQ proof described in
//! [Nut-12](https://github.com/cashubtc/nuts/blob/main/12.md), showing that the mint signed with
//! the private key of the keyset it advertises.

use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use utoipa::ToSchema;

use crate::amount::checked_sum;
use crate::error::NutmegCoreError;

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BlindedMessage {
    pub amount: u64,
    #[serde(rename = "id")]
    pub keyset_id: String,
    #[serde(rename = "B_")]
    #[schema(value_type = String)]
    pub b_: PublicKey,
    /// Signatures required when SIG_ALL inputs bind the outputs of a swap.
    pub witness: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct BlindedSignature {
    pub amount: u64,
    #[serde(rename = "id")]
    pub keyset_id: String,
    #[serde(rename = "C_")]
    #[schema(value_type = String)]
    pub c_: PublicKey,
    pub dleq: Option<BlindSignatureDleq>,
}

/// `C_ = k*B_` and `K = k*G` share the same `k`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct BlindSignatureDleq {
    #[schema(value_type = String)]
    pub e: SecretKey,
    #[schema(value_type = String)]
    pub s: SecretKey,
}

pub trait TotalAmount {
    fn total_amount(&self) -> Result<u64, NutmegCoreError>;
}

impl TotalAmount for Vec<BlindedSignature> {
    fn total_amount(&self) -> Result<u64, NutmegCoreError> {
        checked_sum(self.iter().map(|sig| sig.amount))
    }
}

impl TotalAmount for Vec<BlindedMessage> {
    fn total_amount(&self) -> Result<u64, NutmegCoreError> {
        checked_sum(self.iter().map(|msg| msg.amount))
    }
}

impl TotalAmount for [BlindedMessage] {
    fn total_amount(&self) -> Result<u64, NutmegCoreError> {
        checked_sum(self.iter().map(|msg| msg.amount))
    }
}
