use nutmeg_core::error::NutmegCoreError;
use nutmeg_core::primitives::{MeltQuoteState, MintQuoteState, PostMeltQuoteBolt11Response, PostMintQuoteBolt11Response};
use nutmeg_core::proof::Proof;
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reservation to mint ecash by paying a Lightning invoice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MintQuote {
    pub quote_id: Uuid,
    pub amount: u64,
    pub payment_request: String,
    pub payment_hash: String,
    pub state: MintQuoteState,
    pub expiry: u64,
    /// When set, minting requires a NUT-20 signature by this key.
    pub pubkey: Option<PublicKey>,
}

impl From<&MintQuote> for PostMintQuoteBolt11Response {
    fn from(quote: &MintQuote) -> Self {
        Self {
            quote: quote.quote_id.to_string(),
            request: quote.payment_request.clone(),
            state: quote.state,
            expiry: quote.expiry,
        }
    }
}

/// A reservation to burn ecash by having the mint pay a Lightning invoice.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeltQuote {
    pub quote_id: Uuid,
    pub payment_request: String,
    pub payment_hash: String,
    pub amount: u64,
    pub fee_reserve: u64,
    pub state: MeltQuoteState,
    pub expiry: u64,
    pub preimage: Option<String>,
    /// Partial amount for multi-path payments, in millisats.
    pub mpp_amount_msat: Option<u64>,
}

impl From<&MeltQuote> for PostMeltQuoteBolt11Response {
    fn from(quote: &MeltQuote) -> Self {
        Self {
            quote: quote.quote_id.to_string(),
            amount: quote.amount,
            fee_reserve: quote.fee_reserve,
            state: quote.state,
            expiry: quote.expiry,
            payment_preimage: quote.preimage.clone(),
        }
    }
}

/// A proof as persisted in the spent and pending tables, keyed by
/// `Y = hash_to_curve(secret)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofRecord {
    pub y: String,
    pub amount: u64,
    pub keyset_id: String,
    pub secret: String,
    pub c: String,
    pub witness: Option<String>,
}

impl TryFrom<&Proof> for ProofRecord {
    type Error = NutmegCoreError;

    fn try_from(proof: &Proof) -> Result<Self, Self::Error> {
        Ok(Self {
            y: proof.y_hex()?,
            amount: proof.amount,
            keyset_id: proof.keyset_id.clone(),
            secret: proof.secret.clone(),
            c: proof.c.to_string(),
            witness: proof.witness.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateInvoiceResult {
    pub payment_hash: String,
    pub payment_request: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvoiceStatus {
    pub settled: bool,
    pub preimage: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentStatus {
    Succeeded,
    Failed,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentResult {
    pub status: PaymentStatus,
    pub preimage: Option<String>,
    /// total routing fees paid, in sats
    pub total_fees: u64,
}

/// The fields of a bolt11 invoice the mint acts on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub amount_msat: Option<u64>,
    pub payment_hash: String,
}
