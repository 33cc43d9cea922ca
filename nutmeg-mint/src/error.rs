use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use nutmeg_core::error::NutmegCoreError;
use serde_json::json;
use thiserror::Error;
use tracing::{event, Level};

use crate::lightning::error::LightningError;

#[derive(Error, Debug)]
pub enum NutmegMintError {
    #[error("Keyset is not known: {0}")]
    UnknownKeyset(String),

    #[error("Keyset is inactive")]
    KeysetInactive,

    #[error("Unit is not supported")]
    UnitNotSupported,

    #[error("Payment method is not supported")]
    PaymentMethodNotSupported,

    #[error("Invalid amount")]
    InvalidAmount,

    #[error("Mint amount outside of limit range")]
    MintAmountExceeded,

    #[error("Melt amount outside of limit range")]
    MeltAmountExceeded,

    #[error("Minting is disabled")]
    MintingDisabled,

    #[error("Quote not found")]
    QuoteNotFound,

    #[error("A quote for this payment request already exists")]
    QuoteExists,

    #[error("Quote request is not paid")]
    QuoteNotPaid,

    #[error("Quote is pending")]
    QuotePending,

    #[error("Output has already been issued for quote")]
    AlreadyIssued,

    #[error("Quote is already paid")]
    AlreadyPaid,

    #[error("Signature for mint request invalid")]
    InvalidSignature,

    #[error("Duplicate inputs provided")]
    DuplicateProofs,

    #[error("Duplicate outputs provided")]
    DuplicateOutputs,

    #[error("Token is already spent")]
    AlreadySpent,

    #[error("Token is pending in another transaction")]
    ProofPending,

    #[error("Token could not be verified")]
    InvalidProof,

    #[error("Blinded message has already been signed")]
    AlreadySigned,

    #[error("Transaction is not balanced: inputs do not cover outputs plus fees")]
    InsufficientInputs,

    #[error("Outputs exceed quote amount")]
    OutputsOverQuote,

    #[error("Invalid preimage")]
    InvalidPreimage,

    #[error("Invalid witness: {0}")]
    InvalidWitness(String),

    #[error("Not enough signatures")]
    NotEnoughSignatures,

    #[error("SIG_ALL proofs can only be used in a swap")]
    SigAllOnlySwap,

    #[error("Failed to decode payment request {0}")]
    DecodeInvoice(String),

    #[error("Lightning Error {0}")]
    Lightning(#[from] LightningError),

    #[error("DB Error {0}")]
    Db(#[from] sqlx::Error),

    #[error("Serde Error {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl NutmegMintError {
    /// cashu wire error code, one per kind.
    pub fn code(&self) -> u64 {
        match self {
            Self::AlreadySigned => 10002,
            Self::InvalidProof => 10003,
            Self::AlreadySpent => 11001,
            Self::InsufficientInputs => 11002,
            Self::UnitNotSupported | Self::PaymentMethodNotSupported => 11005,
            Self::MintAmountExceeded => 11006,
            Self::DuplicateProofs => 11007,
            Self::DuplicateOutputs => 11008,
            Self::ProofPending => 11009,
            Self::OutputsOverQuote => 11010,
            Self::MeltAmountExceeded => 11011,
            Self::InvalidAmount => 11012,
            Self::UnknownKeyset(_) => 12001,
            Self::KeysetInactive => 12002,
            Self::QuoteNotPaid => 20001,
            Self::AlreadyIssued => 20002,
            Self::MintingDisabled => 20003,
            Self::QuoteNotFound => 20004,
            Self::QuotePending => 20005,
            Self::AlreadyPaid => 20006,
            Self::InvalidSignature => 20008,
            Self::QuoteExists => 20009,
            Self::InvalidWitness(_) => 30001,
            Self::NotEnoughSignatures => 30002,
            Self::InvalidPreimage => 30003,
            Self::SigAllOnlySwap => 30004,
            _ => 0,
        }
    }
}

/// Maps spending-condition failures from the core library onto wire errors.
impl From<NutmegCoreError> for NutmegMintError {
    fn from(err: NutmegCoreError) -> Self {
        match err {
            NutmegCoreError::NotEnoughSignatures => Self::NotEnoughSignatures,
            NutmegCoreError::InvalidPreimage => Self::InvalidPreimage,
            NutmegCoreError::InvalidWitness(detail) => Self::InvalidWitness(detail),
            NutmegCoreError::InvalidSignature | NutmegCoreError::SignatureMissing => {
                Self::InvalidSignature
            }
            NutmegCoreError::AmountOverflow => Self::InvalidAmount,
            err => Self::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for NutmegMintError {
    fn into_response(self) -> Response {
        event!(Level::ERROR, "error in mint: {:?}", self);

        let status = match self {
            Self::Db(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };

        let body = Json(json!({
            "code": self.code(),
            "detail": self.to_string(),
        }));

        (status, body).into_response()
    }
}
