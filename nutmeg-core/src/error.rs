//! This module defines the `NutmegCoreError` enum, which represents the possible errors that can occur in the nutmeg core library.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NutmegCoreError {
    #[error("Secp256k1Error {0}")]
    Secp256k1Error(#[from] secp256k1::Error),

    #[error("Bip32Error {0}")]
    Bip32Error(#[from] bip32::Error),

    #[error("HexError {0}")]
    HexError(#[from] hex::FromHexError),

    #[error("SerdeJsonError {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("No valid point found")]
    NoValidPoint,

    #[error("Invalid Keysetid")]
    InvalidKeysetId,

    #[error("Amount overflow")]
    AmountOverflow,

    #[error("Invalid witness: {0}")]
    InvalidWitness(String),

    #[error("Not enough signatures")]
    NotEnoughSignatures,

    #[error("Invalid preimage")]
    InvalidPreimage,

    #[error("Invalid hash")]
    InvalidHash,

    #[error("Unknown sigflag")]
    UnknownSigFlag,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Signature missing")]
    SignatureMissing,

    #[error("Not a well-known secret")]
    NotWellKnownSecret,
}
