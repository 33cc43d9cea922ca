//! BIP-340 Schnorr helpers used by spending conditions and mint-quote
//! signatures. Messages are hashed with SHA-256 before signing, so a
//! "signature over msg" always means a signature over `SHA256(msg)`.

use bitcoin_hashes::{sha256, Hash};
use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, PublicKey, Secp256k1, SecretKey};

use crate::error::NutmegCoreError;

pub fn sign_message(key: &SecretKey, msg: &[u8]) -> Result<Signature, NutmegCoreError> {
    let secp = Secp256k1::new();
    let digest = sha256::Hash::hash(msg);
    let message = Message::from_digest(digest.to_byte_array());
    let keypair = Keypair::from_secret_key(&secp, key);
    Ok(secp.sign_schnorr(&message, &keypair))
}

pub fn verify_signature(pubkey: &PublicKey, msg: &[u8], signature: &Signature) -> bool {
    let secp = Secp256k1::verification_only();
    let digest = sha256::Hash::hash(msg);
    let message = Message::from_digest(digest.to_byte_array());
    let (xonly, _) = pubkey.x_only_public_key();
    secp.verify_schnorr(signature, &message, &xonly).is_ok()
}

pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, NutmegCoreError> {
    use hex::FromHex;
    let bytes = Vec::from_hex(hex_key)?;
    Ok(PublicKey::from_slice(&bytes)?)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    sha256::Hash::hash(bytes).to_string()
}

/// Seconds since the unix epoch.
pub fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs()
}
