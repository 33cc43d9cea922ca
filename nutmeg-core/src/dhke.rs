//! Blind Diffie-Hellman key exchange, the signature scheme behind cashu.
//!
//! Alice (wallet):
//!```python
//! Y = hash_to_curve(secret)
//! r = random blinding factor
//! B_ = Y + r*G
//!```
//!
//! Bob (mint):
//!```python
//! C_ = k*B_
//!```
//!
//! Alice unblinds:
//!```python
//! C = C_ - r*K  (= k*Y)
//!```
//!
//! Bob can later check `C == k*hash_to_curve(secret)` without ever having
//! seen the secret at signing time.
//!
//! In addition the mint attaches a DLEQ proof to every blind signature,
//! showing that `C_ = k*B_` and `K = k*G` use the same `k`.

use bitcoin_hashes::{sha256, Hash};
use secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};

use crate::blind::BlindSignatureDleq;
use crate::error::NutmegCoreError;

const DOMAIN_SEPARATOR: &[u8; 28] = b"Secp256k1_HashToCurve_Cashu_";

#[derive(Clone, Debug)]
pub struct Dhke {
    secp: Secp256k1<All>,
}

impl Default for Dhke {
    fn default() -> Self {
        Self::new()
    }
}

impl Dhke {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    /// Maps a message to a point on the curve.
    ///
    /// `msg_hash = SHA256(DOMAIN_SEPARATOR || msg)`, then for a little-endian
    /// 32-bit counter the first `SHA256(msg_hash || counter)` that parses as
    /// the x coordinate of a compressed point (prefix `0x02`) wins.
    pub fn hash_to_curve(message: &[u8]) -> Result<PublicKey, NutmegCoreError> {
        let msg_to_hash = [DOMAIN_SEPARATOR.as_slice(), message].concat();
        let msg_hash = sha256::Hash::hash(&msg_to_hash).to_byte_array();

        let mut counter: u32 = 0;
        while counter < 2_u32.pow(16) {
            let mut bytes_to_hash = Vec::with_capacity(36);
            bytes_to_hash.extend_from_slice(&msg_hash);
            bytes_to_hash.extend_from_slice(&counter.to_le_bytes());
            let hash = sha256::Hash::hash(&bytes_to_hash).to_byte_array();

            let mut candidate = [0u8; 33];
            candidate[0] = 0x02;
            candidate[1..].copy_from_slice(&hash);
            match PublicKey::from_slice(&candidate) {
                Ok(point) => return Ok(point),
                Err(_) => counter += 1,
            }
        }
        Err(NutmegCoreError::NoValidPoint)
    }

    /// `e = SHA256(R1 || R2 || K || C_)` over the hex encodings of the
    /// uncompressed serializations, as used by the DLEQ challenge.
    pub fn hash_e(points: &[PublicKey]) -> [u8; 32] {
        let mut e = String::new();
        for point in points {
            e.push_str(&hex::encode(point.serialize_uncompressed()));
        }
        sha256::Hash::hash(e.as_bytes()).to_byte_array()
    }

    /// `B_ = hash_to_curve(secret) + r*G`. Returns the blinded point and the
    /// blinding factor `r`.
    pub fn blind_message(
        &self,
        secret: &[u8],
        blinding_factor: Option<SecretKey>,
    ) -> Result<(PublicKey, SecretKey), NutmegCoreError> {
        let y = Self::hash_to_curve(secret)?;
        let r = blinding_factor.unwrap_or_else(|| SecretKey::new(&mut rand::thread_rng()));
        let b_ = y.combine(&r.public_key(&self.secp))?;
        Ok((b_, r))
    }

    /// `C_ = k*B_`
    pub fn sign_blinded_message(
        &self,
        b_: &PublicKey,
        k: &SecretKey,
    ) -> Result<PublicKey, NutmegCoreError> {
        Ok(b_.mul_tweak(&self.secp, &Scalar::from(*k))?)
    }

    /// `C = C_ - r*K`
    pub fn unblind(
        &self,
        c_: PublicKey,
        r: &SecretKey,
        k: &PublicKey,
    ) -> Result<PublicKey, NutmegCoreError> {
        let rk = k.mul_tweak(&self.secp, &Scalar::from(*r))?;
        Ok(c_.combine(&rk.negate(&self.secp))?)
    }

    /// `C == k*hash_to_curve(secret)`
    pub fn verify(
        &self,
        k: &SecretKey,
        c: &PublicKey,
        secret: &[u8],
    ) -> Result<bool, NutmegCoreError> {
        let y = Self::hash_to_curve(secret)?;
        Ok(*c == y.mul_tweak(&self.secp, &Scalar::from(*k))?)
    }

    /// Proof that `C_` was signed with the private key of `K`:
    ///
    /// ```python
    /// r = random nonce
    /// R1 = r*G
    /// R2 = r*B_
    /// e = hash(R1, R2, K, C_)
    /// s = r + e*k
    /// ```
    pub fn generate_dleq(
        &self,
        k: &SecretKey,
        b_: &PublicKey,
        c_: &PublicKey,
    ) -> Result<BlindSignatureDleq, NutmegCoreError> {
        let r = SecretKey::new(&mut rand::thread_rng());
        let r1 = r.public_key(&self.secp);
        let r2 = b_.mul_tweak(&self.secp, &Scalar::from(r))?;

        let e_bytes = Self::hash_e(&[r1, r2, k.public_key(&self.secp), *c_]);
        let e = SecretKey::from_slice(&e_bytes)?;

        let ek = k.mul_tweak(&Scalar::from(e))?;
        let s = r.add_tweak(&Scalar::from(ek))?;

        Ok(BlindSignatureDleq { e, s })
    }

    /// `R1 = s*G - e*K`, `R2 = s*B_ - e*C_`, valid iff
    /// `e == hash(R1, R2, K, C_)`.
    pub fn verify_dleq(
        &self,
        dleq: &BlindSignatureDleq,
        k: &PublicKey,
        b_: &PublicKey,
        c_: &PublicKey,
    ) -> Result<bool, NutmegCoreError> {
        let e_scalar = Scalar::from(dleq.e);
        let s_scalar = Scalar::from(dleq.s);

        let ek = k.mul_tweak(&self.secp, &e_scalar)?;
        let r1 = dleq
            .s
            .public_key(&self.secp)
            .combine(&ek.negate(&self.secp))?;

        let sb = b_.mul_tweak(&self.secp, &s_scalar)?;
        let ec = c_.mul_tweak(&self.secp, &e_scalar)?;
        let r2 = sb.combine(&ec.negate(&self.secp))?;

        Ok(Self::hash_e(&[r1, r2, *k, *c_]) == dleq.e.secret_bytes())
    }
}
