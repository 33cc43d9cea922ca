use async_trait::async_trait;
use nutmeg_core::blind::BlindedSignature;
use nutmeg_core::keyset::KeysetInfo;
use nutmeg_core::primitives::{MeltQuoteState, MintQuoteState};
use uuid::Uuid;

use crate::error::NutmegMintError;
use crate::model::{MeltQuote, MintQuote, ProofRecord};

pub mod memory;
pub mod postgres;

/// Durable state of the mint: keysets, quotes, spent and pending proofs and
/// the blind-signature cache.
///
/// Per-secret exclusion lives here: the spent and pending tables are keyed by
/// `Y` and an insert of a known `Y` fails with `AlreadySpent` or
/// `ProofPending`. The `commit_*` operations bundle everything a state
/// transition writes into one serializable transaction so that a crash
/// mid-way is safe.
#[async_trait]
pub trait Database: Send + Sync {
    async fn get_seed(&self) -> Result<Option<Vec<u8>>, NutmegMintError>;
    async fn save_seed(&self, seed: &[u8]) -> Result<(), NutmegMintError>;

    async fn get_keysets(&self) -> Result<Vec<KeysetInfo>, NutmegMintError>;
    async fn save_keyset(&self, keyset: &KeysetInfo) -> Result<(), NutmegMintError>;
    /// Deactivates all stored keysets and inserts the new active one.
    async fn rotate_keysets(&self, new_keyset: &KeysetInfo) -> Result<(), NutmegMintError>;

    /// Returns the subset of `ys` that is already spent.
    async fn get_proofs_used(&self, ys: &[String]) -> Result<Vec<ProofRecord>, NutmegMintError>;
    /// Returns the subset of `ys` that is pending in a melt.
    async fn get_pending_proofs(&self, ys: &[String]) -> Result<Vec<ProofRecord>, NutmegMintError>;
    async fn get_pending_proofs_by_quote(
        &self,
        quote_id: &Uuid,
    ) -> Result<Vec<ProofRecord>, NutmegMintError>;
    /// Fails with `AlreadySpent`/`ProofPending` if any `Y` is already known.
    async fn add_pending_proofs(
        &self,
        proofs: &[ProofRecord],
        quote_id: &Uuid,
    ) -> Result<(), NutmegMintError>;

    async fn add_mint_quote(&self, quote: &MintQuote) -> Result<(), NutmegMintError>;
    async fn get_mint_quote(&self, id: &Uuid) -> Result<Option<MintQuote>, NutmegMintError>;
    async fn get_mint_quote_by_payment_hash(
        &self,
        payment_hash: &str,
    ) -> Result<Option<MintQuote>, NutmegMintError>;
    async fn update_mint_quote_state(
        &self,
        id: &Uuid,
        state: MintQuoteState,
    ) -> Result<(), NutmegMintError>;
    async fn get_unpaid_mint_quotes(&self) -> Result<Vec<MintQuote>, NutmegMintError>;

    async fn add_melt_quote(&self, quote: &MeltQuote) -> Result<(), NutmegMintError>;
    async fn get_melt_quote(&self, id: &Uuid) -> Result<Option<MeltQuote>, NutmegMintError>;
    async fn get_melt_quote_by_payment_request(
        &self,
        payment_request: &str,
    ) -> Result<Option<MeltQuote>, NutmegMintError>;
    async fn get_pending_melt_quotes(&self) -> Result<Vec<MeltQuote>, NutmegMintError>;
    async fn update_melt_quote(
        &self,
        id: &Uuid,
        state: MeltQuoteState,
        preimage: Option<String>,
    ) -> Result<(), NutmegMintError>;

    async fn get_blind_signature(
        &self,
        b_: &str,
    ) -> Result<Option<BlindedSignature>, NutmegMintError>;
    /// Cache lookups in input order, `None` where nothing was ever signed.
    async fn get_blind_signatures(
        &self,
        bs: &[String],
    ) -> Result<Vec<Option<BlindedSignature>>, NutmegMintError>;

    /// Marks the inputs spent and caches the new signatures in one
    /// transaction. Fails with `AlreadySpent`/`ProofPending`/`AlreadySigned`.
    async fn commit_swap(
        &self,
        inputs: &[ProofRecord],
        outputs: &[(String, BlindedSignature)],
    ) -> Result<(), NutmegMintError>;

    /// Transitions the quote Paid -> Issued and caches the new signatures in
    /// one transaction. Fails with `AlreadyIssued` when the quote is not in
    /// the Paid state anymore.
    async fn commit_mint_issue(
        &self,
        quote_id: &Uuid,
        outputs: &[(String, BlindedSignature)],
    ) -> Result<(), NutmegMintError>;

    /// Moves the quote's pending proofs to the spent table and marks the
    /// quote Paid, recording the preimage.
    async fn commit_melt_paid(
        &self,
        quote_id: &Uuid,
        preimage: Option<&str>,
    ) -> Result<(), NutmegMintError>;

    /// Releases the quote's pending proofs and marks the quote Unpaid again.
    async fn commit_melt_failed(&self, quote_id: &Uuid) -> Result<(), NutmegMintError>;

    /// Sum of all blind signature amounts ever issued.
    async fn total_issued(&self) -> Result<u64, NutmegMintError>;
    /// Sum of all spent proof amounts.
    async fn total_redeemed(&self) -> Result<u64, NutmegMintError>;
}
