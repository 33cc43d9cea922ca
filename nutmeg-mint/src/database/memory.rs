//! In-memory store used by the fake stack and the test suite. A single
//! `RwLock` around the whole state gives every operation, including the
//! composite commits, the same serializability the Postgres store gets from
//! transactions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nutmeg_core::blind::BlindedSignature;
use nutmeg_core::keyset::KeysetInfo;
use nutmeg_core::primitives::{MeltQuoteState, MintQuoteState};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::Database;
use crate::error::NutmegMintError;
use crate::model::{MeltQuote, MintQuote, ProofRecord};

#[derive(Default)]
struct Inner {
    seed: Option<Vec<u8>>,
    keysets: Vec<KeysetInfo>,
    spent_proofs: HashMap<String, ProofRecord>,
    pending_proofs: HashMap<String, (ProofRecord, Uuid)>,
    mint_quotes: HashMap<Uuid, MintQuote>,
    melt_quotes: HashMap<Uuid, MeltQuote>,
    blind_signatures: HashMap<String, BlindedSignature>,
}

impl Inner {
    fn ensure_unknown(&self, ys: impl Iterator<Item = String>) -> Result<(), NutmegMintError> {
        for y in ys {
            if self.spent_proofs.contains_key(&y) {
                return Err(NutmegMintError::AlreadySpent);
            }
            if self.pending_proofs.contains_key(&y) {
                return Err(NutmegMintError::ProofPending);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn get_seed(&self) -> Result<Option<Vec<u8>>, NutmegMintError> {
        Ok(self.inner.read().await.seed.clone())
    }

    async fn save_seed(&self, seed: &[u8]) -> Result<(), NutmegMintError> {
        self.inner.write().await.seed = Some(seed.to_vec());
        Ok(())
    }

    async fn get_keysets(&self) -> Result<Vec<KeysetInfo>, NutmegMintError> {
        Ok(self.inner.read().await.keysets.clone())
    }

    async fn save_keyset(&self, keyset: &KeysetInfo) -> Result<(), NutmegMintError> {
        self.inner.write().await.keysets.push(keyset.clone());
        Ok(())
    }

    async fn rotate_keysets(&self, new_keyset: &KeysetInfo) -> Result<(), NutmegMintError> {
        let mut inner = self.inner.write().await;
        for keyset in &mut inner.keysets {
            keyset.active = false;
        }
        inner.keysets.push(new_keyset.clone());
        Ok(())
    }

    async fn get_proofs_used(&self, ys: &[String]) -> Result<Vec<ProofRecord>, NutmegMintError> {
        let inner = self.inner.read().await;
        Ok(ys
            .iter()
            .filter_map(|y| inner.spent_proofs.get(y).cloned())
            .collect())
    }

    async fn get_pending_proofs(&self, ys: &[String]) -> Result<Vec<ProofRecord>, NutmegMintError> {
        let inner = self.inner.read().await;
        Ok(ys
            .iter()
            .filter_map(|y| inner.pending_proofs.get(y).map(|(proof, _)| proof.clone()))
            .collect())
    }

    async fn get_pending_proofs_by_quote(
        &self,
        quote_id: &Uuid,
    ) -> Result<Vec<ProofRecord>, NutmegMintError> {
        let inner = self.inner.read().await;
        Ok(inner
            .pending_proofs
            .values()
            .filter(|(_, id)| id == quote_id)
            .map(|(proof, _)| proof.clone())
            .collect())
    }

    async fn add_pending_proofs(
        &self,
        proofs: &[ProofRecord],
        quote_id: &Uuid,
    ) -> Result<(), NutmegMintError> {
        let mut inner = self.inner.write().await;
        inner.ensure_unknown(proofs.iter().map(|proof| proof.y.clone()))?;
        for proof in proofs {
            inner
                .pending_proofs
                .insert(proof.y.clone(), (proof.clone(), *quote_id));
        }
        Ok(())
    }

    async fn add_mint_quote(&self, quote: &MintQuote) -> Result<(), NutmegMintError> {
        self.inner
            .write()
            .await
            .mint_quotes
            .insert(quote.quote_id, quote.clone());
        Ok(())
    }

    async fn get_mint_quote(&self, id: &Uuid) -> Result<Option<MintQuote>, NutmegMintError> {
        Ok(self.inner.read().await.mint_quotes.get(id).cloned())
    }

    async fn get_mint_quote_by_payment_hash(
        &self,
        payment_hash: &str,
    ) -> Result<Option<MintQuote>, NutmegMintError> {
        Ok(self
            .inner
            .read()
            .await
            .mint_quotes
            .values()
            .find(|quote| quote.payment_hash == payment_hash)
            .cloned())
    }

    async fn update_mint_quote_state(
        &self,
        id: &Uuid,
        state: MintQuoteState,
    ) -> Result<(), NutmegMintError> {
        let mut inner = self.inner.write().await;
        let quote = inner
            .mint_quotes
            .get_mut(id)
            .ok_or(NutmegMintError::QuoteNotFound)?;
        quote.state = state;
        Ok(())
    }

    async fn get_unpaid_mint_quotes(&self) -> Result<Vec<MintQuote>, NutmegMintError> {
        Ok(self
            .inner
            .read()
            .await
            .mint_quotes
            .values()
            .filter(|quote| quote.state == MintQuoteState::Unpaid)
            .cloned()
            .collect())
    }

    async fn add_melt_quote(&self, quote: &MeltQuote) -> Result<(), NutmegMintError> {
        let mut inner = self.inner.write().await;
        if inner
            .melt_quotes
            .values()
            .any(|existing| existing.payment_request == quote.payment_request)
        {
            return Err(NutmegMintError::QuoteExists);
        }
        inner.melt_quotes.insert(quote.quote_id, quote.clone());
        Ok(())
    }

    async fn get_melt_quote(&self, id: &Uuid) -> Result<Option<MeltQuote>, NutmegMintError> {
        Ok(self.inner.read().await.melt_quotes.get(id).cloned())
    }

    async fn get_melt_quote_by_payment_request(
        &self,
        payment_request: &str,
    ) -> Result<Option<MeltQuote>, NutmegMintError> {
        Ok(self
            .inner
            .read()
            .await
            .melt_quotes
            .values()
            .find(|quote| quote.payment_request == payment_request)
            .cloned())
    }

    async fn get_pending_melt_quotes(&self) -> Result<Vec<MeltQuote>, NutmegMintError> {
        Ok(self
            .inner
            .read()
            .await
            .melt_quotes
            .values()
            .filter(|quote| quote.state == MeltQuoteState::Pending)
            .cloned()
            .collect())
    }

    async fn update_melt_quote(
        &self,
        id: &Uuid,
        state: MeltQuoteState,
        preimage: Option<String>,
    ) -> Result<(), NutmegMintError> {
        let mut inner = self.inner.write().await;
        let quote = inner
            .melt_quotes
            .get_mut(id)
            .ok_or(NutmegMintError::QuoteNotFound)?;
        quote.state = state;
        if preimage.is_some() {
            quote.preimage = preimage;
        }
        Ok(())
    }

    async fn get_blind_signature(
        &self,
        b_: &str,
    ) -> Result<Option<BlindedSignature>, NutmegMintError> {
        Ok(self.inner.read().await.blind_signatures.get(b_).cloned())
    }

    async fn get_blind_signatures(
        &self,
        bs: &[String],
    ) -> Result<Vec<Option<BlindedSignature>>, NutmegMintError> {
        let inner = self.inner.read().await;
        Ok(bs
            .iter()
            .map(|b_| inner.blind_signatures.get(b_).cloned())
            .collect())
    }

    async fn commit_swap(
        &self,
        inputs: &[ProofRecord],
        outputs: &[(String, BlindedSignature)],
    ) -> Result<(), NutmegMintError> {
        let mut inner = self.inner.write().await;
        inner.ensure_unknown(inputs.iter().map(|proof| proof.y.clone()))?;
        for (b_, _) in outputs {
            if inner.blind_signatures.contains_key(b_) {
                return Err(NutmegMintError::AlreadySigned);
            }
        }
        for proof in inputs {
            inner.spent_proofs.insert(proof.y.clone(), proof.clone());
        }
        for (b_, signature) in outputs {
            inner.blind_signatures.insert(b_.clone(), signature.clone());
        }
        Ok(())
    }

    async fn commit_mint_issue(
        &self,
        quote_id: &Uuid,
        outputs: &[(String, BlindedSignature)],
    ) -> Result<(), NutmegMintError> {
        let mut inner = self.inner.write().await;
        for (b_, _) in outputs {
            if inner.blind_signatures.contains_key(b_) {
                return Err(NutmegMintError::AlreadySigned);
            }
        }
        let quote = inner
            .mint_quotes
            .get_mut(quote_id)
            .ok_or(NutmegMintError::QuoteNotFound)?;
        if quote.state != MintQuoteState::Paid {
            return Err(NutmegMintError::AlreadyIssued);
        }
        quote.state = MintQuoteState::Issued;
        for (b_, signature) in outputs {
            inner.blind_signatures.insert(b_.clone(), signature.clone());
        }
        Ok(())
    }

    async fn commit_melt_paid(
        &self,
        quote_id: &Uuid,
        preimage: Option<&str>,
    ) -> Result<(), NutmegMintError> {
        let mut inner = self.inner.write().await;
        let pending = inner
            .pending_proofs
            .iter()
            .filter(|(_, (_, id))| id == quote_id)
            .map(|(y, _)| y.clone())
            .collect::<Vec<_>>();
        for y in pending {
            if let Some((proof, _)) = inner.pending_proofs.remove(&y) {
                inner.spent_proofs.insert(y, proof);
            }
        }
        let quote = inner
            .melt_quotes
            .get_mut(quote_id)
            .ok_or(NutmegMintError::QuoteNotFound)?;
        quote.state = MeltQuoteState::Paid;
        quote.preimage = preimage.map(ToString::to_string);
        Ok(())
    }

    async fn commit_melt_failed(&self, quote_id: &Uuid) -> Result<(), NutmegMintError> {
        let mut inner = self.inner.write().await;
        inner.pending_proofs.retain(|_, (_, id)| id != quote_id);
        let quote = inner
            .melt_quotes
            .get_mut(quote_id)
            .ok_or(NutmegMintError::QuoteNotFound)?;
        quote.state = MeltQuoteState::Unpaid;
        Ok(())
    }

    async fn total_issued(&self) -> Result<u64, NutmegMintError> {
        Ok(self
            .inner
            .read()
            .await
            .blind_signatures
            .values()
            .map(|signature| signature.amount)
            .sum())
    }

    async fn total_redeemed(&self) -> Result<u64, NutmegMintError> {
        Ok(self
            .inner
            .read()
            .await
            .spent_proofs
            .values()
            .map(|proof| proof.amount)
            .sum())
    }
}
