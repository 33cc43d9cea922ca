use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nutmeg_core::amount::total_input_fee;
use nutmeg_core::blind::{BlindedMessage, BlindedSignature, TotalAmount};
use nutmeg_core::crypto::{sha256_hex, unix_time};
use nutmeg_core::dhke::Dhke;
use nutmeg_core::keyset::{KeysetInfo, MintKeyset};
use nutmeg_core::p2pk::{any_witness_signatures, enforce_sig_flag, sig_all_message, valid_signatures};
use nutmeg_core::primitives::{
    CurrencyUnit, MeltQuoteState, MintQuoteState, PostMeltQuoteBolt11Request,
    PostMintBolt11Request, PostMintQuoteBolt11Request, PostRestoreResponse, ProofCheckState,
    ProofState,
};
use nutmeg_core::proof::Proofs;
use nutmeg_core::secret::{Kind, SigFlag, WellKnownSecret};
use rand::RngCore;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::config::MintConfig;
use crate::database::memory::MemoryStore;
use crate::database::postgres::PostgresStore;
use crate::database::Database;
use crate::error::NutmegMintError;
use crate::lightning::cln::ClnLightning;
use crate::lightning::fake::FakeLightning;
use crate::lightning::lnd::LndLightning;
use crate::lightning::{Lightning, LightningType};
use crate::model::{MeltQuote, MintQuote, ProofRecord};
use crate::pubsub::Publisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Swap,
    Melt,
}

#[derive(Clone)]
pub struct Mint {
    pub lightning: Arc<dyn Lightning + Send + Sync>,
    pub lightning_type: LightningType,
    pub db: Arc<dyn Database + Send + Sync>,
    pub dhke: Dhke,
    pub config: MintConfig,
    pub pubsub: Arc<Publisher>,
    seed: Arc<Vec<u8>>,
    keysets: Arc<RwLock<Vec<(KeysetInfo, MintKeyset)>>>,
    quote_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl Mint {
    /// Loads or creates the seed and keysets and assembles the mint.
    pub async fn init(
        lightning: Arc<dyn Lightning + Send + Sync>,
        lightning_type: LightningType,
        db: Arc<dyn Database + Send + Sync>,
        config: MintConfig,
    ) -> Result<Self, NutmegMintError> {
        let seed = match db.get_seed().await? {
            Some(seed) => seed,
            None => {
                let mut seed = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut seed);
                db.save_seed(&seed).await?;
                seed.to_vec()
            }
        };

        let mut infos = db.get_keysets().await?;
        if infos.is_empty() {
            let keyset = MintKeyset::derive(&seed, 0, config.input_fee_ppk)?;
            let info = KeysetInfo {
                id: keyset.keyset_id.clone(),
                unit: CurrencyUnit::Sat,
                active: true,
                derivation_path_idx: 0,
                input_fee_ppk: config.input_fee_ppk,
                valid_from: unix_time(),
            };
            db.save_keyset(&info).await?;
            infos.push(info);
        }

        let mut keysets = Vec::with_capacity(infos.len());
        for info in infos {
            let keyset = MintKeyset::derive(&seed, info.derivation_path_idx, info.input_fee_ppk)?;
            keysets.push((info, keyset));
        }

        Ok(Self {
            lightning,
            lightning_type,
            db,
            dhke: Dhke::new(),
            config,
            pubsub: Arc::new(Publisher::new()),
            seed: Arc::new(seed),
            keysets: Arc::new(RwLock::new(keysets)),
            quote_locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn mint_pubkey(&self) -> Option<secp256k1::PublicKey> {
        nutmeg_core::keyset::derive_mint_pubkey(&self.seed).ok()
    }

    /// Serializes mint and melt calls against one quote.
    async fn lock_quote(&self, quote_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.quote_locks.lock().await;
            locks
                .entry(quote_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn active_keyset(&self) -> Result<(KeysetInfo, MintKeyset), NutmegMintError> {
        self.keysets
            .read()
            .await
            .iter()
            .find(|(info, _)| info.active)
            .cloned()
            .ok_or_else(|| NutmegMintError::Internal("no active keyset".to_string()))
    }

    pub async fn keyset_by_id(
        &self,
        id: &str,
    ) -> Result<(KeysetInfo, MintKeyset), NutmegMintError> {
        self.keysets
            .read()
            .await
            .iter()
            .find(|(info, _)| info.id == id)
            .cloned()
            .ok_or_else(|| NutmegMintError::UnknownKeyset(id.to_string()))
    }

    pub async fn keyset_infos(&self) -> Vec<KeysetInfo> {
        self.keysets
            .read()
            .await
            .iter()
            .map(|(info, _)| info.clone())
            .collect()
    }

    /// Adds a new active keyset derived from the next index and deactivates
    /// all previous ones. Holding the write lock serializes rotation against
    /// the signing path.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn rotate_keyset(&self, input_fee_ppk: u64) -> Result<KeysetInfo, NutmegMintError> {
        let mut keysets = self.keysets.write().await;
        let next_idx = keysets
            .iter()
            .map(|(info, _)| info.derivation_path_idx)
            .max()
            .map_or(0, |idx| idx + 1);

        let keyset = MintKeyset::derive(&self.seed, next_idx, input_fee_ppk)?;
        let info = KeysetInfo {
            id: keyset.keyset_id.clone(),
            unit: CurrencyUnit::Sat,
            active: true,
            derivation_path_idx: next_idx,
            input_fee_ppk,
            valid_from: unix_time(),
        };
        self.db.rotate_keysets(&info).await?;

        for (existing, _) in keysets.iter_mut() {
            existing.active = false;
        }
        keysets.push((info.clone(), keyset));
        Ok(info)
    }

    /// Fee reserve for an outgoing payment of `amount_sat`.
    pub fn fee_reserve(&self, amount_sat: u64) -> u64 {
        let fee_percent = self.config.lightning_fee.fee_percent as f64 / 100.0;
        let fee_reserve = (amount_sat as f64 * fee_percent).ceil() as u64;
        std::cmp::max(fee_reserve, self.config.lightning_fee.fee_reserve_min)
    }

    fn has_duplicate_pubkeys(outputs: &[BlindedMessage]) -> bool {
        let mut uniq = HashSet::new();
        !outputs.iter().all(move |output| uniq.insert(output.b_))
    }

    fn has_duplicate_secrets(proofs: &Proofs) -> bool {
        let mut uniq = HashSet::new();
        !proofs.iter().all(move |proof| uniq.insert(&proof.secret))
    }

    /// Checks that every output references a known active keyset and a valid
    /// power-of-two amount.
    async fn validate_outputs(&self, outputs: &[BlindedMessage]) -> Result<(), NutmegMintError> {
        let keysets = self.keysets.read().await;
        for output in outputs {
            let (info, keyset) = keysets
                .iter()
                .find(|(info, _)| info.id == output.keyset_id)
                .ok_or_else(|| NutmegMintError::UnknownKeyset(output.keyset_id.clone()))?;
            if !info.active {
                return Err(NutmegMintError::KeysetInactive);
            }
            if keyset.private_key_for_amount(output.amount).is_none() {
                return Err(NutmegMintError::InvalidAmount);
            }
        }
        Ok(())
    }

    /// Checks `C == k*hash_to_curve(secret)` for every input against the key
    /// of its keyset, active or not.
    async fn verify_proofs(&self, proofs: &Proofs) -> Result<(), NutmegMintError> {
        let keysets = self.keysets.read().await;
        for proof in proofs {
            let (_, keyset) = keysets
                .iter()
                .find(|(info, _)| info.id == proof.keyset_id)
                .ok_or_else(|| NutmegMintError::UnknownKeyset(proof.keyset_id.clone()))?;
            let key = keyset
                .private_key_for_amount(proof.amount)
                .ok_or(NutmegMintError::InvalidAmount)?;
            let valid = self
                .dhke
                .verify(key, &proof.c, proof.secret.as_bytes())
                .map_err(|_| NutmegMintError::InvalidProof)?;
            if !valid {
                return Err(NutmegMintError::InvalidProof);
            }
        }
        Ok(())
    }

    /// `ceil(sum(input_fee_ppk) / 1000)` over the inputs' keysets.
    async fn input_fee(&self, proofs: &Proofs) -> Result<u64, NutmegMintError> {
        let keysets = self.keysets.read().await;
        let mut fee_ppks = Vec::with_capacity(proofs.len());
        for proof in proofs {
            let (info, _) = keysets
                .iter()
                .find(|(info, _)| info.id == proof.keyset_id)
                .ok_or_else(|| NutmegMintError::UnknownKeyset(proof.keyset_id.clone()))?;
            fee_ppks.push(info.input_fee_ppk);
        }
        total_input_fee(fee_ppks).map_err(|_| NutmegMintError::InvalidAmount)
    }

    /// Runs P2PK and HTLC verification over the inputs. When any input
    /// carries `SIG_ALL` the signature domain covers all input secrets and
    /// all output `B_` values, and the outputs must be signed as well.
    fn verify_spending_conditions(
        &self,
        inputs: &Proofs,
        outputs: Option<&[BlindedMessage]>,
        operation: Operation,
    ) -> Result<(), NutmegMintError> {
        let enforced = enforce_sig_flag(inputs);
        if enforced.sig_flag == SigFlag::SigAll {
            if operation != Operation::Swap {
                return Err(NutmegMintError::SigAllOnlySwap);
            }
            let outputs = outputs.unwrap_or_default();
            let msg = sig_all_message(inputs, outputs);
            let pubkeys = enforced.pubkeys.into_iter().collect::<Vec<_>>();

            for proof in inputs {
                if let Ok(secret) = WellKnownSecret::from_secret(&proof.secret) {
                    if secret.kind == Kind::HTLC {
                        proof.verify_htlc_preimage()?;
                    }
                }
                let signatures =
                    any_witness_signatures(proof.witness.as_ref()).unwrap_or_default();
                if valid_signatures(&msg, &pubkeys, &signatures) < enforced.sigs_required {
                    return Err(NutmegMintError::NotEnoughSignatures);
                }
            }
            for output in outputs {
                let signatures =
                    any_witness_signatures(output.witness.as_ref()).unwrap_or_default();
                if valid_signatures(&msg, &pubkeys, &signatures) < enforced.sigs_required {
                    return Err(NutmegMintError::NotEnoughSignatures);
                }
            }
            return Ok(());
        }

        for proof in inputs {
            match WellKnownSecret::from_secret(&proof.secret) {
                Ok(secret) => match secret.kind {
                    Kind::P2PK => proof.verify_p2pk()?,
                    Kind::HTLC => proof.verify_htlc()?,
                },
                // opaque secrets carry no spending conditions
                Err(_) => {}
            }
        }
        Ok(())
    }

    /// Signs each output with the key of its amount and attaches the DLEQ
    /// proof of correct signing.
    async fn create_blinded_signatures(
        &self,
        outputs: &[BlindedMessage],
    ) -> Result<Vec<BlindedSignature>, NutmegMintError> {
        let keysets = self.keysets.read().await;
        let mut signatures = Vec::with_capacity(outputs.len());
        for output in outputs {
            let (_, keyset) = keysets
                .iter()
                .find(|(info, _)| info.id == output.keyset_id)
                .ok_or_else(|| NutmegMintError::UnknownKeyset(output.keyset_id.clone()))?;
            let key = keyset
                .private_key_for_amount(output.amount)
                .ok_or(NutmegMintError::InvalidAmount)?;

            let c_ = self
                .dhke
                .sign_blinded_message(&output.b_, key)
                .map_err(|err| NutmegMintError::Internal(err.to_string()))?;
            let dleq = self
                .dhke
                .generate_dleq(key, &output.b_, &c_)
                .map_err(|err| NutmegMintError::Internal(err.to_string()))?;

            signatures.push(BlindedSignature {
                amount: output.amount,
                keyset_id: output.keyset_id.clone(),
                c_,
                dleq: Some(dleq),
            });
        }
        Ok(signatures)
    }

    async fn check_used_proofs(&self, ys: &[String]) -> Result<(), NutmegMintError> {
        if !self.db.get_proofs_used(ys).await?.is_empty() {
            return Err(NutmegMintError::AlreadySpent);
        }
        if !self.db.get_pending_proofs(ys).await?.is_empty() {
            return Err(NutmegMintError::ProofPending);
        }
        Ok(())
    }

    fn proof_records(inputs: &Proofs) -> Result<Vec<ProofRecord>, NutmegMintError> {
        inputs
            .iter()
            .map(|proof| ProofRecord::try_from(proof).map_err(|_| NutmegMintError::InvalidProof))
            .collect()
    }

    // --- quotes ---------------------------------------------------------

    #[instrument(level = "debug", skip(self, request), fields(amount = request.amount), err)]
    pub async fn create_mint_quote(
        &self,
        request: &PostMintQuoteBolt11Request,
    ) -> Result<MintQuote, NutmegMintError> {
        if self.config.limits.minting_disabled {
            return Err(NutmegMintError::MintingDisabled);
        }
        let limits = &self.config.limits;
        if request.amount < limits.mint_min
            || limits.mint_max.is_some_and(|max| request.amount > max)
        {
            return Err(NutmegMintError::MintAmountExceeded);
        }
        if let Some(max_balance) = limits.max_balance {
            let outstanding = self
                .db
                .total_issued()
                .await?
                .saturating_sub(self.db.total_redeemed().await?);
            if outstanding + request.amount > max_balance {
                return Err(NutmegMintError::MintAmountExceeded);
            }
        }

        let invoice = self.lightning.create_invoice(request.amount).await?;
        let quote = MintQuote {
            quote_id: Uuid::new_v4(),
            amount: request.amount,
            payment_request: invoice.payment_request,
            payment_hash: invoice.payment_hash,
            state: MintQuoteState::Unpaid,
            expiry: unix_time() + self.config.quotes.expiry_secs,
            pubkey: request.pubkey,
        };
        self.db.add_mint_quote(&quote).await?;
        self.pubsub.publish_mint_quote(&quote);
        Ok(quote)
    }

    /// Current state of a mint quote, falling back to an invoice lookup when
    /// the stored state is still Unpaid.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn mint_quote_state(&self, quote_id: &str) -> Result<MintQuote, NutmegMintError> {
        let quote_id = parse_quote_id(quote_id)?;
        let mut quote = self
            .db
            .get_mint_quote(&quote_id)
            .await?
            .ok_or(NutmegMintError::QuoteNotFound)?;

        if quote.state == MintQuoteState::Unpaid {
            let status = self
                .lightning
                .invoice_status(quote.payment_hash.clone())
                .await?;
            if status.settled {
                self.mark_mint_quote_paid(&mut quote).await?;
            }
        }
        Ok(quote)
    }

    pub(crate) async fn mark_mint_quote_paid(
        &self,
        quote: &mut MintQuote,
    ) -> Result<(), NutmegMintError> {
        quote.state = MintQuoteState::Paid;
        self.db
            .update_mint_quote_state(&quote.quote_id, MintQuoteState::Paid)
            .await?;
        self.pubsub.publish_mint_quote(quote);
        Ok(())
    }

    /// Issues blind signatures against a paid quote. Exactly one concurrent
    /// call succeeds, everyone else observes `AlreadyIssued`.
    #[instrument(level = "debug", skip_all, fields(quote_id = %request.quote), err)]
    pub async fn mint_tokens(
        &self,
        request: &PostMintBolt11Request,
    ) -> Result<Vec<BlindedSignature>, NutmegMintError> {
        let quote_id = parse_quote_id(&request.quote)?;
        let _guard = self.lock_quote(quote_id).await;

        let mut quote = self
            .db
            .get_mint_quote(&quote_id)
            .await?
            .ok_or(NutmegMintError::QuoteNotFound)?;

        if let Some(pubkey) = &quote.pubkey {
            request
                .verify_signature(pubkey)
                .map_err(|_| NutmegMintError::InvalidSignature)?;
        }

        match quote.state {
            MintQuoteState::Issued => return Err(NutmegMintError::AlreadyIssued),
            MintQuoteState::Paid => {}
            MintQuoteState::Unpaid => {
                let status = self
                    .lightning
                    .invoice_status(quote.payment_hash.clone())
                    .await?;
                if !status.settled {
                    return Err(NutmegMintError::QuoteNotPaid);
                }
                self.mark_mint_quote_paid(&mut quote).await?;
            }
        }

        if Self::has_duplicate_pubkeys(&request.outputs) {
            return Err(NutmegMintError::DuplicateOutputs);
        }
        self.validate_outputs(&request.outputs).await?;
        let sum = request
            .outputs
            .total_amount()
            .map_err(|_| NutmegMintError::InvalidAmount)?;
        if sum > quote.amount {
            return Err(NutmegMintError::OutputsOverQuote);
        }
        for output in &request.outputs {
            if self
                .db
                .get_blind_signature(&output.b_.to_string())
                .await?
                .is_some()
            {
                return Err(NutmegMintError::AlreadySigned);
            }
        }

        let signatures = self.create_blinded_signatures(&request.outputs).await?;
        let pairs = request
            .outputs
            .iter()
            .zip(signatures.iter())
            .map(|(output, signature)| (output.b_.to_string(), signature.clone()))
            .collect::<Vec<_>>();
        self.db.commit_mint_issue(&quote_id, &pairs).await?;

        quote.state = MintQuoteState::Issued;
        self.pubsub.publish_mint_quote(&quote);
        Ok(signatures)
    }

    #[instrument(level = "debug", skip_all, err)]
    pub async fn create_melt_quote(
        &self,
        request: &PostMeltQuoteBolt11Request,
    ) -> Result<MeltQuote, NutmegMintError> {
        let decoded = self.lightning.decode_invoice(request.request.clone()).await?;
        let amount_msat = request
            .mpp_amount_msat
            .or(decoded.amount_msat)
            .ok_or(NutmegMintError::InvalidAmount)?;
        let amount = amount_msat / 1_000;

        if self
            .db
            .get_melt_quote_by_payment_request(&request.request)
            .await?
            .is_some()
        {
            return Err(NutmegMintError::QuoteExists);
        }

        let limits = &self.config.limits;
        if amount < limits.melt_min || limits.melt_max.is_some_and(|max| amount > max) {
            return Err(NutmegMintError::MeltAmountExceeded);
        }

        // an invoice issued by this mint is settled internally, without a
        // Lightning round-trip and without a fee reserve
        let internal = self
            .db
            .get_mint_quote_by_payment_hash(&decoded.payment_hash)
            .await?
            .is_some();
        let fee_reserve = if internal {
            0
        } else {
            self.fee_reserve(amount)
        };

        let quote = MeltQuote {
            quote_id: Uuid::new_v4(),
            payment_request: request.request.clone(),
            payment_hash: decoded.payment_hash,
            amount,
            fee_reserve,
            state: MeltQuoteState::Unpaid,
            expiry: unix_time() + self.config.quotes.expiry_secs,
            preimage: None,
            mpp_amount_msat: request.mpp_amount_msat,
        };
        self.db.add_melt_quote(&quote).await?;
        self.pubsub.publish_melt_quote(&quote);
        Ok(quote)
    }

    pub async fn melt_quote_state(&self, quote_id: &str) -> Result<MeltQuote, NutmegMintError> {
        let quote_id = parse_quote_id(quote_id)?;
        self.db
            .get_melt_quote(&quote_id)
            .await?
            .ok_or(NutmegMintError::QuoteNotFound)
    }

    // --- transactions ---------------------------------------------------

    /// Swaps spent proofs for fresh blind signatures, conserving value minus
    /// input fees.
    #[instrument(level = "debug", skip_all, err)]
    pub async fn swap(
        &self,
        inputs: &Proofs,
        outputs: &[BlindedMessage],
    ) -> Result<Vec<BlindedSignature>, NutmegMintError> {
        if Self::has_duplicate_secrets(inputs) {
            return Err(NutmegMintError::DuplicateProofs);
        }
        if Self::has_duplicate_pubkeys(outputs) {
            return Err(NutmegMintError::DuplicateOutputs);
        }
        self.validate_outputs(outputs).await?;

        let ys = inputs.ys().map_err(|_| NutmegMintError::InvalidProof)?;
        self.check_used_proofs(&ys).await?;
        self.verify_proofs(inputs).await?;
        self.verify_spending_conditions(inputs, Some(outputs), Operation::Swap)?;

        for output in outputs {
            if self
                .db
                .get_blind_signature(&output.b_.to_string())
                .await?
                .is_some()
            {
                return Err(NutmegMintError::AlreadySigned);
            }
        }

        let fee = self.input_fee(inputs).await?;
        let input_total = inputs
            .total_amount()
            .map_err(|_| NutmegMintError::InvalidAmount)?;
        let output_total = outputs
            .total_amount()
            .map_err(|_| NutmegMintError::InvalidAmount)?;
        if input_total
            .checked_sub(fee)
            .ok_or(NutmegMintError::InsufficientInputs)?
            < output_total
        {
            return Err(NutmegMintError::InsufficientInputs);
        }

        let signatures = self.create_blinded_signatures(outputs).await?;
        let records = Self::proof_records(inputs)?;
        let pairs = outputs
            .iter()
            .zip(signatures.iter())
            .map(|(output, signature)| (output.b_.to_string(), signature.clone()))
            .collect::<Vec<_>>();
        self.db.commit_swap(&records, &pairs).await?;

        for record in &records {
            self.pubsub.publish_proof_state(
                record.y.clone(),
                ProofState::Spent,
                record.witness.clone(),
            );
        }
        Ok(signatures)
    }

    /// Pays the quote's invoice with the inputs as collateral. The inputs
    /// stay pending while the payment outcome is unknown.
    #[instrument(level = "debug", skip_all, fields(quote_id = %quote_id), err)]
    pub async fn melt_tokens(
        &self,
        quote_id: &str,
        inputs: &Proofs,
    ) -> Result<MeltQuote, NutmegMintError> {
        let quote_id = parse_quote_id(quote_id)?;
        let _guard = self.lock_quote(quote_id).await;

        let mut quote = self
            .db
            .get_melt_quote(&quote_id)
            .await?
            .ok_or(NutmegMintError::QuoteNotFound)?;
        match quote.state {
            MeltQuoteState::Paid => return Err(NutmegMintError::AlreadyPaid),
            MeltQuoteState::Pending => return Err(NutmegMintError::QuotePending),
            MeltQuoteState::Unpaid => {}
        }

        if Self::has_duplicate_secrets(inputs) {
            return Err(NutmegMintError::DuplicateProofs);
        }
        let ys = inputs.ys().map_err(|_| NutmegMintError::InvalidProof)?;
        self.check_used_proofs(&ys).await?;
        self.verify_proofs(inputs).await?;
        self.verify_spending_conditions(inputs, None, Operation::Melt)?;

        let fee = self.input_fee(inputs).await?;
        let input_total = inputs
            .total_amount()
            .map_err(|_| NutmegMintError::InvalidAmount)?;
        let required = quote
            .amount
            .checked_add(quote.fee_reserve)
            .ok_or(NutmegMintError::InvalidAmount)?;
        if input_total
            .checked_sub(fee)
            .ok_or(NutmegMintError::InsufficientInputs)?
            < required
        {
            return Err(NutmegMintError::InsufficientInputs);
        }

        let records = Self::proof_records(inputs)?;
        self.db.add_pending_proofs(&records, &quote_id).await?;
        quote.state = MeltQuoteState::Pending;
        self.db
            .update_melt_quote(&quote_id, MeltQuoteState::Pending, None)
            .await?;
        self.pubsub.publish_melt_quote(&quote);
        for record in &records {
            self.pubsub
                .publish_proof_state(record.y.clone(), ProofState::Pending, None);
        }

        // internal settlement: the invoice belongs to a mint quote of this
        // mint, no Lightning payment happens
        if let Some(mut mint_quote) = self
            .db
            .get_mint_quote_by_payment_hash(&quote.payment_hash)
            .await?
        {
            let preimage = internal_settlement_preimage(&mint_quote.quote_id);
            self.settle_melt_quote(&mut quote, Some(preimage), &records)
                .await?;
            if mint_quote.state == MintQuoteState::Unpaid {
                self.mark_mint_quote_paid(&mut mint_quote).await?;
            }
            return Ok(quote);
        }

        let payment = {
            let lightning = self.lightning.clone();
            let payment_request = quote.payment_request.clone();
            let max_fee = quote.fee_reserve;
            let mpp_amount_msat = quote.mpp_amount_msat;
            async move {
                match mpp_amount_msat {
                    Some(amount_msat) => {
                        lightning
                            .pay_partial_amount(payment_request, amount_msat, max_fee)
                            .await
                    }
                    None => lightning.pay_invoice(payment_request, max_fee).await,
                }
            }
        };

        let timeout = Duration::from_secs(self.config.quotes.melt_timeout_secs);
        match tokio::time::timeout(timeout, payment).await {
            Err(_) => {
                // outcome unknown, reconciliation will resolve the quote
                Ok(quote)
            }
            Ok(Err(err)) => {
                warn!("payment attempt for melt quote {quote_id} errored: {err}");
                Ok(quote)
            }
            Ok(Ok(result)) => match result.status {
                crate::model::PaymentStatus::Succeeded => {
                    self.settle_melt_quote(&mut quote, result.preimage, &records)
                        .await?;
                    Ok(quote)
                }
                crate::model::PaymentStatus::Failed => {
                    self.release_melt_quote(&mut quote, &records).await?;
                    Ok(quote)
                }
                crate::model::PaymentStatus::Pending => Ok(quote),
            },
        }
    }

    async fn settle_melt_quote(
        &self,
        quote: &mut MeltQuote,
        preimage: Option<String>,
        records: &[ProofRecord],
    ) -> Result<(), NutmegMintError> {
        self.db
            .commit_melt_paid(&quote.quote_id, preimage.as_deref())
            .await?;
        quote.state = MeltQuoteState::Paid;
        quote.preimage = preimage;
        self.pubsub.publish_melt_quote(quote);
        for record in records {
            self.pubsub.publish_proof_state(
                record.y.clone(),
                ProofState::Spent,
                record.witness.clone(),
            );
        }
        Ok(())
    }

    async fn release_melt_quote(
        &self,
        quote: &mut MeltQuote,
        records: &[ProofRecord],
    ) -> Result<(), NutmegMintError> {
        self.db.commit_melt_failed(&quote.quote_id).await?;
        quote.state = MeltQuoteState::Unpaid;
        self.pubsub.publish_melt_quote(quote);
        for record in records {
            self.pubsub
                .publish_proof_state(record.y.clone(), ProofState::Unspent, None);
        }
        Ok(())
    }

    /// Resolves pending melt quotes against the Lightning backend. Called
    /// periodically by the reconciliation task.
    pub async fn reconcile_pending_melts(&self) -> Result<(), NutmegMintError> {
        for quote in self.db.get_pending_melt_quotes().await? {
            let _guard = self.lock_quote(quote.quote_id).await;
            let Some(mut current) = self.db.get_melt_quote(&quote.quote_id).await? else {
                continue;
            };
            if current.state != MeltQuoteState::Pending {
                continue;
            }
            let records = self
                .db
                .get_pending_proofs_by_quote(&quote.quote_id)
                .await?;
            match self
                .lightning
                .outgoing_payment_status(current.payment_hash.clone())
                .await
            {
                Ok(result) => match result.status {
                    crate::model::PaymentStatus::Succeeded => {
                        self.settle_melt_quote(&mut current, result.preimage, &records)
                            .await?;
                    }
                    crate::model::PaymentStatus::Failed => {
                        self.release_melt_quote(&mut current, &records).await?;
                    }
                    crate::model::PaymentStatus::Pending => {}
                },
                Err(err) => warn!(
                    "could not reconcile melt quote {}: {err}",
                    quote.quote_id
                ),
            }
        }
        Ok(())
    }

    /// Spend state per `Y`, including the witness stored with spent proofs.
    pub async fn check_state(
        &self,
        ys: &[String],
    ) -> Result<Vec<ProofCheckState>, NutmegMintError> {
        let spent = self
            .db
            .get_proofs_used(ys)
            .await?
            .into_iter()
            .map(|record| (record.y.clone(), record.witness))
            .collect::<HashMap<_, _>>();
        let pending = self
            .db
            .get_pending_proofs(ys)
            .await?
            .into_iter()
            .map(|record| record.y)
            .collect::<HashSet<_>>();

        Ok(ys
            .iter()
            .map(|y| match spent.get(y) {
                Some(witness) => ProofCheckState {
                    y: y.clone(),
                    state: ProofState::Spent,
                    witness: witness.clone(),
                },
                None => ProofCheckState {
                    y: y.clone(),
                    state: if pending.contains(y) {
                        ProofState::Pending
                    } else {
                        ProofState::Unspent
                    },
                    witness: None,
                },
            })
            .collect())
    }

    /// Returns the cached signatures for the given blinded messages,
    /// preserving request order. This is how wallets recover after loss.
    pub async fn restore(
        &self,
        outputs: &[BlindedMessage],
    ) -> Result<PostRestoreResponse, NutmegMintError> {
        let bs = outputs
            .iter()
            .map(|output| output.b_.to_string())
            .collect::<Vec<_>>();
        let found = self.db.get_blind_signatures(&bs).await?;

        let mut response = PostRestoreResponse::default();
        for (output, signature) in outputs.iter().zip(found) {
            if let Some(signature) = signature {
                response.outputs.push(output.clone());
                response.signatures.push(signature);
            }
        }
        Ok(response)
    }

    // --- admin ----------------------------------------------------------

    pub async fn issued_ecash(&self) -> Result<u64, NutmegMintError> {
        self.db.total_issued().await
    }

    pub async fn redeemed_ecash(&self) -> Result<u64, NutmegMintError> {
        self.db.total_redeemed().await
    }

    pub async fn total_balance(&self) -> Result<u64, NutmegMintError> {
        Ok(self
            .issued_ecash()
            .await?
            .saturating_sub(self.redeemed_ecash().await?))
    }
}

fn parse_quote_id(quote_id: &str) -> Result<Uuid, NutmegMintError> {
    Uuid::parse_str(quote_id).map_err(|_| NutmegMintError::QuoteNotFound)
}

/// Deterministic preimage recorded for internally settled melt quotes.
fn internal_settlement_preimage(mint_quote_id: &Uuid) -> String {
    sha256_hex(mint_quote_id.to_string().as_bytes())
}

#[derive(Debug, Default)]
pub struct MintBuilder {
    config: Option<MintConfig>,
    lightning_type: Option<LightningType>,
}

impl MintBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: MintConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_lightning(mut self, lightning_type: LightningType) -> Self {
        self.lightning_type = Some(lightning_type);
        self
    }

    pub async fn build(self) -> Result<Mint, NutmegMintError> {
        let config = self.config.unwrap_or_else(MintConfig::from_env);
        let lightning_type = self
            .lightning_type
            .ok_or_else(|| NutmegMintError::Internal("Lightning backend not set".to_string()))?;

        let lightning: Arc<dyn Lightning + Send + Sync> = match &lightning_type {
            LightningType::Lnd(settings) => Arc::new(
                LndLightning::new(
                    settings
                        .grpc_host
                        .clone()
                        .expect("LND_GRPC_HOST not set"),
                    settings
                        .tls_cert_path
                        .as_ref()
                        .expect("LND_TLS_CERT_PATH not set"),
                    settings
                        .macaroon_path
                        .as_ref()
                        .expect("LND_MACAROON_PATH not set"),
                )
                .await?,
            ),
            LightningType::Cln(settings) => Arc::new(
                ClnLightning::new(
                    settings.grpc_host.clone().expect("CLN_GRPC_HOST not set"),
                    settings.client_cert.as_ref().expect("CLN_CLIENT_CERT not set"),
                    settings.client_key.as_ref().expect("CLN_CLIENT_KEY not set"),
                    settings.ca_cert.as_ref().expect("CLN_CA_CERT not set"),
                )
                .await?,
            ),
            LightningType::Fake => Arc::new(FakeLightning::new()),
        };

        let db: Arc<dyn Database + Send + Sync> = if config.database.db_url.is_empty() {
            Arc::new(MemoryStore::new())
        } else {
            let store = PostgresStore::new(&config.database).await?;
            store.migrate().await?;
            Arc::new(store)
        };

        Mint::init(lightning, lightning_type, db, config).await
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use nutmeg_core::amount::{generate_random_string, Amount};
    use nutmeg_core::blind::BlindedMessage;
    use nutmeg_core::crypto::sha256_hex;
    use nutmeg_core::dhke::Dhke;
    use nutmeg_core::primitives::{
        CurrencyUnit, MeltQuoteState, MintQuoteState, PostMeltQuoteBolt11Request,
        PostMintBolt11Request, PostMintQuoteBolt11Request, ProofState,
    };
    use nutmeg_core::proof::{Proof, Proofs};
    use nutmeg_core::secret::{Conditions, Kind, SigFlag, WellKnownSecret};
    use pretty_assertions::assert_eq;
    use secp256k1::{Secp256k1, SecretKey};

    use super::Mint;
    use crate::config::MintConfig;
    use crate::database::memory::MemoryStore;
    use crate::error::NutmegMintError;
    use crate::lightning::fake::FakeLightning;
    use crate::lightning::{Lightning, LightningType};
    use crate::model::PaymentStatus;

    async fn create_mint_with_config(
        config: MintConfig,
    ) -> anyhow::Result<(Mint, Arc<FakeLightning>)> {
        let lightning = Arc::new(FakeLightning::new());
        let mint = Mint::init(
            lightning.clone(),
            LightningType::Fake,
            Arc::new(MemoryStore::new()),
            config,
        )
        .await?;
        Ok((mint, lightning))
    }

    async fn create_mint() -> anyhow::Result<(Mint, Arc<FakeLightning>)> {
        create_mint_with_config(MintConfig::default()).await
    }

    fn keypair(hex_key: &str) -> (SecretKey, secp256k1::PublicKey) {
        let secp = Secp256k1::new();
        let key = SecretKey::from_str(hex_key).expect("invalid secret key");
        (key, key.public_key(&secp))
    }

    fn random_secrets(count: usize) -> Vec<String> {
        (0..count).map(|_| generate_random_string()).collect()
    }

    fn blind_outputs(
        keyset_id: &str,
        amounts: &[u64],
        secrets: &[String],
    ) -> anyhow::Result<(Vec<BlindedMessage>, Vec<SecretKey>)> {
        let dhke = Dhke::new();
        let mut outputs = Vec::new();
        let mut blinding_factors = Vec::new();
        for (amount, secret) in amounts.iter().zip(secrets) {
            let (b_, r) = dhke.blind_message(secret.as_bytes(), None)?;
            outputs.push(BlindedMessage {
                amount: *amount,
                keyset_id: keyset_id.to_string(),
                b_,
                witness: None,
            });
            blinding_factors.push(r);
        }
        Ok((outputs, blinding_factors))
    }

    async fn mint_proofs_with_secrets(
        mint: &Mint,
        lightning: &FakeLightning,
        amounts: &[u64],
        secrets: Vec<String>,
    ) -> anyhow::Result<Proofs> {
        let total = amounts.iter().sum();
        let quote = mint
            .create_mint_quote(&PostMintQuoteBolt11Request {
                amount: total,
                unit: CurrencyUnit::Sat,
                pubkey: None,
            })
            .await?;
        lightning.settle_invoice(&quote.payment_hash).await;

        let (info, keyset) = mint.active_keyset().await?;
        let (outputs, blinding_factors) = blind_outputs(&info.id, amounts, &secrets)?;
        let signatures = mint
            .mint_tokens(&PostMintBolt11Request {
                quote: quote.quote_id.to_string(),
                outputs,
                signature: None,
            })
            .await?;

        let dhke = Dhke::new();
        let mut proofs = Vec::new();
        for (index, signature) in signatures.iter().enumerate() {
            let amount = amounts[index];
            let pubkey = keyset.public_keys.get(&amount).expect("key for amount");
            let c = dhke.unblind(signature.c_, &blinding_factors[index], pubkey)?;
            proofs.push(Proof::new(amount, secrets[index].clone(), c, info.id.clone()));
        }
        Ok(proofs.into())
    }

    async fn mint_proofs(
        mint: &Mint,
        lightning: &FakeLightning,
        amount: u64,
    ) -> anyhow::Result<Proofs> {
        let amounts = Amount(amount).split().into_iter().collect::<Vec<_>>();
        let secrets = random_secrets(amounts.len());
        mint_proofs_with_secrets(mint, lightning, &amounts, secrets).await
    }

    async fn external_melt_quote(
        mint: &Mint,
        lightning: &FakeLightning,
        amount: u64,
    ) -> anyhow::Result<super::MeltQuote> {
        let invoice = lightning.create_invoice(amount).await?;
        Ok(mint
            .create_melt_quote(&PostMeltQuoteBolt11Request {
                request: invoice.payment_request,
                unit: CurrencyUnit::Sat,
                mpp_amount_msat: None,
            })
            .await?)
    }

    #[tokio::test]
    async fn test_mint_happy_path() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;

        let quote = mint
            .create_mint_quote(&PostMintQuoteBolt11Request {
                amount: 10_000,
                unit: CurrencyUnit::Sat,
                pubkey: None,
            })
            .await?;
        assert_eq!(quote.state, MintQuoteState::Unpaid);

        // minting before payment fails
        let (info, _) = mint.active_keyset().await?;
        let amounts = Amount(10_000).split().into_iter().collect::<Vec<_>>();
        let secrets = random_secrets(amounts.len());
        let (outputs, _) = blind_outputs(&info.id, &amounts, &secrets)?;
        let request = PostMintBolt11Request {
            quote: quote.quote_id.to_string(),
            outputs,
            signature: None,
        };
        assert!(matches!(
            mint.mint_tokens(&request).await,
            Err(NutmegMintError::QuoteNotPaid)
        ));

        // the external payer settles the invoice
        lightning.settle_invoice(&quote.payment_hash).await;
        assert_eq!(
            mint.mint_quote_state(&quote.quote_id.to_string())
                .await?
                .state,
            MintQuoteState::Paid
        );

        let signatures = mint.mint_tokens(&request).await?;
        assert_eq!(signatures.len(), amounts.len());
        assert_eq!(
            signatures.iter().map(|sig| sig.amount).sum::<u64>(),
            10_000
        );
        // every signature carries a valid DLEQ proof
        let (_, keyset) = mint.active_keyset().await?;
        let secp = Secp256k1::new();
        for (signature, output) in signatures.iter().zip(&request.outputs) {
            let pubkey = keyset
                .private_keys
                .get(&signature.amount)
                .unwrap()
                .public_key(&secp);
            assert!(mint.dhke.verify_dleq(
                signature.dleq.as_ref().unwrap(),
                &pubkey,
                &output.b_,
                &signature.c_
            )?);
        }

        assert_eq!(
            mint.mint_quote_state(&quote.quote_id.to_string())
                .await?
                .state,
            MintQuoteState::Issued
        );

        // a second issuance attempt against the same quote fails
        assert!(matches!(
            mint.mint_tokens(&request).await,
            Err(NutmegMintError::AlreadyIssued)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_state_check_after_mint() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 100).await?;

        let states = mint.check_state(&proofs.ys()?).await?;
        assert!(states
            .iter()
            .all(|state| state.state == ProofState::Unspent));
        Ok(())
    }

    #[tokio::test]
    async fn test_double_spend_rejected() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 2100).await?;

        let (info, _) = mint.active_keyset().await?;
        let amounts = Amount(2100).split().into_iter().collect::<Vec<_>>();

        let (outputs_a, _) = blind_outputs(&info.id, &amounts, &random_secrets(amounts.len()))?;
        mint.swap(&proofs, &outputs_a).await?;

        let states = mint.check_state(&proofs.ys()?).await?;
        assert!(states.iter().all(|state| state.state == ProofState::Spent));

        let (outputs_b, _) = blind_outputs(&info.id, &amounts, &random_secrets(amounts.len()))?;
        assert!(matches!(
            mint.swap(&proofs, &outputs_b).await,
            Err(NutmegMintError::AlreadySpent)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_swap_duplicate_inputs_and_outputs() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 4).await?;
        let (info, _) = mint.active_keyset().await?;

        let doubled = Proofs::new(
            proofs
                .proofs()
                .into_iter()
                .chain(proofs.proofs())
                .collect(),
        );
        let (outputs, _) = blind_outputs(&info.id, &[4, 4], &random_secrets(2))?;
        assert!(matches!(
            mint.swap(&doubled, &outputs).await,
            Err(NutmegMintError::DuplicateProofs)
        ));

        let (outputs, _) = blind_outputs(&info.id, &[4], &random_secrets(1))?;
        let duplicated_outputs = vec![outputs[0].clone(), outputs[0].clone()];
        assert!(matches!(
            mint.swap(&proofs, &duplicated_outputs).await,
            Err(NutmegMintError::DuplicateOutputs)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_swap_insufficient_inputs() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 64).await?;
        let (info, _) = mint.active_keyset().await?;

        let (outputs, _) = blind_outputs(&info.id, &[64, 64], &random_secrets(2))?;
        assert!(matches!(
            mint.swap(&proofs, &outputs).await,
            Err(NutmegMintError::InsufficientInputs)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_swap_invalid_output_amount() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 4).await?;
        let (info, _) = mint.active_keyset().await?;

        // 3 is not a power of two, no key exists for it
        let (outputs, _) = blind_outputs(&info.id, &[3], &random_secrets(1))?;
        assert!(matches!(
            mint.swap(&proofs, &outputs).await,
            Err(NutmegMintError::InvalidAmount)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_swap_forged_proof() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 4).await?;
        let (info, _) = mint.active_keyset().await?;

        let mut forged = proofs.proofs();
        forged[0].secret = "some-other-secret".to_string();
        let (outputs, _) = blind_outputs(&info.id, &[4], &random_secrets(1))?;
        assert!(matches!(
            mint.swap(&Proofs::new(forged), &outputs).await,
            Err(NutmegMintError::InvalidProof)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_swap_with_input_fees() -> anyhow::Result<()> {
        let config = MintConfig {
            input_fee_ppk: 1000,
            ..Default::default()
        };
        let (mint, lightning) = create_mint_with_config(config).await?;
        let proofs = mint_proofs(&mint, &lightning, 64).await?;
        let (info, _) = mint.active_keyset().await?;

        // one input at 1000 ppk charges one sat
        let (outputs, _) = blind_outputs(&info.id, &[64], &random_secrets(1))?;
        assert!(matches!(
            mint.swap(&proofs, &outputs).await,
            Err(NutmegMintError::InsufficientInputs)
        ));

        let amounts = vec![1, 2, 4, 8, 16, 32];
        let (outputs, _) = blind_outputs(&info.id, &amounts, &random_secrets(amounts.len()))?;
        let signatures = mint.swap(&proofs, &outputs).await?;
        assert_eq!(signatures.iter().map(|sig| sig.amount).sum::<u64>(), 63);
        Ok(())
    }

    #[tokio::test]
    async fn test_mint_quote_with_nut20_signature() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let (key, pubkey) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");

        let quote = mint
            .create_mint_quote(&PostMintQuoteBolt11Request {
                amount: 8,
                unit: CurrencyUnit::Sat,
                pubkey: Some(pubkey),
            })
            .await?;
        lightning.settle_invoice(&quote.payment_hash).await;

        let (info, _) = mint.active_keyset().await?;
        let (outputs, _) = blind_outputs(&info.id, &[8], &random_secrets(1))?;
        let mut request = PostMintBolt11Request {
            quote: quote.quote_id.to_string(),
            outputs,
            signature: None,
        };

        assert!(matches!(
            mint.mint_tokens(&request).await,
            Err(NutmegMintError::InvalidSignature)
        ));

        let (wrong_key, _) =
            keypair("0000000000000000000000000000000000000000000000000000000000000001");
        request.sign(&wrong_key)?;
        assert!(matches!(
            mint.mint_tokens(&request).await,
            Err(NutmegMintError::InvalidSignature)
        ));

        request.sign(&key)?;
        assert_eq!(mint.mint_tokens(&request).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_swap_p2pk() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let (key, pubkey) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");
        let (wrong_key, _) =
            keypair("0000000000000000000000000000000000000000000000000000000000000001");

        let secret = WellKnownSecret::new(Kind::P2PK, pubkey.to_string(), None)
            .to_secret_string()?;
        let proofs = mint_proofs_with_secrets(&mint, &lightning, &[32], vec![secret]).await?;
        let (info, _) = mint.active_keyset().await?;
        let (outputs, _) = blind_outputs(&info.id, &[32], &random_secrets(1))?;

        // no witness at all
        assert!(matches!(
            mint.swap(&proofs, &outputs).await,
            Err(NutmegMintError::InvalidWitness(_))
        ));

        // signature by the wrong key
        let mut wrong_signed = proofs.proofs();
        wrong_signed[0].sign_p2pk(&wrong_key)?;
        assert!(matches!(
            mint.swap(&Proofs::new(wrong_signed), &outputs).await,
            Err(NutmegMintError::NotEnoughSignatures)
        ));

        // valid signature
        let mut signed = proofs.proofs();
        signed[0].sign_p2pk(&key)?;
        let signatures = mint.swap(&Proofs::new(signed), &outputs).await?;
        assert_eq!(signatures.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_htlc_multisig_sig_all() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let (key_one, pubkey_one) =
            keypair("99590802251e78ee1051648439eedb003dc539093a48a44e7b8f2642c909ea37");
        let (key_two, pubkey_two) =
            keypair("0000000000000000000000000000000000000000000000000000000000000001");

        let conditions = Conditions {
            pubkeys: Some(vec![pubkey_one, pubkey_two]),
            num_sigs: Some(2),
            sig_flag: SigFlag::SigAll,
            ..Default::default()
        };
        let secret = WellKnownSecret::new(
            Kind::HTLC,
            sha256_hex(b"111111"),
            Some(&conditions),
        )
        .to_secret_string()?;
        let proofs = mint_proofs_with_secrets(&mint, &lightning, &[64], vec![secret]).await?;
        let (info, _) = mint.active_keyset().await?;
        let (outputs, _) = blind_outputs(&info.id, &[64], &random_secrets(1))?;

        // SIG_ALL inputs cannot be melted
        let melt_quote = external_melt_quote(&mint, &lightning, 32).await?;
        assert!(matches!(
            mint.melt_tokens(&melt_quote.quote_id.to_string(), &proofs)
                .await,
            Err(NutmegMintError::SigAllOnlySwap)
        ));

        // inputs carry preimage plus both signatures over the transcript,
        // outputs stay unsigned
        let msg = nutmeg_core::p2pk::sig_all_message(&proofs, &outputs);
        let mut signed_inputs = proofs.proofs();
        signed_inputs[0].add_preimage("111111")?;
        for key in [&key_one, &key_two] {
            let signature = nutmeg_core::crypto::sign_message(key, &msg)?;
            let witness = signed_inputs[0].witness.clone().unwrap();
            let mut parsed = nutmeg_core::htlc::HTLCWitness::from_witness(&witness)?;
            parsed
                .signatures
                .get_or_insert_with(Vec::new)
                .push(signature.to_string());
            signed_inputs[0].witness = Some(serde_json::to_string(&parsed)?);
        }
        let signed_inputs = Proofs::new(signed_inputs);
        assert!(matches!(
            mint.swap(&signed_inputs, &outputs).await,
            Err(NutmegMintError::NotEnoughSignatures)
        ));

        // outputs carry both signatures as well
        let mut signed_outputs = outputs.clone();
        for output in &mut signed_outputs {
            output.sign_p2pk(&key_one, &msg)?;
            output.sign_p2pk(&key_two, &msg)?;
        }
        let signatures = mint.swap(&signed_inputs, &signed_outputs).await?;
        assert_eq!(signatures.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_melt_external_payment() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 128).await?;

        let quote = external_melt_quote(&mint, &lightning, 64).await?;
        assert_eq!(quote.fee_reserve, 1); // 1% of 64, rounded up

        let melted = mint
            .melt_tokens(&quote.quote_id.to_string(), &proofs)
            .await?;
        assert_eq!(melted.state, MeltQuoteState::Paid);
        assert!(melted.preimage.is_some());

        let states = mint.check_state(&proofs.ys()?).await?;
        assert!(states.iter().all(|state| state.state == ProofState::Spent));

        // paying the same quote again fails
        assert!(matches!(
            mint.melt_tokens(&quote.quote_id.to_string(), &proofs)
                .await,
            Err(NutmegMintError::AlreadyPaid)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_melt_failed_payment_releases_inputs() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 128).await?;

        let quote = external_melt_quote(&mint, &lightning, 64).await?;
        lightning.set_payment_outcome(PaymentStatus::Failed).await;

        // a failed payment is not an error, the quote just stays unpaid
        let melted = mint
            .melt_tokens(&quote.quote_id.to_string(), &proofs)
            .await?;
        assert_eq!(melted.state, MeltQuoteState::Unpaid);

        let states = mint.check_state(&proofs.ys()?).await?;
        assert!(states
            .iter()
            .all(|state| state.state == ProofState::Unspent));

        // the inputs are spendable again
        lightning.set_payment_outcome(PaymentStatus::Succeeded).await;
        let melted = mint
            .melt_tokens(&quote.quote_id.to_string(), &proofs)
            .await?;
        assert_eq!(melted.state, MeltQuoteState::Paid);
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_melt_and_reconciliation() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 128).await?;

        let quote = external_melt_quote(&mint, &lightning, 64).await?;
        lightning.set_payment_outcome(PaymentStatus::Pending).await;

        let melted = mint
            .melt_tokens(&quote.quote_id.to_string(), &proofs)
            .await?;
        assert_eq!(melted.state, MeltQuoteState::Pending);

        let states = mint.check_state(&proofs.ys()?).await?;
        assert!(states
            .iter()
            .all(|state| state.state == ProofState::Pending));

        // pending proofs cannot be swapped
        let (info, _) = mint.active_keyset().await?;
        let (outputs, _) = blind_outputs(&info.id, &[64], &random_secrets(1))?;
        assert!(matches!(
            mint.swap(&proofs, &outputs).await,
            Err(NutmegMintError::ProofPending)
        ));

        // the payment settles after the fact, reconciliation picks it up
        lightning
            .resolve_payment(&quote.payment_hash, PaymentStatus::Succeeded)
            .await;
        mint.reconcile_pending_melts().await?;

        let resolved = mint.melt_quote_state(&quote.quote_id.to_string()).await?;
        assert_eq!(resolved.state, MeltQuoteState::Paid);
        assert!(resolved.preimage.is_some());

        let states = mint.check_state(&proofs.ys()?).await?;
        assert!(states.iter().all(|state| state.state == ProofState::Spent));
        Ok(())
    }

    #[tokio::test]
    async fn test_internal_settlement() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 3200).await?;

        // a mint quote of this mint and a melt quote for the same invoice
        let mint_quote = mint
            .create_mint_quote(&PostMintQuoteBolt11Request {
                amount: 3200,
                unit: CurrencyUnit::Sat,
                pubkey: None,
            })
            .await?;
        let melt_quote = mint
            .create_melt_quote(&PostMeltQuoteBolt11Request {
                request: mint_quote.payment_request.clone(),
                unit: CurrencyUnit::Sat,
                mpp_amount_msat: None,
            })
            .await?;
        assert_eq!(melt_quote.fee_reserve, 0);

        let melted = mint
            .melt_tokens(&melt_quote.quote_id.to_string(), &proofs)
            .await?;
        assert_eq!(melted.state, MeltQuoteState::Paid);
        assert_eq!(
            melted.preimage,
            Some(sha256_hex(mint_quote.quote_id.to_string().as_bytes()))
        );

        // the mint quote became payable without a Lightning round-trip
        let paid = mint
            .mint_quote_state(&mint_quote.quote_id.to_string())
            .await?;
        assert_eq!(paid.state, MintQuoteState::Paid);

        let (info, _) = mint.active_keyset().await?;
        let amounts = Amount(3200).split().into_iter().collect::<Vec<_>>();
        let (outputs, _) = blind_outputs(&info.id, &amounts, &random_secrets(amounts.len()))?;
        let signatures = mint
            .mint_tokens(&PostMintBolt11Request {
                quote: mint_quote.quote_id.to_string(),
                outputs,
                signature: None,
            })
            .await?;
        assert_eq!(
            signatures.iter().map(|sig| sig.amount).sum::<u64>(),
            3200
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_melt_quote_for_same_invoice_twice() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let invoice = lightning.create_invoice(64).await?;

        let request = PostMeltQuoteBolt11Request {
            request: invoice.payment_request,
            unit: CurrencyUnit::Sat,
            mpp_amount_msat: None,
        };
        mint.create_melt_quote(&request).await?;
        assert!(matches!(
            mint.create_melt_quote(&request).await,
            Err(NutmegMintError::QuoteExists)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_returns_cached_signatures() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;

        let quote = mint
            .create_mint_quote(&PostMintQuoteBolt11Request {
                amount: 32,
                unit: CurrencyUnit::Sat,
                pubkey: None,
            })
            .await?;
        lightning.settle_invoice(&quote.payment_hash).await;

        let (info, _) = mint.active_keyset().await?;
        let (outputs, _) = blind_outputs(&info.id, &[32], &random_secrets(1))?;
        let signatures = mint
            .mint_tokens(&PostMintBolt11Request {
                quote: quote.quote_id.to_string(),
                outputs: outputs.clone(),
                signature: None,
            })
            .await?;

        // an unknown output is silently skipped
        let (unknown, _) = blind_outputs(&info.id, &[8], &random_secrets(1))?;
        let mut request = outputs.clone();
        request.extend(unknown);

        let restored = mint.restore(&request).await?;
        assert_eq!(restored.outputs.len(), 1);
        assert_eq!(restored.signatures, signatures);

        // restore is idempotent
        let again = mint.restore(&request).await?;
        assert_eq!(again.signatures, signatures);
        Ok(())
    }

    #[tokio::test]
    async fn test_keyset_rotation() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 64).await?;
        let (old_info, _) = mint.active_keyset().await?;

        let new_info = mint.rotate_keyset(100).await?;
        assert_ne!(new_info.id, old_info.id);
        assert_eq!(new_info.input_fee_ppk, 100);
        assert_eq!(mint.keyset_infos().await.len(), 2);

        let (active, _) = mint.active_keyset().await?;
        assert_eq!(active.id, new_info.id);

        // outputs for the retired keyset are rejected
        let (old_outputs, _) = blind_outputs(&old_info.id, &[64], &random_secrets(1))?;
        assert!(matches!(
            mint.swap(&proofs, &old_outputs).await,
            Err(NutmegMintError::KeysetInactive)
        ));

        // proofs of the old keyset still verify and can be swapped into the
        // new one
        let (new_outputs, _) = blind_outputs(&new_info.id, &[64], &random_secrets(1))?;
        let signatures = mint.swap(&proofs, &new_outputs).await?;
        assert_eq!(signatures[0].keyset_id, new_info.id);
        Ok(())
    }

    #[tokio::test]
    async fn test_mint_limits() -> anyhow::Result<()> {
        let config = MintConfig {
            limits: crate::config::LimitsConfig {
                mint_min: 10,
                mint_max: Some(1000),
                ..Default::default()
            },
            ..Default::default()
        };
        let (mint, _) = create_mint_with_config(config).await?;

        for amount in [1, 2000] {
            assert!(matches!(
                mint.create_mint_quote(&PostMintQuoteBolt11Request {
                    amount,
                    unit: CurrencyUnit::Sat,
                    pubkey: None,
                })
                .await,
                Err(NutmegMintError::MintAmountExceeded)
            ));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_mint_issues_once() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let quote = mint
            .create_mint_quote(&PostMintQuoteBolt11Request {
                amount: 16,
                unit: CurrencyUnit::Sat,
                pubkey: None,
            })
            .await?;
        lightning.settle_invoice(&quote.payment_hash).await;
        let (info, _) = mint.active_keyset().await?;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let mint = mint.clone();
            let (outputs, _) = blind_outputs(&info.id, &[16], &random_secrets(1))?;
            let request = PostMintBolt11Request {
                quote: quote.quote_id.to_string(),
                outputs,
                signature: None,
            };
            handles.push(tokio::spawn(
                async move { mint.mint_tokens(&request).await },
            ));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await? {
                Ok(_) => successes += 1,
                Err(NutmegMintError::AlreadyIssued) | Err(NutmegMintError::AlreadySigned) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(successes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_swap_spends_once() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        let proofs = mint_proofs(&mint, &lightning, 64).await?;
        let (info, _) = mint.active_keyset().await?;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let mint = mint.clone();
            let proofs = proofs.clone();
            let (outputs, _) = blind_outputs(&info.id, &[64], &random_secrets(1))?;
            handles.push(tokio::spawn(async move {
                mint.swap(&proofs, &outputs).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await? {
                Ok(_) => successes += 1,
                Err(NutmegMintError::AlreadySpent) | Err(NutmegMintError::ProofPending) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(successes, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_quote_state_polls_backend() -> anyhow::Result<()> {
        use crate::lightning::MockLightning;
        use crate::model::{CreateInvoiceResult, InvoiceStatus};

        let mut lightning = MockLightning::new();
        lightning.expect_create_invoice().returning(|amount| {
            Ok(CreateInvoiceResult {
                payment_hash: "00ff".to_string(),
                payment_request: format!("lnbcrt{amount}n1mock"),
            })
        });
        lightning.expect_invoice_status().returning(|_| {
            Ok(InvoiceStatus {
                settled: true,
                preimage: Some("00".to_string()),
            })
        });

        let mint = Mint::init(
            Arc::new(lightning),
            LightningType::Fake,
            Arc::new(MemoryStore::new()),
            MintConfig::default(),
        )
        .await?;

        let quote = mint
            .create_mint_quote(&PostMintQuoteBolt11Request {
                amount: 100,
                unit: CurrencyUnit::Sat,
                pubkey: None,
            })
            .await?;
        assert_eq!(quote.state, MintQuoteState::Unpaid);

        // polling consults the backend and persists the transition
        let polled = mint.mint_quote_state(&quote.quote_id.to_string()).await?;
        assert_eq!(polled.state, MintQuoteState::Paid);
        Ok(())
    }

    #[tokio::test]
    async fn test_balance_counters() -> anyhow::Result<()> {
        let (mint, lightning) = create_mint().await?;
        assert_eq!(mint.total_balance().await?, 0);

        let proofs = mint_proofs(&mint, &lightning, 100).await?;
        assert_eq!(mint.issued_ecash().await?, 100);
        assert_eq!(mint.total_balance().await?, 100);

        let quote = external_melt_quote(&mint, &lightning, 64).await?;
        mint.melt_tokens(&quote.quote_id.to_string(), &proofs)
            .await?;
        assert_eq!(mint.redeemed_ecash().await?, 100);
        assert_eq!(mint.total_balance().await?, 0);
        Ok(())
    }
}
