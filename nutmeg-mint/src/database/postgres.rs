use std::str::FromStr;

use async_trait::async_trait;
use nutmeg_core::blind::{BlindSignatureDleq, BlindedSignature};
use nutmeg_core::keyset::KeysetInfo;
use nutmeg_core::primitives::{CurrencyUnit, MeltQuoteState, MintQuoteState};
use secp256k1::{PublicKey, SecretKey};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use super::Database;
use crate::config::DatabaseConfig;
use crate::error::NutmegMintError;
use crate::model::{MeltQuote, MintQuote, ProofRecord};

#[derive(Clone)]
pub struct PostgresStore {
    pool: sqlx::Pool<Postgres>,
}

impl PostgresStore {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        Ok(Self {
            pool: PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(config.db_url.as_str())
                .await?,
        })
    }

    pub async fn migrate(&self) -> Result<(), NutmegMintError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| NutmegMintError::Internal(err.to_string()))
    }
}

fn mint_state_to_str(state: MintQuoteState) -> &'static str {
    match state {
        MintQuoteState::Unpaid => "UNPAID",
        MintQuoteState::Paid => "PAID",
        MintQuoteState::Issued => "ISSUED",
    }
}

fn mint_state_from_str(state: &str) -> Result<MintQuoteState, NutmegMintError> {
    match state {
        "UNPAID" => Ok(MintQuoteState::Unpaid),
        "PAID" => Ok(MintQuoteState::Paid),
        "ISSUED" => Ok(MintQuoteState::Issued),
        other => Err(NutmegMintError::Internal(format!(
            "invalid mint quote state {other}"
        ))),
    }
}

fn melt_state_to_str(state: MeltQuoteState) -> &'static str {
    match state {
        MeltQuoteState::Unpaid => "UNPAID",
        MeltQuoteState::Pending => "PENDING",
        MeltQuoteState::Paid => "PAID",
    }
}

fn melt_state_from_str(state: &str) -> Result<MeltQuoteState, NutmegMintError> {
    match state {
        "UNPAID" => Ok(MeltQuoteState::Unpaid),
        "PENDING" => Ok(MeltQuoteState::Pending),
        "PAID" => Ok(MeltQuoteState::Paid),
        other => Err(NutmegMintError::Internal(format!(
            "invalid melt quote state {other}"
        ))),
    }
}

fn proof_from_row(row: &PgRow) -> ProofRecord {
    ProofRecord {
        y: row.get("y"),
        amount: row.get::<i64, _>("amount") as u64,
        keyset_id: row.get("keyset_id"),
        secret: row.get("secret"),
        c: row.get("c"),
        witness: row.get("witness"),
    }
}

fn mint_quote_from_row(row: &PgRow) -> Result<MintQuote, NutmegMintError> {
    let pubkey: Option<String> = row.get("pubkey");
    Ok(MintQuote {
        quote_id: row.get("id"),
        amount: row.get::<i64, _>("amount") as u64,
        payment_request: row.get("payment_request"),
        payment_hash: row.get("payment_hash"),
        state: mint_state_from_str(row.get("state"))?,
        expiry: row.get::<i64, _>("expiry") as u64,
        pubkey: pubkey
            .map(|key| {
                PublicKey::from_str(&key)
                    .map_err(|err| NutmegMintError::Internal(err.to_string()))
            })
            .transpose()?,
    })
}

fn melt_quote_from_row(row: &PgRow) -> Result<MeltQuote, NutmegMintError> {
    Ok(MeltQuote {
        quote_id: row.get("id"),
        payment_request: row.get("payment_request"),
        payment_hash: row.get("payment_hash"),
        amount: row.get::<i64, _>("amount") as u64,
        fee_reserve: row.get::<i64, _>("fee_reserve") as u64,
        state: melt_state_from_str(row.get("state"))?,
        expiry: row.get::<i64, _>("expiry") as u64,
        preimage: row.get("preimage"),
        mpp_amount_msat: row.get::<Option<i64>, _>("mpp_amount_msat").map(|v| v as u64),
    })
}

fn signature_from_row(row: &PgRow) -> Result<BlindedSignature, NutmegMintError> {
    let dleq_e: Option<String> = row.get("dleq_e");
    let dleq_s: Option<String> = row.get("dleq_s");
    let dleq = match (dleq_e, dleq_s) {
        (Some(e), Some(s)) => Some(BlindSignatureDleq {
            e: SecretKey::from_str(&e)
                .map_err(|err| NutmegMintError::Internal(err.to_string()))?,
            s: SecretKey::from_str(&s)
                .map_err(|err| NutmegMintError::Internal(err.to_string()))?,
        }),
        _ => None,
    };
    Ok(BlindedSignature {
        amount: row.get::<i64, _>("amount") as u64,
        keyset_id: row.get("keyset_id"),
        c_: PublicKey::from_str(row.get("c_"))
            .map_err(|err| NutmegMintError::Internal(err.to_string()))?,
        dleq,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

async fn insert_spent_proofs(
    tx: &mut Transaction<'_, Postgres>,
    proofs: &[ProofRecord],
) -> Result<(), NutmegMintError> {
    for proof in proofs {
        sqlx::query(
            "INSERT INTO spent_proofs (y, amount, keyset_id, secret, c, witness) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&proof.y)
        .bind(proof.amount as i64)
        .bind(&proof.keyset_id)
        .bind(&proof.secret)
        .bind(&proof.c)
        .bind(&proof.witness)
        .execute(&mut **tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                NutmegMintError::AlreadySpent
            } else {
                err.into()
            }
        })?;
    }
    Ok(())
}

async fn insert_blind_signatures(
    tx: &mut Transaction<'_, Postgres>,
    outputs: &[(String, BlindedSignature)],
) -> Result<(), NutmegMintError> {
    for (b_, signature) in outputs {
        sqlx::query(
            "INSERT INTO blind_signatures (b_, amount, keyset_id, c_, dleq_e, dleq_s) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(b_)
        .bind(signature.amount as i64)
        .bind(&signature.keyset_id)
        .bind(signature.c_.to_string())
        .bind(signature.dleq.as_ref().map(|dleq| dleq.e.display_secret().to_string()))
        .bind(signature.dleq.as_ref().map(|dleq| dleq.s.display_secret().to_string()))
        .execute(&mut **tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                NutmegMintError::AlreadySigned
            } else {
                err.into()
            }
        })?;
    }
    Ok(())
}

#[async_trait]
impl Database for PostgresStore {
    #[instrument(level = "debug", skip_all, err)]
    async fn get_seed(&self) -> Result<Option<Vec<u8>>, NutmegMintError> {
        let row = sqlx::query("SELECT seed FROM mint_seed WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            hex::decode(row.get::<String, _>("seed"))
                .map_err(|err| NutmegMintError::Internal(err.to_string()))
        })
        .transpose()
    }

    #[instrument(level = "debug", skip_all, err)]
    async fn save_seed(&self, seed: &[u8]) -> Result<(), NutmegMintError> {
        sqlx::query("INSERT INTO mint_seed (id, seed) VALUES (1, $1)")
            .bind(hex::encode(seed))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_keysets(&self) -> Result<Vec<KeysetInfo>, NutmegMintError> {
        let rows = sqlx::query("SELECT * FROM keysets ORDER BY derivation_path_idx")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| KeysetInfo {
                id: row.get("id"),
                unit: CurrencyUnit::Sat,
                active: row.get("active"),
                derivation_path_idx: row.get::<i64, _>("derivation_path_idx") as u32,
                input_fee_ppk: row.get::<i64, _>("input_fee_ppk") as u64,
                valid_from: row.get::<i64, _>("valid_from") as u64,
            })
            .collect())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn save_keyset(&self, keyset: &KeysetInfo) -> Result<(), NutmegMintError> {
        sqlx::query(
            "INSERT INTO keysets (id, unit, active, derivation_path_idx, input_fee_ppk, valid_from) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&keyset.id)
        .bind(keyset.unit.to_string())
        .bind(keyset.active)
        .bind(keyset.derivation_path_idx as i64)
        .bind(keyset.input_fee_ppk as i64)
        .bind(keyset.valid_from as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn rotate_keysets(&self, new_keyset: &KeysetInfo) -> Result<(), NutmegMintError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE keysets SET active = false")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO keysets (id, unit, active, derivation_path_idx, input_fee_ppk, valid_from) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&new_keyset.id)
        .bind(new_keyset.unit.to_string())
        .bind(new_keyset.active)
        .bind(new_keyset.derivation_path_idx as i64)
        .bind(new_keyset.input_fee_ppk as i64)
        .bind(new_keyset.valid_from as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, err)]
    async fn get_proofs_used(&self, ys: &[String]) -> Result<Vec<ProofRecord>, NutmegMintError> {
        let rows = sqlx::query("SELECT * FROM spent_proofs WHERE y = ANY($1)")
            .bind(ys)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(proof_from_row).collect())
    }

    #[instrument(level = "debug", skip_all, err)]
    async fn get_pending_proofs(&self, ys: &[String]) -> Result<Vec<ProofRecord>, NutmegMintError> {
        let rows = sqlx::query("SELECT * FROM pending_proofs WHERE y = ANY($1)")
            .bind(ys)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(proof_from_row).collect())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_pending_proofs_by_quote(
        &self,
        quote_id: &Uuid,
    ) -> Result<Vec<ProofRecord>, NutmegMintError> {
        let rows = sqlx::query("SELECT * FROM pending_proofs WHERE melt_quote_id = $1")
            .bind(quote_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(proof_from_row).collect())
    }

    #[instrument(level = "debug", skip_all, err)]
    async fn add_pending_proofs(
        &self,
        proofs: &[ProofRecord],
        quote_id: &Uuid,
    ) -> Result<(), NutmegMintError> {
        let ys = proofs.iter().map(|proof| proof.y.clone()).collect::<Vec<_>>();
        let mut tx = self.pool.begin().await?;

        let spent: Option<PgRow> = sqlx::query("SELECT y FROM spent_proofs WHERE y = ANY($1)")
            .bind(&ys)
            .fetch_optional(&mut *tx)
            .await?;
        if spent.is_some() {
            return Err(NutmegMintError::AlreadySpent);
        }

        for proof in proofs {
            sqlx::query(
                "INSERT INTO pending_proofs (y, amount, keyset_id, secret, c, witness, melt_quote_id) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(&proof.y)
            .bind(proof.amount as i64)
            .bind(&proof.keyset_id)
            .bind(&proof.secret)
            .bind(&proof.c)
            .bind(&proof.witness)
            .bind(quote_id)
            .execute(&mut *tx)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    NutmegMintError::ProofPending
                } else {
                    err.into()
                }
            })?;
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn add_mint_quote(&self, quote: &MintQuote) -> Result<(), NutmegMintError> {
        sqlx::query(
            "INSERT INTO mint_quotes (id, amount, payment_request, payment_hash, state, expiry, pubkey) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(quote.quote_id)
        .bind(quote.amount as i64)
        .bind(&quote.payment_request)
        .bind(&quote.payment_hash)
        .bind(mint_state_to_str(quote.state))
        .bind(quote.expiry as i64)
        .bind(quote.pubkey.map(|key| key.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_mint_quote(&self, id: &Uuid) -> Result<Option<MintQuote>, NutmegMintError> {
        let row = sqlx::query("SELECT * FROM mint_quotes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(mint_quote_from_row).transpose()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_mint_quote_by_payment_hash(
        &self,
        payment_hash: &str,
    ) -> Result<Option<MintQuote>, NutmegMintError> {
        let row = sqlx::query("SELECT * FROM mint_quotes WHERE payment_hash = $1")
            .bind(payment_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(mint_quote_from_row).transpose()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn update_mint_quote_state(
        &self,
        id: &Uuid,
        state: MintQuoteState,
    ) -> Result<(), NutmegMintError> {
        sqlx::query("UPDATE mint_quotes SET state = $1 WHERE id = $2")
            .bind(mint_state_to_str(state))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_unpaid_mint_quotes(&self) -> Result<Vec<MintQuote>, NutmegMintError> {
        let rows = sqlx::query("SELECT * FROM mint_quotes WHERE state = 'UNPAID'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(mint_quote_from_row).collect()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn add_melt_quote(&self, quote: &MeltQuote) -> Result<(), NutmegMintError> {
        sqlx::query(
            "INSERT INTO melt_quotes (id, payment_request, payment_hash, amount, fee_reserve, state, expiry, preimage, mpp_amount_msat) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(quote.quote_id)
        .bind(&quote.payment_request)
        .bind(&quote.payment_hash)
        .bind(quote.amount as i64)
        .bind(quote.fee_reserve as i64)
        .bind(melt_state_to_str(quote.state))
        .bind(quote.expiry as i64)
        .bind(&quote.preimage)
        .bind(quote.mpp_amount_msat.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                NutmegMintError::QuoteExists
            } else {
                err.into()
            }
        })?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_melt_quote(&self, id: &Uuid) -> Result<Option<MeltQuote>, NutmegMintError> {
        let row = sqlx::query("SELECT * FROM melt_quotes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(melt_quote_from_row).transpose()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_melt_quote_by_payment_request(
        &self,
        payment_request: &str,
    ) -> Result<Option<MeltQuote>, NutmegMintError> {
        let row = sqlx::query("SELECT * FROM melt_quotes WHERE payment_request = $1")
            .bind(payment_request)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(melt_quote_from_row).transpose()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_pending_melt_quotes(&self) -> Result<Vec<MeltQuote>, NutmegMintError> {
        let rows = sqlx::query("SELECT * FROM melt_quotes WHERE state = 'PENDING'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(melt_quote_from_row).collect()
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn update_melt_quote(
        &self,
        id: &Uuid,
        state: MeltQuoteState,
        preimage: Option<String>,
    ) -> Result<(), NutmegMintError> {
        sqlx::query("UPDATE melt_quotes SET state = $1, preimage = COALESCE($2, preimage) WHERE id = $3")
            .bind(melt_state_to_str(state))
            .bind(preimage)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn get_blind_signature(
        &self,
        b_: &str,
    ) -> Result<Option<BlindedSignature>, NutmegMintError> {
        let row = sqlx::query("SELECT * FROM blind_signatures WHERE b_ = $1")
            .bind(b_)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(signature_from_row).transpose()
    }

    #[instrument(level = "debug", skip_all, err)]
    async fn get_blind_signatures(
        &self,
        bs: &[String],
    ) -> Result<Vec<Option<BlindedSignature>>, NutmegMintError> {
        let rows = sqlx::query("SELECT * FROM blind_signatures WHERE b_ = ANY($1)")
            .bind(bs)
            .fetch_all(&self.pool)
            .await?;
        let mut by_b = std::collections::HashMap::new();
        for row in &rows {
            by_b.insert(row.get::<String, _>("b_"), signature_from_row(row)?);
        }
        Ok(bs.iter().map(|b_| by_b.get(b_).cloned()).collect())
    }

    #[instrument(level = "debug", skip_all, err)]
    async fn commit_swap(
        &self,
        inputs: &[ProofRecord],
        outputs: &[(String, BlindedSignature)],
    ) -> Result<(), NutmegMintError> {
        let ys = inputs.iter().map(|proof| proof.y.clone()).collect::<Vec<_>>();
        let mut tx = self.pool.begin().await?;

        let pending: Option<PgRow> = sqlx::query("SELECT y FROM pending_proofs WHERE y = ANY($1)")
            .bind(&ys)
            .fetch_optional(&mut *tx)
            .await?;
        if pending.is_some() {
            return Err(NutmegMintError::ProofPending);
        }

        insert_spent_proofs(&mut tx, inputs).await?;
        insert_blind_signatures(&mut tx, outputs).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(level = "debug", skip_all, err)]
    async fn commit_mint_issue(
        &self,
        quote_id: &Uuid,
        outputs: &[(String, BlindedSignature)],
    ) -> Result<(), NutmegMintError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE mint_quotes SET state = 'ISSUED' WHERE id = $1 AND state = 'PAID'",
        )
        .bind(quote_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(NutmegMintError::AlreadyIssued);
        }

        insert_blind_signatures(&mut tx, outputs).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn commit_melt_paid(
        &self,
        quote_id: &Uuid,
        preimage: Option<&str>,
    ) -> Result<(), NutmegMintError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO spent_proofs (y, amount, keyset_id, secret, c, witness) SELECT y, amount, keyset_id, secret, c, witness FROM pending_proofs WHERE melt_quote_id = $1",
        )
        .bind(quote_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM pending_proofs WHERE melt_quote_id = $1")
            .bind(quote_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE melt_quotes SET state = 'PAID', preimage = $1 WHERE id = $2")
            .bind(preimage)
            .bind(quote_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn commit_melt_failed(&self, quote_id: &Uuid) -> Result<(), NutmegMintError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pending_proofs WHERE melt_quote_id = $1")
            .bind(quote_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE melt_quotes SET state = 'UNPAID' WHERE id = $1")
            .bind(quote_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn total_issued(&self) -> Result<u64, NutmegMintError> {
        let row = sqlx::query("SELECT COALESCE(SUM(amount), 0)::BIGINT AS total FROM blind_signatures")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("total") as u64)
    }

    #[instrument(level = "debug", skip(self), err)]
    async fn total_redeemed(&self) -> Result<u64, NutmegMintError> {
        let row = sqlx::query("SELECT COALESCE(SUM(amount), 0)::BIGINT AS total FROM spent_proofs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("total") as u64)
    }
}
