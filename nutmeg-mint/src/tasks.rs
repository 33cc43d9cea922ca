//! Background workers: one invoice watcher per unpaid mint quote and a
//! periodic reconciliation loop for pending melt quotes.

use std::time::Duration;

use nutmeg_core::crypto::unix_time;
use nutmeg_core::primitives::MintQuoteState;
use tracing::{debug, warn};

use crate::mint::Mint;
use crate::model::MintQuote;

/// Watches the quote's invoice until it settles or the quote expires.
pub fn spawn_invoice_watcher(mint: Mint, quote: MintQuote) {
    tokio::spawn(async move {
        if quote.state != MintQuoteState::Unpaid {
            return;
        }
        let now = unix_time();
        if quote.expiry <= now {
            return;
        }
        let expiry = Duration::from_secs(quote.expiry - now);

        let mut events = match mint
            .lightning
            .subscribe_invoice(quote.payment_hash.clone())
            .await
        {
            Ok(events) => events,
            Err(err) => {
                warn!("could not subscribe to invoice of quote {}: {err}", quote.quote_id);
                return;
            }
        };

        tokio::select! {
            event = events.recv() => {
                if let Some(status) = event {
                    if status.settled {
                        debug!("invoice of mint quote {} settled", quote.quote_id);
                        let mut quote = quote;
                        if let Err(err) = mint.mark_mint_quote_paid(&mut quote).await {
                            warn!("could not mark quote {} paid: {err}", quote.quote_id);
                        }
                    }
                }
            }
            _ = tokio::time::sleep(expiry) => {
                debug!("mint quote {} expired unpaid", quote.quote_id);
            }
        }
    });
}

/// Re-attaches invoice watchers for quotes that were unpaid at shutdown.
pub async fn respawn_invoice_watchers(mint: &Mint) {
    match mint.db.get_unpaid_mint_quotes().await {
        Ok(quotes) => {
            for quote in quotes {
                spawn_invoice_watcher(mint.clone(), quote);
            }
        }
        Err(err) => warn!("could not load unpaid mint quotes: {err}"),
    }
}

/// Periodically resolves melt quotes whose payment outcome was unknown.
pub fn spawn_melt_reconciliation(mint: Mint) {
    let interval = Duration::from_secs(mint.config.quotes.reconcile_interval_secs);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if let Err(err) = mint.reconcile_pending_melts().await {
                warn!("melt reconciliation failed: {err}");
            }
        }
    });
}
