//! A deterministic Lightning backend for tests and local development. It
//! settles invoices on demand and pays with a scriptable outcome, so quote
//! lifecycles can be driven without a node.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nutmeg_core::crypto::sha256_hex;
use rand::RngCore;
use tokio::sync::{mpsc, Mutex};

use super::Lightning;
use crate::error::NutmegMintError;
use crate::model::{
    CreateInvoiceResult, DecodedInvoice, InvoiceStatus, PaymentResult, PaymentStatus,
};

#[derive(Debug, Clone)]
struct FakeInvoice {
    amount_sat: u64,
    payment_request: String,
    preimage: String,
    settled: bool,
}

#[derive(Default)]
struct Inner {
    /// invoices issued by this backend, keyed by payment hash
    invoices: HashMap<String, FakeInvoice>,
    /// settlement subscribers, keyed by payment hash
    subscribers: HashMap<String, Vec<mpsc::Sender<InvoiceStatus>>>,
    /// outgoing payments, keyed by payment hash
    payments: HashMap<String, PaymentResult>,
    /// outcome of the next pay call
    payment_outcome: Option<PaymentStatus>,
}

#[derive(Clone, Default)]
pub struct FakeLightning {
    inner: Arc<Mutex<Inner>>,
}

impl FakeLightning {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the outcome of subsequent pay calls. Default is `Succeeded`.
    pub async fn set_payment_outcome(&self, outcome: PaymentStatus) {
        self.inner.lock().await.payment_outcome = Some(outcome);
    }

    /// Settles an invoice as if the external payer paid it, waking up
    /// subscribers.
    pub async fn settle_invoice(&self, payment_hash: &str) {
        let mut inner = self.inner.lock().await;
        let Some(invoice) = inner.invoices.get_mut(payment_hash) else {
            return;
        };
        invoice.settled = true;
        let preimage = invoice.preimage.clone();

        if let Some(subscribers) = inner.subscribers.remove(payment_hash) {
            for subscriber in subscribers {
                let _ = subscriber.try_send(InvoiceStatus {
                    settled: true,
                    preimage: Some(preimage.clone()),
                });
            }
        }
    }

    /// Resolves a pending outgoing payment, as a node would after the fact.
    pub async fn resolve_payment(&self, payment_hash: &str, status: PaymentStatus) {
        let mut inner = self.inner.lock().await;
        let preimage = inner
            .invoices
            .get(payment_hash)
            .map(|invoice| invoice.preimage.clone());
        inner.payments.insert(
            payment_hash.to_string(),
            PaymentResult {
                status,
                preimage: (status == PaymentStatus::Succeeded)
                    .then(|| preimage.unwrap_or_else(random_hex)),
                total_fees: 0,
            },
        );
    }

    async fn record_payment(&self, payment_hash: &str) -> PaymentResult {
        let mut inner = self.inner.lock().await;
        let status = inner.payment_outcome.unwrap_or(PaymentStatus::Succeeded);
        let preimage = inner
            .invoices
            .get(payment_hash)
            .map(|invoice| invoice.preimage.clone());
        let result = PaymentResult {
            status,
            preimage: (status == PaymentStatus::Succeeded)
                .then(|| preimage.unwrap_or_else(random_hex)),
            total_fees: 0,
        };
        inner
            .payments
            .insert(payment_hash.to_string(), result.clone());
        result
    }
}

fn random_hex() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[async_trait]
impl Lightning for FakeLightning {
    async fn create_invoice(
        &self,
        amount_sat: u64,
    ) -> Result<CreateInvoiceResult, NutmegMintError> {
        let preimage = random_hex();
        let payment_hash = sha256_hex(preimage.as_bytes());
        let payment_request = format!("fakelnbc{amount_sat}n1{payment_hash}");

        self.inner.lock().await.invoices.insert(
            payment_hash.clone(),
            FakeInvoice {
                amount_sat,
                payment_request: payment_request.clone(),
                preimage,
                settled: false,
            },
        );

        Ok(CreateInvoiceResult {
            payment_hash,
            payment_request,
        })
    }

    async fn invoice_status(&self, payment_hash: String) -> Result<InvoiceStatus, NutmegMintError> {
        let inner = self.inner.lock().await;
        let invoice = inner
            .invoices
            .get(&payment_hash)
            .ok_or_else(|| NutmegMintError::Internal("unknown invoice".to_string()))?;
        Ok(InvoiceStatus {
            settled: invoice.settled,
            preimage: invoice.settled.then(|| invoice.preimage.clone()),
        })
    }

    async fn pay_invoice(
        &self,
        payment_request: String,
        _max_fee_sat: u64,
    ) -> Result<PaymentResult, NutmegMintError> {
        let decoded = self.decode_invoice(payment_request).await?;
        Ok(self.record_payment(&decoded.payment_hash).await)
    }

    async fn pay_partial_amount(
        &self,
        payment_request: String,
        _amount_msat: u64,
        _max_fee_sat: u64,
    ) -> Result<PaymentResult, NutmegMintError> {
        let decoded = self.decode_invoice(payment_request).await?;
        Ok(self.record_payment(&decoded.payment_hash).await)
    }

    async fn outgoing_payment_status(
        &self,
        payment_hash: String,
    ) -> Result<PaymentResult, NutmegMintError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .payments
            .get(&payment_hash)
            .cloned()
            .unwrap_or(PaymentResult {
                status: PaymentStatus::Failed,
                preimage: None,
                total_fees: 0,
            }))
    }

    async fn subscribe_invoice(
        &self,
        payment_hash: String,
    ) -> Result<mpsc::Receiver<InvoiceStatus>, NutmegMintError> {
        let (tx, rx) = mpsc::channel(8);
        let mut inner = self.inner.lock().await;
        match inner.invoices.get(&payment_hash) {
            Some(invoice) if invoice.settled => {
                let _ = tx.try_send(InvoiceStatus {
                    settled: true,
                    preimage: Some(invoice.preimage.clone()),
                });
            }
            _ => {
                inner
                    .subscribers
                    .entry(payment_hash)
                    .or_default()
                    .push(tx);
            }
        }
        Ok(rx)
    }

    async fn decode_invoice(
        &self,
        payment_request: String,
    ) -> Result<DecodedInvoice, NutmegMintError> {
        let inner = self.inner.lock().await;
        let invoice = inner
            .invoices
            .values()
            .find(|invoice| invoice.payment_request == payment_request);
        match invoice {
            Some(invoice) => Ok(DecodedInvoice {
                amount_msat: Some(invoice.amount_sat * 1_000),
                payment_hash: sha256_hex(invoice.preimage.as_bytes()),
            }),
            None => super::decode_bolt11(&payment_request),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_settlement_notifies_subscribers() -> anyhow::Result<()> {
        let lightning = FakeLightning::new();
        let invoice = lightning.create_invoice(1000).await?;

        let mut subscription = lightning
            .subscribe_invoice(invoice.payment_hash.clone())
            .await?;
        assert!(!lightning
            .invoice_status(invoice.payment_hash.clone())
            .await?
            .settled);

        lightning.settle_invoice(&invoice.payment_hash).await;

        let event = subscription.recv().await.expect("settlement event");
        assert!(event.settled);
        assert!(event.preimage.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_scripted_payment_outcome() -> anyhow::Result<()> {
        let lightning = FakeLightning::new();
        let invoice = lightning.create_invoice(21).await?;

        lightning.set_payment_outcome(PaymentStatus::Pending).await;
        let result = lightning
            .pay_invoice(invoice.payment_request.clone(), 0)
            .await?;
        assert_eq!(result.status, PaymentStatus::Pending);

        lightning
            .resolve_payment(&invoice.payment_hash, PaymentStatus::Succeeded)
            .await;
        let status = lightning
            .outgoing_payment_status(invoice.payment_hash.clone())
            .await?;
        assert_eq!(status.status, PaymentStatus::Succeeded);
        assert!(status.preimage.is_some());
        Ok(())
    }
}
