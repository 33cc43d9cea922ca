use std::fmt::{self, Formatter};
use std::str::FromStr;

use async_trait::async_trait;
use lightning_invoice::Bolt11Invoice as LNInvoice;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;

use crate::error::NutmegMintError;
use crate::model::{CreateInvoiceResult, DecodedInvoice, InvoiceStatus, PaymentResult};

pub mod cln;
pub mod error;
pub mod fake;
pub mod lnd;

use self::cln::ClnLightningSettings;
use self::lnd::LndLightningSettings;

#[derive(Debug, Clone)]
pub enum LightningType {
    Lnd(LndLightningSettings),
    Cln(ClnLightningSettings),
    Fake,
}

impl fmt::Display for LightningType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lnd(settings) => write!(f, "Lnd: {}", settings),
            Self::Cln(settings) => write!(f, "Cln: {}", settings),
            Self::Fake => write!(f, "Fake"),
        }
    }
}

/// The mint's only coupling to the Lightning network.
///
/// Implementations must map their own timeout or deadline conditions to
/// `PaymentStatus::Pending`, never to `Failed`: a payment whose outcome is
/// unknown keeps its melt quote pending until reconciliation resolves it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Lightning: Send + Sync {
    async fn create_invoice(&self, amount_sat: u64)
        -> Result<CreateInvoiceResult, NutmegMintError>;

    async fn invoice_status(&self, payment_hash: String)
        -> Result<InvoiceStatus, NutmegMintError>;

    async fn pay_invoice(
        &self,
        payment_request: String,
        max_fee_sat: u64,
    ) -> Result<PaymentResult, NutmegMintError>;

    /// Pays `amount_msat` of the invoice as one part of a multi-path payment.
    async fn pay_partial_amount(
        &self,
        payment_request: String,
        amount_msat: u64,
        max_fee_sat: u64,
    ) -> Result<PaymentResult, NutmegMintError>;

    /// Terminal or current state of an outgoing payment, used to resolve
    /// pending melt quotes.
    async fn outgoing_payment_status(
        &self,
        payment_hash: String,
    ) -> Result<PaymentResult, NutmegMintError>;

    /// Stream of settlement events for a single invoice.
    async fn subscribe_invoice(
        &self,
        payment_hash: String,
    ) -> Result<mpsc::Receiver<InvoiceStatus>, NutmegMintError>;

    async fn decode_invoice(
        &self,
        payment_request: String,
    ) -> Result<DecodedInvoice, NutmegMintError> {
        decode_bolt11(&payment_request)
    }
}

/// Reads amount and payment hash out of a bolt11 payment request.
pub fn decode_bolt11(payment_request: &str) -> Result<DecodedInvoice, NutmegMintError> {
    let invoice = LNInvoice::from_str(payment_request)
        .map_err(|_| NutmegMintError::DecodeInvoice(payment_request.to_string()))?;
    Ok(DecodedInvoice {
        amount_msat: invoice.amount_milli_satoshis(),
        payment_hash: invoice.payment_hash().to_string(),
    })
}
