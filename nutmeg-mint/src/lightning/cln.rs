use std::fmt::{self, Formatter};
use std::fs::read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cln_grpc::pb::listinvoices_invoices::ListinvoicesInvoicesStatus;
use cln_grpc::pb::listpays_pays::ListpaysPaysStatus;
use cln_grpc::pb::node_client::NodeClient;
use cln_grpc::pb::pay_response::PayStatus;
use cln_grpc::pb::{amount_or_any, Amount, AmountOrAny};
use secp256k1::rand;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, MappedMutexGuard, Mutex, MutexGuard};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing::warn;

use super::error::LightningError;
use super::Lightning;
use crate::error::NutmegMintError;
use crate::model::{CreateInvoiceResult, InvoiceStatus, PaymentResult, PaymentStatus};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ClnLightningSettings {
    pub grpc_host: Option<String>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
}

impl ClnLightningSettings {
    pub fn from_env() -> Self {
        Self {
            grpc_host: std::env::var("CLN_GRPC_HOST").ok(),
            client_cert: std::env::var("CLN_CLIENT_CERT").ok().map(PathBuf::from),
            client_key: std::env::var("CLN_CLIENT_KEY").ok().map(PathBuf::from),
            ca_cert: std::env::var("CLN_CA_CERT").ok().map(PathBuf::from),
        }
    }
}

impl fmt::Display for ClnLightningSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grpc_host: {}",
            self.grpc_host.as_deref().unwrap_or_default()
        )
    }
}

pub struct ClnLightning(Arc<Mutex<NodeClient<Channel>>>);

impl ClnLightning {
    pub async fn new(
        grpc_host: String,
        client_cert: &PathBuf,
        client_key: &PathBuf,
        ca_cert: &PathBuf,
    ) -> Result<Self, NutmegMintError> {
        let client_cert =
            read(client_cert).map_err(|err| LightningError::Connect(err.to_string()))?;
        let client_key =
            read(client_key).map_err(|err| LightningError::Connect(err.to_string()))?;
        let identity = Identity::from_pem(client_cert, client_key);

        let ca_cert = read(ca_cert).map_err(|err| LightningError::Connect(err.to_string()))?;
        let ca_certificate = Certificate::from_pem(ca_cert);

        let tls_config = ClientTlsConfig::new()
            .domain_name("localhost")
            .identity(identity)
            .ca_certificate(ca_certificate);

        let channel = Channel::from_shared(grpc_host)
            .map_err(|err| LightningError::Connect(err.to_string()))?
            .tls_config(tls_config)
            .map_err(|err| LightningError::Connect(err.to_string()))?
            .connect()
            .await
            .map_err(|err| LightningError::Connect(err.to_string()))?;

        Ok(Self(Arc::new(Mutex::new(NodeClient::new(channel)))))
    }

    pub async fn client_lock(&self) -> MappedMutexGuard<'_, NodeClient<Channel>> {
        MutexGuard::map(self.0.lock().await, |client| client)
    }

    async fn lookup_invoice(
        &self,
        payment_hash: &str,
    ) -> Result<Option<cln_grpc::pb::ListinvoicesInvoices>, NutmegMintError> {
        let invoices = self
            .client_lock()
            .await
            .list_invoices(cln_grpc::pb::ListinvoicesRequest {
                invstring: None,
                label: None,
                payment_hash: Some(
                    hex::decode(payment_hash).map_err(|_| LightningError::InvalidHash)?,
                ),
                offer_id: None,
                index: None,
                start: None,
                limit: None,
            })
            .await
            .map_err(LightningError::Grpc)?
            .into_inner();
        Ok(invoices.invoices.into_iter().next())
    }
}

#[async_trait]
impl Lightning for ClnLightning {
    async fn create_invoice(
        &self,
        amount_sat: u64,
    ) -> Result<CreateInvoiceResult, NutmegMintError> {
        let amount_msat = Some(AmountOrAny {
            value: Some(amount_or_any::Value::Amount(Amount {
                msat: amount_sat * 1_000,
            })),
        });
        let invoice = self
            .client_lock()
            .await
            .invoice(cln_grpc::pb::InvoiceRequest {
                amount_msat,
                description: format!("{:x}", rand::random::<u128>()),
                label: format!("{:x}", rand::random::<u128>()),
                expiry: None,
                fallbacks: vec![],
                preimage: None,
                cltv: None,
                deschashonly: None,
            })
            .await
            .map_err(LightningError::Grpc)?
            .into_inner();

        Ok(CreateInvoiceResult {
            payment_hash: hex::encode(invoice.payment_hash),
            payment_request: invoice.bolt11,
        })
    }

    async fn invoice_status(&self, payment_hash: String) -> Result<InvoiceStatus, NutmegMintError> {
        let invoice = self
            .lookup_invoice(&payment_hash)
            .await?
            .ok_or(LightningError::NotFound)?;

        let settled = invoice.status() == ListinvoicesInvoicesStatus::Paid;
        Ok(InvoiceStatus {
            settled,
            preimage: invoice
                .payment_preimage
                .filter(|_| settled)
                .map(hex::encode),
        })
    }

    async fn pay_invoice(
        &self,
        payment_request: String,
        max_fee_sat: u64,
    ) -> Result<PaymentResult, NutmegMintError> {
        let payment = self
            .client_lock()
            .await
            .pay(cln_grpc::pb::PayRequest {
                bolt11: payment_request,
                amount_msat: None,
                label: None,
                riskfactor: None,
                maxfeepercent: None,
                retry_for: None,
                maxdelay: None,
                exemptfee: None,
                localinvreqid: None,
                exclude: vec![],
                maxfee: Some(Amount {
                    msat: max_fee_sat * 1_000,
                }),
                description: None,
            })
            .await
            .map_err(LightningError::Grpc)?
            .into_inner();

        let status = match payment.status() {
            PayStatus::Complete => PaymentStatus::Succeeded,
            PayStatus::Failed => PaymentStatus::Failed,
            PayStatus::Pending => PaymentStatus::Pending,
        };
        let total_fees = match (&payment.amount_sent_msat, &payment.amount_msat) {
            (Some(sent), Some(amount)) => sent.msat.saturating_sub(amount.msat) / 1_000,
            _ => 0,
        };

        Ok(PaymentResult {
            status,
            preimage: (status == PaymentStatus::Succeeded)
                .then(|| hex::encode(&payment.payment_preimage)),
            total_fees,
        })
    }

    async fn pay_partial_amount(
        &self,
        _payment_request: String,
        _amount_msat: u64,
        _max_fee_sat: u64,
    ) -> Result<PaymentResult, NutmegMintError> {
        Err(LightningError::Unsupported("partial payments".to_string()).into())
    }

    async fn outgoing_payment_status(
        &self,
        payment_hash: String,
    ) -> Result<PaymentResult, NutmegMintError> {
        let pays = self
            .client_lock()
            .await
            .list_pays(cln_grpc::pb::ListpaysRequest {
                bolt11: None,
                payment_hash: Some(
                    hex::decode(&payment_hash).map_err(|_| LightningError::InvalidHash)?,
                ),
                status: None,
            })
            .await
            .map_err(LightningError::Grpc)?
            .into_inner();

        let Some(pay) = pays.pays.into_iter().next() else {
            // the node never saw this payment, so it was never attempted
            return Ok(PaymentResult {
                status: PaymentStatus::Failed,
                preimage: None,
                total_fees: 0,
            });
        };

        let status = match pay.status() {
            ListpaysPaysStatus::Complete => PaymentStatus::Succeeded,
            ListpaysPaysStatus::Failed => PaymentStatus::Failed,
            ListpaysPaysStatus::Pending => PaymentStatus::Pending,
        };
        Ok(PaymentResult {
            status,
            preimage: pay.preimage.map(hex::encode),
            total_fees: 0,
        })
    }

    async fn subscribe_invoice(
        &self,
        payment_hash: String,
    ) -> Result<mpsc::Receiver<InvoiceStatus>, NutmegMintError> {
        let (tx, rx) = mpsc::channel(8);
        let client = self.0.clone();

        tokio::spawn(async move {
            let payment_hash = match hex::decode(&payment_hash) {
                Ok(hash) => hash,
                Err(_) => return,
            };
            loop {
                let invoices = client
                    .lock()
                    .await
                    .list_invoices(cln_grpc::pb::ListinvoicesRequest {
                        invstring: None,
                        label: None,
                        payment_hash: Some(payment_hash.clone()),
                        offer_id: None,
                        index: None,
                        start: None,
                        limit: None,
                    })
                    .await;

                match invoices {
                    Ok(invoices) => {
                        if let Some(invoice) = invoices.into_inner().invoices.into_iter().next() {
                            if invoice.status() == ListinvoicesInvoicesStatus::Paid {
                                let _ = tx
                                    .send(InvoiceStatus {
                                        settled: true,
                                        preimage: invoice.payment_preimage.map(hex::encode),
                                    })
                                    .await;
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        warn!("cln invoice poll failed: {err}");
                        return;
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        });
        Ok(rx)
    }
}
