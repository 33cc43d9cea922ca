use std::fmt::{self, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fedimint_tonic_lnd::lnrpc::fee_limit::Limit;
use fedimint_tonic_lnd::lnrpc::payment::PaymentStatus as LndPaymentStatus;
use fedimint_tonic_lnd::lnrpc::{FeeLimit, Invoice, PaymentHash, SendRequest};
use fedimint_tonic_lnd::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, MappedMutexGuard, Mutex, MutexGuard};
use tracing::{debug, warn};
use url::Url;

use super::error::LightningError;
use super::Lightning;
use crate::error::NutmegMintError;
use crate::model::{CreateInvoiceResult, InvoiceStatus, PaymentResult, PaymentStatus};

const INVOICE_EXPIRY_SECS: i64 = 3600;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct LndLightningSettings {
    pub grpc_host: Option<Url>,
    pub tls_cert_path: Option<PathBuf>,
    pub macaroon_path: Option<PathBuf>,
}

impl LndLightningSettings {
    pub fn from_env() -> Self {
        Self {
            grpc_host: std::env::var("LND_GRPC_HOST")
                .ok()
                .and_then(|host| host.parse().ok()),
            tls_cert_path: std::env::var("LND_TLS_CERT_PATH").ok().map(PathBuf::from),
            macaroon_path: std::env::var("LND_MACAROON_PATH").ok().map(PathBuf::from),
        }
    }
}

impl fmt::Display for LndLightningSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "grpc_host: {}, tls_cert_path: {}, macaroon_path: {}",
            self.grpc_host
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            self.tls_cert_path
                .as_ref()
                .and_then(|path| path.to_str())
                .unwrap_or_default(),
            self.macaroon_path
                .as_ref()
                .and_then(|path| path.to_str())
                .unwrap_or_default()
        )
    }
}

pub struct LndLightning(Arc<Mutex<Client>>);

impl LndLightning {
    pub async fn new(
        address: Url,
        cert_file: &PathBuf,
        macaroon_file: &PathBuf,
    ) -> Result<Self, NutmegMintError> {
        let client = fedimint_tonic_lnd::connect(address.to_string(), cert_file, macaroon_file)
            .await
            .map_err(|err| LightningError::Connect(err.to_string()))?;
        Ok(Self(Arc::new(Mutex::new(client))))
    }

    pub async fn client_lock(
        &self,
    ) -> MappedMutexGuard<'_, fedimint_tonic_lnd::LightningClient> {
        MutexGuard::map(self.0.lock().await, |client| client.lightning())
    }

    async fn invoices_lock(
        &self,
    ) -> MappedMutexGuard<'_, fedimint_tonic_lnd::InvoicesClient> {
        MutexGuard::map(self.0.lock().await, |client| client.invoices())
    }

    async fn router_lock(&self) -> MappedMutexGuard<'_, fedimint_tonic_lnd::RouterClient> {
        MutexGuard::map(self.0.lock().await, |client| client.router())
    }
}

fn payment_result(payment: &fedimint_tonic_lnd::lnrpc::Payment) -> PaymentResult {
    let status = if payment.status == LndPaymentStatus::Succeeded as i32 {
        PaymentStatus::Succeeded
    } else if payment.status == LndPaymentStatus::Failed as i32 {
        PaymentStatus::Failed
    } else {
        PaymentStatus::Pending
    };
    PaymentResult {
        status,
        preimage: (status == PaymentStatus::Succeeded).then(|| payment.payment_preimage.clone()),
        total_fees: payment.fee_sat.max(0) as u64,
    }
}

fn decode_hash(payment_hash: &str) -> Result<Vec<u8>, NutmegMintError> {
    hex::decode(payment_hash).map_err(|_| LightningError::InvalidHash.into())
}

fn rpc_error(status: fedimint_tonic_lnd::tonic::Status) -> LightningError {
    LightningError::Rpc(status.to_string())
}

#[async_trait]
impl Lightning for LndLightning {
    async fn create_invoice(
        &self,
        amount_sat: u64,
    ) -> Result<CreateInvoiceResult, NutmegMintError> {
        let invoice_request = Invoice {
            value: amount_sat as i64,
            expiry: INVOICE_EXPIRY_SECS,
            ..Default::default()
        };

        let invoice = self
            .client_lock()
            .await
            .add_invoice(fedimint_tonic_lnd::tonic::Request::new(invoice_request))
            .await
            .map_err(rpc_error)?
            .into_inner();

        Ok(CreateInvoiceResult {
            payment_hash: hex::encode(invoice.r_hash),
            payment_request: invoice.payment_request,
        })
    }

    async fn invoice_status(&self, payment_hash: String) -> Result<InvoiceStatus, NutmegMintError> {
        let request = PaymentHash {
            r_hash: decode_hash(&payment_hash)?,
            ..Default::default()
        };

        let invoice = self
            .client_lock()
            .await
            .lookup_invoice(fedimint_tonic_lnd::tonic::Request::new(request))
            .await
            .map_err(rpc_error)?
            .into_inner();

        let settled =
            invoice.state == fedimint_tonic_lnd::lnrpc::invoice::InvoiceState::Settled as i32;
        Ok(InvoiceStatus {
            settled,
            preimage: (settled && !invoice.r_preimage.is_empty())
                .then(|| hex::encode(&invoice.r_preimage)),
        })
    }

    async fn pay_invoice(
        &self,
        payment_request: String,
        max_fee_sat: u64,
    ) -> Result<PaymentResult, NutmegMintError> {
        let pay_req = SendRequest {
            payment_request,
            fee_limit: Some(FeeLimit {
                limit: Some(Limit::Fixed(max_fee_sat as i64)),
            }),
            ..Default::default()
        };
        let response = self
            .client_lock()
            .await
            .send_payment_sync(fedimint_tonic_lnd::tonic::Request::new(pay_req))
            .await
            .map_err(rpc_error)?
            .into_inner();

        if !response.payment_error.is_empty() || response.payment_preimage.is_empty() {
            debug!("lnd payment failed: {}", response.payment_error);
            return Ok(PaymentResult {
                status: PaymentStatus::Failed,
                preimage: None,
                total_fees: 0,
            });
        }

        let total_fees = response
            .payment_route
            .map_or(0, |route| route.total_fees_msat / 1_000) as u64;

        Ok(PaymentResult {
            status: PaymentStatus::Succeeded,
            preimage: Some(hex::encode(response.payment_preimage)),
            total_fees,
        })
    }

    async fn pay_partial_amount(
        &self,
        payment_request: String,
        amount_msat: u64,
        max_fee_sat: u64,
    ) -> Result<PaymentResult, NutmegMintError> {
        let request = fedimint_tonic_lnd::routerrpc::SendPaymentRequest {
            payment_request,
            amt_msat: amount_msat as i64,
            fee_limit_sat: max_fee_sat as i64,
            timeout_seconds: 60,
            no_inflight_updates: true,
            ..Default::default()
        };

        let mut stream = self
            .router_lock()
            .await
            .send_payment_v2(fedimint_tonic_lnd::tonic::Request::new(request))
            .await
            .map_err(rpc_error)?
            .into_inner();

        let mut result = PaymentResult {
            status: PaymentStatus::Pending,
            preimage: None,
            total_fees: 0,
        };
        while let Some(payment) = stream.message().await.map_err(rpc_error)? {
            result = payment_result(&payment);
        }
        Ok(result)
    }

    async fn outgoing_payment_status(
        &self,
        payment_hash: String,
    ) -> Result<PaymentResult, NutmegMintError> {
        let request = fedimint_tonic_lnd::routerrpc::TrackPaymentRequest {
            payment_hash: decode_hash(&payment_hash)?,
            no_inflight_updates: true,
        };

        let response = self
            .router_lock()
            .await
            .track_payment_v2(fedimint_tonic_lnd::tonic::Request::new(request))
            .await;

        let mut stream = match response {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == fedimint_tonic_lnd::tonic::Code::NotFound => {
                // lnd never saw this payment, so it was never attempted
                return Ok(PaymentResult {
                    status: PaymentStatus::Failed,
                    preimage: None,
                    total_fees: 0,
                });
            }
            Err(status) => return Err(rpc_error(status).into()),
        };

        match stream.message().await.map_err(rpc_error)? {
            Some(payment) => Ok(payment_result(&payment)),
            None => Ok(PaymentResult {
                status: PaymentStatus::Pending,
                preimage: None,
                total_fees: 0,
            }),
        }
    }

    async fn subscribe_invoice(
        &self,
        payment_hash: String,
    ) -> Result<mpsc::Receiver<InvoiceStatus>, NutmegMintError> {
        let request = fedimint_tonic_lnd::invoicesrpc::SubscribeSingleInvoiceRequest {
            r_hash: decode_hash(&payment_hash)?,
        };

        let mut stream = self
            .invoices_lock()
            .await
            .subscribe_single_invoice(fedimint_tonic_lnd::tonic::Request::new(request))
            .await
            .map_err(rpc_error)?
            .into_inner();

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(invoice)) => {
                        let settled = invoice.state
                            == fedimint_tonic_lnd::lnrpc::invoice::InvoiceState::Settled as i32;
                        if settled {
                            let _ = tx
                                .send(InvoiceStatus {
                                    settled: true,
                                    preimage: (!invoice.r_preimage.is_empty())
                                        .then(|| hex::encode(&invoice.r_preimage)),
                                })
                                .await;
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!("lnd invoice subscription ended: {err}");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}
