#[derive(Debug, thiserror::Error)]
pub enum LightningError {
    #[error("grpc error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("failed to connect to node: {0}")]
    Connect(String),

    #[error("invalid payment hash")]
    InvalidHash,

    #[error("Not found")]
    NotFound,

    #[error("Payment failed")]
    PaymentFailed,

    #[error("operation not supported by this backend: {0}")]
    Unsupported(String),
}
