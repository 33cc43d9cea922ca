use axum::routing::{get, post};
use axum::Router;
use nutmeg_core::blind::{BlindSignatureDleq, BlindedMessage, BlindedSignature};
use nutmeg_core::keyset::{V1Keyset, V1Keysets};
use nutmeg_core::primitives::{
    CurrencyUnit, KeyResponse, KeysResponse, MeltQuoteState, MethodEntry, MethodSettings,
    MintInfoResponse, MintQuoteState, Nuts, PaymentMethod, PostCheckStateRequest,
    PostCheckStateResponse, PostMeltBolt11Request, PostMeltBolt11Response,
    PostMeltQuoteBolt11Request, PostMeltQuoteBolt11Response, PostMintBolt11Request,
    PostMintBolt11Response, PostMintQuoteBolt11Request, PostMintQuoteBolt11Response,
    PostRestoreRequest, PostRestoreResponse, PostSwapRequest, PostSwapResponse, ProofCheckState,
    ProofState, SupportedSettings,
};
use nutmeg_core::proof::{Proof, ProofDleq, Proofs};
use opentelemetry_otlp::WithExportConfig;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::__tracing_subscriber_SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::admin;
use crate::config::TracingConfig;
use crate::mint::Mint;
use crate::routes::default::{
    get_health, get_info, get_keys, get_keys_by_id, get_keysets, get_melt_quote_bolt11,
    get_mint_quote_bolt11, post_checkstate, post_melt_bolt11, post_melt_quote_bolt11,
    post_mint_bolt11, post_mint_quote_bolt11, post_restore, post_swap,
};
use crate::routes::ws::get_ws;
use crate::tasks;

pub async fn run_server(mint: Mint) -> anyhow::Result<()> {
    init_tracing(mint.config.tracing.as_ref());

    if let Some(ref buildtime) = mint.config.build.build_time {
        info!("build time: {}", buildtime);
    }
    if let Some(ref commithash) = mint.config.build.commit_hash {
        info!("git commit-hash: {}", commithash);
    }
    info!("listening on: {}", &mint.config.server.host_port);
    info!("mint-info: {:?}", mint.config.info);
    info!("lightning fee-reserve: {}", mint.config.lightning_fee);
    info!("lightning-backend: {}", mint.lightning_type);
    info!(
        "admin socket: {}",
        mint.config.server.admin_socket_path.display()
    );

    tasks::respawn_invoice_watchers(&mint).await;
    tasks::spawn_melt_reconciliation(mint.clone());

    {
        let mint = mint.clone();
        let socket_path = mint.config.server.admin_socket_path.clone();
        tokio::spawn(async move {
            if let Err(err) = admin::run_admin_server(mint, socket_path).await {
                tracing::error!("admin server failed: {err}");
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&mint.config.server.host_port).await?;
    axum::serve(
        listener,
        app(mint)
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_headers(Any)
                    .allow_methods(Any)
                    .expose_headers(Any),
            )
            .into_make_service(),
    )
    .await?;

    Ok(())
}

fn init_tracing(config: Option<&TracingConfig>) {
    let registry = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env());

    match config.and_then(|config| config.otlp_endpoint.as_ref()) {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .http()
                        .with_endpoint(endpoint),
                )
                .install_batch(opentelemetry_sdk::runtime::Tokio)
                .expect("failed to install otlp tracer");
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        }
        None => registry.init(),
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::default::get_keys,
        crate::routes::default::get_keys_by_id,
        crate::routes::default::get_keysets,
        crate::routes::default::post_mint_quote_bolt11,
        crate::routes::default::get_mint_quote_bolt11,
        crate::routes::default::post_mint_bolt11,
        crate::routes::default::post_melt_quote_bolt11,
        crate::routes::default::get_melt_quote_bolt11,
        crate::routes::default::post_melt_bolt11,
        crate::routes::default::post_swap,
        crate::routes::default::post_checkstate,
        crate::routes::default::post_restore,
        crate::routes::default::get_info,
        crate::routes::default::get_health,
    ),
    components(schemas(
        MintInfoResponse,
        Nuts,
        MethodSettings,
        MethodEntry,
        SupportedSettings,
        CurrencyUnit,
        PaymentMethod,
        KeysResponse,
        KeyResponse,
        V1Keysets,
        V1Keyset,
        BlindedMessage,
        BlindedSignature,
        BlindSignatureDleq,
        Proof,
        ProofDleq,
        Proofs,
        MintQuoteState,
        MeltQuoteState,
        ProofState,
        ProofCheckState,
        PostMintQuoteBolt11Request,
        PostMintQuoteBolt11Response,
        PostMintBolt11Request,
        PostMintBolt11Response,
        PostMeltQuoteBolt11Request,
        PostMeltQuoteBolt11Response,
        PostMeltBolt11Request,
        PostMeltBolt11Response,
        PostSwapRequest,
        PostSwapResponse,
        PostCheckStateRequest,
        PostCheckStateResponse,
        PostRestoreRequest,
        PostRestoreResponse,
    ))
)]
struct ApiDoc;

fn app(mint: Mint) -> Router {
    let routes = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/v1/keys", get(get_keys))
        .route("/v1/keys/:id", get(get_keys_by_id))
        .route("/v1/keysets", get(get_keysets))
        .route("/v1/mint/quote/bolt11", post(post_mint_quote_bolt11))
        .route("/v1/mint/quote/bolt11/:quote_id", get(get_mint_quote_bolt11))
        .route("/v1/mint/bolt11", post(post_mint_bolt11))
        .route("/v1/melt/quote/bolt11", post(post_melt_quote_bolt11))
        .route("/v1/melt/quote/bolt11/:quote_id", get(get_melt_quote_bolt11))
        .route("/v1/melt/bolt11", post(post_melt_bolt11))
        .route("/v1/swap", post(post_swap))
        .route("/v1/checkstate", post(post_checkstate))
        .route("/v1/restore", post(post_restore))
        .route("/v1/info", get(get_info))
        .route("/v1/ws", get(get_ws))
        .route("/health", get(get_health));

    let router = match mint.config.server.api_prefix.clone() {
        Some(prefix) => Router::new().nest(&prefix, routes),
        None => routes,
    };

    router.with_state(mint).layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use nutmeg_core::keyset::V1Keysets;
    use nutmeg_core::primitives::{KeysResponse, MintInfoResponse};
    use tower::ServiceExt;

    use super::app;
    use crate::config::{MintConfig, MintInfoConfig};
    use crate::database::memory::MemoryStore;
    use crate::lightning::fake::FakeLightning;
    use crate::lightning::LightningType;
    use crate::mint::Mint;

    async fn create_test_mint(config: MintConfig) -> anyhow::Result<Mint> {
        Ok(Mint::init(
            Arc::new(FakeLightning::new()),
            LightningType::Fake,
            Arc::new(MemoryStore::new()),
            config,
        )
        .await?)
    }

    #[tokio::test]
    async fn test_get_keys() -> anyhow::Result<()> {
        let mint = create_test_mint(MintConfig::default()).await?;
        let response = app(mint)
            .oneshot(Request::builder().uri("/v1/keys").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await?.to_bytes();
        let keys: KeysResponse = serde_json::from_slice(&body)?;
        assert_eq!(keys.keysets.len(), 1);
        assert_eq!(keys.keysets[0].keys.len(), 60);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_keysets() -> anyhow::Result<()> {
        let mint = create_test_mint(MintConfig::default()).await?;
        let response = app(mint)
            .oneshot(Request::builder().uri("/v1/keysets").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await?.to_bytes();
        let keysets: V1Keysets = serde_json::from_slice(&body)?;
        assert_eq!(keysets.keysets.len(), 1);
        assert!(keysets.keysets[0].active);
        assert!(keysets.keysets[0].id.starts_with("00"));
        Ok(())
    }

    #[tokio::test]
    async fn test_get_info() -> anyhow::Result<()> {
        let config = MintConfig {
            info: MintInfoConfig {
                name: Some("nutmeg test mint".to_string()),
                version: true,
                description: Some("a mint for testing".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mint = create_test_mint(config).await?;
        let response = app(mint)
            .oneshot(Request::builder().uri("/v1/info").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await?.to_bytes();
        let info: MintInfoResponse = serde_json::from_slice(&body)?;
        assert_eq!(info.name, Some("nutmeg test mint".to_string()));
        assert!(info.nuts.nut12.supported);
        assert!(!info.nuts.nut4.disabled);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_keyset_is_a_client_error() -> anyhow::Result<()> {
        let mint = create_test_mint(MintConfig::default()).await?;
        let response = app(mint)
            .oneshot(
                Request::builder()
                    .uri("/v1/keys/00ffffffffffffff")
                    .body(Body::empty())?,
            )
            .await?;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await?.to_bytes();
        let error: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(error["code"], 12001);
        Ok(())
    }

    #[tokio::test]
    async fn test_health() -> anyhow::Result<()> {
        let mint = create_test_mint(MintConfig::default()).await?;
        let response = app(mint)
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }
}
