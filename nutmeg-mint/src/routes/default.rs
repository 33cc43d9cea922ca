use axum::extract::{Path, State};
use axum::Json;
use nutmeg_core::keyset::V1Keysets;
use nutmeg_core::primitives::{
    KeyResponse, KeysResponse, MethodEntry, MethodSettings, MintInfoResponse, Nuts,
    PaymentMethod, PostCheckStateRequest, PostCheckStateResponse, PostMeltBolt11Request,
    PostMeltBolt11Response, PostMeltQuoteBolt11Request, PostMeltQuoteBolt11Response,
    PostMintBolt11Request, PostMintBolt11Response, PostMintQuoteBolt11Request,
    PostMintQuoteBolt11Response, PostRestoreRequest, PostRestoreResponse, PostSwapRequest,
    PostSwapResponse, SupportedSettings,
};
use tracing::instrument;

use crate::error::NutmegMintError;
use crate::mint::Mint;
use crate::tasks;

#[utoipa::path(
        get,
        path = "/v1/keys",
        responses(
            (status = 200, description = "get keys of the active keysets", body = [KeysResponse])
        )
    )]
#[instrument(skip(mint), err)]
pub async fn get_keys(State(mint): State<Mint>) -> Result<Json<KeysResponse>, NutmegMintError> {
    let (info, keyset) = mint.active_keyset().await?;
    Ok(Json(KeysResponse {
        keysets: vec![KeyResponse {
            id: info.id,
            unit: info.unit,
            keys: keyset.public_keys,
        }],
    }))
}

#[utoipa::path(
        get,
        path = "/v1/keys/{id}",
        responses(
            (status = 200, description = "get keys by id", body = [KeysResponse])
        ),
        params(
            ("id" = String, Path, description = "keyset id"),
        )
    )]
#[instrument(skip(mint), err)]
pub async fn get_keys_by_id(
    Path(id): Path<String>,
    State(mint): State<Mint>,
) -> Result<Json<KeysResponse>, NutmegMintError> {
    let (info, keyset) = mint.keyset_by_id(&id).await?;
    Ok(Json(KeysResponse {
        keysets: vec![KeyResponse {
            id: info.id,
            unit: info.unit,
            keys: keyset.public_keys,
        }],
    }))
}

#[utoipa::path(
        get,
        path = "/v1/keysets",
        responses(
            (status = 200, description = "get all keyset ids", body = [V1Keysets])
        ),
    )]
#[instrument(skip(mint), err)]
pub async fn get_keysets(State(mint): State<Mint>) -> Result<Json<V1Keysets>, NutmegMintError> {
    let keysets = mint
        .keyset_infos()
        .await
        .iter()
        .map(Into::into)
        .collect::<Vec<_>>();
    Ok(Json(V1Keysets { keysets }))
}

#[utoipa::path(
        post,
        path = "/v1/mint/quote/bolt11",
        request_body = PostMintQuoteBolt11Request,
        responses(
            (status = 200, description = "create a mint quote", body = [PostMintQuoteBolt11Response])
        ),
    )]
#[instrument(name = "post_mint_quote_bolt11", skip(mint), err)]
pub async fn post_mint_quote_bolt11(
    State(mint): State<Mint>,
    Json(request): Json<PostMintQuoteBolt11Request>,
) -> Result<Json<PostMintQuoteBolt11Response>, NutmegMintError> {
    let quote = mint.create_mint_quote(&request).await?;
    tasks::spawn_invoice_watcher(mint.clone(), quote.clone());
    Ok(Json((&quote).into()))
}

#[utoipa::path(
        get,
        path = "/v1/mint/quote/bolt11/{quote_id}",
        responses(
            (status = 200, description = "get mint quote state", body = [PostMintQuoteBolt11Response])
        ),
        params(
            ("quote_id" = String, Path, description = "quote id"),
        )
    )]
#[instrument(name = "get_mint_quote_bolt11", skip(mint), err)]
pub async fn get_mint_quote_bolt11(
    Path(quote_id): Path<String>,
    State(mint): State<Mint>,
) -> Result<Json<PostMintQuoteBolt11Response>, NutmegMintError> {
    let quote = mint.mint_quote_state(&quote_id).await?;
    Ok(Json((&quote).into()))
}

#[utoipa::path(
        post,
        path = "/v1/mint/bolt11",
        request_body = PostMintBolt11Request,
        responses(
            (status = 200, description = "issue signatures against a paid quote", body = [PostMintBolt11Response])
        ),
    )]
#[instrument(name = "post_mint_bolt11", fields(quote_id = %request.quote), skip_all, err)]
pub async fn post_mint_bolt11(
    State(mint): State<Mint>,
    Json(request): Json<PostMintBolt11Request>,
) -> Result<Json<PostMintBolt11Response>, NutmegMintError> {
    let signatures = mint.mint_tokens(&request).await?;
    Ok(Json(PostMintBolt11Response { signatures }))
}

#[utoipa::path(
        post,
        path = "/v1/melt/quote/bolt11",
        request_body = PostMeltQuoteBolt11Request,
        responses(
            (status = 200, description = "create a melt quote", body = [PostMeltQuoteBolt11Response])
        ),
    )]
#[instrument(name = "post_melt_quote_bolt11", skip_all, err)]
pub async fn post_melt_quote_bolt11(
    State(mint): State<Mint>,
    Json(request): Json<PostMeltQuoteBolt11Request>,
) -> Result<Json<PostMeltQuoteBolt11Response>, NutmegMintError> {
    let quote = mint.create_melt_quote(&request).await?;
    Ok(Json((&quote).into()))
}

#[utoipa::path(
        get,
        path = "/v1/melt/quote/bolt11/{quote_id}",
        responses(
            (status = 200, description = "get melt quote state", body = [PostMeltQuoteBolt11Response])
        ),
        params(
            ("quote_id" = String, Path, description = "quote id"),
        )
    )]
#[instrument(name = "get_melt_quote_bolt11", skip(mint), err)]
pub async fn get_melt_quote_bolt11(
    Path(quote_id): Path<String>,
    State(mint): State<Mint>,
) -> Result<Json<PostMeltQuoteBolt11Response>, NutmegMintError> {
    let quote = mint.melt_quote_state(&quote_id).await?;
    Ok(Json((&quote).into()))
}

#[utoipa::path(
        post,
        path = "/v1/melt/bolt11",
        request_body = PostMeltBolt11Request,
        responses(
            (status = 200, description = "melt tokens into a Lightning payment", body = [PostMeltBolt11Response])
        ),
    )]
#[instrument(name = "post_melt_bolt11", fields(quote_id = %request.quote), skip_all, err)]
pub async fn post_melt_bolt11(
    State(mint): State<Mint>,
    Json(request): Json<PostMeltBolt11Request>,
) -> Result<Json<PostMeltBolt11Response>, NutmegMintError> {
    let quote = mint.melt_tokens(&request.quote, &request.inputs).await?;
    Ok(Json(PostMeltBolt11Response {
        state: quote.state,
        payment_preimage: quote.preimage,
        change: None,
    }))
}

#[utoipa::path(
        post,
        path = "/v1/swap",
        request_body = PostSwapRequest,
        responses(
            (status = 200, description = "swap proofs for fresh signatures", body = [PostSwapResponse])
        ),
    )]
#[instrument(name = "post_swap", skip_all, err)]
pub async fn post_swap(
    State(mint): State<Mint>,
    Json(request): Json<PostSwapRequest>,
) -> Result<Json<PostSwapResponse>, NutmegMintError> {
    let signatures = mint.swap(&request.inputs, &request.outputs).await?;
    Ok(Json(PostSwapResponse { signatures }))
}

#[utoipa::path(
        post,
        path = "/v1/checkstate",
        request_body = PostCheckStateRequest,
        responses(
            (status = 200, description = "check proof states by Y", body = [PostCheckStateResponse])
        ),
    )]
#[instrument(name = "post_checkstate", skip_all, err)]
pub async fn post_checkstate(
    State(mint): State<Mint>,
    Json(request): Json<PostCheckStateRequest>,
) -> Result<Json<PostCheckStateResponse>, NutmegMintError> {
    let states = mint.check_state(&request.ys).await?;
    Ok(Json(PostCheckStateResponse { states }))
}

#[utoipa::path(
        post,
        path = "/v1/restore",
        request_body = PostRestoreRequest,
        responses(
            (status = 200, description = "restore blind signatures", body = [PostRestoreResponse])
        ),
    )]
#[instrument(name = "post_restore", skip_all, err)]
pub async fn post_restore(
    State(mint): State<Mint>,
    Json(request): Json<PostRestoreRequest>,
) -> Result<Json<PostRestoreResponse>, NutmegMintError> {
    Ok(Json(mint.restore(&request.outputs).await?))
}

#[utoipa::path(
        get,
        path = "/v1/info",
        responses(
            (status = 200, description = "mint metadata and supported settings", body = [MintInfoResponse])
        ),
    )]
#[instrument(skip(mint), err)]
pub async fn get_info(State(mint): State<Mint>) -> Result<Json<MintInfoResponse>, NutmegMintError> {
    let info = &mint.config.info;
    let limits = &mint.config.limits;

    let supported = SupportedSettings { supported: true };
    let mint_info = MintInfoResponse {
        name: info.name.clone(),
        pubkey: mint.mint_pubkey(),
        version: info
            .version
            .then(|| format!("nutmeg/{}", mint.config.build.full_version())),
        description: info.description.clone(),
        description_long: info.description_long.clone(),
        contact: info.contact.clone(),
        motd: info.motd.clone(),
        nuts: Nuts {
            nut4: MethodSettings {
                methods: vec![MethodEntry {
                    method: PaymentMethod::Bolt11,
                    unit: Default::default(),
                    min_amount: Some(limits.mint_min),
                    max_amount: limits.mint_max,
                }],
                disabled: limits.minting_disabled,
            },
            nut5: MethodSettings {
                methods: vec![MethodEntry {
                    method: PaymentMethod::Bolt11,
                    unit: Default::default(),
                    min_amount: Some(limits.melt_min),
                    max_amount: limits.melt_max,
                }],
                disabled: false,
            },
            nut7: supported.clone(),
            nut8: SupportedSettings { supported: false },
            nut9: supported.clone(),
            nut10: supported.clone(),
            nut11: supported.clone(),
            nut12: supported.clone(),
            nut14: supported.clone(),
            nut17: supported.clone(),
            nut20: supported,
        },
    };
    Ok(Json(mint_info))
}

#[utoipa::path(
        get,
        path = "/health",
        responses(
            (status = 200, description = "liveness probe")
        ),
    )]
pub async fn get_health() -> &'static str {
    "ok"
}
