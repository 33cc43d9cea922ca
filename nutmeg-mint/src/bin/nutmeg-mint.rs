use std::{env, fmt};

use nutmegmint::config::MintConfig;
use nutmegmint::lightning::cln::ClnLightningSettings;
use nutmegmint::lightning::lnd::LndLightningSettings;
use nutmegmint::lightning::LightningType;
use nutmegmint::mint::MintBuilder;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let app_env = match env::var("MINT_APP_ENV") {
        Ok(var) if var.trim() == "dev" => AppEnv::Dev,
        _ => AppEnv::Prod,
    };

    println!("Running in {app_env} mode");

    if app_env == AppEnv::Dev {
        match dotenvy::dotenv() {
            Ok(path) => println!(".env read successfully from {}", path.display()),
            Err(err) => panic!("Could not load .env file: {err}"),
        };
    }

    let ln_backend = get_env("MINT_LIGHTNING_BACKEND");
    let ln_type = match ln_backend.as_str() {
        "Lnd" => LightningType::Lnd(LndLightningSettings::from_env()),
        "Cln" => LightningType::Cln(ClnLightningSettings::from_env()),
        "Fake" => LightningType::Fake,
        _ => panic!(
            "env MINT_LIGHTNING_BACKEND not found or invalid values. Valid values are Lnd, Cln and Fake"
        ),
    };

    let mint = MintBuilder::new()
        .with_config(MintConfig::from_env())
        .with_lightning(ln_type)
        .build()
        .await?;

    nutmegmint::server::run_server(mint).await
}

#[derive(Debug, PartialEq, Eq)]
pub enum AppEnv {
    Dev,
    Prod,
}

impl fmt::Display for AppEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

fn get_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{} not found", key))
}
