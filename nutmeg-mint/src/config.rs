use std::net::SocketAddr;
use std::path::PathBuf;
use std::{env, fmt};

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct MintConfig {
    pub info: MintInfoConfig,
    pub build: BuildConfig,
    pub lightning_fee: LightningFeeConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub limits: LimitsConfig,
    pub quotes: QuoteConfig,
    /// Fee in ppk charged per input proof of a newly generated keyset.
    pub input_fee_ppk: u64,
    pub tracing: Option<TracingConfig>,
}

impl MintConfig {
    pub fn from_env() -> Self {
        Self {
            info: MintInfoConfig::from_env(),
            build: BuildConfig::from_env(),
            lightning_fee: LightningFeeConfig::from_env(),
            server: ServerConfig::from_env(),
            database: DatabaseConfig::from_env(),
            limits: LimitsConfig::from_env(),
            quotes: QuoteConfig::from_env(),
            input_fee_ppk: env_or_default("MINT_INPUT_FEE_PPK", 0),
            tracing: TracingConfig::from_env(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct MintInfoConfig {
    pub name: Option<String>,
    #[serde(default = "default_version")]
    pub version: bool,
    pub description: Option<String>,
    pub description_long: Option<String>,
    pub contact: Option<Vec<Vec<String>>>,
    pub motd: Option<String>,
}

fn default_version() -> bool {
    true
}

impl MintInfoConfig {
    pub fn from_env() -> Self {
        Self {
            name: env::var("MINT_INFO_NAME").ok(),
            version: env_or_default("MINT_INFO_VERSION", true),
            description: env::var("MINT_INFO_DESCRIPTION").ok(),
            description_long: env::var("MINT_INFO_DESCRIPTION_LONG").ok(),
            contact: None,
            motd: env::var("MINT_INFO_MOTD").ok(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct BuildConfig {
    pub commit_hash: Option<String>,
    pub build_time: Option<String>,
    pub cargo_pkg_version: Option<String>,
}

impl BuildConfig {
    pub fn from_env() -> Self {
        Self {
            commit_hash: env::var("COMMITHASH").ok(),
            build_time: env::var("BUILDTIME").ok(),
            cargo_pkg_version: Some(env!("CARGO_PKG_VERSION").to_owned()),
        }
    }

    pub fn full_version(&self) -> String {
        format!(
            "{}-{}",
            self.cargo_pkg_version
                .as_ref()
                .unwrap_or(&"unknown".to_string()),
            self.commit_hash.as_ref().unwrap_or(&"unknown".to_string())
        )
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LightningFeeConfig {
    /// fee reserve as a percentage of the payment amount
    pub fee_percent: f32,
    /// minimum fee reserve in sats
    pub fee_reserve_min: u64,
}

impl LightningFeeConfig {
    pub fn from_env() -> Self {
        let defaults = LightningFeeConfig::default();
        Self {
            fee_percent: env_or_default("LIGHTNING_FEE_PERCENT", defaults.fee_percent),
            fee_reserve_min: env_or_default("LIGHTNING_RESERVE_FEE_MIN", defaults.fee_reserve_min),
        }
    }
}

impl Default for LightningFeeConfig {
    fn default() -> Self {
        Self {
            fee_percent: 1.0,
            fee_reserve_min: 0,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    pub host_port: SocketAddr,
    pub api_prefix: Option<String>,
    /// unix-domain socket for the management rpc
    pub admin_socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_port: "[::]:3338".to_string().parse().expect("invalid host port"),
            api_prefix: None,
            admin_socket_path: PathBuf::from("/tmp/nutmeg-mint.sock"),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();
        Self {
            host_port: env_or_default("MINT_HOST_PORT", defaults.host_port),
            api_prefix: env::var("MINT_API_PREFIX").ok(),
            admin_socket_path: env::var("MINT_ADMIN_SOCKET_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.admin_socket_path),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub db_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl DatabaseConfig {
    pub fn from_env() -> Self {
        Self {
            db_url: env::var("MINT_DB_URL").unwrap_or_default(),
            max_connections: env_or_default("MINT_DB_MAX_CONNECTIONS", 5),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LimitsConfig {
    pub mint_min: u64,
    pub mint_max: Option<u64>,
    pub melt_min: u64,
    pub melt_max: Option<u64>,
    /// cap on the total amount of unredeemed ecash
    pub max_balance: Option<u64>,
    pub minting_disabled: bool,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            mint_min: 1,
            mint_max: None,
            melt_min: 1,
            melt_max: None,
            max_balance: None,
            minting_disabled: false,
        }
    }
}

impl LimitsConfig {
    pub fn from_env() -> Self {
        let defaults = LimitsConfig::default();
        Self {
            mint_min: env_or_default("MINT_MIN_AMOUNT", defaults.mint_min),
            mint_max: env::var("MINT_MAX_AMOUNT").ok().and_then(|v| v.parse().ok()),
            melt_min: env_or_default("MELT_MIN_AMOUNT", defaults.melt_min),
            melt_max: env::var("MELT_MAX_AMOUNT").ok().and_then(|v| v.parse().ok()),
            max_balance: env::var("MINT_MAX_BALANCE")
                .ok()
                .and_then(|v| v.parse().ok()),
            minting_disabled: env_or_default("MINT_MINTING_DISABLED", false),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct QuoteConfig {
    /// lifetime of mint and melt quotes in seconds
    pub expiry_secs: u64,
    /// how long an outgoing payment may block a melt call
    pub melt_timeout_secs: u64,
    /// interval of the task resolving pending melt quotes
    pub reconcile_interval_secs: u64,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            expiry_secs: 1800,
            melt_timeout_secs: 60,
            reconcile_interval_secs: 30,
        }
    }
}

impl QuoteConfig {
    pub fn from_env() -> Self {
        let defaults = QuoteConfig::default();
        Self {
            expiry_secs: env_or_default("MINT_QUOTE_EXPIRY_SECS", defaults.expiry_secs),
            melt_timeout_secs: env_or_default("MINT_MELT_TIMEOUT_SECS", defaults.melt_timeout_secs),
            reconcile_interval_secs: env_or_default(
                "MINT_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval_secs,
            ),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TracingConfig {
    pub otlp_endpoint: Option<String>,
}

impl TracingConfig {
    pub fn from_env() -> Option<Self> {
        env::var("MINT_OTLP_ENDPOINT").ok().map(|endpoint| Self {
            otlp_endpoint: Some(endpoint),
        })
    }
}

impl fmt::Display for LightningFeeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fee_percent: {}, fee_reserve_min: {}",
            self.fee_percent, self.fee_reserve_min
        )
    }
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|var| var.parse().ok())
        .unwrap_or(default)
}
