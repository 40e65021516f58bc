//! Configuration for escrow clients

use crate::error::{EscrowError, EscrowResult};
use crate::gateway::GatewayConfig;
use crate::types::is_address;
use crate::uploader::{RetryPolicy, UploadMetadata};
use crate::workflow::WorkflowSettings;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub chain: ChainConfig,

    #[serde(default)]
    pub wallet: WalletConfig,

    #[serde(default)]
    pub contracts: ContractsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Retry policy for asset uploads
    #[serde(default)]
    pub upload: RetryPolicy,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Target chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// EIP-155 chain id (137 = Polygon mainnet)
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,

    /// JSON-RPC node used for reads and receipts
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    /// Block explorer host used for contract links
    #[serde(default = "default_explorer_host")]
    pub explorer_host: String,

    /// Symbol used when formatting balances
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,

    #[serde(default = "default_native_decimals")]
    pub native_decimals: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: default_chain_id(),
            rpc_url: default_rpc_url(),
            explorer_host: default_explorer_host(),
            native_symbol: default_native_symbol(),
            native_decimals: default_native_decimals(),
        }
    }
}

/// Wallet endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    /// JSON-RPC endpoint of the signing wallet
    #[serde(default = "default_wallet_url")]
    pub provider_url: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            provider_url: default_wallet_url(),
        }
    }
}

/// Deployed contracts
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractsConfig {
    /// Escrow factory; required for escrow creation
    #[serde(default)]
    pub factory_address: String,

    /// Escrow instances listed on the judge board
    #[serde(default)]
    pub escrow_addresses: Vec<String>,
}

/// Content-addressed asset storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_endpoint")]
    pub endpoint: String,

    /// Bearer token for the storage API
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_asset_name")]
    pub asset_name: String,

    #[serde(default = "default_asset_description")]
    pub asset_description: String,

    /// Request timeout in milliseconds
    #[serde(default = "default_storage_timeout")]
    pub timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: default_storage_endpoint(),
            token: String::new(),
            asset_name: default_asset_name(),
            asset_description: default_asset_description(),
            timeout_ms: default_storage_timeout(),
        }
    }
}

impl StorageConfig {
    pub fn metadata(&self) -> UploadMetadata {
        UploadMetadata {
            name: self.asset_name.clone(),
            description: self.asset_description.clone(),
        }
    }
}

/// Contract call timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_receipt_timeout")]
    pub receipt_timeout_ms: u64,

    #[serde(default = "default_receipt_poll_interval")]
    pub receipt_poll_interval_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout(),
            receipt_timeout_ms: default_receipt_timeout(),
            receipt_poll_interval_ms: default_receipt_poll_interval(),
        }
    }
}

impl From<&GatewaySettings> for GatewayConfig {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            receipt_timeout: Duration::from_millis(settings.receipt_timeout_ms),
            receipt_poll_interval: Duration::from_millis(settings.receipt_poll_interval_ms),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_chain_id() -> u64 {
    137
}

fn default_rpc_url() -> String {
    "https://polygon-rpc.com".to_string()
}

fn default_explorer_host() -> String {
    "polygonscan.com".to_string()
}

fn default_native_symbol() -> String {
    "MATIC".to_string()
}

fn default_native_decimals() -> u32 {
    18
}

fn default_wallet_url() -> String {
    "http://127.0.0.1:1248".to_string()
}

fn default_storage_endpoint() -> String {
    "https://api.nft.storage".to_string()
}

fn default_asset_name() -> String {
    UploadMetadata::default().name
}

fn default_asset_description() -> String {
    UploadMetadata::default().description
}

fn default_storage_timeout() -> u64 {
    60_000
}

fn default_read_timeout() -> u64 {
    15_000
}

fn default_receipt_timeout() -> u64 {
    180_000
}

fn default_receipt_poll_interval() -> u64 {
    2_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClientConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `ESCROW_`-prefixed environment variables (`ESCROW_CHAIN__CHAIN_ID`).
    pub fn load(path: Option<&str>) -> EscrowResult<Self> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&ClientConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ESCROW")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("contracts.escrow_addresses")
                .try_parsing(true),
        );

        let config: ClientConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EscrowResult<()> {
        if self.chain.chain_id == 0 {
            return Err(EscrowError::Config("chain.chain_id must be non-zero".to_string()));
        }
        for (key, value) in [
            ("chain.rpc_url", &self.chain.rpc_url),
            ("chain.explorer_host", &self.chain.explorer_host),
            ("wallet.provider_url", &self.wallet.provider_url),
            ("storage.endpoint", &self.storage.endpoint),
        ] {
            if value.trim().is_empty() {
                return Err(EscrowError::Config(format!("{} must not be empty", key)));
            }
        }
        if !self.contracts.factory_address.is_empty() && !is_address(&self.contracts.factory_address) {
            return Err(EscrowError::Config(format!(
                "contracts.factory_address '{}' is not a 20-byte hex address",
                self.contracts.factory_address
            )));
        }
        if let Some(bad) = self
            .contracts
            .escrow_addresses
            .iter()
            .find(|address| !is_address(address))
        {
            return Err(EscrowError::Config(format!(
                "contracts.escrow_addresses contains malformed address '{}'",
                bad
            )));
        }
        Ok(())
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::from(&self.gateway)
    }

    /// Settings for the creation workflow. Fails if no factory is configured.
    pub fn workflow_settings(&self) -> EscrowResult<WorkflowSettings> {
        if self.contracts.factory_address.is_empty() {
            return Err(EscrowError::Config(
                "contracts.factory_address is required for escrow creation".to_string(),
            ));
        }
        Ok(WorkflowSettings {
            chain_id: self.chain.chain_id,
            factory_address: self.contracts.factory_address.clone(),
            explorer_host: self.chain.explorer_host.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.chain.chain_id, 137);
        assert_eq!(config.chain.explorer_host, "polygonscan.com");
        assert_eq!(config.storage.endpoint, "https://api.nft.storage");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gateway_conversion() {
        let gateway = ClientConfig::default().gateway_config();
        assert_eq!(gateway, GatewayConfig::default());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.chain.chain_id = 0;
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.contracts.factory_address = "0xfactory".to_string();
        assert!(matches!(config.validate(), Err(EscrowError::Config(_))));

        let mut config = ClientConfig::default();
        config.contracts.escrow_addresses = vec!["nope".to_string()];
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.storage.endpoint = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_workflow_settings_require_factory() {
        let mut config = ClientConfig::default();
        assert!(config.workflow_settings().is_err());

        config.contracts.factory_address = "0x00000000000000000000000000000000000fac70".to_string();
        let settings = config.workflow_settings().unwrap();
        assert_eq!(settings.chain_id, 137);
        assert_eq!(settings.explorer_host, "polygonscan.com");
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("escrow-config-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
[chain]
chain_id = 80001
explorer_host = "mumbai.polygonscan.com"

[contracts]
factory_address = "0x00000000000000000000000000000000000fac70"

[upload]
max_retries = 5
backoff_ms = 100
exponential_backoff = false
"#,
        )
        .unwrap();

        let config = ClientConfig::load(path.to_str()).unwrap();
        assert_eq!(config.chain.chain_id, 80001);
        assert_eq!(config.chain.explorer_host, "mumbai.polygonscan.com");
        assert_eq!(config.upload.max_retries, 5);
        assert!(!config.upload.exponential_backoff);
        // Untouched sections keep their defaults.
        assert_eq!(config.gateway.read_timeout_ms, 15_000);

        std::fs::remove_file(&path).unwrap();
    }
}
