use std::{env, time::Duration};

use config::{Config, ConfigError, File};
use relayer_core::transaction_config::TransactionConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub relayer: RelayerSettings,
    /// Initial values of the runtime tunables, changeable over HTTP afterwards
    #[serde(default)]
    pub transactions: TransactionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Process memory, everything is lost on restart
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayerSettings {
    /// Prefix for every Redis key the relayer owns
    pub namespace: Option<String>,
    pub store: StoreBackend,
    pub submission_interval_ms: u64,
    /// RPC endpoint per chain, `{chain_id}` is substituted
    pub rpc_url_template: String,
    pub rpc_timeout_ms: u64,
    pub worker_lease_ttl_secs: u64,
    /// Fee escalation step applied on every retry
    pub fee_bump_percent: u32,
    /// Hex private keys of the wallets transactions are sent from
    pub wallet_private_keys: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3005,
            host: "0.0.0.0".into(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Default for RelayerSettings {
    fn default() -> Self {
        Self {
            namespace: None,
            store: StoreBackend::Redis,
            submission_interval_ms: 1_000,
            rpc_url_template: "https://{chain_id}.rpc.thirdweb.com".into(),
            rpc_timeout_ms: 10_000,
            worker_lease_ttl_secs: 60,
            fee_bump_percent: 20,
            wallet_private_keys: Vec::new(),
        }
    }
}

impl RelayerSettings {
    pub fn submission_interval(&self) -> Duration {
        Duration::from_millis(self.submission_interval_ms.max(1))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn worker_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_lease_ttl_secs)
    }
}

pub fn get_config() -> Result<RelayerConfig, ConfigError> {
    let base_path = env::current_dir()
        .map_err(|e| ConfigError::Message(format!("Failed to determine the current directory: {e}")))?;
    let configuration_directory = base_path.join("configuration");

    // Detect the running environment
    let environment: Environment = env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigError::Message)?;

    let environment_filename = format!("server_{}.yaml", environment.as_str());

    let config = Config::builder()
        .add_source(File::from(configuration_directory.join("server_base.yaml")))
        .add_source(File::from(configuration_directory.join(environment_filename)).required(false))
        .add_source(
            config::Environment::with_prefix("app")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("relayer.wallet_private_keys")
                .try_parsing(true),
        )
        .build()?;

    let config: RelayerConfig = config.try_deserialize()?;
    config
        .transactions
        .validate()
        .map_err(|e| ConfigError::Message(format!("Invalid transactions section: {e}")))?;

    Ok(config)
}

/// The possible runtime environment for our application.
pub enum Environment {
    Local,
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{other} is not a supported environment. Use either `local`, `development`, or `production`."
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_yaml_sections() {
        let yaml = r#"
server:
  port: 4000
  log_format: json
redis:
  url: redis://localhost:6379
relayer:
  namespace: staging
  store: memory
  wallet_private_keys:
    - "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
transactions:
  minTxsToProcess: 2
"#;
        let config: RelayerConfig = Config::builder()
            .add_source(File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.log_format, LogFormat::Json);
        assert_eq!(config.relayer.store, StoreBackend::Memory);
        assert_eq!(config.relayer.namespace.as_deref(), Some("staging"));
        assert_eq!(config.relayer.wallet_private_keys.len(), 1);
        assert_eq!(config.relayer.fee_bump_percent, 20);
        assert_eq!(config.transactions.min_txs_to_process, 2);
        assert_eq!(config.transactions.max_txs_to_process, 30);
    }

    #[test]
    fn unknown_environment_is_rejected() {
        assert!(Environment::try_from("staging".to_string()).is_err());
        assert!(Environment::try_from("Production".to_string()).is_ok());
    }
}
