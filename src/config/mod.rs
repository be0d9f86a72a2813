//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables. Loaded once
//! in the binary and passed by reference afterwards.

mod messaging;

pub use messaging::AmqpConfig;

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::storage::StorageConfig;
use crate::topology::Topology;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ENTITY_SYNC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ENTITY_SYNC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "ENTITY_SYNC_LOG";

/// Legacy variables of earlier deployments.
pub const RABBITMQ_URL_ENV_VAR: &str = "RABBITMQ_URL";
pub const RABBITMQ_USER_ENV_VAR: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_VAR: &str = "RABBITMQ_PSWD";
pub const RABBITMQ_HOST_ENV_VAR: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_VAR: &str = "RABBITMQ_PORT";
pub const RABBITMQ_VHOST_ENV_VAR: &str = "RABBITMQ_VHOST";
pub const SERVICE_NAME_ENV_VAR: &str = "MST_SERVICE_NAME";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Identity of this service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Self-service name, embedded in every queue name.
    pub name: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "entity-sync".to_string(),
        }
    }
}

/// Broker reconnect policy for the service supervisor.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts per outage before the service gives up.
    pub max_attempts: usize,
    /// Consumers must stay up this long before an outage counts as over.
    pub stable_after_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: 10,
            stable_after_ms: 10_000,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub amqp: AmqpConfig,
    pub storage: StorageConfig,
    /// Topology map: microservice → entity → operations.
    pub consumers: Topology,
    /// Separate YAML file holding the topology map. Replaces `consumers`.
    pub topology_path: Option<String>,
    pub reconnect: ReconnectConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    ///
    /// The topology map is re-read from the YAML files themselves since entity
    /// names are case-sensitive map keys.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut files: Vec<PathBuf> = Vec::new();
        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            files.push(PathBuf::from(DEFAULT_CONFIG_FILE));
        }
        if let Some(config_path) = path {
            files.push(PathBuf::from(config_path));
        }
        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            files.push(PathBuf::from(config_path));
        }

        let mut builder = ConfigLib::builder();
        for file in &files {
            builder = builder.add_source(
                File::from(file.as_path())
                    .format(FileFormat::Yaml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = settings.try_deserialize()?;
        config.consumers = consumers_from_files(&files)?;
        config.resolve_topology_file()?;
        Ok(config)
    }

    /// Load configuration from a single YAML file, without environment overrides.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        let mut config = Self::from_yaml(&content)?;
        config.resolve_topology_file()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply the legacy `RABBITMQ_*` and `MST_SERVICE_NAME` variables.
    ///
    /// Set variables override file and prefixed-environment values.
    pub fn apply_legacy_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = std::env::var(RABBITMQ_URL_ENV_VAR) {
            self.amqp.url = Some(url);
        }
        if let Ok(user) = std::env::var(RABBITMQ_USER_ENV_VAR) {
            self.amqp.user = messaging::resolve_secret(&user)?;
        }
        if let Ok(password) = std::env::var(RABBITMQ_PASSWORD_ENV_VAR) {
            self.amqp.password = Some(messaging::resolve_secret(&password)?);
            self.amqp.password_file = None;
        }
        if let Ok(host) = std::env::var(RABBITMQ_HOST_ENV_VAR) {
            self.amqp.host = host;
        }
        if let Ok(port) = std::env::var(RABBITMQ_PORT_ENV_VAR) {
            self.amqp.port = port.parse().map_err(|_| {
                ConfigError::Invalid(format!("{} is not a port: {}", RABBITMQ_PORT_ENV_VAR, port))
            })?;
        }
        if let Ok(vhost) = std::env::var(RABBITMQ_VHOST_ENV_VAR) {
            self.amqp.vhost = vhost;
        }
        if let Ok(name) = std::env::var(SERVICE_NAME_ENV_VAR) {
            self.service.name = name;
        }
        Ok(())
    }

    /// Reject configurations that cannot start a service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.name.trim().is_empty() {
            return Err(ConfigError::Invalid("service.name must not be empty".to_string()));
        }
        if self.amqp.prefetch == 0 {
            return Err(ConfigError::Invalid("amqp.prefetch must be at least 1".to_string()));
        }
        if self.reconnect.min_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.min_delay_ms exceeds reconnect.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    fn resolve_topology_file(&mut self) -> Result<(), ConfigError> {
        if let Some(path) = &self.topology_path {
            self.consumers = Topology::from_file(path)?;
        }
        Ok(())
    }
}

/// The `consumers` section of the last file that has one.
fn consumers_from_files(files: &[PathBuf]) -> Result<Topology, ConfigError> {
    let mut consumers = Topology::default();
    for file in files {
        let content = std::fs::read_to_string(file)
            .map_err(|e| ConfigError::FileRead(file.display().to_string(), e.to_string()))?;
        let document: serde_yaml::Value =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if let Some(section) = document.get("consumers") {
            consumers = serde_yaml::from_value(section.clone())
                .map_err(|e| ConfigError::Parse(e.to_string()))?;
        }
    }
    Ok(consumers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageType;
    use crate::topology::Operation;
    use serial_test::serial;
    use std::io::Write;

    const SAMPLE: &str = r#"
service:
  name: billing
amqp:
  host: rabbit
  durable: false
  prefetch: 4
storage:
  type: memory
  entities: [User, Invoice]
consumers:
  auth:
    User:
      operations: [created, updated, deleted]
"#;

    fn write_yaml(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn clear_legacy_env() {
        for var in [
            RABBITMQ_URL_ENV_VAR,
            RABBITMQ_USER_ENV_VAR,
            RABBITMQ_PASSWORD_ENV_VAR,
            RABBITMQ_HOST_ENV_VAR,
            RABBITMQ_PORT_ENV_VAR,
            RABBITMQ_VHOST_ENV_VAR,
            SERVICE_NAME_ENV_VAR,
            CONFIG_ENV_VAR,
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.service.name, "entity-sync");
        assert!(config.amqp.durable);
        assert_eq!(config.amqp.prefetch, 1);
        assert_eq!(config.storage.storage_type, StorageType::Sqlite);
        assert!(config.consumers.is_empty());
        assert!(config.reconnect.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_yaml() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.service.name, "billing");
        assert_eq!(config.amqp.host, "rabbit");
        assert!(!config.amqp.durable);
        assert_eq!(config.amqp.prefetch, 4);
        assert_eq!(config.storage.storage_type, StorageType::Memory);
        assert_eq!(config.storage.entities, vec!["User", "Invoice"]);

        let operations: Vec<_> = config
            .consumers
            .subscriptions()
            .map(|s| s.operation.clone())
            .collect();
        assert_eq!(
            operations,
            vec![Operation::Created, Operation::Updated, Operation::Deleted]
        );
    }

    #[test]
    fn test_from_file_missing_is_file_read_error() {
        let result = Config::from_file("/nonexistent/entity-sync.yaml");
        assert!(matches!(result, Err(ConfigError::FileRead(_, _))));
    }

    #[test]
    fn test_topology_path_replaces_inline_consumers() {
        let topology = write_yaml("inventory:\n  StockItem:\n    operations: [updated]\n");
        let config = write_yaml(&format!(
            "{}topology_path: {}\n",
            SAMPLE,
            topology.path().display()
        ));

        let config = Config::from_file(&config.path().display().to_string()).unwrap();
        let entities: Vec<_> = config.consumers.entities().collect();
        assert_eq!(entities, vec![("inventory", "StockItem")]);
    }

    #[test]
    fn test_validate_rejects_zero_prefetch() {
        let mut config = Config::default();
        config.amqp.prefetch = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_load_layers_prefixed_env_and_keeps_entity_case() {
        clear_legacy_env();
        let file = write_yaml(SAMPLE);
        std::env::set_var("ENTITY_SYNC__SERVICE__NAME", "invoicing");

        let config = Config::load(Some(&file.path().display().to_string()));
        std::env::remove_var("ENTITY_SYNC__SERVICE__NAME");
        let config = config.unwrap();

        assert_eq!(config.service.name, "invoicing");
        assert_eq!(config.amqp.host, "rabbit");
        assert_eq!(config.consumers.entities().collect::<Vec<_>>(), vec![("auth", "User")]);
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        clear_legacy_env();
        assert!(Config::load(Some("/nonexistent/entity-sync.yaml")).is_err());
    }

    #[test]
    #[serial]
    fn test_apply_legacy_env() {
        clear_legacy_env();
        std::env::set_var(RABBITMQ_HOST_ENV_VAR, "legacy-rabbit");
        std::env::set_var(RABBITMQ_PORT_ENV_VAR, "5673");
        std::env::set_var(RABBITMQ_PASSWORD_ENV_VAR, "pw");
        std::env::set_var(SERVICE_NAME_ENV_VAR, "billing");

        let mut config = Config::default();
        let applied = config.apply_legacy_env();
        clear_legacy_env();
        applied.unwrap();

        assert_eq!(config.service.name, "billing");
        assert_eq!(
            config.amqp.connection_url().unwrap(),
            "amqp://guest:pw@legacy-rabbit:5673/%2F"
        );
    }

    #[test]
    #[serial]
    fn test_apply_legacy_env_rejects_bad_port() {
        clear_legacy_env();
        std::env::set_var(RABBITMQ_PORT_ENV_VAR, "not-a-port");

        let mut config = Config::default();
        let applied = config.apply_legacy_env();
        clear_legacy_env();

        assert!(matches!(applied, Err(ConfigError::Invalid(_))));
    }
}
