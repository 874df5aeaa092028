use std::collections::HashMap;
use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::error::AppError;

/// Prefix of environment variables read by the service (`OPEQ_STORE__TABLE_NAME`).
const ENV_PREFIX: &str = "OPEQ";

/// Variable names used by the original deployment, mapped onto config keys.
const LEGACY_ENV_OVERRIDES: &[(&str, &str)] = &[
    ("DYNAMODB_TABLE_NAME", "store.table_name"),
    ("DYNAMODB_CHUNK_KEY_NAME", "store.chunk_key_name"),
    ("DYNAMODB_SORT_KEY_NAME", "store.sort_key_name"),
    ("DYNAMODB_TTL_ITEM_NAME", "store.ttl_attribute_name"),
    ("S3_BUKET_NAME", "blob.bucket_name"),
    ("LOG_LEVEL", "logging.level"),
];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub blob: BlobConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum accepted request body in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

/// Key-value table settings.
///
/// The four naming fields are required and have no defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// "memory" (default), "postgres" or "redis"
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub chunk_key_name: String,
    #[serde(default)]
    pub sort_key_name: String,
    #[serde(default)]
    pub ttl_attribute_name: String,
    /// Required when backend = "postgres"
    pub postgres_url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
    /// Consecutive backend failures that open the circuit breaker
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    /// Time an open circuit waits before probing the backend again
    #[serde(default = "default_circuit_cooldown")]
    pub circuit_cooldown_ms: u64,
}

/// Snapshot blob store settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// "memory" (default) or "filesystem"
    #[serde(default = "default_blob_backend")]
    pub backend: String,
    #[serde(default)]
    pub bucket_name: String,
    /// Base directory of the filesystem backend
    #[serde(default = "default_blob_root")]
    pub root_dir: String,
    /// Snapshots older than this are pruned
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Chunk used when a request does not name one
    #[serde(default = "default_chunk_key")]
    pub default_chunk_key: String,
    #[serde(default = "default_item_ttl")]
    pub item_ttl_seconds: u64,
    /// Maximum wait for the writer guard before failing with Busy
    #[serde(default = "default_guard_timeout")]
    pub guard_timeout_ms: u64,
    /// "chunk" (one writer per chunk) or "global" (one writer overall)
    #[serde(default = "default_guard_scope")]
    pub guard_scope: String,
    /// Upper bound on a whole queue operation, guard wait included
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
}

/// Boundary retry policy for transient queue errors.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval of the TTL sweep in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Interval of periodic snapshots in seconds (0 disables them)
    #[serde(default)]
    pub snapshot_interval_seconds: u64,
    /// Chunks snapshotted periodically
    #[serde(default)]
    pub snapshot_chunks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_body_limit() -> usize {
    64 * 1024
}

fn default_store_backend() -> String {
    "memory".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_cooldown() -> u64 {
    30_000
}

fn default_redis_prefix() -> String {
    "opeq".to_string()
}

fn default_blob_backend() -> String {
    "memory".to_string()
}

fn default_blob_root() -> String {
    "./data".to_string()
}

fn default_retention_seconds() -> u64 {
    86_400 // 1 day
}

fn default_chunk_key() -> String {
    "TEST_OPE".to_string()
}

fn default_item_ttl() -> u64 {
    60
}

fn default_guard_timeout() -> u64 {
    5_000
}

fn default_guard_scope() -> String {
    "chunk".to_string()
}

fn default_operation_timeout() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_initial_delay() -> u64 {
    50
}

fn default_retry_max_delay() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Settings {
    /// Load settings from config files, `.env` and the process environment.
    ///
    /// Missing required values are reported as `AppError::ConfigMissing`,
    /// which callers treat as fatal.
    pub fn new() -> Result<Self, AppError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let legacy: HashMap<String, String> = LEGACY_ENV_OVERRIDES
            .iter()
            .filter_map(|(var, _)| env::var(var).ok().map(|value| (var.to_string(), value)))
            .collect();

        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(env_source(None));

        Self::build(builder, &legacy)
    }

    /// Load settings from an explicit variable map instead of the process
    /// environment. Keys use the same names as real variables.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, AppError> {
        let builder = Config::builder().add_source(env_source(Some(vars.clone())));
        Self::build(builder, &vars)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        legacy: &HashMap<String, String>,
    ) -> Result<Self, AppError> {
        let mut builder = builder;
        for (var, key) in LEGACY_ENV_OVERRIDES {
            builder = builder.set_override_option(*key, legacy.get(*var).cloned())?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check that every required value is present.
    pub fn validate(&self) -> Result<(), AppError> {
        let required = [
            ("store.table_name", &self.store.table_name),
            ("store.chunk_key_name", &self.store.chunk_key_name),
            ("store.sort_key_name", &self.store.sort_key_name),
            ("store.ttl_attribute_name", &self.store.ttl_attribute_name),
            ("blob.bucket_name", &self.blob.bucket_name),
        ];

        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(AppError::ConfigMissing(key.to_string()));
            }
        }

        if self.store.backend == "postgres" && self.store.postgres_url.is_none() {
            return Err(AppError::ConfigMissing("store.postgres_url".to_string()));
        }

        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn env_source(vars: Option<HashMap<String, String>>) -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("maintenance.snapshot_chunks")
        .source(vars)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            backend: default_blob_backend(),
            bucket_name: String::new(),
            root_dir: default_blob_root(),
            retention_seconds: default_retention_seconds(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_chunk_key: default_chunk_key(),
            item_ttl_seconds: default_item_ttl(),
            guard_timeout_ms: default_guard_timeout(),
            guard_scope: default_guard_scope(),
            operation_timeout_ms: default_operation_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_retry_initial_delay(),
            max_delay_ms: default_retry_max_delay(),
        }
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_seconds: default_sweep_interval(),
            snapshot_interval_seconds: 0,
            snapshot_chunks: vec![],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NotFound(key) => AppError::ConfigMissing(key),
            other => AppError::Config(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn required_vars() -> Vec<(&'static str, &'static str)> {
        vec![
            ("OPEQ_STORE__TABLE_NAME", "queue_table"),
            ("OPEQ_STORE__CHUNK_KEY_NAME", "ckey"),
            ("OPEQ_STORE__SORT_KEY_NAME", "skey"),
            ("OPEQ_STORE__TTL_ATTRIBUTE_NAME", "expired"),
            ("OPEQ_BLOB__BUCKET_NAME", "db-bucket"),
        ]
    }

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8080);

        let queue = QueueConfig::default();
        assert_eq!(queue.default_chunk_key, "TEST_OPE");
        assert_eq!(queue.item_ttl_seconds, 60);
        assert_eq!(queue.guard_scope, "chunk");

        assert_eq!(BlobConfig::default().retention_seconds, 86_400);
    }

    #[test]
    fn test_load_from_prefixed_vars() {
        let mut pairs = required_vars();
        pairs.push(("OPEQ_SERVER__PORT", "9000"));
        pairs.push(("OPEQ_QUEUE__ITEM_TTL_SECONDS", "120"));
        pairs.push(("OPEQ_MAINTENANCE__SNAPSHOT_CHUNKS", "c1,c2"));

        let settings = Settings::from_vars(vars(&pairs)).unwrap();
        assert_eq!(settings.store.table_name, "queue_table");
        assert_eq!(settings.blob.bucket_name, "db-bucket");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.queue.item_ttl_seconds, 120);
        assert_eq!(settings.maintenance.snapshot_chunks, vec!["c1", "c2"]);
        assert_eq!(settings.store.backend, "memory");
        assert_eq!(settings.store.circuit_failure_threshold, 5);
        assert_eq!(settings.store.circuit_cooldown_ms, 30_000);
    }

    #[test]
    fn test_legacy_variable_names() {
        let settings = Settings::from_vars(vars(&[
            ("DYNAMODB_TABLE_NAME", "legacy-table"),
            ("DYNAMODB_CHUNK_KEY_NAME", "ckey"),
            ("DYNAMODB_SORT_KEY_NAME", "skey"),
            ("DYNAMODB_TTL_ITEM_NAME", "expired"),
            ("S3_BUKET_NAME", "legacy-bucket"),
        ]))
        .unwrap();

        assert_eq!(settings.store.table_name, "legacy-table");
        assert_eq!(settings.blob.bucket_name, "legacy-bucket");
    }

    #[test]
    fn test_missing_required_value() {
        let pairs: Vec<_> = required_vars()
            .into_iter()
            .filter(|(k, _)| *k != "OPEQ_BLOB__BUCKET_NAME")
            .collect();

        let err = Settings::from_vars(vars(&pairs)).unwrap_err();
        assert!(matches!(err, AppError::ConfigMissing(ref key) if key == "blob.bucket_name"));
    }

    #[test]
    fn test_postgres_requires_url() {
        let mut pairs = required_vars();
        pairs.push(("OPEQ_STORE__BACKEND", "postgres"));

        let err = Settings::from_vars(vars(&pairs)).unwrap_err();
        assert!(matches!(err, AppError::ConfigMissing(ref key) if key == "store.postgres_url"));
    }
}
