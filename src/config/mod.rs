mod settings;

pub use settings::{
    BlobConfig, LoggingConfig, MaintenanceConfig, QueueConfig, RetryConfig, ServerConfig,
    Settings, StoreConfig,
};
