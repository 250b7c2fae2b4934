use crate::model::PhotoLimits;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),
}

/// Main configuration for the closet service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Photo storage configuration
    pub s3: S3Config,
    /// Item record database configuration
    pub database: DatabaseConfig,
    /// Identity provider configuration
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Item lifecycle limits and timeouts
    #[serde(default)]
    pub closet: ClosetConfig,
    /// Orphan reconciliation configuration
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// S3 photo storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding every closet, profile, marketplace and temp asset
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Signed URL lifetime in seconds
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Identity provider (Cognito user pool) configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// AWS region of the user pool
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for local emulators)
    pub endpoint_url: Option<String>,
    /// How long a confirmed session is trusted before it is checked again, in seconds
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

/// Closet item lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ClosetConfig {
    /// Minimum photos per item
    #[serde(default = "default_min_photos")]
    pub min_photos: usize,
    /// Maximum photos per item
    #[serde(default = "default_max_photos")]
    pub max_photos: usize,
    /// Photos uploaded in parallel within one create
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Upper bound for any single storage or data call, in seconds
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Remove photos written by a create that failed before its record was saved
    #[serde(default = "default_true")]
    pub cleanup_failed_uploads: bool,
}

/// Orphan sweep configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    /// Unreferenced closet photos younger than this are left alone, in seconds
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Age after which temp uploads are removed, in seconds
    #[serde(default = "default_temp_max_age_secs")]
    pub temp_max_age_secs: u64,
}

// Default value functions
fn default_session_ttl_secs() -> u64 {
    300
}

fn default_service_name() -> String {
    "clst-closet".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_signed_url_ttl_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_min_photos() -> usize {
    2
}

fn default_max_photos() -> usize {
    5
}

fn default_upload_concurrency() -> usize {
    3
}

fn default_operation_timeout_secs() -> u64 {
    30
}

fn default_grace_period_secs() -> u64 {
    3600
}

fn default_temp_max_age_secs() -> u64 {
    24 * 60 * 60
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .set_default("service.name", "clst-closet")?
            .set_default("service.log_level", "info")?
            .add_source(config::File::with_name("config/closet").required(false))
            .add_source(config::File::with_name("/etc/clst/closet").required(false))
            // CLST__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("CLST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.bucket.is_empty() {
            return Err(ConfigError::MissingRequired("s3.bucket".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(ConfigError::MissingRequired("database.url".to_string()));
        }

        // Anything outside the stored bounds would upload and then always fail to persist
        if self.closet.min_photos < PhotoLimits::STORED_MIN {
            return Err(ConfigError::InvalidValue {
                key: "closet.min_photos".to_string(),
                message: format!("must be at least {}", PhotoLimits::STORED_MIN),
            });
        }

        if self.closet.max_photos > PhotoLimits::STORED_MAX {
            return Err(ConfigError::InvalidValue {
                key: "closet.max_photos".to_string(),
                message: format!("must be at most {}", PhotoLimits::STORED_MAX),
            });
        }

        if self.closet.min_photos > self.closet.max_photos {
            return Err(ConfigError::InvalidValue {
                key: "closet.max_photos".to_string(),
                message: format!(
                    "must not be below closet.min_photos ({})",
                    self.closet.min_photos
                ),
            });
        }

        if self.closet.upload_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "closet.upload_concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.closet.operation_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "closet.operation_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        if self.s3.signed_url_ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "s3.signed_url_ttl_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Get signed URL lifetime as Duration
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.s3.signed_url_ttl_secs)
    }

    /// Get the session re-check interval as Duration
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.identity.session_ttl_secs)
    }

    /// Get the per-call timeout as Duration
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.closet.operation_timeout_secs)
    }

    /// Get the sweep grace period as Duration
    pub fn sweep_grace_period(&self) -> Duration {
        Duration::from_secs(self.sweep.grace_period_secs)
    }

    /// Get the temp upload retention as Duration
    pub fn temp_max_age(&self) -> Duration {
        Duration::from_secs(self.sweep.temp_max_age_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Default for ClosetConfig {
    fn default() -> Self {
        Self {
            min_photos: default_min_photos(),
            max_photos: default_max_photos(),
            upload_concurrency: default_upload_concurrency(),
            operation_timeout_secs: default_operation_timeout_secs(),
            cleanup_failed_uploads: true,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            temp_max_age_secs: default_temp_max_age_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            s3: S3Config {
                bucket: "clst-storage".to_string(),
                region: "us-east-1".to_string(),
                endpoint_url: None,
                force_path_style: false,
                signed_url_ttl_secs: 3600,
                multipart_threshold_bytes: default_multipart_threshold(),
                part_size_bytes: default_part_size(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/clst".to_string(),
                max_connections: 10,
                min_connections: 1,
                connect_timeout_secs: 30,
                idle_timeout_secs: 600,
                run_migrations: true,
            },
            identity: IdentityConfig::default(),
            closet: ClosetConfig::default(),
            sweep: SweepConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_min_photos(), 2);
        assert_eq!(default_max_photos(), 5);
        assert_eq!(default_signed_url_ttl_secs(), 3600);
        assert_eq!(default_temp_max_age_secs(), 86400);
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.signed_url_ttl(), Duration::from_secs(3600));
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_missing_bucket() {
        let mut config = create_test_config();
        config.s3.bucket = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(_))
        ));
    }

    #[test]
    fn test_inverted_photo_bounds() {
        let mut config = create_test_config();
        config.closet.min_photos = 4;
        config.closet.max_photos = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_photo_bounds_within_stored_range() {
        let mut config = create_test_config();
        config.closet.max_photos = 6;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "closet.max_photos"
        ));

        let mut config = create_test_config();
        config.closet.min_photos = 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "closet.min_photos"
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = create_test_config();
        config.closet.operation_timeout_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
