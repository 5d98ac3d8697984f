use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::error::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the metadata database
    pub data_dir: String,
    pub storage: StorageConfig,
    pub multipart: MultipartConfig,
    /// Ceiling applied to users whose identity does not carry one
    pub default_storage_ceiling: u64,
    /// How often the daemon reaps stale multipart sessions
    pub sweep_interval: Duration,
}

/// Which blob backend a deployment uses. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    S3,
    /// S3-compatible server (MinIO); requires an endpoint
    Minio,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "s3" => Ok(BackendKind::S3),
            "minio" => Ok(BackendKind::Minio),
            other => Err(Error::UnsupportedBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Root directory for the local backend
    pub local_storage_path: String,
    /// Base URL local objects are served under
    pub local_public_base_url: String,
    pub s3: S3Config,
    /// Lifetime of presigned URLs
    pub url_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    /// Bucket name (required for s3 and minio)
    pub bucket: Option<String>,
    pub region: String,
    /// Custom endpoint for S3-compatible servers (required for minio)
    pub endpoint: Option<String>,
    /// Static credentials; the default AWS provider chain is used when absent
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Upper bound on attempts per request, retries included
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct MultipartConfig {
    /// Minimum size of every part but the last (the local backend enforces this too)
    pub min_part_size: u64,
    /// Largest part accepted in one call
    pub max_part_size: u64,
    /// Sessions older than this without completing are reaped
    pub session_ttl: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: None,
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            max_attempts: 3,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            local_storage_path: "./files".to_string(),
            local_public_base_url: "http://localhost:8080/files".to_string(),
            s3: S3Config::default(),
            url_ttl: Duration::from_secs(3600),
        }
    }
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            min_part_size: 5 * 1024 * 1024, // 5MB, the S3 minimum
            max_part_size: 64 * 1024 * 1024,
            session_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            storage: StorageConfig::default(),
            multipart: MultipartConfig::default(),
            default_storage_ceiling: 10 * 1024 * 1024 * 1024, // 10GB
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, Error> {
        let defaults = Config::default();

        let data_dir = std::env::var("DATA_DIR").unwrap_or(defaults.data_dir);

        let backend = std::env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .parse::<BackendKind>()?;

        let local_storage_path =
            std::env::var("LOCAL_STORAGE_PATH").unwrap_or(defaults.storage.local_storage_path);
        let local_public_base_url = std::env::var("LOCAL_PUBLIC_BASE_URL")
            .unwrap_or(defaults.storage.local_public_base_url);

        let s3 = S3Config {
            bucket: std::env::var("S3_BUCKET").ok(),
            region: std::env::var("S3_REGION").unwrap_or(defaults.storage.s3.region),
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            access_key_id: std::env::var("S3_ACCESS_KEY_ID").ok(),
            secret_access_key: std::env::var("S3_SECRET_ACCESS_KEY").ok(),
            max_attempts: env_parse("S3_MAX_ATTEMPTS").unwrap_or(defaults.storage.s3.max_attempts),
        };

        let url_ttl = env_parse("PRESIGNED_URL_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or(defaults.storage.url_ttl);

        let multipart = MultipartConfig {
            min_part_size: env_parse("MULTIPART_MIN_PART_SIZE")
                .unwrap_or(defaults.multipart.min_part_size),
            max_part_size: env_parse("MULTIPART_MAX_PART_SIZE")
                .unwrap_or(defaults.multipart.max_part_size),
            session_ttl: env_parse("MULTIPART_SESSION_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.multipart.session_ttl),
        };

        let config = Config {
            data_dir,
            storage: StorageConfig {
                backend,
                local_storage_path,
                local_public_base_url,
                s3,
                url_ttl,
            },
            multipart,
            default_storage_ceiling: env_parse("DEFAULT_STORAGE_CEILING")
                .unwrap_or(defaults.default_storage_ceiling),
            sweep_interval: env_parse("SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.is_empty() {
            return Err(ConfigError::ValidationError(
                "DATA_DIR cannot be empty".to_string(),
            ));
        }

        match self.storage.backend {
            BackendKind::Local => {
                if self.storage.local_storage_path.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "LOCAL_STORAGE_PATH cannot be empty".to_string(),
                    ));
                }
            }
            BackendKind::S3 | BackendKind::Minio => {
                if self.storage.s3.bucket.is_none() {
                    return Err(ConfigError::ValidationError(
                        "S3_BUCKET is required when STORAGE_BACKEND is s3 or minio".to_string(),
                    ));
                }
                if self.storage.s3.max_attempts == 0 {
                    return Err(ConfigError::ValidationError(
                        "S3_MAX_ATTEMPTS must be at least 1".to_string(),
                    ));
                }
            }
        }

        if self.storage.backend == BackendKind::Minio {
            if self.storage.s3.endpoint.is_none() {
                return Err(ConfigError::ValidationError(
                    "S3_ENDPOINT is required when STORAGE_BACKEND=minio".to_string(),
                ));
            }
            if self.storage.s3.access_key_id.is_none()
                || self.storage.s3.secret_access_key.is_none()
            {
                return Err(ConfigError::ValidationError(
                    "S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY are required when STORAGE_BACKEND=minio"
                        .to_string(),
                ));
            }
        }

        if self.multipart.min_part_size == 0
            || self.multipart.max_part_size < self.multipart.min_part_size
        {
            return Err(ConfigError::ValidationError(
                "MULTIPART_MAX_PART_SIZE must be at least MULTIPART_MIN_PART_SIZE, which must be non-zero"
                    .to_string(),
            ));
        }

        if self.storage.backend != BackendKind::Local && self.multipart.min_part_size < 5 * 1024 * 1024
        {
            tracing::warn!(
                min_part_size = self.multipart.min_part_size,
                "MULTIPART_MIN_PART_SIZE is below the S3 minimum of 5MB; the backend will reject \
                 undersized parts on completion"
            );
        }

        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}
