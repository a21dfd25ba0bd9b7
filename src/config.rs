//! Service configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! `DECETY_*` environment variables. The result is validated before use.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DecetyError, Result};
use crate::types::FEATURE_DIMS;

/// Config file picked up from the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "decety.toml";

/// Upper bound of `admin.session_ttl_secs`, ten years.
pub const MAX_SESSION_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub catalog: CatalogConfig,
    pub images: ImagesConfig,
    pub admin: AdminConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path prefix all public and admin routes are mounted under.
    pub prefix: String,
    pub request_timeout_secs: u64,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 32851,
            prefix: "/decety".into(),
            request_timeout_secs: 30,
            max_upload_bytes: 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Local,
    Memory,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the local filesystem backend.
    pub local_path: String,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            local_path: "./data".into(),
            bucket: None,
            region: None,
            endpoint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub max_images_per_variant: usize,
    /// Request field names of the feature dimensions, in vector order.
    pub param_names: Vec<String>,
    /// Per-dimension weights of the matching distance.
    pub weights: Vec<f64>,
    /// Log entries written before they are folded into a new snapshot.
    pub compact_after_entries: usize,
    /// Seconds between request counter flushes.
    pub counter_flush_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            max_images_per_variant: 100,
            param_names: ["d1", "d2", "d3", "d4", "d5"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            weights: vec![0.18222713, 0.29388735, 0.2728954, 0.28005472, 0.8529484],
            compact_after_entries: 256,
            counter_flush_secs: 10,
        }
    }
}

impl CatalogConfig {
    /// Weights as a fixed-size array. Only valid after [`Config::validate`].
    pub fn weight_vector(&self) -> [f64; FEATURE_DIMS] {
        let mut out = [0.0; FEATURE_DIMS];
        for (slot, w) in out.iter_mut().zip(self.weights.iter()) {
            *slot = *w;
        }
        out
    }
}

/// Target raster of a derived image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedSize {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
    pub thumbnail: DerivedSize,
    pub preview: DerivedSize,
    /// External program producing derived rasters, reading stdin and writing stdout.
    pub deriver_program: String,
    /// Arguments passed to the deriver. `{width}`, `{height}` and `{quality}`
    /// are substituted per call.
    pub deriver_args: Vec<String>,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            thumbnail: DerivedSize {
                width: 200,
                height: 200,
                quality: 80,
            },
            preview: DerivedSize {
                width: 800,
                height: 800,
                quality: 85,
            },
            deriver_program: "convert".into(),
            deriver_args: [
                "-",
                "-resize",
                "{width}x{height}",
                "-quality",
                "{quality}",
                "jpg:-",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub login: String,
    pub password: String,
    pub session_ttl_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            login: "admin".into(),
            password: "password".into(),
            session_ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub rate_per_sec: f64,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 1.0,
            burst: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, `$DECETY_CONFIG`, or `decety.toml` in the
    /// working directory, falling back to defaults when no file exists.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let explicit = path
            .map(str::to_string)
            .or_else(|| std::env::var("DECETY_CONFIG").ok());

        let mut config = match explicit {
            Some(p) => Self::from_file(&p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Config::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| DecetyError::Config(e.to_string()))
    }

    fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| DecetyError::Config(format!("cannot read {path}: {e}")))?;
        Self::from_toml_str(&raw)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("DECETY_HOST") {
            self.server.host = v;
        }
        if let Ok(v) = std::env::var("DECETY_PORT") {
            self.server.port = parse_env("DECETY_PORT", &v)?;
        }
        if let Ok(v) = std::env::var("DECETY_PREFIX") {
            self.server.prefix = v;
        }
        if let Ok(v) = std::env::var("DECETY_STORAGE_BACKEND") {
            self.storage.backend = match v.to_ascii_lowercase().as_str() {
                "local" => StorageBackend::Local,
                "memory" => StorageBackend::Memory,
                "s3" => StorageBackend::S3,
                other => {
                    return Err(DecetyError::Config(format!(
                        "unknown storage backend: {other}"
                    )))
                }
            };
        }
        if let Ok(v) = std::env::var("DECETY_STORAGE_PATH") {
            self.storage.local_path = v;
        }
        if let Ok(v) = std::env::var("DECETY_S3_BUCKET") {
            self.storage.bucket = Some(v);
        }
        if let Ok(v) = std::env::var("DECETY_S3_REGION") {
            self.storage.region = Some(v);
        }
        if let Ok(v) = std::env::var("DECETY_S3_ENDPOINT") {
            self.storage.endpoint = Some(v);
        }
        if let Ok(v) = std::env::var("DECETY_ADMIN_LOGIN") {
            self.admin.login = v;
        }
        if let Ok(v) = std::env::var("DECETY_ADMIN_PASSWORD") {
            self.admin.password = v;
        }
        if let Ok(v) = std::env::var("DECETY_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("DECETY_LOG_FORMAT") {
            self.logging.format = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.catalog.weights.len() != FEATURE_DIMS {
            return Err(DecetyError::Config(format!(
                "catalog.weights must have {FEATURE_DIMS} entries, got {}",
                self.catalog.weights.len()
            )));
        }
        if self
            .catalog
            .weights
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            return Err(DecetyError::Config(
                "catalog.weights must be finite and non-negative".into(),
            ));
        }
        if self.catalog.param_names.len() != FEATURE_DIMS {
            return Err(DecetyError::Config(format!(
                "catalog.param_names must have {FEATURE_DIMS} entries, got {}",
                self.catalog.param_names.len()
            )));
        }
        if self.catalog.max_images_per_variant == 0 {
            return Err(DecetyError::Config(
                "catalog.max_images_per_variant must be > 0".into(),
            ));
        }
        if self.catalog.compact_after_entries == 0 || self.catalog.counter_flush_secs == 0 {
            return Err(DecetyError::Config(
                "catalog.compact_after_entries and catalog.counter_flush_secs must be > 0".into(),
            ));
        }
        if self.admin.session_ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(DecetyError::Config(format!(
                "admin.session_ttl_secs must be at most {MAX_SESSION_TTL_SECS}"
            )));
        }
        if !(self.rate_limit.rate_per_sec > 0.0) || self.rate_limit.burst == 0 {
            return Err(DecetyError::Config(
                "rate_limit.rate_per_sec and rate_limit.burst must be > 0".into(),
            ));
        }
        if self.storage.backend == StorageBackend::S3 && self.storage.bucket.is_none() {
            return Err(DecetyError::Config(
                "storage.bucket is required for the s3 backend".into(),
            ));
        }
        if !self.server.prefix.is_empty() && !self.server.prefix.starts_with('/') {
            return Err(DecetyError::Config(
                "server.prefix must start with '/'".into(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| DecetyError::Config(format!("invalid value for {name}: {value}")))
}
