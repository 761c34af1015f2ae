//! Configuration management for reqflow
//!
//! Handles loading, saving, and validating configuration from TOML files.

mod defaults;

pub use defaults::*;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Extraction service connection
    #[serde(default)]
    pub service: ServiceConfig,

    /// Per-document ingestion settings
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Per-project knowledge base build settings
    #[serde(default)]
    pub build: BuildConfig,

    /// Conflict job polling settings
    #[serde(default)]
    pub poller: PollerConfig,

    /// Worker pool settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Paths configuration (internal, not user-editable)
    #[serde(skip)]
    pub paths: PathsConfig,
}

/// Extraction service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the extraction/conflict service
    #[serde(default = "default_service_url")]
    pub url: String,

    /// Environment variable name for the service API key
    #[serde(default = "default_service_api_key_env")]
    pub api_key_env: String,

    /// Timeout for status and metadata calls (seconds)
    #[serde(default = "default_service_request_timeout")]
    pub request_timeout_secs: u64,

    /// Timeout for requirement extraction (seconds)
    #[serde(default = "default_service_extract_timeout")]
    pub extract_timeout_secs: u64,

    /// Timeout for knowledge base builds and incremental updates (seconds)
    #[serde(default = "default_service_build_timeout")]
    pub build_timeout_secs: u64,

    /// Timeout for starting conflict detection (seconds)
    #[serde(default = "default_service_conflict_timeout")]
    pub conflict_timeout_secs: u64,
}

/// Ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Maximum characters of content sent for extraction
    #[serde(default = "default_ingest_max_content_chars")]
    pub max_content_chars: usize,

    /// Shorter bound used for the one retry after a malformed response
    #[serde(default = "default_ingest_retry_content_chars")]
    pub retry_content_chars: usize,

    /// Maximum length of a derived title
    #[serde(default = "default_ingest_title_max_chars")]
    pub title_max_chars: usize,

    /// Confidence assigned when the service reports none
    #[serde(default = "default_ingest_default_confidence")]
    pub default_confidence: f64,

    /// Attempts before a document is marked failed
    #[serde(default = "default_ingest_max_attempts")]
    pub max_attempts: u32,

    /// Backoff between attempts (seconds); the last value repeats
    #[serde(default = "default_ingest_backoff_secs")]
    pub backoff_secs: Vec<u64>,

    /// Timeout per attempt (seconds)
    #[serde(default = "default_ingest_timeout")]
    pub timeout_secs: u64,
}

/// Knowledge base build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// TTL of the per-project lock (seconds)
    #[serde(default = "default_build_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Timeout per attempt (seconds)
    #[serde(default = "default_build_timeout")]
    pub timeout_secs: u64,

    /// Attempts per build request
    #[serde(default = "default_build_max_attempts")]
    pub max_attempts: u32,
}

/// Conflict poller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Attempt budget for one external job
    #[serde(default = "default_poller_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts (seconds)
    #[serde(default = "default_poller_delay")]
    pub delay_secs: u64,

    /// Delay before the first attempt (seconds)
    #[serde(default = "default_poller_cascade_delay")]
    pub cascade_delay_secs: u64,

    /// Timeout per attempt (seconds)
    #[serde(default = "default_poller_timeout")]
    pub timeout_secs: u64,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,

    /// Sleep between queue polls when idle (milliseconds)
    #[serde(default = "default_worker_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Grace added to a job's timeout to form its lease (seconds)
    #[serde(default = "default_worker_lease_grace")]
    pub lease_grace_secs: u64,
}

/// Internal paths configuration
#[derive(Debug, Clone, Default)]
pub struct PathsConfig {
    /// Base directory for reqflow data
    pub base_dir: PathBuf,

    /// Path to config file
    pub config_file: PathBuf,

    /// Path to SQLite database
    pub db_file: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: default_service_url(),
            api_key_env: default_service_api_key_env(),
            request_timeout_secs: default_service_request_timeout(),
            extract_timeout_secs: default_service_extract_timeout(),
            build_timeout_secs: default_service_build_timeout(),
            conflict_timeout_secs: default_service_conflict_timeout(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_content_chars: default_ingest_max_content_chars(),
            retry_content_chars: default_ingest_retry_content_chars(),
            title_max_chars: default_ingest_title_max_chars(),
            default_confidence: default_ingest_default_confidence(),
            max_attempts: default_ingest_max_attempts(),
            backoff_secs: default_ingest_backoff_secs(),
            timeout_secs: default_ingest_timeout(),
        }
    }
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            lock_ttl_secs: default_build_lock_ttl(),
            timeout_secs: default_build_timeout(),
            max_attempts: default_build_max_attempts(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_poller_max_attempts(),
            delay_secs: default_poller_delay(),
            cascade_delay_secs: default_poller_cascade_delay(),
            timeout_secs: default_poller_timeout(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            idle_poll_ms: default_worker_idle_poll_ms(),
            lease_grace_secs: default_worker_lease_grace(),
        }
    }
}

impl ServiceConfig {
    /// Get the service API key from environment
    pub fn api_key(&self) -> Option<String> {
        if self.api_key_env.is_empty() {
            return None;
        }
        std::env::var(&self.api_key_env).ok()
    }
}

impl IngestConfig {
    /// Backoff before the retry following attempt number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.backoff_secs.len().saturating_sub(1));
        Duration::from_secs(self.backoff_secs.get(idx).copied().unwrap_or(0))
    }
}

impl PollerConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn cascade_delay(&self) -> Duration {
        Duration::from_secs(self.cascade_delay_secs)
    }
}

impl Config {
    /// Get the default base directory for reqflow (~/.reqflow)
    pub fn default_base_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".reqflow")
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        Self::default_base_dir().join("config.toml")
    }

    /// Initialize paths configuration
    pub fn init_paths(&mut self, base_dir: Option<PathBuf>) {
        let base = base_dir.unwrap_or_else(Self::default_base_dir);
        self.paths = PathsConfig {
            config_file: base.join("config.toml"),
            db_file: base.join("reqflow.db"),
            base_dir: base,
        };
    }

    /// Load configuration from a specific file path
    pub fn load(config_path: &Path) -> Result<Self> {
        debug!("Loading config from {:?}", config_path);

        if !config_path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        }

        let content = std::fs::read_to_string(config_path)?;
        let mut config: Config = toml::from_str(&content)?;

        // Set up paths based on config file location
        let base = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
        config.paths = PathsConfig {
            config_file: config_path.to_path_buf(),
            db_file: base.join("reqflow.db"),
            base_dir: base,
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific base directory
    pub fn load_from(base_dir: Option<PathBuf>) -> Result<Self> {
        let mut config = Config::default();
        config.init_paths(base_dir);

        if config.paths.config_file.exists() {
            debug!("Loading config from {:?}", config.paths.config_file);
            let content = std::fs::read_to_string(&config.paths.config_file)?;
            let mut loaded: Config = toml::from_str(&content)?;
            loaded.paths = config.paths;
            config = loaded;
        } else {
            debug!("No config file found, using defaults");
        }

        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.paths.config_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&self.paths.config_file, content)?;
        info!("Saved config to {:?}", self.paths.config_file);
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ingest.retry_content_chars >= self.ingest.max_content_chars {
            return Err(Error::Config(
                "ingest.retry_content_chars must be < ingest.max_content_chars".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.ingest.default_confidence) {
            return Err(Error::Config(
                "ingest.default_confidence must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.ingest.max_attempts == 0
            || self.build.max_attempts == 0
            || self.poller.max_attempts == 0
        {
            return Err(Error::Config(
                "max_attempts must be at least 1 for ingest, build and poller".to_string(),
            ));
        }

        if self.ingest.backoff_secs.is_empty() {
            return Err(Error::Config(
                "ingest.backoff_secs must contain at least one value".to_string(),
            ));
        }

        // A crashed worker must never hold a project longer than any job could run
        if self.build.lock_ttl_secs <= self.build.timeout_secs
            || self.build.lock_ttl_secs <= self.ingest.timeout_secs
        {
            return Err(Error::Config(
                "build.lock_ttl_secs must exceed build.timeout_secs and ingest.timeout_secs"
                    .to_string(),
            ));
        }

        if self.worker.concurrency == 0 {
            return Err(Error::Config(
                "worker.concurrency must be positive".to_string(),
            ));
        }

        url::Url::parse(&self.service.url)?;

        Ok(())
    }
}
