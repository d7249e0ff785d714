//! # Engine Configuration
//!
//! Configuration for the submission / contingency engine and its workers.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FISCAL_AUTHORITY_URL=https://apitest.dtes.mh.gob.sv                │
//! │     FISCAL_AUTHORITY_PASSWORD=...   (only source for the password)     │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/fiscal-core/fiscal.toml (Linux)                          │
//! │     ~/Library/Application Support/com.fiscal.core/fiscal.toml (macOS)  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/fiscal/fiscal.db"
//!
//! [authority]
//! mode = "http"               # http | simulated
//! base_url = "https://apitest.dtes.mh.gob.sv"
//! issuer_nit = "06140101001010"
//!
//! [retry]
//! max_attempts = 3
//!
//! [batching]
//! max_batch_size = 100
//!
//! [polling]
//! interval_secs = 30
//! max_processing_secs = 3600
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use fiscal_core::validation::validate_batch_size;
use fiscal_core::{RetryPolicy, MAX_AUTHORITY_BATCH_SIZE};

// =============================================================================
// Database
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits on a locked database (milliseconds).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("com", "fiscal", "core")
        .map(|dirs| dirs.data_dir().join("fiscal.db"))
        .unwrap_or_else(|| PathBuf::from("fiscal.db"))
}

fn default_max_connections() -> u32 {
    5
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

// =============================================================================
// Authority
// =============================================================================

/// Which gateway implementation the daemon wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityMode {
    /// The real REST API.
    #[default]
    Http,
    /// In-memory authority that accepts everything; for demos and drills.
    Simulated,
}

impl std::fmt::Display for AuthorityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthorityMode::Http => write!(f, "http"),
            AuthorityMode::Simulated => write!(f, "simulated"),
        }
    }
}

impl std::str::FromStr for AuthorityMode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" | "live" => Ok(AuthorityMode::Http),
            "simulated" | "sim" => Ok(AuthorityMode::Simulated),
            other => Err(SyncError::InvalidConfig(format!(
                "Unknown authority mode: '{}'. Valid options: http, simulated",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritySettings {
    #[serde(default)]
    pub mode: AuthorityMode,

    /// Root of the reception API (`/fesv/...` paths hang off it).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    /// Single-document status endpoint.
    #[serde(default = "default_consult_url")]
    pub consult_url: String,

    /// Issuer tax id; also the auth user.
    #[serde(default)]
    pub issuer_nit: String,

    /// Read from `FISCAL_AUTHORITY_PASSWORD` only.
    #[serde(skip)]
    pub password: Option<String>,

    /// Per-attempt bound on every authority call (seconds).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://apitest.dtes.mh.gob.sv".to_string()
}

fn default_auth_url() -> String {
    "https://apitest.dtes.mh.gob.sv/seguridad/auth".to_string()
}

fn default_consult_url() -> String {
    "https://apitest.dtes.mh.gob.sv/fesv/recepcion/consultadte/".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        AuthoritySettings {
            mode: AuthorityMode::default(),
            base_url: default_base_url(),
            auth_url: default_auth_url(),
            consult_url: default_consult_url(),
            issuer_nit: String::new(),
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl AuthoritySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Retry budget shared by direct submission, batch submission and
/// notification delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval_ms() -> u64 {
    2_000
}

fn default_max_interval_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
        }
    }
}

// =============================================================================
// Contingency
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContingencySettings {
    /// Notification attempts before a period is surfaced for attention.
    #[serde(default = "default_max_notification_attempts")]
    pub max_notification_attempts: u32,

    /// Active periods older than this are closed by the scheduled sweep.
    /// `0` disables scheduled closing.
    #[serde(default = "default_max_period_age_secs")]
    pub max_period_age_secs: u64,

    /// How many times `assign` re-resolves the active period after losing a
    /// race with a close.
    #[serde(default = "default_assign_attempts")]
    pub assign_attempts: u32,

    /// Sweep claims older than this are reclaimable (seconds).
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,

    /// Close active periods as soon as the authority answers an
    /// authentication probe again.
    #[serde(default = "default_close_on_recovery")]
    pub close_on_recovery: bool,

    /// Slack added to the retry budget before a document left in
    /// `submitting` is moved to contingency (seconds).
    #[serde(default = "default_submission_lease_margin_secs")]
    pub submission_lease_margin_secs: u64,
}

fn default_max_notification_attempts() -> u32 {
    10
}

fn default_max_period_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_assign_attempts() -> u32 {
    3
}

fn default_claim_ttl_secs() -> u64 {
    300
}

fn default_close_on_recovery() -> bool {
    true
}

fn default_submission_lease_margin_secs() -> u64 {
    30
}

impl Default for ContingencySettings {
    fn default() -> Self {
        ContingencySettings {
            max_notification_attempts: default_max_notification_attempts(),
            max_period_age_secs: default_max_period_age_secs(),
            assign_attempts: default_assign_attempts(),
            claim_ttl_secs: default_claim_ttl_secs(),
            close_on_recovery: default_close_on_recovery(),
            submission_lease_margin_secs: default_submission_lease_margin_secs(),
        }
    }
}

impl ContingencySettings {
    pub fn max_period_age(&self) -> Option<Duration> {
        (self.max_period_age_secs > 0).then(|| Duration::from_secs(self.max_period_age_secs))
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    pub fn submission_lease_margin(&self) -> Duration {
        Duration::from_secs(self.submission_lease_margin_secs)
    }
}

// =============================================================================
// Batching / Polling
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingSettings {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Pending lotes re-submitted per sweep.
    #[serde(default = "default_pending_limit")]
    pub pending_limit: u32,
}

fn default_max_batch_size() -> usize {
    MAX_AUTHORITY_BATCH_SIZE
}

fn default_pending_limit() -> u32 {
    100
}

impl Default for BatchingSettings {
    fn default() -> Self {
        BatchingSettings {
            max_batch_size: default_max_batch_size(),
            pending_limit: default_pending_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_poll_interval_secs")]
    pub interval_secs: u64,

    /// Lotes processing longer than this get flagged stale.
    #[serde(default = "default_max_processing_secs")]
    pub max_processing_secs: u64,

    /// Lotes polled per sweep.
    #[serde(default = "default_poll_limit")]
    pub limit: u32,
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_max_processing_secs() -> u64 {
    60 * 60
}

fn default_poll_limit() -> u32 {
    50
}

impl Default for PollingSettings {
    fn default() -> Self {
        PollingSettings {
            interval_secs: default_poll_interval_secs(),
            max_processing_secs: default_max_processing_secs(),
            limit: default_poll_limit(),
        }
    }
}

impl PollingSettings {
    pub fn max_processing(&self) -> Duration {
        Duration::from_secs(self.max_processing_secs)
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationSettings {
    /// Allowed skew between local and authority processed-at (seconds).
    #[serde(default = "default_timestamp_tolerance_secs")]
    pub timestamp_tolerance_secs: u64,

    /// Status queries in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_timestamp_tolerance_secs() -> u64 {
    60
}

fn default_concurrency() -> usize {
    4
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        ReconciliationSettings {
            timestamp_tolerance_secs: default_timestamp_tolerance_secs(),
            concurrency: default_concurrency(),
        }
    }
}

// =============================================================================
// Workers
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Notification retry + scheduled close sweep (seconds).
    #[serde(default = "default_contingency_interval_secs")]
    pub contingency_interval_secs: u64,

    /// Batch build / pending lote resubmission sweep (seconds).
    #[serde(default = "default_batch_interval_secs")]
    pub batch_interval_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_contingency_interval_secs() -> u64 {
    60
}

fn default_batch_interval_secs() -> u64 {
    60
}

impl Default for WorkerSettings {
    fn default() -> Self {
        WorkerSettings {
            enabled: true,
            contingency_interval_secs: default_contingency_interval_secs(),
            batch_interval_secs: default_batch_interval_secs(),
        }
    }
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiscalConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub authority: AuthoritySettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub contingency: ContingencySettings,

    #[serde(default)]
    pub batching: BatchingSettings,

    #[serde(default)]
    pub polling: PollingSettings,

    #[serde(default)]
    pub reconciliation: ReconciliationSettings,

    #[serde(default)]
    pub workers: WorkerSettings,
}

impl FiscalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (fiscal.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading fiscal config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load fiscal config: {}. Using defaults.", e);
            let mut config = Self::default();
            config.apply_env_overrides();
            config
        })
    }

    /// Saves configuration to file. The password is never written.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;

        info!(?path, "Fiscal config saved");
        Ok(())
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.authority.mode == AuthorityMode::Http {
            for (name, raw) in [
                ("base_url", &self.authority.base_url),
                ("auth_url", &self.authority.auth_url),
                ("consult_url", &self.authority.consult_url),
            ] {
                let parsed = url::Url::parse(raw)?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(SyncError::InvalidUrl(format!(
                        "{} must start with http:// or https://, got: {}",
                        name, raw
                    )));
                }
            }
        }

        if self.authority.timeout_secs == 0 {
            return Err(SyncError::InvalidConfig("authority.timeout_secs must be greater than 0".into()));
        }

        if self.retry.max_attempts == 0 {
            return Err(SyncError::InvalidConfig("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(SyncError::InvalidConfig("retry.multiplier must be at least 1.0".into()));
        }
        if self.retry.initial_interval_ms > self.retry.max_interval_ms {
            return Err(SyncError::InvalidConfig(
                "retry.initial_interval_ms must not exceed retry.max_interval_ms".into(),
            ));
        }

        validate_batch_size(self.batching.max_batch_size)
            .map_err(|e| SyncError::InvalidConfig(format!("batching: {}", e)))?;

        if self.batching.pending_limit == 0 {
            return Err(SyncError::InvalidConfig("batching.pending_limit must be greater than 0".into()));
        }

        if self.polling.interval_secs == 0 {
            return Err(SyncError::InvalidConfig("polling.interval_secs must be greater than 0".into()));
        }
        if self.reconciliation.concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "reconciliation.concurrency must be greater than 0".into(),
            ));
        }
        if self.contingency.assign_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "contingency.assign_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies `FISCAL_*` overrides read through `lookup`.
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("FISCAL_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Some(mode) = lookup("FISCAL_AUTHORITY_MODE") {
            match mode.parse() {
                Ok(parsed) => self.authority.mode = parsed,
                Err(_) => warn!(mode = %mode, "Unknown authority mode in environment"),
            }
        }

        if let Some(url) = lookup("FISCAL_AUTHORITY_URL") {
            debug!(url = %url, "Overriding authority URL from environment");
            self.authority.base_url = url;
        }

        if let Some(url) = lookup("FISCAL_AUTHORITY_AUTH_URL") {
            self.authority.auth_url = url;
        }

        if let Some(url) = lookup("FISCAL_AUTHORITY_CONSULT_URL") {
            self.authority.consult_url = url;
        }

        if let Some(nit) = lookup("FISCAL_AUTHORITY_NIT") {
            self.authority.issuer_nit = nit;
        }

        if let Some(password) = lookup("FISCAL_AUTHORITY_PASSWORD") {
            self.authority.password = Some(password);
        }

        if let Some(timeout) = lookup("FISCAL_AUTHORITY_TIMEOUT_SECS") {
            if let Ok(t) = timeout.parse::<u64>() {
                self.authority.timeout_secs = t;
            }
        }

        if let Some(size) = lookup("FISCAL_MAX_BATCH_SIZE") {
            if let Ok(s) = size.parse::<usize>() {
                debug!(max_batch_size = s, "Overriding batch size from environment");
                self.batching.max_batch_size = s;
            }
        }

        if let Some(interval) = lookup("FISCAL_POLL_INTERVAL_SECS") {
            if let Ok(i) = interval.parse::<u64>() {
                self.polling.interval_secs = i;
            }
        }
    }

    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "fiscal", "core")
            .map(|dirs| dirs.config_dir().join("fiscal.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// The retry budget, bounded by the authority timeout per attempt.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            initial_interval: Duration::from_millis(self.retry.initial_interval_ms),
            max_interval: Duration::from_millis(self.retry.max_interval_ms),
            multiplier: self.retry.multiplier,
            attempt_timeout: self.authority.timeout(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.polling.interval_secs)
    }

    pub fn timestamp_tolerance(&self) -> Duration {
        Duration::from_secs(self.reconciliation.timestamp_tolerance_secs)
    }
}
