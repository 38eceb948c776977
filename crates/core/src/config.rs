//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable base URL used to build artifact URLs
    /// (e.g., "https://fleet.example.com").
    #[serde(default = "default_public_url")]
    pub public_url: String,
    /// Maximum accepted request body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// The endpoint is unauthenticated; restrict it at the network level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_public_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
            max_body_bytes: default_max_body_bytes(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

impl ServerConfig {
    /// Absolute URL for an artifact path such as `/v1/artifacts/<hash>/manifest.json`.
    pub fn artifact_url(&self, path: &str) -> String {
        format!("{}{}", self.public_url.trim_end_matches('/'), path)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.public_url.starts_with("http://") || self.public_url.starts_with("https://")) {
            return Err(format!(
                "server.public_url must be an http(s) URL, got {:?}",
                self.public_url
            ));
        }
        if self.max_body_bytes == 0 {
            return Err("server.max_body_bytes cannot be 0".to_string());
        }
        Ok(())
    }
}

/// Admin token configuration.
///
/// The admin token is required for server operation. If the token hash
/// changes between restarts, the previous admin token is revoked and a new
/// one is created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Pre-computed hash of the admin token (SHA256 hex, 64 characters).
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
    /// Scopes for the admin token (default: ["fleet:admin"]).
    pub token_scopes: Option<Vec<String>>,
    /// Description for the admin token.
    pub token_description: Option<String>,
}

impl AdminConfig {
    /// Create a test configuration with a dummy token hash.
    ///
    /// **For testing only.** The hash is deterministic but not a real token.
    pub fn for_testing() -> Self {
        Self {
            // SHA256 of "test-admin-token"
            token_hash: "17d6bfe05d1b1fb7bc499f8e3f639c7b3eda4c40f321eef8887a0c04c89a99c5"
                .to_string(),
            token_scopes: None,
            token_description: Some("Test admin token".to_string()),
        }
    }
}

/// Metadata store configuration (SQLite).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Database file path.
    #[serde(default = "default_metadata_path")]
    pub path: PathBuf,
    /// Query timeout in seconds. Advisory only: SQLite cannot cancel a
    /// running query, slow queries are logged.
    #[serde(default = "default_sqlite_query_timeout_secs")]
    pub query_timeout_secs: Option<u64>,
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("./data/fleet.db")
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Manifest signing configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Key identifier, logged alongside signatures (e.g., "fleet-2026-1").
    pub key_id: String,
    /// Private key source.
    pub private_key: PrivateKeyConfig,
}

/// Private key source configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PrivateKeyConfig {
    /// PKCS#8 PEM key stored in a file.
    File {
        /// Path to the private key file.
        path: PathBuf,
    },
    /// PKCS#8 PEM key stored in an environment variable.
    Env {
        /// Environment variable name.
        var: String,
    },
    /// Key provided directly as a value (NOT recommended for production).
    Value {
        /// The PKCS#8 PEM encoded key.
        key: String,
    },
    /// Generate a new key at startup (for development only).
    Generate,
}

/// Rollout orchestration and background job configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Maximum time a gateway may stay in `applying` before the update is
    /// failed by the control plane.
    #[serde(default = "default_apply_timeout_secs")]
    pub apply_timeout_secs: u64,
    /// Interval between timeout/redelivery/backup sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// How long a `pending` command waits before it is re-published.
    #[serde(default = "default_redelivery_interval_secs")]
    pub redelivery_interval_secs: u64,
    /// Maximum number of re-publications per gateway update.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Days a gateway backup reference is kept after creation.
    #[serde(default = "default_backup_retention_days")]
    pub backup_retention_days: u32,
    /// Number of background job workers.
    #[serde(default = "default_job_workers")]
    pub job_workers: usize,
    /// Attempts for a job that hits a transient metadata error.
    #[serde(default = "default_job_retry_attempts")]
    pub job_retry_attempts: u32,
    /// Delay between job retry attempts.
    #[serde(default = "default_job_retry_delay_ms")]
    pub job_retry_delay_ms: u64,
}

fn default_apply_timeout_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_redelivery_interval_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_backup_retention_days() -> u32 {
    30
}

fn default_job_workers() -> usize {
    4
}

fn default_job_retry_attempts() -> u32 {
    3
}

fn default_job_retry_delay_ms() -> u64 {
    200
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            apply_timeout_secs: default_apply_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            redelivery_interval_secs: default_redelivery_interval_secs(),
            max_retries: default_max_retries(),
            backup_retention_days: default_backup_retention_days(),
            job_workers: default_job_workers(),
            job_retry_attempts: default_job_retry_attempts(),
            job_retry_delay_ms: default_job_retry_delay_ms(),
        }
    }
}

impl RolloutConfig {
    /// Get the apply timeout as a Duration.
    pub fn apply_timeout(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        Duration::seconds(i64::try_from(self.apply_timeout_secs).unwrap_or(i64::MAX))
    }

    /// Get the redelivery interval as a Duration.
    pub fn redelivery_interval(&self) -> Duration {
        Duration::seconds(i64::try_from(self.redelivery_interval_secs).unwrap_or(i64::MAX))
    }

    /// Get the backup retention as a Duration.
    pub fn backup_retention(&self) -> Duration {
        Duration::days(i64::from(self.backup_retention_days))
    }

    /// Get the sweep interval as a std::time::Duration.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_secs)
    }

    /// Get the job retry delay as a std::time::Duration.
    pub fn job_retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.job_retry_delay_ms)
    }

    /// Validate rollout configuration for settings that would break the
    /// background loops.
    pub fn validate(&self) -> Result<(), String> {
        if self.sweep_interval_secs == 0 {
            return Err("rollout.sweep_interval_secs cannot be 0".to_string());
        }
        if self.apply_timeout_secs == 0 {
            return Err("rollout.apply_timeout_secs cannot be 0".to_string());
        }
        if self.job_workers == 0 {
            return Err("rollout.job_workers must be at least 1".to_string());
        }
        if self.job_retry_attempts == 0 {
            return Err("rollout.job_retry_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Where CRITICAL escalations are pushed besides the log.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Webhook receiving a JSON body per escalation.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Request timeout for the webhook.
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_notify_timeout_secs() -> u64 {
    10
}

/// Complete control plane configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Admin token configuration (required).
    pub admin: AdminConfig,
    /// Signing configuration (required to publish manifests).
    pub signing: Option<SigningConfig>,
    /// Rollout configuration.
    #[serde(default)]
    pub rollout: RolloutConfig,
    /// Escalation notification configuration.
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl AppConfig {
    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.** Uses SQLite metadata, a dummy admin token and
    /// no signing key.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            metadata: MetadataConfig::default(),
            admin: AdminConfig::for_testing(),
            signing: None,
            rollout: RolloutConfig::default(),
            notify: NotifyConfig::default(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;
        self.rollout.validate()
    }
}

/// Edge agent configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    /// This gateway's id.
    #[serde(default)]
    pub gateway_id: String,
    /// Control plane base URL.
    #[serde(default)]
    pub api_url: String,
    /// Bearer token presented to the control plane.
    #[serde(default)]
    pub token: Option<String>,
    /// Pinned RSA public key (PEM) used to verify manifests.
    #[serde(default = "default_public_key_path")]
    pub public_key_path: PathBuf,
    /// Directory holding `VERSION`, the update lock, and `backups/`.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Service descriptor (JSON compose document).
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,
    /// Root for manifest config changes.
    #[serde(default = "default_config_root")]
    pub config_root: PathBuf,
    /// Local datastore file included in every backup.
    #[serde(default = "default_datastore_path")]
    pub datastore_path: PathBuf,
    /// Version assumed when no `VERSION` file exists yet.
    #[serde(default = "default_initial_version")]
    pub initial_version: String,
    /// Seconds to wait after starting services before health checks.
    #[serde(default = "default_settle_interval_secs")]
    pub settle_interval_secs: u64,
    /// Seconds between polls in `run` mode.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound for any single external command (docker, sqlite3, ...).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Hold the live command channel open in `run` mode. Polling continues
    /// either way.
    #[serde(default = "default_use_channel")]
    pub use_channel: bool,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

fn default_public_key_path() -> PathBuf {
    PathBuf::from("/etc/otter/fleet.pub.pem")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/otter")
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("/etc/otter/compose.json")
}

fn default_config_root() -> PathBuf {
    PathBuf::from("/etc/otter/config")
}

fn default_datastore_path() -> PathBuf {
    PathBuf::from("/var/lib/otter/data/gateway.db")
}

fn default_initial_version() -> String {
    "0.0.0".to_string()
}

fn default_settle_interval_secs() -> u64 {
    10
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_command_timeout_secs() -> u64 {
    600
}

fn default_use_channel() -> bool {
    true
}

impl AgentConfig {
    pub fn settle_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.settle_interval_secs)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs)
    }

    pub fn version_file(&self) -> PathBuf {
        self.state_dir.join("VERSION")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state_dir.join("update.lock")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    /// Validate agent configuration.
    pub fn validate(&self) -> Result<(), String> {
        crate::gateway::GatewayId::parse(&self.gateway_id)
            .map_err(|e| format!("gateway_id: {e}"))?;
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(format!("api_url must be an http(s) URL, got {:?}", self.api_url));
        }
        crate::version::SemVersion::parse(&self.initial_version)
            .map_err(|e| format!("initial_version: {e}"))?;
        if self.download.max_attempts == 0 {
            return Err("download.max_attempts must be at least 1".to_string());
        }
        if self.poll_interval_secs == 0 {
            return Err("poll_interval_secs cannot be 0".to_string());
        }
        if self.backup.keep == 0 {
            return Err("backup.keep must be at least 1".to_string());
        }
        Ok(())
    }

    /// Create a test configuration rooted at `root`.
    ///
    /// **For testing only.**
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            gateway_id: "gw-test".to_string(),
            api_url: "http://127.0.0.1:9".to_string(),
            token: None,
            public_key_path: root.join("fleet.pub.pem"),
            state_dir: root.join("state"),
            compose_file: root.join("compose.json"),
            config_root: root.join("config"),
            datastore_path: root.join("data").join("gateway.db"),
            initial_version: default_initial_version(),
            settle_interval_secs: 0,
            poll_interval_secs: 1,
            command_timeout_secs: 5,
            use_channel: false,
            download: DownloadConfig {
                timeout_secs: 2,
                max_attempts: 2,
                retry_delay_ms: 10,
            },
            health: HealthConfig {
                required_services: Vec::new(),
                broker_addr: None,
                broker_timeout_ms: 200,
            },
            backup: BackupConfig::default(),
        }
    }
}

/// Artifact download policy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Per-request timeout.
    #[serde(default = "default_download_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per artifact before giving up.
    #[serde(default = "default_download_max_attempts")]
    pub max_attempts: u32,
    /// Delay between attempts.
    #[serde(default = "default_download_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_download_timeout_secs() -> u64 {
    30
}

fn default_download_max_attempts() -> u32 {
    3
}

fn default_download_retry_delay_ms() -> u64 {
    1000
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_download_timeout_secs(),
            max_attempts: default_download_max_attempts(),
            retry_delay_ms: default_download_retry_delay_ms(),
        }
    }
}

impl DownloadConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.retry_delay_ms)
    }
}

/// Post-apply health check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Services that must report "running".
    #[serde(default)]
    pub required_services: Vec<String>,
    /// Local message broker probed with a TCP connect (e.g. "127.0.0.1:1883").
    #[serde(default = "default_broker_addr")]
    pub broker_addr: Option<String>,
    /// Broker connect timeout.
    #[serde(default = "default_broker_timeout_ms")]
    pub broker_timeout_ms: u64,
}

fn default_broker_addr() -> Option<String> {
    Some("127.0.0.1:1883".to_string())
}

fn default_broker_timeout_ms() -> u64 {
    2000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            required_services: Vec::new(),
            broker_addr: default_broker_addr(),
            broker_timeout_ms: default_broker_timeout_ms(),
        }
    }
}

impl HealthConfig {
    pub fn broker_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.broker_timeout_ms)
    }
}

/// Local backup bundle retention.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Bundles kept on disk, the latest included.
    #[serde(default = "default_backup_keep")]
    pub keep: usize,
}

fn default_backup_keep() -> usize {
    3
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            keep: default_backup_keep(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_defaults_metrics_enabled() {
        let config = ServerConfig::default();
        assert!(config.metrics_enabled);
    }

    #[test]
    fn test_artifact_url_joins_without_double_slash() {
        let config = ServerConfig {
            public_url: "https://fleet.example.com/".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(
            config.artifact_url("/v1/artifacts/ab/manifest.json"),
            "https://fleet.example.com/v1/artifacts/ab/manifest.json"
        );
    }

    #[test]
    fn test_rollout_config_from_partial_toml() {
        let config: RolloutConfig = toml::from_str("apply_timeout_secs = 120").unwrap();
        assert_eq!(config.apply_timeout_secs, 120);
        assert_eq!(config.max_retries, default_max_retries());
        assert_eq!(config.apply_timeout(), Duration::seconds(120));
    }

    #[test]
    fn test_rollout_config_rejects_zero_interval() {
        let config = RolloutConfig {
            sweep_interval_secs: 0,
            ..RolloutConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_private_key_config_tagged() {
        let config: SigningConfig = toml::from_str(
            r#"
            key_id = "fleet-1"
            [private_key]
            type = "file"
            path = "/etc/otter/signing.pem"
            "#,
        )
        .unwrap();
        assert!(matches!(config.private_key, PrivateKeyConfig::File { .. }));
    }

    #[test]
    fn test_agent_config_defaults_and_validation() {
        let config: AgentConfig = toml::from_str(
            r#"
            gateway_id = "gw-9"
            api_url = "https://fleet.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.settle_interval_secs, 10);
        assert_eq!(config.version_file(), PathBuf::from("/var/lib/otter/VERSION"));
        assert!(config.validate().is_ok());

        let bad = AgentConfig {
            gateway_id: "gw/9".to_string(),
            ..config
        };
        assert!(bad.validate().is_err());
    }
}
