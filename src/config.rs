use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MigrationError, Result};
use crate::job::FailurePolicy;
use crate::rate_limiter::{Quota, ServiceClass};
use crate::workload::WorkloadKind;

/// Upload session chunks must be a multiple of this size
pub const UPLOAD_CHUNK_ALIGNMENT: u64 = 320 * 1024;

/// Largest chunk an upload session accepts in one request
pub const MAX_CHUNK_SIZE: u64 = 60 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub tenants: Vec<TenantCredentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    #[serde(default = "default_login_base_url")]
    pub login_base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            graph_base_url: default_graph_base_url(),
            login_base_url: default_login_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// Optional per-service-class quota overrides
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RateLimitsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub general: Option<Quota>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail: Option<Quota>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Quota>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams: Option<Quota>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub teams_messages: Option<Quota>,
}

impl RateLimitsConfig {
    /// Overrides keyed by service class, for `TenantRateLimiter::with_quotas`
    pub fn overrides(&self) -> HashMap<ServiceClass, Quota> {
        [
            (ServiceClass::General, self.general),
            (ServiceClass::Mail, self.mail),
            (ServiceClass::Files, self.files),
            (ServiceClass::Teams, self.teams),
            (ServiceClass::TeamsMessages, self.teams_messages),
        ]
        .into_iter()
        .filter_map(|(class, quota)| quota.map(|quota| (class, quota)))
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_mail_concurrency")]
    pub mail: usize,
    #[serde(default = "default_files_concurrency")]
    pub files: usize,
    #[serde(default = "default_sites_concurrency")]
    pub sites: usize,
    #[serde(default = "default_teams_concurrency")]
    pub teams: usize,
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            mail: default_mail_concurrency(),
            files: default_files_concurrency(),
            sites: default_sites_concurrency(),
            teams: default_teams_concurrency(),
            worker_slots: default_worker_slots(),
        }
    }
}

impl ConcurrencyConfig {
    /// Concurrent workload runs allowed for one workload kind
    pub fn limit_for(&self, kind: WorkloadKind) -> usize {
        match kind {
            WorkloadKind::Mail => self.mail,
            WorkloadKind::Files => self.files,
            WorkloadKind::Sites => self.sites,
            WorkloadKind::Teams => self.teams,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_small_upload_limit")]
    pub small_upload_limit_bytes: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            small_upload_limit_bytes: default_small_upload_limit(),
            chunk_size_bytes: default_chunk_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_directory")]
    pub directory: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            directory: default_state_directory(),
        }
    }
}

impl StateConfig {
    pub fn jobs_dir(&self) -> PathBuf {
        self.directory.join("jobs")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.directory.join("checkpoints")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.directory.join("queue")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.directory.join("snapshots")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
    #[serde(default = "default_teams_message_delay_ms")]
    pub teams_message_delay_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            progress_interval_secs: default_progress_interval_secs(),
            teams_message_delay_ms: default_teams_message_delay_ms(),
        }
    }
}

/// App registration used for the client-credentials grant against one tenant
#[derive(Clone, Serialize, Deserialize)]
pub struct TenantCredentials {
    pub tenant_id: String,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Environment variable holding the secret, preferred over an inline secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_env: Option<String>,
}

impl std::fmt::Debug for TenantCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantCredentials")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "<redacted>"))
            .field("client_secret_env", &self.client_secret_env)
            .finish()
    }
}

impl TenantCredentials {
    /// Resolve the client secret, reading the environment variable if configured
    pub fn secret(&self) -> Result<String> {
        if let Some(var) = &self.client_secret_env {
            return std::env::var(var).map_err(|_| {
                MigrationError::CredentialError(format!(
                    "Environment variable {} for tenant {} is not set",
                    var, self.tenant_id
                ))
            });
        }

        self.client_secret.clone().ok_or_else(|| {
            MigrationError::CredentialError(format!(
                "No client secret configured for tenant {}",
                self.tenant_id
            ))
        })
    }
}

fn default_graph_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_login_base_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_mail_concurrency() -> usize {
    4
}

fn default_files_concurrency() -> usize {
    4
}

fn default_sites_concurrency() -> usize {
    3
}

fn default_teams_concurrency() -> usize {
    2
}

fn default_worker_slots() -> usize {
    4
}

fn default_small_upload_limit() -> u64 {
    4 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    10 * 1024 * 1024
}

fn default_state_directory() -> PathBuf {
    PathBuf::from(".tenant-migrator")
}

fn default_progress_interval_secs() -> u64 {
    5
}

fn default_teams_message_delay_ms() -> u64 {
    1000
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            MigrationError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| {
            MigrationError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                MigrationError::ConfigError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| {
            MigrationError::ConfigError(format!("Failed to serialize config: {}", e))
        })?;

        tokio::fs::write(path, content).await.map_err(|e| {
            MigrationError::ConfigError(format!("Failed to write config file: {}", e))
        })?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.api.graph_base_url.is_empty() || self.api.login_base_url.is_empty() {
            return Err(MigrationError::ConfigError(
                "api.graph_base_url and api.login_base_url cannot be empty".to_string(),
            ));
        }
        if self.api.request_timeout_secs == 0 {
            return Err(MigrationError::ConfigError(
                "api.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.retry.base_delay_ms == 0 {
            return Err(MigrationError::ConfigError(
                "retry.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        // 2^max_retries multiplies the base delay
        if self.retry.max_retries > 16 {
            return Err(MigrationError::ConfigError(
                "retry.max_retries cannot exceed 16".to_string(),
            ));
        }

        for (class, quota) in self.rate_limits.overrides() {
            if quota.capacity == 0 || quota.window_ms == 0 {
                return Err(MigrationError::ConfigError(format!(
                    "rate_limits.{} needs a capacity and window_ms greater than 0",
                    class
                )));
            }
        }

        let concurrency = &self.concurrency;
        for (name, value) in [
            ("mail", concurrency.mail),
            ("files", concurrency.files),
            ("sites", concurrency.sites),
            ("teams", concurrency.teams),
            ("worker_slots", concurrency.worker_slots),
        ] {
            if value == 0 {
                return Err(MigrationError::ConfigError(format!(
                    "concurrency.{} must be at least 1",
                    name
                )));
            }
        }

        let chunk = self.transfer.chunk_size_bytes;
        if chunk == 0 || chunk % UPLOAD_CHUNK_ALIGNMENT != 0 {
            return Err(MigrationError::ConfigError(format!(
                "transfer.chunk_size_bytes must be a non-zero multiple of {} bytes (320 KiB)",
                UPLOAD_CHUNK_ALIGNMENT
            )));
        }
        if chunk > MAX_CHUNK_SIZE {
            return Err(MigrationError::ConfigError(format!(
                "transfer.chunk_size_bytes cannot exceed {} bytes (60 MiB)",
                MAX_CHUNK_SIZE
            )));
        }

        if self.execution.progress_interval_secs == 0 {
            return Err(MigrationError::ConfigError(
                "execution.progress_interval_secs must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if tenant.tenant_id.is_empty() || tenant.client_id.is_empty() {
                return Err(MigrationError::ConfigError(
                    "tenants entries need a tenant_id and client_id".to_string(),
                ));
            }
            if tenant.client_secret.as_deref().map_or(true, str::is_empty)
                && tenant.client_secret_env.as_deref().map_or(true, str::is_empty)
            {
                return Err(MigrationError::ConfigError(format!(
                    "tenant {} needs client_secret or client_secret_env",
                    tenant.tenant_id
                )));
            }
            if !seen.insert(tenant.tenant_id.as_str()) {
                return Err(MigrationError::ConfigError(format!(
                    "tenant {} is configured more than once",
                    tenant.tenant_id
                )));
            }
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Look up the credentials configured for a tenant
    pub fn tenant(&self, tenant_id: &str) -> Option<&TenantCredentials> {
        self.tenants.iter().find(|t| t.tenant_id == tenant_id)
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let mut config = Self::default();
        config.tenants.push(TenantCredentials {
            tenant_id: "00000000-0000-0000-0000-000000000000".to_string(),
            client_id: "11111111-1111-1111-1111-111111111111".to_string(),
            client_secret: None,
            client_secret_env: Some("SOURCE_TENANT_SECRET".to_string()),
        });
        config.save(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tenant(id: &str) -> TenantCredentials {
        TenantCredentials {
            tenant_id: id.to_string(),
            client_id: "client".to_string(),
            client_secret: Some("secret".to_string()),
            client_secret_env: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.api.graph_base_url, "https://graph.microsoft.com/v1.0");
        assert_eq!(config.api.request_timeout_secs, 120);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.concurrency.limit_for(WorkloadKind::Sites), 3);
        assert_eq!(config.concurrency.limit_for(WorkloadKind::Teams), 2);
        assert_eq!(config.transfer.small_upload_limit_bytes, 4 * 1024 * 1024);
        assert_eq!(config.transfer.chunk_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.execution.failure_policy, FailurePolicy::ReportFailures);
        assert_eq!(config.execution.teams_message_delay_ms, 1000);
        assert!(config.rate_limits.overrides().is_empty());
    }

    #[test]
    fn test_config_validation_valid() {
        let mut config = Config::default();
        config.tenants.push(tenant("a"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_chunk_alignment() {
        let mut config = Config::default();
        config.transfer.chunk_size_bytes = 1_000_000;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("320 KiB"));

        config.transfer.chunk_size_bytes = 0;
        assert!(config.validate().is_err());

        config.transfer.chunk_size_bytes = UPLOAD_CHUNK_ALIGNMENT * 200;
        assert!(config.validate().unwrap_err().to_string().contains("60 MiB"));

        config.transfer.chunk_size_bytes = UPLOAD_CHUNK_ALIGNMENT;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_concurrency() {
        let mut config = Config::default();
        config.concurrency.teams = 0;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("concurrency.teams"));
    }

    #[test]
    fn test_config_validation_zero_base_delay() {
        let mut config = Config::default();
        config.retry.base_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_quota_override() {
        let mut config = Config::default();
        config.rate_limits.teams = Some(Quota::new(0, 1000));
        assert!(config.validate().unwrap_err().to_string().contains("rate_limits.teams"));
    }

    #[test]
    fn test_config_validation_tenants() {
        let mut config = Config::default();
        config.tenants.push(tenant("a"));
        config.tenants.push(tenant("a"));
        assert!(config.validate().unwrap_err().to_string().contains("more than once"));

        let mut config = Config::default();
        let mut missing = tenant("b");
        missing.client_secret = None;
        config.tenants.push(missing);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_from_env() {
        let mut creds = tenant("a");
        creds.client_secret = None;
        creds.client_secret_env = Some("TENANT_MIGRATOR_TEST_SECRET_UNSET".to_string());
        assert!(matches!(creds.secret(), Err(MigrationError::CredentialError(_))));

        assert_eq!(tenant("b").secret().unwrap(), "secret");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let rendered = format!("{:?}", tenant("a"));
        assert!(!rendered.contains("\"secret\""));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml_str = r#"
            [retry]
            max_retries = 5

            [rate_limits.teams_messages]
            capacity = 2
            window_ms = 1000

            [execution]
            failure_policy = "fail_job"

            [[tenants]]
            tenant_id = "contoso"
            client_id = "app"
            client_secret_env = "CONTOSO_SECRET"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(
            config.rate_limits.overrides().get(&ServiceClass::TeamsMessages),
            Some(&Quota::new(2, 1000))
        );
        assert_eq!(config.execution.failure_policy, FailurePolicy::FailOnItemFailures);
        assert_eq!(config.tenant("contoso").unwrap().client_id, "app");
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        Config::create_example(&path).await.unwrap();
        let loaded = Config::load(&path).await.unwrap();
        assert_eq!(loaded.tenants.len(), 1);
        assert_eq!(
            loaded.tenants[0].client_secret_env.as_deref(),
            Some("SOURCE_TENANT_SECRET")
        );
    }

    #[tokio::test]
    async fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.concurrency.worker_slots, 4);
    }
}
