// Configuration management with layered configuration (file, env)
// Loaded once at startup and passed explicitly; nothing reads the environment later.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub tenant: TenantConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Tenant name; read from `<secrets_dir>/cxone_tenant` when empty
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Overrides the region's token endpoint
    #[serde(default)]
    pub auth_url: Option<String>,
    /// Overrides the region's admin endpoint
    #[serde(default)]
    pub admin_url: Option<String>,
    /// Overrides the region's API endpoint
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub secrets_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_region() -> String {
    "US".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub page_size: usize,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_base_delay_seconds: u64,
    pub retry_max_delay_seconds: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            timeout_seconds: 60,
            max_retries: 3,
            retry_base_delay_seconds: 1,
            retry_max_delay_seconds: 30,
        }
    }
}

/// A named policy as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyDefinition {
    pub name: String,
    pub cron: String,
}

/// A group path bound to a policy name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupBinding {
    pub group: String,
    pub policy: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Registered in order; the first definition of a normalized name wins
    #[serde(default)]
    pub policies: Vec<PolicyDefinition>,
    #[serde(default)]
    pub groups: Vec<GroupBinding>,
    /// Policy applied to projects with neither a tag nor a group binding
    #[serde(default)]
    pub default_policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between full refresh passes
    pub update_delay_seconds: u64,
    /// Shorter delay used after a communication failure
    pub error_retry_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_delay_seconds: 43200,
            error_retry_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    pub directory: PathBuf,
    pub run_as: String,
    pub workdir: String,
    pub scanner_command: String,
    pub log_target: String,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/etc/cron.d"),
            run_as: "nobody".to_string(),
            workdir: "/opt/scan-scheduler".to_string(),
            scanner_command: "./scanner".to_string(),
            log_target: "/opt/scan-scheduler/logfifo".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GateBackend {
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub backend: GateBackend,
    pub lock_dir: PathBuf,
    #[serde(default)]
    pub redis_url: Option<String>,
    pub lease_seconds: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            backend: GateBackend::File,
            lock_dir: PathBuf::from("/run/lock/scan-scheduler"),
            redis_url: None,
            lease_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default)]
    pub tracing_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_port: None,
            tracing_endpoint: None,
        }
    }
}

/// OAuth client credentials for one tenant
#[derive(Clone)]
pub struct Credentials {
    pub tenant: String,
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("tenant", &self.tenant)
            .field("client_id", &self.client_id)
            .field("client_secret", &"REDACTED")
            .finish()
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.catalog.page_size == 0 {
            return Err("Catalog page_size must be greater than 0".to_string());
        }
        if self.catalog.max_retries == 0 {
            return Err("Catalog max_retries must be greater than 0".to_string());
        }
        if self.scheduler.update_delay_seconds == 0 {
            return Err("Scheduler update_delay_seconds must be greater than 0".to_string());
        }
        if self.scheduler.error_retry_seconds == 0 {
            return Err("Scheduler error_retry_seconds must be greater than 0".to_string());
        }
        if self.cron.run_as.trim().is_empty() {
            return Err("Cron run_as cannot be empty".to_string());
        }
        if self.cron.scanner_command.trim().is_empty() {
            return Err("Cron scanner_command cannot be empty".to_string());
        }
        if self.gate.backend == GateBackend::Redis && self.gate.redis_url.is_none() {
            return Err("Gate redis_url required when backend is 'redis'".to_string());
        }
        if self.gate.lease_seconds == 0 {
            return Err("Gate lease_seconds must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Resolve tenant credentials from configuration, falling back to secret files
    pub fn credentials(&self) -> Result<Credentials, String> {
        let secrets_dir = self.secrets_dir();

        let tenant = pick_secret(&self.tenant.name, &secrets_dir, "cxone_tenant")?;
        let client_id = pick_secret(
            self.tenant.client_id.as_deref().unwrap_or_default(),
            &secrets_dir,
            "cxone_oauth_client_id",
        )?;
        let client_secret = pick_secret(
            self.tenant.client_secret.as_deref().unwrap_or_default(),
            &secrets_dir,
            "cxone_oauth_client_secret",
        )?;

        Ok(Credentials {
            tenant,
            client_id,
            client_secret,
        })
    }

    /// Configured secrets directory, else `/run/secrets`, else `./run/secrets`, else `.`
    fn secrets_dir(&self) -> PathBuf {
        if let Some(dir) = &self.tenant.secrets_dir {
            return dir.clone();
        }
        ["/run/secrets", "./run/secrets"]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn pick_secret(configured: &str, dir: &Path, file_name: &str) -> Result<String, String> {
    if !configured.trim().is_empty() {
        return Ok(configured.trim().to_string());
    }

    let path = dir.join(file_name);
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read secret {}: {}", path.display(), e))?;
    let value = contents.lines().next().unwrap_or_default().trim().to_string();

    if value.is_empty() {
        return Err(format!("Secret {} is empty", path.display()));
    }
    Ok(value)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tenant: TenantConfig {
                name: String::new(),
                region: default_region(),
                auth_url: None,
                admin_url: None,
                api_url: None,
                client_id: None,
                client_secret: None,
                secrets_dir: None,
                ssl_verify: true,
                proxy: None,
            },
            catalog: CatalogConfig::default(),
            schedule: ScheduleConfig::default(),
            scheduler: SchedulerConfig::default(),
            cron: CronConfig::default(),
            gate: GateConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}
