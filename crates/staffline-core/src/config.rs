use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StafflineError};
use crate::types::IntegrationKind;

/// Top-level staffline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub audit: Option<AuditConfig>,
    #[serde(default)]
    pub providers: BTreeMap<IntegrationKind, ProviderConfig>,
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

/// How an integration step entering `in_progress` gets its first network attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Spawn the provider call on the runtime; the transition returns immediately.
    #[default]
    Background,
    /// Await the provider call before the transition returns.
    Inline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite database file. `~/` is expanded.
    #[serde(default = "default_database")]
    pub database: String,
    /// Attempt bound for integration steps without their own override.
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    /// How often a transaction that hit a write conflict is retried.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    #[serde(default)]
    pub dispatch_mode: DispatchMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            default_max_attempts: default_max_attempts(),
            conflict_retries: default_conflict_retries(),
            dispatch_mode: DispatchMode::default(),
        }
    }
}

fn default_database() -> String { "~/.staffline/staffline.db".to_string() }
fn default_max_attempts() -> u32 { 3 }
fn default_conflict_retries() -> u32 { 3 }

/// Backoff used to stamp `next_retry_at` on failed integration attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_secs: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

fn default_initial_backoff() -> u64 { 60 }
fn default_max_backoff() -> u64 { 3600 }

/// Background sweep: due retries, stale attempts, overdue instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,
    /// Cron expression (with seconds field).
    #[serde(default = "default_sweep_schedule")]
    pub schedule: String,
    /// An attempt left `in_progress` longer than this is treated as failed.
    #[serde(default = "default_stale_attempt_secs")]
    pub stale_attempt_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            schedule: default_sweep_schedule(),
            stale_attempt_secs: default_stale_attempt_secs(),
        }
    }
}

fn default_sweeper_enabled() -> bool { true }
fn default_sweep_schedule() -> String { "0 */5 * * * *".to_string() }
fn default_stale_attempt_secs() -> u64 { 900 }

/// JSONL audit log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Enable the audit log (default: true when section is present).
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// Directory for audit files. Default: next to the database.
    #[serde(default)]
    pub audit_dir: Option<String>,
    /// 1 = instances and exceptions, 2 = + step transitions, 3 = + integration attempts.
    #[serde(default = "default_audit_level")]
    pub level: u8,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            audit_dir: None,
            level: default_audit_level(),
        }
    }
}

fn default_audit_enabled() -> bool { true }
fn default_audit_level() -> u8 { 2 }

/// One external integration provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_provider_timeout() -> u64 { 30 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_keys: vec![],
        }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    /// Recorded as the actor on every mutation made with this key.
    pub name: String,
    pub key: String,
    #[serde(default)]
    pub role: ApiKeyRole,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyRole {
    #[default]
    Viewer,
    Operator,
    Admin,
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StafflineError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| StafflineError::Config(e.to_string()))
    }

    /// Resolve the database path (expand ~).
    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.engine.database)
    }

    /// Resolve the audit directory: configured path, or `audit/` next to the database.
    pub fn audit_dir(&self) -> PathBuf {
        if let Some(dir) = self.audit.as_ref().and_then(|a| a.audit_dir.as_deref()) {
            return expand_home(dir);
        }
        let db = self.database_path();
        db.parent()
            .map(|p| p.join("audit"))
            .unwrap_or_else(|| PathBuf::from("audit"))
    }

    /// Attempt bound for a step, honouring its blueprint override.
    pub fn max_attempts_for(&self, step_override: Option<u32>) -> u32 {
        step_override
            .filter(|n| *n > 0)
            .unwrap_or(self.engine.default_max_attempts)
            .max(1)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
