//! Orchestrator configuration
//!
//! Loaded from TOML (every section optional), then overridden from the
//! environment:
//!
//! | variable | effect |
//! |---|---|
//! | `DEVORCH_CONFIG` | path of the TOML file read by [`OrchestratorConfig::from_env`] |
//! | `DEVORCH_DB` | SQLite database path |
//! | `DEVORCH_POLICY` | guardrail policy file |
//! | `DEVORCH_OLLAMA_URL` | enables the Ollama provider at this base URL |
//! | `DEVORCH_APPROVAL_TIMEOUT` | seconds before a pending approval expires |
//!
//! Approvals never expire unless a timeout is configured.

use crate::error::{OrchestratorError, Result};
use crate::guardrail::{default_allowed_directories, GuardrailRule};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory holding the default database and policy file
pub fn data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dev-orchestrator")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub guardrails: GuardrailsConfig,
    pub executor: ExecutorConfig,
    pub services: ServiceConfig,
    pub approvals: ApprovalConfig,
    pub state: StateLimits,
    pub nlp: NlpConfig,
    pub storage: StorageConfig,
    pub notifications: NotificationConfig,
    /// Used when a submission has no cwd and no project is active
    pub default_working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailsConfig {
    pub allowed_directories: Vec<String>,
    /// External policy file; takes precedence over `rules`
    pub policy_file: Option<PathBuf>,
    /// Reload the policy file when it changes
    pub watch: bool,
    /// Inline rules; empty means built-in defaults
    #[serde(rename = "rule")]
    pub rules: Vec<GuardrailRule>,
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            allowed_directories: default_allowed_directories(),
            policy_file: None,
            watch: true,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// When false, commands in the same directory run one at a time
    pub allow_concurrent_in_same_directory: bool,
    /// Tail kept per output stream
    pub max_output_bytes: usize,
    /// Grace period between SIGTERM and SIGKILL on cancel
    pub cancel_grace_ms: u64,
    pub shell: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            allow_concurrent_in_same_directory: true,
            max_output_bytes: 64 * 1024,
            cancel_grace_ms: 5_000,
            shell: "sh".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub stop_timeout_secs: u64,
    pub reconcile_interval_ms: u64,
    /// Forward service stdout/stderr lines into the log ring
    pub capture_output: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 5,
            reconcile_interval_ms: 2_000,
            capture_output: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Pending approvals older than this are rejected; `None` disables expiry
    pub approval_timeout_secs: Option<u64>,
    pub sweep_interval_ms: u64,
    /// Resolved ids remembered for conflict reporting
    pub tombstone_capacity: usize,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            approval_timeout_secs: None,
            sweep_interval_ms: 1_000,
            tombstone_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateLimits {
    pub command_history: usize,
    pub logs: usize,
    /// Capacity of the delta broadcast channel
    pub broadcast_capacity: usize,
}

impl Default for StateLimits {
    fn default() -> Self {
        Self {
            command_history: 100,
            logs: 500,
            broadcast_capacity: 1_024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NlpConfig {
    pub enabled: bool,
    /// Provider tried after templates when the request names none
    pub primary: Option<String>,
    pub fallbacks: Vec<String>,
    pub timeout_ms: u64,
    pub min_confidence: f32,
    pub ollama: Option<OllamaConfig>,
}

impl Default for NlpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            primary: None,
            fallbacks: Vec::new(),
            timeout_ms: 10_000,
            min_confidence: 0.5,
            ollama: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "granite3-dense:8b".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub enabled: bool,
    pub app_name: String,
    pub timeout_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            app_name: "devorch".to_string(),
            timeout_ms: 3_000,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as TOML
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `DEVORCH_CONFIG` file (or defaults) with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let config = match std::env::var_os("DEVORCH_CONFIG") {
            Some(path) => Self::from_file(PathBuf::from(path))?,
            None => Self::default(),
        };
        Ok(config.apply_env())
    }

    /// Apply `DEVORCH_*` overrides
    pub fn apply_env(mut self) -> Self {
        if let Some(db) = std::env::var_os("DEVORCH_DB") {
            self.storage.database_path = Some(PathBuf::from(db));
        }
        if let Some(policy) = std::env::var_os("DEVORCH_POLICY") {
            self.guardrails.policy_file = Some(PathBuf::from(policy));
        }
        if let Ok(url) = std::env::var("DEVORCH_OLLAMA_URL") {
            let ollama = self.nlp.ollama.get_or_insert_with(OllamaConfig::default);
            ollama.base_url = url;
        }
        if let Some(secs) = std::env::var("DEVORCH_APPROVAL_TIMEOUT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
        {
            self.approvals.approval_timeout_secs = Some(secs);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor.shell.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "executor.shell must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.nlp.min_confidence) {
            return Err(OrchestratorError::InvalidConfig(format!(
                "nlp.min_confidence must be within 0..=1, got {}",
                self.nlp.min_confidence
            )));
        }
        if self.services.reconcile_interval_ms == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "services.reconcile_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_allowed_directories(mut self, dirs: Vec<String>) -> Self {
        self.guardrails.allowed_directories = dirs;
        self
    }

    pub fn with_policy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.guardrails.policy_file = Some(path.into());
        self
    }

    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage.database_path = Some(path.into());
        self
    }

    pub fn with_approval_timeout(mut self, secs: Option<u64>) -> Self {
        self.approvals.approval_timeout_secs = secs;
        self
    }

    pub fn with_reconcile_interval(mut self, ms: u64) -> Self {
        self.services.reconcile_interval_ms = ms;
        self
    }

    pub fn with_stop_timeout(mut self, secs: u64) -> Self {
        self.services.stop_timeout_secs = secs;
        self
    }

    pub fn with_serialized_directories(mut self) -> Self {
        self.executor.allow_concurrent_in_same_directory = false;
        self
    }

    pub fn with_default_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_working_directory = Some(dir.into());
        self
    }

    pub fn with_notifications(mut self, enabled: bool) -> Self {
        self.notifications.enabled = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert!(config.executor.allow_concurrent_in_same_directory);
        assert_eq!(config.executor.max_output_bytes, 65_536);
        assert_eq!(config.services.stop_timeout_secs, 5);
        assert_eq!(config.services.reconcile_interval_ms, 2_000);
        assert_eq!(config.approvals.approval_timeout_secs, None);
        assert_eq!(config.guardrails.allowed_directories.len(), 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let text = r#"
[executor]
allow_concurrent_in_same_directory = false

[guardrails]
allowed_directories = ["/srv/src"]

[[guardrails.rule]]
pattern = "make release"
action = "approve"
"#;
        let config: OrchestratorConfig = toml::from_str(text).unwrap();
        assert!(!config.executor.allow_concurrent_in_same_directory);
        assert_eq!(config.executor.shell, "sh");
        assert_eq!(config.guardrails.allowed_directories, vec!["/srv/src"]);
        assert_eq!(config.guardrails.rules.len(), 1);
        assert_eq!(config.state.logs, 500);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devorch.toml");
        let config = OrchestratorConfig::default()
            .with_database("/tmp/devorch.db")
            .with_approval_timeout(Some(60));

        config.to_file(&path).unwrap();
        let loaded = OrchestratorConfig::from_file(&path).unwrap();

        assert_eq!(
            loaded.storage.database_path,
            Some(PathBuf::from("/tmp/devorch.db"))
        );
        assert_eq!(loaded.approvals.approval_timeout_secs, Some(60));
    }

    #[test]
    fn test_validate_rejects_bad_confidence() {
        let mut config = OrchestratorConfig::default();
        config.nlp.min_confidence = 1.5;
        assert_eq!(config.validate().unwrap_err().code(), "invalid_config");
    }
}
