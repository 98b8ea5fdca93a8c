//! Agent configuration loaded from `mobile-use.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default config file name, resolved relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "mobile-use.toml";

/// Agent configuration (TOML).
///
/// Every section is optional; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub session: SessionConfig,
    pub backoff: BackoffConfig,
    pub verification: VerificationConfig,
    pub prompt: PromptConfig,
    pub provider: ProviderConfig,
    pub device: DeviceConfig,
}

/// Budgets enforced by the recovery controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Global iteration ceiling (every plan/execute/verify cycle counts, retries included).
    pub max_steps: u32,
    /// Global wall-clock ceiling in seconds.
    pub wall_clock_secs: u64,
    /// Retries allowed for one logical step before re-planning.
    pub per_step_retries: u32,
    /// Re-plans allowed across the whole session.
    pub max_replans: u32,
    /// Consecutive provider errors tolerated before giving up.
    pub provider_error_ceiling: u32,
    /// Consecutive driver errors tolerated before giving up.
    pub driver_error_ceiling: u32,
    /// Capture a fresh snapshot before retrying the same proposal.
    pub resnapshot_before_retry: bool,
    /// Number of recent step records shown to the planner.
    pub memory_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            wall_clock_secs: 10 * 60,
            per_step_retries: 2,
            max_replans: 3,
            provider_error_ceiling: 2,
            driver_error_ceiling: 2,
            resnapshot_before_retry: true,
            memory_window: 8,
        }
    }
}

impl SessionConfig {
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_secs)
    }
}

/// Exponential backoff applied to transient provider and driver errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Random jitter as a percentage of the computed delay (0..=100).
    pub jitter_pct: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 8_000,
            jitter_pct: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    /// Ask the model when the deterministic rules cannot decide.
    pub model_fallback: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            model_fallback: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// Byte budget for one rendered prompt.
    pub budget_bytes: usize,
    /// Attach the current screenshot to planner and verifier calls.
    pub attach_screenshot: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 40_000,
            attach_screenshot: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI-compatible chat completions over HTTP.
    Openai,
    /// External agent CLI reading the prompt on stdin.
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature_milli: u32,
    /// Command for `kind = "command"` (e.g. `["codex","exec"]`).
    pub command: Vec<String>,
    /// Cap on captured provider stdout in bytes.
    pub output_limit_bytes: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Openai,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
            temperature_milli: 0,
            command: vec!["codex".to_string(), "exec".to_string()],
            output_limit_bytes: 200_000,
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn temperature(&self) -> f32 {
        self.temperature_milli as f32 / 1000.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeviceConfig {
    pub adb_path: String,
    /// Device serial; the first attached device is used when unset.
    pub serial: Option<String>,
    pub capture_screenshots: bool,
    pub capture_timeout_secs: u64,
    pub dispatch_timeout_secs: u64,
    /// Elements beyond this cap are dropped and the state is marked partial.
    pub max_elements: usize,
    /// Attempts to restart the adb server when no device is visible.
    pub server_restart_attempts: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            serial: None,
            capture_screenshots: true,
            capture_timeout_secs: 20,
            dispatch_timeout_secs: 10,
            max_elements: 300,
            server_restart_attempts: 3,
        }
    }
}

impl DeviceConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        let session = &self.session;
        if session.max_steps == 0 {
            return Err(anyhow!("session.max_steps must be > 0"));
        }
        if session.wall_clock_secs == 0 {
            return Err(anyhow!("session.wall_clock_secs must be > 0"));
        }
        if session.provider_error_ceiling == 0 || session.driver_error_ceiling == 0 {
            return Err(anyhow!("session error ceilings must be > 0"));
        }
        if session.memory_window == 0 {
            return Err(anyhow!("session.memory_window must be > 0"));
        }
        if self.backoff.base_ms == 0 || self.backoff.max_ms < self.backoff.base_ms {
            return Err(anyhow!("backoff requires 0 < base_ms <= max_ms"));
        }
        if self.backoff.jitter_pct > 100 {
            return Err(anyhow!("backoff.jitter_pct must be <= 100"));
        }
        if self.prompt.budget_bytes == 0 {
            return Err(anyhow!("prompt.budget_bytes must be > 0"));
        }
        let provider = &self.provider;
        if provider.timeout_secs == 0 {
            return Err(anyhow!("provider.timeout_secs must be > 0"));
        }
        match provider.kind {
            ProviderKind::Openai => {
                if provider.model.trim().is_empty() {
                    return Err(anyhow!("provider.model must be set"));
                }
                if provider.base_url.trim().is_empty() {
                    return Err(anyhow!("provider.base_url must be set"));
                }
            }
            ProviderKind::Command => {
                if provider.command.is_empty() || provider.command[0].trim().is_empty() {
                    return Err(anyhow!("provider.command must be a non-empty array"));
                }
            }
        }
        if self.device.capture_timeout_secs == 0 || self.device.dispatch_timeout_secs == 0 {
            return Err(anyhow!("device timeouts must be > 0"));
        }
        if self.device.max_elements == 0 {
            return Err(anyhow!("device.max_elements must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mobile-use.toml");
        let mut cfg = AgentConfig::default();
        cfg.device.serial = Some("emulator-5554".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("mobile-use.toml");
        fs::write(&path, "[session]\nmax_replans = 1\n\n[provider]\nkind = \"command\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.session.max_replans, 1);
        assert_eq!(cfg.session.max_steps, SessionConfig::default().max_steps);
        assert_eq!(cfg.provider.kind, ProviderKind::Command);
    }

    #[test]
    fn validate_rejects_zero_step_budget() {
        let mut cfg = AgentConfig::default();
        cfg.session.max_steps = 0;
        let err = cfg.validate().expect_err("should reject");
        assert!(err.to_string().contains("max_steps"));
    }

    #[test]
    fn validate_rejects_empty_command_provider() {
        let mut cfg = AgentConfig::default();
        cfg.provider.kind = ProviderKind::Command;
        cfg.provider.command = Vec::new();
        assert!(cfg.validate().is_err());
    }
}
