use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::ConfigError;
use crate::profile::Profile;

pub const CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub profile: Profile,
    pub browser: BrowserConfig,
    pub automation: AutomationConfig,
    pub logging: LoggingConfig,
    pub credentials: CredentialsConfig,
    pub escalation: EscalationConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    /// Attach to an already running Chrome, e.g. `http://127.0.0.1:9222`.
    pub attach_url: Option<String>,
    pub executable: Option<PathBuf>,
    pub user_data_dir: Option<PathBuf>,
    pub window_width: u32,
    pub window_height: u32,
    pub navigation_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            attach_url: None,
            executable: None,
            user_data_dir: None,
            window_width: 1280,
            window_height: 720,
            navigation_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub max_iterations: usize,
    pub action_timeout_ms: u64,
    /// Pause after every executed action, jittered by up to a third.
    pub action_delay_ms: u64,
    pub captcha_wait_secs: u64,
    pub captcha_poll_ms: u64,
    /// Field-filling candidates applied per iteration.
    pub actions_per_iteration: usize,
    pub max_scroll_steps: usize,
    pub fallback_text: String,
    pub artifacts_dir: PathBuf,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            max_iterations: crate::types::DEFAULT_MAX_ITERATIONS,
            action_timeout_ms: 10_000,
            action_delay_ms: 1_000,
            captcha_wait_secs: 300,
            captcha_poll_ms: 2_000,
            actions_per_iteration: 1,
            max_scroll_steps: 10,
            fallback_text: "N/A".into(),
            artifacts_dir: PathBuf::from("runs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_file: Option<PathBuf>,
    pub mask_secrets: bool,
    pub save_snapshots: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            log_file: None,
            mask_secrets: true,
            save_snapshots: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub password_env_var: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            password_env_var: "JOB_APP_PASSWORD".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub enabled: bool,
    pub api_base: String,
    pub api_key_env: String,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_base: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            model: "gpt-4o-mini".into(),
            temperature: 0.2,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".into(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw, path)
    }

    fn from_yaml(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Candidate locations, most specific first.
    pub fn search_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(path) = explicit {
            paths.push(path.to_path_buf());
            return paths;
        }
        paths.push(PathBuf::from(CONFIG_FILE));
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("autoapply").join(CONFIG_FILE));
        }
        paths
    }

    /// Loads the first existing file. An explicit path must exist; otherwise
    /// a missing file yields defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        for path in Self::search_paths(None) {
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        warn!("no {CONFIG_FILE} found, using defaults");
        Ok(Self::default())
    }

    /// Replaces the profile section with a standalone profile file.
    pub fn with_profile_file(mut self, path: &Path) -> Result<Self, ConfigError> {
        self.profile = Profile::load(path)?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.profile.email.as_deref().is_none_or(|e| e.trim().is_empty()) {
            missing.push("profile.email");
        }
        if self.profile.full_name().is_none() {
            missing.push("profile.name (or first_name/last_name)");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Invalid(format!("missing {}", missing.join(", "))));
        }
        if self.automation.max_iterations == 0 {
            return Err(ConfigError::Invalid("automation.max_iterations must be at least 1".into()));
        }
        if self.automation.actions_per_iteration == 0 {
            return Err(ConfigError::Invalid("automation.actions_per_iteration must be at least 1".into()));
        }
        Ok(())
    }
}
