//! Process configuration: YAML file, `.env`, then environment overrides

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::orchestrator::RunContext;
use crate::wait::{MAX_INTERACTION_TIMEOUT, MAX_NAVIGATION_TIMEOUT, validate_timeout};

/// Config file looked up in the working directory when none is given
pub const DEFAULT_CONFIG_FILE: &str = "chat-automation.yaml";

pub const ENV_TARGET_URL: &str = "CHATGPT_PROJECT_URL";
pub const ENV_ACCOUNT: &str = "EMAIL";
pub const ENV_CREDENTIAL: &str = "PASSWORD";
pub const ENV_SESSION_DIR: &str = "CHAT_AUTOMATION_SESSION_DIR";
pub const ENV_HEADLESS: &str = "CHAT_AUTOMATION_HEADLESS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid target URL '{url}': {source}")]
    InvalidUrl { url: String, source: url::ParseError },

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chat project page every ask starts from
    #[serde(default)]
    pub target_url: String,

    /// Identity-provider account (email) used for federated login
    #[serde(default)]
    pub account: String,

    #[serde(default, skip_serializing)]
    pub credential: String,

    /// Durable authenticated profile
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,

    /// Parent for run workspaces; system temp dir when unset
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Browser launch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// The chat application rejects most headless sessions
    #[serde(default)]
    pub headless: bool,

    /// Disable web security features (Same-Origin Policy, etc.)
    /// WARNING: Only enable for trusted content
    #[serde(default)]
    pub disable_security: bool,

    #[serde(default)]
    pub chrome_executable: Option<PathBuf>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_window_width")]
    pub width: u32,

    #[serde(default = "default_window_height")]
    pub height: u32,
}

/// Every bound used during a run, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_login_check_ms")]
    pub login_check_ms: u64,
    #[serde(default = "default_action_ms")]
    pub action_ms: u64,
    #[serde(default = "default_login_settle_ms")]
    pub login_settle_ms: u64,
    #[serde(default = "default_provider_settle_ms")]
    pub provider_settle_ms: u64,
    #[serde(default = "default_provider_ready_ms")]
    pub provider_ready_ms: u64,
    #[serde(default = "default_remembered_account_ms")]
    pub remembered_account_ms: u64,
    #[serde(default = "default_email_settle_ms")]
    pub email_settle_ms: u64,
    #[serde(default = "default_password_settle_ms")]
    pub password_settle_ms: u64,
    #[serde(default = "default_prompt_input_ms")]
    pub prompt_input_ms: u64,
    #[serde(default = "default_submit_visible_ms")]
    pub submit_visible_ms: u64,
    #[serde(default = "default_submit_poll_interval_ms")]
    pub submit_poll_interval_ms: u64,
    #[serde(default = "default_submit_max_attempts")]
    pub submit_max_attempts: u32,
    #[serde(default = "default_submit_settle_ms")]
    pub submit_settle_ms: u64,
    #[serde(default = "default_response_ms")]
    pub response_ms: u64,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
}

fn default_session_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chat-automation")
        .join("profile")
}

fn default_request_timeout_secs() -> u64 {
    30
}
fn default_window_width() -> u32 {
    1280
}
fn default_window_height() -> u32 {
    900
}

fn default_login_check_ms() -> u64 {
    5_000
}
fn default_action_ms() -> u64 {
    30_000
}
fn default_login_settle_ms() -> u64 {
    1_000
}
fn default_provider_settle_ms() -> u64 {
    3_000
}
fn default_provider_ready_ms() -> u64 {
    10_000
}
fn default_remembered_account_ms() -> u64 {
    3_000
}
fn default_email_settle_ms() -> u64 {
    2_000
}
fn default_password_settle_ms() -> u64 {
    5_000
}
fn default_prompt_input_ms() -> u64 {
    15_000
}
fn default_submit_visible_ms() -> u64 {
    30_000
}
fn default_submit_poll_interval_ms() -> u64 {
    1_000
}
fn default_submit_max_attempts() -> u32 {
    30
}
fn default_submit_settle_ms() -> u64 {
    2_000
}
fn default_response_ms() -> u64 {
    1_200_000
}
fn default_lock_wait_ms() -> u64 {
    600_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_url: String::new(),
            account: String::new(),
            credential: String::new(),
            session_dir: default_session_dir(),
            workspace_root: None,
            browser: BrowserConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            disable_security: false,
            chrome_executable: None,
            request_timeout_secs: default_request_timeout_secs(),
            window: WindowConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_window_width(),
            height: default_window_height(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            login_check_ms: default_login_check_ms(),
            action_ms: default_action_ms(),
            login_settle_ms: default_login_settle_ms(),
            provider_settle_ms: default_provider_settle_ms(),
            provider_ready_ms: default_provider_ready_ms(),
            remembered_account_ms: default_remembered_account_ms(),
            email_settle_ms: default_email_settle_ms(),
            password_settle_ms: default_password_settle_ms(),
            prompt_input_ms: default_prompt_input_ms(),
            submit_visible_ms: default_submit_visible_ms(),
            submit_poll_interval_ms: default_submit_poll_interval_ms(),
            submit_max_attempts: default_submit_max_attempts(),
            submit_settle_ms: default_submit_settle_ms(),
            response_ms: default_response_ms(),
            lock_wait_ms: default_lock_wait_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn login_check(&self) -> Duration {
        Duration::from_millis(self.login_check_ms)
    }
    pub fn action(&self) -> Duration {
        Duration::from_millis(self.action_ms)
    }
    pub fn login_settle(&self) -> Duration {
        Duration::from_millis(self.login_settle_ms)
    }
    pub fn provider_settle(&self) -> Duration {
        Duration::from_millis(self.provider_settle_ms)
    }
    pub fn provider_ready(&self) -> Duration {
        Duration::from_millis(self.provider_ready_ms)
    }
    pub fn remembered_account(&self) -> Duration {
        Duration::from_millis(self.remembered_account_ms)
    }
    pub fn email_settle(&self) -> Duration {
        Duration::from_millis(self.email_settle_ms)
    }
    pub fn password_settle(&self) -> Duration {
        Duration::from_millis(self.password_settle_ms)
    }
    pub fn prompt_input(&self) -> Duration {
        Duration::from_millis(self.prompt_input_ms)
    }
    pub fn submit_visible(&self) -> Duration {
        Duration::from_millis(self.submit_visible_ms)
    }
    pub fn submit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.submit_poll_interval_ms)
    }
    pub fn submit_settle(&self) -> Duration {
        Duration::from_millis(self.submit_settle_ms)
    }
    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let interaction = [
            ("login_check_ms", self.login_check()),
            ("action_ms", self.action()),
            ("login_settle_ms", self.login_settle()),
            ("provider_settle_ms", self.provider_settle()),
            ("provider_ready_ms", self.provider_ready()),
            ("remembered_account_ms", self.remembered_account()),
            ("email_settle_ms", self.email_settle()),
            ("password_settle_ms", self.password_settle()),
            ("prompt_input_ms", self.prompt_input()),
            ("submit_visible_ms", self.submit_visible()),
            ("submit_poll_interval_ms", self.submit_poll_interval()),
            ("submit_settle_ms", self.submit_settle()),
        ];
        let navigation = [
            ("response_ms", self.response()),
            ("lock_wait_ms", self.lock_wait()),
        ];

        let checks = interaction
            .into_iter()
            .map(|(name, value)| (name, value, MAX_INTERACTION_TIMEOUT))
            .chain(
                navigation
                    .into_iter()
                    .map(|(name, value)| (name, value, MAX_NAVIGATION_TIMEOUT)),
            );
        for (name, value, max) in checks {
            validate_timeout(name, value, max)
                .map_err(|reason| ConfigError::Invalid { name, reason })?;
        }

        if self.submit_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                name: "submit_max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

impl Config {
    /// Load from `path` (or `DEFAULT_CONFIG_FILE` if present), then `.env`
    /// and process environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_yaml_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };

        if let Ok(env_file) = dotenvy::dotenv() {
            debug!("Loaded environment from {}", env_file.display());
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override settings from `lookup` (the process environment in `load`)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_TARGET_URL) {
            self.target_url = url;
        }
        if let Some(account) = lookup(ENV_ACCOUNT) {
            self.account = account;
        }
        if let Some(credential) = lookup(ENV_CREDENTIAL) {
            self.credential = credential;
        }
        if let Some(dir) = lookup(ENV_SESSION_DIR) {
            self.session_dir = PathBuf::from(dir);
        }
        if let Some(headless) = lookup(ENV_HEADLESS) {
            self.browser.headless = matches!(
                headless.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_url.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_TARGET_URL));
        }
        url::Url::parse(&self.target_url).map_err(|source| ConfigError::InvalidUrl {
            url: self.target_url.clone(),
            source,
        })?;
        if self.account.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_ACCOUNT));
        }
        if self.credential.is_empty() {
            return Err(ConfigError::Missing(ENV_CREDENTIAL));
        }
        self.timeouts.validate()
    }

    pub fn run_context(
        &self,
        prompt: impl Into<String>,
        file: Option<PathBuf>,
        expect_json: bool,
    ) -> RunContext {
        RunContext {
            target_url: self.target_url.clone(),
            account: self.account.clone(),
            credential: self.credential.clone(),
            prompt: prompt.into(),
            file,
            expect_json,
        }
    }
}
