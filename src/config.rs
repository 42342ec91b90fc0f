//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Lock tier configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LockConfig {
    /// Serialize every agent step process-wide, not just per session.
    #[serde(default)]
    pub global_execution_lock: bool,
    /// Drop lock entries that were idle this long; 0 disables eviction.
    #[serde(default)]
    pub idle_eviction_seconds: u64,
}

/// When the budget manager should compress history.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// Fraction of `max_input_tokens`, in `(0, 1]`.
    Fraction(f64),
    /// Absolute token ceiling.
    Tokens(u64),
}

/// Which recent turns survive compression verbatim.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum KeepPolicy {
    /// Keep the last fraction of turns, in `(0, 1]` (at least one turn).
    Fraction(f64),
    /// Keep the last N turns; N must be at least 1.
    #[serde(alias = "messages")]
    Turns(usize),
}

/// Context budget configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct BudgetConfig {
    /// Whether compression runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fixed instruction text counted alongside the turns.
    #[serde(default)]
    pub instruction_prefix: String,
    /// Trigger policy.
    #[serde(default = "default_trigger")]
    pub trigger: TriggerPolicy,
    /// Keep policy.
    #[serde(default = "default_keep")]
    pub keep: KeepPolicy,
    /// Maximum input size of the model, in tokens.
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: u64,
    /// Cap on the summarization prompt size in tokens; 0 means no cap.
    #[serde(default)]
    pub trim_tokens_to_summarize: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instruction_prefix: String::new(),
            trigger: default_trigger(),
            keep: default_keep(),
            max_input_tokens: default_max_input_tokens(),
            trim_tokens_to_summarize: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn in_unit_interval(value: f64) -> bool {
    value > 0.0 && value <= 1.0
}

fn default_trigger() -> TriggerPolicy {
    TriggerPolicy::Fraction(0.85)
}

fn default_keep() -> KeepPolicy {
    KeepPolicy::Fraction(0.10)
}

fn default_max_input_tokens() -> u64 {
    128_000
}

/// How concurrent actions inside one batch are counted against the cap.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CountingPolicy {
    /// Every action in a batch is checked against the count observed before
    /// the batch; a batch may overshoot the cap by at most `batch - 1`.
    #[default]
    BatchSnapshot,
    /// Slots are reserved one at a time; the cap is never exceeded.
    Strict,
}

/// Action accountant configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AccountantConfig {
    /// Maximum side-effecting actions per session.
    #[serde(default = "default_max_actions")]
    pub max_actions: u64,
    /// Batch counting policy.
    #[serde(default)]
    pub policy: CountingPolicy,
}

impl Default for AccountantConfig {
    fn default() -> Self {
        Self {
            max_actions: default_max_actions(),
            policy: CountingPolicy::default(),
        }
    }
}

fn default_max_actions() -> u64 {
    25
}

/// Execution bridge configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Whether steps may run on a spawned task; `false` runs them inline.
    #[serde(default = "default_true")]
    pub allow_spawn: bool,
    /// Capacity of the fragment channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How long a producer waits on a full channel before giving up.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_seconds: u64,
    /// Default caller deadline for blocking steps.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            allow_spawn: true,
            channel_capacity: default_channel_capacity(),
            send_timeout_seconds: default_send_timeout(),
            step_timeout_seconds: default_step_timeout(),
        }
    }
}

impl BridgeConfig {
    /// Producer backpressure timeout.
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }

    /// Default blocking deadline.
    #[must_use]
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }
}

fn default_channel_capacity() -> usize {
    100
}

fn default_send_timeout() -> u64 {
    30
}

fn default_step_timeout() -> u64 {
    300
}

fn default_session_prefix() -> String {
    "chat".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Canonical checkpoint file for this store instance.
    pub store_path: PathBuf,
    /// Prefix used when deriving session keys.
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// Lock tiers.
    #[serde(default)]
    pub locks: LockConfig,
    /// Context budget.
    #[serde(default)]
    pub budget: BudgetConfig,
    /// Action accounting.
    #[serde(default)]
    pub accountant: AccountantConfig,
    /// Execution bridge.
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration with defaults for every section.
    #[must_use]
    pub fn with_store_path(store_path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: store_path.into(),
            session_prefix: default_session_prefix(),
            locks: LockConfig::default(),
            budget: BudgetConfig::default(),
            accountant: AccountantConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.store_path.as_os_str().is_empty() {
            return Err(AppError::Config("store_path must not be empty".into()));
        }

        if self.session_prefix.trim().is_empty() {
            return Err(AppError::Config("session_prefix must not be empty".into()));
        }

        match self.budget.trigger {
            TriggerPolicy::Fraction(value) => {
                if !in_unit_interval(value) {
                    return Err(AppError::Config(format!(
                        "fraction trigger must be in (0, 1], got {value}"
                    )));
                }
                if self.budget.max_input_tokens == 0 {
                    return Err(AppError::Config(
                        "fraction trigger requires max_input_tokens > 0".into(),
                    ));
                }
            }
            TriggerPolicy::Tokens(0) => {
                return Err(AppError::Config("token trigger must be positive".into()));
            }
            TriggerPolicy::Tokens(_) => {}
        }

        match self.budget.keep {
            KeepPolicy::Fraction(value) if !in_unit_interval(value) => {
                return Err(AppError::Config(format!(
                    "fraction keep must be in (0, 1], got {value}"
                )));
            }
            KeepPolicy::Turns(0) => {
                return Err(AppError::Config(
                    "turn keep must retain at least one turn".into(),
                ));
            }
            KeepPolicy::Fraction(_) | KeepPolicy::Turns(_) => {}
        }

        if self.bridge.channel_capacity == 0 {
            return Err(AppError::Config(
                "bridge.channel_capacity must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}
