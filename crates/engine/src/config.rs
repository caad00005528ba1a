//! Runtime configuration via `rewind.toml`
//!
//! Process-wide switches that are not part of any thread's transaction state:
//! whether speculative execution is enabled at all, and the retry policy used
//! to shake out missing write instrumentation in tests.
//!
//! The config is read once, when a runtime is built. Hosts that load the C
//! boundary point `REWIND_CONFIG` at a config file; when it is unset the
//! defaults apply.

use rewind_core::{Result, RewindError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Conventional config file name.
pub const CONFIG_FILE_NAME: &str = "rewind.toml";

/// Environment variable holding the path of the config file.
pub const CONFIG_ENV_VAR: &str = "REWIND_CONFIG";

/// What to do after an outermost level's work succeeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Commit immediately
    #[default]
    Never,
    /// Roll the level back, run the work a second time, then commit
    ///
    /// Any write the work forgot to record survives the rollback and shows up
    /// as a divergence on the second run.
    AbortAndRetryOutermost,
}

/// Runtime configuration loaded from `rewind.toml`.
///
/// # Example
///
/// ```toml
/// enabled = true
/// retry = "never"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Run transactional work speculatively; when false work runs directly.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Retry policy for outermost levels.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_enabled() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            retry: RetryPolicy::Never,
        }
    }
}

impl RuntimeConfig {
    /// Config with speculation switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Rewind runtime configuration
#
# Run transactional work speculatively (default: true).
# When false, work runs directly and aborts cannot roll anything back.
enabled = true

# Retry policy for outermost transactions: "never" (default) or
# "abort_and_retry_outermost".
#   "abort_and_retry_outermost" = after the work succeeds, roll it back and
#   run it again before committing. Useful for finding unrecorded writes.
retry = "never"
"#
    }

    /// Parse config from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| RewindError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RewindError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: RuntimeConfig = toml::from_str(&content).map_err(|e| {
            RewindError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        info!(
            target: "rewind::txn",
            path = %path.display(),
            enabled = config.enabled,
            retry = ?config.retry,
            "Loaded runtime config"
        );
        Ok(config)
    }

    /// Load the file named by `REWIND_CONFIG`, or the defaults if unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RewindError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
