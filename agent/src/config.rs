//! Agent configuration loaded from metricd.toml
//!
//! The configuration covers logging, the scheduler's per-plugin system
//! options (capacity, active-check behaviour, free-form plugin
//! options), key aliases and access rules, user-parameter definitions
//! and the locally scheduled checks the agent subscribes on behalf of
//! the built-in local-checks client.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use metricd_core::parse_key;

/// Main agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Log verbosity when RUST_LOG is not set (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Optional log file directory; logging goes to stdout when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Schedule the first fire of new active checks immediately instead
    /// of waiting for the delay grid (default: false)
    #[serde(default)]
    pub force_active_checks_on_start: bool,
    /// Key alias lines, `name:key`
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Key patterns non-local clients may always request
    #[serde(default)]
    pub allow_keys: Vec<String>,
    /// Key patterns non-local clients must not request
    #[serde(default)]
    pub deny_keys: Vec<String>,
    /// User parameter lines, `key,command`
    #[serde(default)]
    pub user_parameters: Vec<String>,
    /// Permit shell special characters in flexible user parameter
    /// arguments (default: false)
    #[serde(default)]
    pub unsafe_user_parameters: bool,
    /// Per-plugin system options keyed by plugin name
    #[serde(default)]
    pub plugins: HashMap<String, PluginSystemOptions>,
    /// Locally scheduled checks subscribed for the local-checks client
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

/// System options of a single plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginSystemOptions {
    /// Concurrency budget override; capped by the plugin's hard maximum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    /// Per-plugin override of force_active_checks_on_start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub force_active_checks_on_start: Option<bool>,
    /// Free-form options passed to the plugin's Configurator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<toml::Value>,
}

/// One locally scheduled check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckConfig {
    /// Item key, e.g. `cpu.load[avg1]`
    pub key: String,
    /// Update interval (default: 60 seconds)
    #[serde(default = "default_check_delay")]
    pub delay: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
            force_active_checks_on_start: false,
            aliases: Vec::new(),
            allow_keys: Vec::new(),
            deny_keys: Vec::new(),
            user_parameters: Vec::new(),
            unsafe_user_parameters: false,
            plugins: HashMap::new(),
            checks: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Loads and validates the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("cannot read configuration file {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("cannot parse configuration file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<()> {
        for check in &self.checks {
            parse_key(&check.key)
                .with_context(|| format!("invalid check key \"{}\"", check.key))?;
            if check.delay.trim().is_empty() {
                bail!("check \"{}\" has an empty delay", check.key);
            }
        }
        for (name, options) in &self.plugins {
            if options.capacity == Some(0) {
                bail!("plugin \"{name}\" capacity must be at least 1");
            }
        }
        Ok(())
    }

    pub fn plugin_options(&self, name: &str) -> Option<&PluginSystemOptions> {
        self.plugins.get(name)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_check_delay() -> String {
    "60".to_string()
}
