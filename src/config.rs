// Configuration for the profiler
// Defaults, overlaid by environment variables or a YAML file

use crate::analyze::OrmMarkers;
use crate::error::ProfilerError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::sync::OnceLock;

/// Global configuration instance
static CONFIG: OnceLock<ProfilerConfig> = OnceLock::new();

/// Profiler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Record queries at all (QSCOPE_ENABLED)
    pub enabled: bool,

    /// Module prefixes left out of the application trace (QSCOPE_APP_MODULES_TO_EXCLUDE)
    pub app_modules_to_exclude: Vec<String>,

    /// Module prefixes that make up the owner-domain trace (QSCOPE_OWNER_MODULES)
    pub owner_modules_to_include: Vec<String>,

    /// Frames the signature analyzer keys on
    pub markers: OrmMarkers,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            app_modules_to_exclude: [
                "std::",
                "core::",
                "alloc::",
                "backtrace::",
                "qscope::",
                "tracing::",
                "__rust",
                "rust_begin_unwind",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            owner_modules_to_include: Vec::new(),
            markers: OrmMarkers::default(),
        }
    }
}

impl ProfilerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = ProfilerConfig::default();

        if let Ok(val) = env::var("QSCOPE_ENABLED") {
            match parse_bool(&val) {
                Ok(parsed) => config.enabled = parsed,
                Err(err) => tracing::warn!(
                    "qscope: {err}, using default: {}",
                    config.enabled
                ),
            }
        }

        if let Ok(val) = env::var("QSCOPE_APP_MODULES_TO_EXCLUDE") {
            config.app_modules_to_exclude = parse_prefix_list(&val);
        }

        if let Ok(val) = env::var("QSCOPE_OWNER_MODULES") {
            config.owner_modules_to_include = parse_prefix_list(&val);
        }

        config
    }

    /// Missing fields keep their defaults. Rust path prefixes such as
    /// `"orm::"` must be quoted: unquoted, YAML reads `orm::` as a mapping.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: ProfilerConfig =
            serde_yaml_ng::from_str(raw).context("parse profiler config")?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("load {}", path.display()))
    }

    /// Get the global configuration instance
    pub fn global() -> &'static ProfilerConfig {
        CONFIG.get_or_init(ProfilerConfig::from_env)
    }
}

fn parse_bool(val: &str) -> std::result::Result<bool, ProfilerError> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ProfilerError::Config(format!(
            "invalid QSCOPE_ENABLED value: {other}"
        ))),
    }
}

fn parse_prefix_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|prefix| !prefix.is_empty())
        .map(String::from)
        .collect()
}
