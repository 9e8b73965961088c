//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// How to treat a provider that has no region assignments at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedProviderPolicy {
    /// No declared service area means no constraint: nobody is outside.
    Unconstrained,
    /// No declared service area means every patient is outside.
    Strict,
}

impl Default for UnassignedProviderPolicy {
    fn default() -> Self {
        Self::Unconstrained
    }
}

impl FromStr for UnassignedProviderPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unconstrained" => Ok(Self::Unconstrained),
            "strict" => Ok(Self::Strict),
            other => Err(ConfigError::InvalidValue {
                key: "CARE_OPS_UNASSIGNED_PROVIDER_POLICY".into(),
                message: format!("expected 'unconstrained' or 'strict', got '{other}'"),
            }),
        }
    }
}

/// Zip reconciliation tuning.
#[derive(Debug, Clone)]
pub struct RegionConfig {
    /// Minimum shared leading characters for a prefix fallback match.
    pub zip_min_prefix_len: usize,
    /// Service-area policy for providers without region assignments.
    pub unassigned_provider_policy: UnassignedProviderPolicy,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            zip_min_prefix_len: 3,
            unassigned_provider_policy: UnassignedProviderPolicy::default(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the libSQL database file.
    pub db_path: PathBuf,
    /// Port for the JSON API.
    pub http_port: u16,
    /// Region matching settings.
    pub regions: RegionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/care-ops.db"),
            http_port: 8080,
            regions: RegionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Build configuration from `CARE_OPS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (env in production,
    /// a map in tests). Unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("CARE_OPS_DB_PATH").filter(|s| !s.trim().is_empty()) {
            config.db_path = PathBuf::from(path);
        }

        if let Some(port) = lookup("CARE_OPS_HTTP_PORT") {
            config.http_port = port.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: "CARE_OPS_HTTP_PORT".into(),
                message: format!("{e}"),
            })?;
        }

        if let Some(len) = lookup("CARE_OPS_ZIP_MIN_PREFIX") {
            let parsed: usize = len.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: "CARE_OPS_ZIP_MIN_PREFIX".into(),
                message: format!("{e}"),
            })?;
            if parsed == 0 || parsed > 5 {
                return Err(ConfigError::InvalidValue {
                    key: "CARE_OPS_ZIP_MIN_PREFIX".into(),
                    message: format!("must be between 1 and 5, got {parsed}"),
                });
            }
            config.regions.zip_min_prefix_len = parsed;
        }

        if let Some(policy) = lookup("CARE_OPS_UNASSIGNED_PROVIDER_POLICY") {
            config.regions.unassigned_provider_policy = policy.parse()?;
        }

        Ok(config)
    }
}
