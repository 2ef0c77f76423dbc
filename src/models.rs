//! Application data model

use crate::config::AppDefaults;
use crate::error::{DeployError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where an application's code comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub repository: String,
    pub branch: String,
    /// Subdirectory of the repository holding the application
    pub subfolder: Option<String>,
}

impl SourceRef {
    pub fn new(repository: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            branch: branch.into(),
            subfolder: None,
        }
    }

    pub fn with_subfolder(mut self, subfolder: impl Into<String>) -> Self {
        let subfolder = subfolder.into();
        let trimmed = subfolder.trim_matches('/');
        self.subfolder = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    /// Reject a subfolder that could leave the checkout: absolute paths and
    /// `.`/`..` components
    pub fn validate(&self) -> Result<()> {
        let Some(sub) = &self.subfolder else {
            return Ok(());
        };
        let path = std::path::Path::new(sub);
        let escapes = path.is_absolute()
            || path
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
            || sub.split('/').any(|part| part.is_empty() || part == "." || part == "..");
        if escapes {
            return Err(DeployError::SourceFetchFailed(format!(
                "subfolder '{}' must be a relative path inside the repository",
                sub
            )));
        }
        Ok(())
    }
}

/// One supervised process of an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    pub port: Option<u16>,
    /// The primary process receives proxied traffic
    pub primary: bool,
}

/// Per-application overrides; unset fields fall back to operator defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOverrides {
    pub memory_max: Option<String>,
    pub cpu_quota: Option<String>,
    pub rate_limit_average: Option<u32>,
    pub rate_limit_burst: Option<u32>,
    pub health_check_path: Option<String>,
    pub health_check_interval_secs: Option<u64>,
}

/// Overrides with every default filled in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub memory_max: String,
    pub cpu_quota: String,
    pub rate_limit_average: u32,
    pub rate_limit_burst: u32,
    pub health_check_path: String,
    pub health_check_interval_secs: u64,
    pub restart_sec: u64,
}

impl ConfigOverrides {
    pub fn resolve(&self, defaults: &AppDefaults) -> EffectiveLimits {
        EffectiveLimits {
            memory_max: self
                .memory_max
                .clone()
                .unwrap_or_else(|| defaults.memory_max.clone()),
            cpu_quota: self
                .cpu_quota
                .clone()
                .unwrap_or_else(|| defaults.cpu_quota.clone()),
            rate_limit_average: self
                .rate_limit_average
                .unwrap_or(defaults.rate_limit_average),
            rate_limit_burst: self.rate_limit_burst.unwrap_or(defaults.rate_limit_burst),
            health_check_path: self
                .health_check_path
                .clone()
                .unwrap_or_else(|| defaults.health_check_path.clone()),
            health_check_interval_secs: self
                .health_check_interval_secs
                .unwrap_or(defaults.health_check_interval_secs),
            restart_sec: defaults.restart_sec,
        }
    }
}

/// A registered application, as persisted in the metadata store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub name: String,
    pub source: SourceRef,
    pub processes: Vec<ProcessSpec>,
    #[serde(default)]
    pub config_overrides: ConfigOverrides,
    /// Environment injected into every process (`.env` plus operator overrides)
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Operator-set variables, re-applied on every update
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    pub revision: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub backup_ref: Option<String>,
}

impl AppRecord {
    pub fn primary(&self) -> Option<&ProcessSpec> {
        self.processes.iter().find(|p| p.primary)
    }

    /// Port the proxy routes to, if the primary process listens
    pub fn primary_port(&self) -> Option<u16> {
        self.primary().and_then(|p| p.port)
    }

    /// All ports claimed by this application
    pub fn ports(&self) -> Vec<u16> {
        self.processes.iter().filter_map(|p| p.port).collect()
    }
}

/// Live status of one process, derived from the supervisor and a TCP probe
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub process: String,
    pub unit: String,
    pub running: bool,
    pub port: Option<u16>,
    /// `None` when the process has no port
    pub listening: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub revision: Option<String>,
    pub last_deployed_at: Option<DateTime<Utc>>,
    pub processes: Vec<ProcessStatus>,
}

impl AppStatus {
    pub fn summary(&self) -> &'static str {
        let running = self.processes.iter().filter(|p| p.running).count();
        if self.processes.is_empty() || running == 0 {
            "stopped"
        } else if running == self.processes.len() {
            "running"
        } else {
            "degraded"
        }
    }
}

/// Check that `name` is a DNS label: lowercase alphanumerics and hyphens,
/// 1 to 63 characters, no leading or trailing hyphen
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| DeployError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if name.len() > 63 {
        return Err(invalid("name must be at most 63 characters"));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(invalid(
            "only lowercase letters, digits and hyphens are allowed",
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("name must not start or end with a hyphen"));
    }
    Ok(())
}
