use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Operator configuration, loaded from `$HOIST_CONFIG` or `~/.hoist/config.toml`
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,

    /// Reverse proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Process supervisor settings
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Port allocation range
    #[serde(default)]
    pub ports: PortsConfig,

    /// Defaults for per-application overrides
    #[serde(default)]
    pub defaults: AppDefaults,

    #[serde(default)]
    pub autopull: AutopullConfig,

    #[serde(default)]
    pub locks: LocksConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Root for the database, working trees, backups and locks
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
        }
    }
}

impl PathsConfig {
    pub fn database(&self) -> PathBuf {
        self.state_dir.join("hoist.db")
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.state_dir.join("apps")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Applications are routed at `<name>.<base_domain>`
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Directory watched by the proxy for route files
    #[serde(default = "default_routes_dir")]
    pub routes_dir: PathBuf,

    /// Proxy entry point that terminates TLS
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    /// Certificate resolver used for TLS termination
    #[serde(default = "default_cert_resolver")]
    pub cert_resolver: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            base_domain: default_base_domain(),
            routes_dir: default_routes_dir(),
            entry_point: default_entry_point(),
            cert_resolver: default_cert_resolver(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Directory the supervisor loads unit definitions from
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,

    /// Drive the per-user supervisor instance (`systemctl --user`)
    #[serde(default = "default_user_mode")]
    pub user_mode: bool,

    /// Time to wait after start before checking the process is still running
    #[serde(default = "default_start_grace_ms")]
    pub start_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            unit_dir: default_unit_dir(),
            user_mode: default_user_mode(),
            start_grace_ms: default_start_grace_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn start_grace(&self) -> Duration {
        Duration::from_millis(self.start_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortsConfig {
    #[serde(default = "default_port_min")]
    pub min: u16,

    #[serde(default = "default_port_max")]
    pub max: u16,

    /// Random probes before giving up with PortExhausted
    #[serde(default = "default_port_attempts")]
    pub max_attempts: u32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: default_port_min(),
            max: default_port_max(),
            max_attempts: default_port_attempts(),
        }
    }
}

/// Defaults applied when an application leaves an override unset
#[derive(Debug, Deserialize, Clone)]
pub struct AppDefaults {
    /// Memory ceiling (systemd `MemoryMax` syntax, e.g. "512M")
    #[serde(default = "default_memory_max")]
    pub memory_max: String,

    /// CPU quota (systemd `CPUQuota` syntax, e.g. "100%")
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: String,

    #[serde(default = "default_rate_limit_average")]
    pub rate_limit_average: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Delay before the supervisor restarts a crashed process
    #[serde(default = "default_restart_sec")]
    pub restart_sec: u64,
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            memory_max: default_memory_max(),
            cpu_quota: default_cpu_quota(),
            rate_limit_average: default_rate_limit_average(),
            rate_limit_burst: default_rate_limit_burst(),
            health_check_path: default_health_check_path(),
            health_check_interval_secs: default_health_check_interval(),
            restart_sec: default_restart_sec(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AutopullConfig {
    #[serde(default = "default_autopull_interval")]
    pub interval_secs: u64,
}

impl Default for AutopullConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_autopull_interval(),
        }
    }
}

impl AutopullConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocksConfig {
    /// Bounded wait for a per-application lock before failing with Busy
    #[serde(default = "default_lock_timeout")]
    pub timeout_secs: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout(),
        }
    }
}

impl LocksConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// Default value functions
fn home_dir() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_state_dir() -> PathBuf {
    home_dir().join(".hoist")
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

fn default_routes_dir() -> PathBuf {
    home_dir().join(".hoist").join("routes")
}

fn default_entry_point() -> String {
    "websecure".to_string()
}

fn default_cert_resolver() -> String {
    "letsencrypt".to_string()
}

fn default_unit_dir() -> PathBuf {
    home_dir().join(".config").join("systemd").join("user")
}

fn default_user_mode() -> bool {
    true
}

fn default_start_grace_ms() -> u64 {
    1000
}

fn default_port_min() -> u16 {
    10001
}

fn default_port_max() -> u16 {
    59999
}

fn default_port_attempts() -> u32 {
    64
}

fn default_memory_max() -> String {
    "512M".to_string()
}

fn default_cpu_quota() -> String {
    "100%".to_string()
}

fn default_rate_limit_average() -> u32 {
    100 // requests per second
}

fn default_rate_limit_burst() -> u32 {
    50
}

fn default_health_check_path() -> String {
    "/".to_string()
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_restart_sec() -> u64 {
    5
}

fn default_autopull_interval() -> u64 {
    300 // 5 minutes
}

fn default_lock_timeout() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$HOIST_CONFIG`, else `~/.hoist/config.toml`, else defaults
    pub fn load_default() -> anyhow::Result<Self> {
        let path = std::env::var_os("HOIST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".hoist").join("config.toml"));

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ports.min == 0 || self.ports.min > self.ports.max {
            errors.push(format!(
                "ports: invalid range {}-{}",
                self.ports.min, self.ports.max
            ));
        }
        if self.ports.max_attempts == 0 {
            errors.push("ports: max_attempts must be greater than 0".to_string());
        }
        if self.proxy.base_domain.trim().is_empty() {
            errors.push("proxy: base_domain must not be empty".to_string());
        }
        if self.autopull.interval_secs == 0 {
            errors.push("autopull: interval_secs must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Configuration rooted entirely under one directory (tests, sandboxes)
    pub fn rooted_at(root: &Path) -> Self {
        let mut config = Self::default();
        config.paths.state_dir = root.join("state");
        config.proxy.routes_dir = root.join("routes");
        config.supervisor.unit_dir = root.join("units");
        config.supervisor.start_grace_ms = 0;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[paths]
state_dir = "/var/lib/hoist"

[proxy]
base_domain = "apps.example.com"
routes_dir = "/etc/traefik/dynamic"

[supervisor]
user_mode = false
unit_dir = "/etc/systemd/system"

[ports]
min = 20000
max = 21000

[defaults]
memory_max = "1G"
rate_limit_average = 20

[autopull]
interval_secs = 60
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.paths.database(), PathBuf::from("/var/lib/hoist/hoist.db"));
        assert_eq!(config.proxy.base_domain, "apps.example.com");
        assert!(!config.supervisor.user_mode);
        assert_eq!(config.ports.min, 20000);
        assert_eq!(config.ports.max_attempts, 64);
        assert_eq!(config.defaults.memory_max, "1G");
        assert_eq!(config.defaults.rate_limit_average, 20);
        assert_eq!(config.defaults.rate_limit_burst, 50);
        assert_eq!(config.autopull.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.ports.min, 10001);
        assert_eq!(config.ports.max, 59999);
        assert_eq!(config.proxy.base_domain, "localhost");
        assert_eq!(config.proxy.entry_point, "websecure");
        assert_eq!(config.defaults.health_check_path, "/");
        assert_eq!(config.defaults.health_check_interval_secs, 10);
        assert_eq!(config.locks.timeout(), Duration::from_secs(10));
        assert!(config.supervisor.user_mode);
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let config: Config = toml::from_str(
            r#"
[ports]
min = 30000
max = 20000
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("invalid range"));
    }

    #[test]
    fn test_validate_rejects_empty_domain() {
        let config: Config = toml::from_str(
            r#"
[proxy]
base_domain = " "
"#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rooted_at() {
        let config = Config::rooted_at(Path::new("/tmp/x"));
        assert_eq!(config.paths.apps_dir(), PathBuf::from("/tmp/x/state/apps"));
        assert_eq!(config.proxy.routes_dir, PathBuf::from("/tmp/x/routes"));
        assert_eq!(config.supervisor.unit_dir, PathBuf::from("/tmp/x/units"));
    }
}
