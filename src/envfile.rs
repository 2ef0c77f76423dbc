//! Typed `.env` parsing
//!
//! The application's `.env` declares ports, resource limits and the
//! pass-through environment. Quoting that cannot be read one way only is
//! rejected with [`DeployError::InvalidEnvFile`] instead of being guessed at.

use crate::error::{DeployError, Result};
use crate::models::ConfigOverrides;
use std::collections::BTreeMap;
use std::path::Path;

/// Keys interpreted by the deployer rather than only passed through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizedKey {
    Port,
    MemoryMax,
    CpuQuota,
    RateLimitAverage,
    RateLimitBurst,
    HealthCheckPath,
    HealthCheckInterval,
}

impl RecognizedKey {
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "PORT" => Some(Self::Port),
            "MEMORY_MAX" | "MEMORY_LIMIT" => Some(Self::MemoryMax),
            "CPU_QUOTA" => Some(Self::CpuQuota),
            "RATE_LIMIT_AVERAGE" => Some(Self::RateLimitAverage),
            "RATE_LIMIT_BURST" => Some(Self::RateLimitBurst),
            "HEALTH_CHECK_PATH" => Some(Self::HealthCheckPath),
            "HEALTH_CHECK_INTERVAL" => Some(Self::HealthCheckInterval),
            _ => None,
        }
    }
}

/// Key under which a secondary process declares its port
pub fn process_port_key(process: &str) -> String {
    format!("PORT_{}", process.to_ascii_uppercase().replace('-', "_"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    vars: BTreeMap<String, String>,
    lines: BTreeMap<String, usize>,
}

impl EnvFile {
    /// Load `<dir>/.env`; a missing file is an empty environment
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(".env");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut env = Self::default();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line).trim_start();

            let Some((key, value)) = line.split_once('=') else {
                return Err(invalid(line_no, "expected KEY=VALUE"));
            };
            let key = key.trim();
            if !is_valid_key(key) {
                return Err(invalid(line_no, &format!("invalid key '{}'", key)));
            }

            let value = parse_value(value.trim(), line_no)?;
            env.vars.insert(key.to_string(), value);
            env.lines.insert(key.to_string(), line_no);
        }

        Ok(env)
    }

    /// Apply operator overrides on top of the file's values
    pub fn overlay(&mut self, overrides: &BTreeMap<String, String>) {
        for (key, value) in overrides {
            self.vars.insert(key.clone(), value.clone());
            self.lines.insert(key.clone(), 0);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Port declared for the primary process (`PORT`)
    pub fn port(&self) -> Result<Option<u16>> {
        self.port_value("PORT")
    }

    /// Port declared for a secondary process (`PORT_<PROCESS>`)
    pub fn process_port(&self, process: &str) -> Result<Option<u16>> {
        self.port_value(&process_port_key(process))
    }

    fn port_value(&self, key: &str) -> Result<Option<u16>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        match raw.parse::<u16>() {
            Ok(port) if port > 0 => Ok(Some(port)),
            _ => Err(self.bad_value(key, "must be a TCP port between 1 and 65535")),
        }
    }

    /// Resource and routing overrides declared by the application
    pub fn overrides(&self) -> Result<ConfigOverrides> {
        let mut overrides = ConfigOverrides::default();

        for (key, value) in &self.vars {
            match RecognizedKey::parse(key) {
                Some(RecognizedKey::MemoryMax) => overrides.memory_max = Some(value.clone()),
                Some(RecognizedKey::CpuQuota) => overrides.cpu_quota = Some(value.clone()),
                Some(RecognizedKey::RateLimitAverage) => {
                    overrides.rate_limit_average = Some(self.number(key)?)
                }
                Some(RecognizedKey::RateLimitBurst) => {
                    overrides.rate_limit_burst = Some(self.number(key)?)
                }
                Some(RecognizedKey::HealthCheckPath) => {
                    if !value.starts_with('/') {
                        return Err(self.bad_value(key, "must start with '/'"));
                    }
                    overrides.health_check_path = Some(value.clone())
                }
                Some(RecognizedKey::HealthCheckInterval) => {
                    let secs = value.strip_suffix('s').unwrap_or(value);
                    let secs: u64 = secs
                        .parse()
                        .map_err(|_| self.bad_value(key, "must be a number of seconds"))?;
                    overrides.health_check_interval_secs = Some(secs)
                }
                Some(RecognizedKey::Port) | None => {}
            }
        }

        Ok(overrides)
    }

    /// Variables passed through to every process. Port declarations are
    /// excluded; each unit sets its own `PORT`.
    pub fn passthrough(&self) -> BTreeMap<String, String> {
        self.vars
            .iter()
            .filter(|(k, _)| k.as_str() != "PORT" && !k.starts_with("PORT_"))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn number<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        self.get(key)
            .unwrap_or_default()
            .parse()
            .map_err(|_| self.bad_value(key, "must be a non-negative integer"))
    }

    fn bad_value(&self, key: &str, reason: &str) -> DeployError {
        let line = self.lines.get(key).copied().unwrap_or(0);
        invalid(line, &format!("{} {}", key, reason))
    }
}

fn invalid(line: usize, reason: &str) -> DeployError {
    DeployError::InvalidEnvFile {
        line,
        reason: reason.to_string(),
    }
}

pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_value(value: &str, line: usize) -> Result<String> {
    if let Some(rest) = value.strip_prefix('"') {
        let mut out = String::new();
        let mut chars = rest.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, c @ ('"' | '\\' | '$'))) => out.push(c),
                    Some((_, other)) => {
                        return Err(invalid(line, &format!("unknown escape '\\{}'", other)))
                    }
                    None => return Err(invalid(line, "unterminated double quote")),
                },
                '"' => {
                    check_trailing(&rest[i + 1..], line)?;
                    return Ok(out);
                }
                c => out.push(c),
            }
        }
        return Err(invalid(line, "unterminated double quote"));
    }

    if let Some(rest) = value.strip_prefix('\'') {
        let Some(end) = rest.find('\'') else {
            return Err(invalid(line, "unterminated single quote"));
        };
        check_trailing(&rest[end + 1..], line)?;
        return Ok(rest[..end].to_string());
    }

    // Unquoted: an inline comment needs whitespace before '#'
    let value = match value.find(" #") {
        Some(pos) => value[..pos].trim_end(),
        None => value,
    };
    if value.contains('"') || value.contains('\'') {
        return Err(invalid(line, "quote inside unquoted value"));
    }
    Ok(value.to_string())
}

fn check_trailing(rest: &str, line: usize) -> Result<()> {
    let rest = rest.trim_start();
    if rest.is_empty() || rest.starts_with('#') {
        Ok(())
    } else {
        Err(invalid(line, "unexpected text after closing quote"))
    }
}
