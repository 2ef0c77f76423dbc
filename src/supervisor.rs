//! Process supervisor interface
//!
//! The engine drives processes only through [`Supervisor`]. Production uses
//! [`SystemdSupervisor`], which writes unit files into the configured unit
//! directory and shells out to `systemctl` and `journalctl`.

use crate::config::SupervisorConfig;
use crate::exec::{self, Invocation};
use crate::fsutil;
use crate::units::UnitDef;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Install or replace a unit definition (atomically)
    async fn write_unit(&self, unit: &UnitDef) -> Result<()>;

    /// Delete a unit definition; missing units are not an error
    async fn remove_unit(&self, unit: &str) -> Result<()>;

    /// Units currently installed for `app`
    async fn units_for_app(&self, app: &str) -> Result<Vec<String>>;

    /// App named by an installed unit's `HOIST_APP` line, if the unit exists
    async fn unit_owner(&self, unit: &str) -> Result<Option<String>>;

    /// Make the supervisor pick up written or removed units
    async fn reload(&self) -> Result<()>;

    async fn enable(&self, unit: &str) -> Result<()>;

    async fn disable(&self, unit: &str) -> Result<()>;

    async fn start(&self, unit: &str) -> Result<()>;

    async fn stop(&self, unit: &str) -> Result<()>;

    async fn restart(&self, unit: &str) -> Result<()>;

    async fn is_running(&self, unit: &str) -> Result<bool>;

    /// Most recent log lines across `units`
    async fn logs(&self, units: &[String], lines: usize) -> Result<String>;
}

pub struct SystemdSupervisor {
    unit_dir: PathBuf,
    user_mode: bool,
}

impl SystemdSupervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            unit_dir: config.unit_dir.clone(),
            user_mode: config.user_mode,
        }
    }

    fn systemctl(&self) -> Invocation {
        let inv = Invocation::new("systemctl");
        if self.user_mode {
            inv.arg("--user")
        } else {
            inv
        }
    }

    async fn systemctl_checked(&self, verb: &str, unit: &str) -> Result<()> {
        let inv = self.systemctl().args([verb, unit]);
        exec::run_checked(&inv)
            .await
            .with_context(|| format!("systemctl {} {}", verb, unit))?;
        debug!(unit = %unit, verb, "systemctl ok");
        Ok(())
    }
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
    async fn write_unit(&self, unit: &UnitDef) -> Result<()> {
        let path = self.unit_dir.join(&unit.name);
        fsutil::write_atomic(&path, unit.content.as_bytes())?;
        debug!(unit = %unit.name, path = %path.display(), "Unit written");
        Ok(())
    }

    async fn remove_unit(&self, unit: &str) -> Result<()> {
        if fsutil::remove_file_if_exists(&self.unit_dir.join(unit))? {
            debug!(unit = %unit, "Unit removed");
        }
        Ok(())
    }

    async fn units_for_app(&self, app: &str) -> Result<Vec<String>> {
        if !self.unit_dir.is_dir() {
            return Ok(Vec::new());
        }

        let prefix = format!("hoist-{}.", app);
        let mut units = Vec::new();
        for entry in std::fs::read_dir(&self.unit_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(&prefix) || !name.ends_with(".service") {
                continue;
            }
            let content = std::fs::read_to_string(entry.path()).unwrap_or_default();
            if owner_of(&content) == Some(app) {
                units.push(name);
            }
        }
        units.sort();
        Ok(units)
    }

    async fn unit_owner(&self, unit: &str) -> Result<Option<String>> {
        let path = self.unit_dir.join(unit);
        if !path.is_file() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(owner_of(&content).map(str::to_string))
    }

    async fn reload(&self) -> Result<()> {
        exec::run_checked(&self.systemctl().arg("daemon-reload"))
            .await
            .context("systemctl daemon-reload")?;
        Ok(())
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        self.systemctl_checked("enable", unit).await
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        self.systemctl_checked("disable", unit).await
    }

    async fn start(&self, unit: &str) -> Result<()> {
        info!(unit = %unit, "Starting");
        self.systemctl_checked("start", unit).await
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        info!(unit = %unit, "Stopping");
        self.systemctl_checked("stop", unit).await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        info!(unit = %unit, "Restarting");
        self.systemctl_checked("restart", unit).await
    }

    async fn is_running(&self, unit: &str) -> Result<bool> {
        let out = exec::run(&self.systemctl().args(["is-active", "--quiet", unit])).await?;
        Ok(out.success())
    }

    async fn logs(&self, units: &[String], lines: usize) -> Result<String> {
        let mut inv = Invocation::new("journalctl");
        if self.user_mode {
            inv = inv.arg("--user");
        }
        for unit in units {
            inv = inv.args(["-u", unit.as_str()]);
        }
        let count = lines.to_string();
        inv = inv.args(["-n", count.as_str(), "--no-pager", "-o", "short-iso"]);

        let out = exec::run_checked(&inv).await.context("journalctl")?;
        Ok(out.stdout)
    }
}

/// Value of the `HOIST_APP` environment line in a rendered unit
pub fn owner_of(content: &str) -> Option<&str> {
    content.lines().find_map(|l| {
        l.strip_prefix("Environment=\"HOIST_APP=")
            .and_then(|rest| rest.strip_suffix('"'))
    })
}
