//! Supervisor unit generation
//!
//! One systemd service unit per process, named
//! `hoist-<app>.<process>.service`. Neither app nor process names may
//! contain `.`, so distinct pairs never share a unit name. Output depends only on the record and
//! the operator defaults, so regenerating an unchanged application yields
//! byte-identical files.

use crate::config::{AppDefaults, Config};
use crate::models::{AppRecord, ProcessSpec};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Rendered unit file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitDef {
    /// File name, e.g. `hoist-shop.web.service`
    pub name: String,
    pub process: String,
    pub content: String,
}

pub fn unit_name(app: &str, process: &str) -> String {
    format!("hoist-{}.{}.service", app, process)
}

/// Directory the application's processes run in
pub fn working_dir(apps_dir: &Path, app: &AppRecord) -> PathBuf {
    let root = apps_dir.join(&app.name);
    match &app.source.subfolder {
        Some(sub) => root.join(sub),
        None => root,
    }
}

pub struct UnitGenerator {
    apps_dir: PathBuf,
    defaults: AppDefaults,
    user_mode: bool,
}

impl UnitGenerator {
    pub fn new(config: &Config) -> Self {
        Self {
            apps_dir: config.paths.apps_dir(),
            defaults: config.defaults.clone(),
            user_mode: config.supervisor.user_mode,
        }
    }

    pub fn emit_supervisor_units(&self, app: &AppRecord) -> Vec<UnitDef> {
        app.processes
            .iter()
            .map(|process| UnitDef {
                name: unit_name(&app.name, &process.name),
                process: process.name.clone(),
                content: self.render(app, process),
            })
            .collect()
    }

    fn render(&self, app: &AppRecord, process: &ProcessSpec) -> String {
        let limits = app.config_overrides.resolve(&self.defaults);
        let workdir = working_dir(&self.apps_dir, app);

        let mut env: BTreeMap<&str, String> = app
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        if let Some(port) = process.port {
            env.insert("PORT", port.to_string());
        }
        env.insert("HOIST_APP", app.name.clone());
        env.insert("HOIST_PROCESS", process.name.clone());

        let mut out = String::new();
        out.push_str("# Managed by hoist. Changes are overwritten on the next deploy.\n");
        out.push_str("[Unit]\n");
        let _ = writeln!(out, "Description=hoist {} ({})", app.name, process.name);
        out.push_str("After=network.target\n\n");

        out.push_str("[Service]\n");
        out.push_str("Type=simple\n");
        let _ = writeln!(out, "WorkingDirectory={}", quote(&workdir.to_string_lossy()));
        let _ = writeln!(
            out,
            "ExecStart=/bin/sh -c {}",
            quote(&process.command.replace('$', "$$"))
        );
        for (key, value) in &env {
            let _ = writeln!(out, "Environment={}", quote(&format!("{}={}", key, value)));
        }
        out.push_str("Restart=always\n");
        let _ = writeln!(out, "RestartSec={}", limits.restart_sec);
        let _ = writeln!(out, "MemoryMax={}", limits.memory_max);
        let _ = writeln!(out, "CPUQuota={}", limits.cpu_quota);
        out.push('\n');

        out.push_str("[Install]\n");
        let target = if self.user_mode {
            "default.target"
        } else {
            "multi-user.target"
        };
        let _ = writeln!(out, "WantedBy={}", target);
        out
    }
}

/// Double-quote a value for a unit file. `%` is doubled so systemd does
/// not read it as a specifier.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '%' => out.push_str("%%"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConfigOverrides, SourceRef};
    use chrono::Utc;
    use std::path::Path;

    fn app() -> AppRecord {
        let mut env = BTreeMap::new();
        env.insert("ZED".to_string(), "last".to_string());
        env.insert("API_KEY".to_string(), "s3cr\"t".to_string());
        AppRecord {
            name: "shop".to_string(),
            source: SourceRef::new("repo", "main"),
            processes: vec![
                ProcessSpec {
                    name: "web".to_string(),
                    command: "./server --port $PORT".to_string(),
                    port: Some(10500),
                    primary: true,
                },
                ProcessSpec {
                    name: "worker".to_string(),
                    command: "./worker".to_string(),
                    port: None,
                    primary: false,
                },
            ],
            config_overrides: ConfigOverrides {
                memory_max: Some("1G".to_string()),
                ..Default::default()
            },
            env,
            overrides: BTreeMap::new(),
            revision: None,
            created_at: Utc::now(),
            last_deployed_at: None,
            backup_ref: None,
        }
    }

    fn generator() -> UnitGenerator {
        UnitGenerator::new(&Config::rooted_at(Path::new("/srv")))
    }

    #[test]
    fn test_one_unit_per_process() {
        let units = generator().emit_supervisor_units(&app());
        let names: Vec<&str> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["hoist-shop.web.service", "hoist-shop.worker.service"]);
    }

    #[test]
    fn test_unit_names_do_not_collide_across_dashes() {
        assert_ne!(unit_name("a", "b-web"), unit_name("a-b", "web"));
        assert_eq!(unit_name("a-b", "web"), "hoist-a-b.web.service");
    }

    #[test]
    fn test_web_unit_content() {
        let units = generator().emit_supervisor_units(&app());
        let web = &units[0].content;

        assert!(web.contains("WorkingDirectory=\"/srv/state/apps/shop\"\n"));
        assert!(web.contains("ExecStart=/bin/sh -c \"./server --port $$PORT\"\n"));
        assert!(web.contains("Environment=\"PORT=10500\"\n"));
        assert!(web.contains("Environment=\"API_KEY=s3cr\\\"t\"\n"));
        assert!(web.contains("Restart=always\n"));
        assert!(web.contains("MemoryMax=1G\n"));
        assert!(web.contains("CPUQuota=100%\n"));
        assert!(web.contains("WantedBy=default.target\n"));
    }

    #[test]
    fn test_environment_sorted() {
        let units = generator().emit_supervisor_units(&app());
        let keys: Vec<&str> = units[0]
            .content
            .lines()
            .filter_map(|l| l.strip_prefix("Environment=\""))
            .map(|l| l.split('=').next().unwrap())
            .collect();
        assert_eq!(keys, vec!["API_KEY", "HOIST_APP", "HOIST_PROCESS", "PORT", "ZED"]);
    }

    #[test]
    fn test_worker_has_no_port() {
        let units = generator().emit_supervisor_units(&app());
        assert!(!units[1].content.contains("PORT="));
        assert!(units[1].content.contains("Environment=\"HOIST_PROCESS=worker\"\n"));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let a = generator().emit_supervisor_units(&app());
        let b = generator().emit_supervisor_units(&app());
        assert_eq!(a, b);
    }

    #[test]
    fn test_subfolder_working_dir() {
        let mut app = app();
        app.source.subfolder = Some("services/api".to_string());
        let units = generator().emit_supervisor_units(&app);
        assert!(units[0]
            .content
            .contains("WorkingDirectory=\"/srv/state/apps/shop/services/api\"\n"));
    }

    #[test]
    fn test_quote_escapes_specifiers() {
        assert_eq!(quote("100%"), "\"100%%\"");
        assert_eq!(quote("a\\b\nc"), "\"a\\\\b\\nc\"");
    }
}
