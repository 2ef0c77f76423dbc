//! Process topology resolution
//!
//! Decides, from a checked-out source tree, which processes an application
//! runs and how it is built. Conventions are tried in order and the first
//! match wins:
//!
//! 1. `Procfile`: one process per `name: command` line
//! 2. Compiled manifest: `go.mod` or `Cargo.toml`
//! 3. Interpreted manifest: `requirements.txt` / `pyproject.toml` or `package.json`
//! 4. Exactly one executable file in `bin/`
//!
//! A `Procfile` always wins over a manifest in the same tree.

use crate::error::{DeployError, Result};
use crate::exec::Invocation;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Python entry points, in lookup order
const PYTHON_ENTRY_POINTS: &[&str] = &["app.py", "main.py", "server.py", "wsgi.py"];

/// Which convention matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavor {
    Procfile,
    Go,
    Cargo,
    Python,
    Node,
    Binary,
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flavor::Procfile => write!(f, "Procfile"),
            Flavor::Go => write!(f, "Go"),
            Flavor::Cargo => write!(f, "Cargo"),
            Flavor::Python => write!(f, "Python"),
            Flavor::Node => write!(f, "Node.js"),
            Flavor::Binary => write!(f, "binary"),
        }
    }
}

/// Process declared by the source tree, before ports are assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDecl {
    pub name: String,
    pub command: String,
    pub primary: bool,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub flavor: Flavor,
    pub processes: Vec<ProcessDecl>,
    /// Install and build steps, run in order in the application directory
    pub install_steps: Vec<Invocation>,
}

impl Topology {
    /// Resolve the topology of the tree at `dir`. `app_name` names the
    /// binary of compiled Go applications.
    pub fn resolve(dir: &Path, app_name: &str) -> Result<Self> {
        debug!(path = %dir.display(), "Resolving process topology");

        let mut topology = if dir.join("Procfile").is_file() {
            Self::single_flavor(Flavor::Procfile, parse_procfile(dir)?, Vec::new())
        } else if dir.join("go.mod").is_file() {
            let binary = format!("bin/{}", app_name);
            Self::single_flavor(
                Flavor::Go,
                vec![web(&format!("./{}", binary))],
                vec![Invocation::new("go").args(["build", "-o", binary.as_str(), "."])],
            )
        } else if dir.join("Cargo.toml").is_file() {
            let package = cargo_package_name(dir)?;
            Self::single_flavor(
                Flavor::Cargo,
                vec![web(&format!("./target/release/{}", package))],
                vec![Invocation::new("cargo").args(["build", "--release"])],
            )
        } else if dir.join("requirements.txt").is_file() || dir.join("pyproject.toml").is_file() {
            Self::python(dir)?
        } else if dir.join("package.json").is_file() {
            Self::node(dir)?
        } else if let Some(binary) = single_executable(&dir.join("bin"))? {
            Self::single_flavor(
                Flavor::Binary,
                vec![web(&format!("./bin/{}", binary))],
                Vec::new(),
            )
        } else {
            return Err(DeployError::UnrecognizedApplication(
                "no Procfile, manifest or bin/ executable found".to_string(),
            ));
        };

        // The application's own install script runs after the convention's steps
        if dir.join("install.sh").is_file() {
            topology
                .install_steps
                .push(Invocation::new("sh").arg("install.sh"));
        }

        info!(
            flavor = %topology.flavor,
            processes = topology.processes.len(),
            "Topology resolved"
        );
        Ok(topology)
    }

    fn single_flavor(
        flavor: Flavor,
        processes: Vec<ProcessDecl>,
        install_steps: Vec<Invocation>,
    ) -> Self {
        Self {
            flavor,
            processes,
            install_steps,
        }
    }

    fn python(dir: &Path) -> Result<Self> {
        let entry = PYTHON_ENTRY_POINTS
            .iter()
            .find(|name| dir.join(name).is_file())
            .ok_or_else(|| {
                DeployError::UnrecognizedApplication(format!(
                    "Python manifest found but no entry point ({})",
                    PYTHON_ENTRY_POINTS.join(", ")
                ))
            })?;

        let mut steps = vec![Invocation::new("python3").args(["-m", "venv", ".venv"])];
        if dir.join("requirements.txt").is_file() {
            steps.push(Invocation::new(".venv/bin/pip").args(["install", "-r", "requirements.txt"]));
        } else {
            steps.push(Invocation::new(".venv/bin/pip").args(["install", "."]));
        }

        Ok(Self::single_flavor(
            Flavor::Python,
            vec![web(&format!(".venv/bin/python {}", entry))],
            steps,
        ))
    }

    fn node(dir: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(dir.join("package.json"))?;
        let pkg: serde_json::Value = serde_json::from_str(&content).map_err(|e| {
            DeployError::UnrecognizedApplication(format!("invalid package.json: {}", e))
        })?;

        // `npm start` falls back to `node server.js` when no start script exists
        let has_start = pkg
            .get("scripts")
            .and_then(|s| s.get("start"))
            .and_then(|s| s.as_str())
            .is_some();
        if !has_start && !dir.join("server.js").is_file() {
            return Err(DeployError::UnrecognizedApplication(
                "package.json has no start script and there is no server.js".to_string(),
            ));
        }

        Ok(Self::single_flavor(
            Flavor::Node,
            vec![web("npm start")],
            vec![Invocation::new("npm").arg("install")],
        ))
    }
}

fn web(command: &str) -> ProcessDecl {
    ProcessDecl {
        name: "web".to_string(),
        command: command.to_string(),
        primary: true,
    }
}

/// Parse a Procfile. The first entry is the primary process.
pub fn parse_procfile(dir: &Path) -> Result<Vec<ProcessDecl>> {
    let content = std::fs::read_to_string(dir.join("Procfile"))?;
    let mut processes: Vec<ProcessDecl> = Vec::new();

    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (name, command) = line
            .split_once(':')
            .map(|(n, c)| (n.trim(), c.trim()))
            .filter(|(n, c)| !n.is_empty() && !c.is_empty())
            .ok_or_else(|| {
                DeployError::UnrecognizedApplication(format!(
                    "Procfile line {}: expected 'name: command'",
                    idx + 1
                ))
            })?;

        if !is_valid_process_name(name) {
            return Err(DeployError::UnrecognizedApplication(format!(
                "Procfile line {}: invalid process name '{}'",
                idx + 1,
                name
            )));
        }
        if processes.iter().any(|p| p.name == name) {
            return Err(DeployError::UnrecognizedApplication(format!(
                "Procfile line {}: duplicate process '{}'",
                idx + 1,
                name
            )));
        }

        processes.push(ProcessDecl {
            name: name.to_string(),
            command: command.to_string(),
            primary: processes.is_empty(),
        });
    }

    if processes.is_empty() {
        return Err(DeployError::UnrecognizedApplication(
            "Procfile declares no processes".to_string(),
        ));
    }

    debug!(count = processes.len(), "Parsed Procfile");
    Ok(processes)
}

/// Process names end up in unit file names
fn is_valid_process_name(name: &str) -> bool {
    name.len() <= 32
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
}

fn cargo_package_name(dir: &Path) -> Result<String> {
    #[derive(Deserialize)]
    struct Manifest {
        package: Option<Package>,
    }
    #[derive(Deserialize)]
    struct Package {
        name: String,
    }

    let content = std::fs::read_to_string(dir.join("Cargo.toml"))?;
    let manifest: Manifest = toml::from_str(&content).map_err(|e| {
        DeployError::UnrecognizedApplication(format!("invalid Cargo.toml: {}", e))
    })?;
    manifest.package.map(|p| p.name).ok_or_else(|| {
        DeployError::UnrecognizedApplication("Cargo.toml has no [package] section".to_string())
    })
}

/// Name of the only executable regular file in `dir`, if there is exactly one
fn single_executable(dir: &Path) -> Result<Option<String>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_file() && is_executable(&meta) {
            found.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    if found.len() == 1 {
        Ok(found.pop())
    } else {
        debug!(count = found.len(), "bin/ does not hold exactly one executable");
        Ok(None)
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}
