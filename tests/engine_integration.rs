//! End-to-end tests for the deployment engine
//!
//! Drives the engine against a recording supervisor and a source control
//! that copies plain directories, covering:
//! - Fresh add and name uniqueness
//! - Declared-port conflicts
//! - Rollback of a failed update, including a process that will not start
//! - Multi-process fan-out and unit ownership between similarly named apps
//! - Subfolders that point outside the checkout
//! - Removal and restore on re-add
//! - Atomicity of add
//! - Idempotent generation
//! - Locking and reconciliation of interrupted runs
//! - Autopull

use async_trait::async_trait;
use hoist::autopull::Poller;
use hoist::config::Config;
use hoist::db::{Database, OperationKind};
use hoist::engine::Engine;
use hoist::error::{DeployError, ErrorKind};
use hoist::fsutil;
use hoist::git::SourceControl;
use hoist::lock::AppLock;
use hoist::models::SourceRef;
use hoist::supervisor::{owner_of, Supervisor};
use hoist::units::UnitDef;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

// ============================================================================
// Test Doubles
// ============================================================================

/// Keeps unit files in memory and tracks which units are running
#[derive(Default)]
struct RecordingSupervisor {
    units: Mutex<BTreeMap<String, String>>,
    running: Mutex<BTreeSet<String>>,
    /// Units whose start or restart fails
    refused: Mutex<BTreeSet<String>>,
}

impl RecordingSupervisor {
    fn refuse_start(&self, name: &str) {
        self.refused.lock().insert(name.to_string());
    }

    fn allow_start(&self, name: &str) {
        self.refused.lock().remove(name);
    }

    fn unit(&self, name: &str) -> Option<String> {
        self.units.lock().get(name).cloned()
    }

    fn unit_names(&self) -> Vec<String> {
        self.units.lock().keys().cloned().collect()
    }

    fn is_up(&self, name: &str) -> bool {
        self.running.lock().contains(name)
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.units.lock().clone()
    }
}

#[async_trait]
impl Supervisor for RecordingSupervisor {
    async fn write_unit(&self, unit: &UnitDef) -> anyhow::Result<()> {
        self.units
            .lock()
            .insert(unit.name.clone(), unit.content.clone());
        Ok(())
    }

    async fn remove_unit(&self, unit: &str) -> anyhow::Result<()> {
        self.units.lock().remove(unit);
        self.running.lock().remove(unit);
        Ok(())
    }

    async fn units_for_app(&self, app: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .units
            .lock()
            .iter()
            .filter(|(_, content)| owner_of(content) == Some(app))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn unit_owner(&self, unit: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .units
            .lock()
            .get(unit)
            .and_then(|content| owner_of(content).map(str::to_string)))
    }

    async fn reload(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn enable(&self, unit: &str) -> anyhow::Result<()> {
        if !self.units.lock().contains_key(unit) {
            anyhow::bail!("Unit {} not found", unit);
        }
        Ok(())
    }

    async fn disable(&self, _unit: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start(&self, unit: &str) -> anyhow::Result<()> {
        if !self.units.lock().contains_key(unit) {
            anyhow::bail!("Unit {} not found", unit);
        }
        if self.refused.lock().contains(unit) {
            anyhow::bail!("Job for {} failed", unit);
        }
        self.running.lock().insert(unit.to_string());
        Ok(())
    }

    async fn stop(&self, unit: &str) -> anyhow::Result<()> {
        self.running.lock().remove(unit);
        Ok(())
    }

    async fn restart(&self, unit: &str) -> anyhow::Result<()> {
        self.start(unit).await
    }

    async fn is_running(&self, unit: &str) -> anyhow::Result<bool> {
        Ok(self.is_up(unit))
    }

    async fn logs(&self, units: &[String], lines: usize) -> anyhow::Result<String> {
        Ok(format!("{} lines from {}\n", lines, units.join(",")))
    }
}

/// Treats the repository as a local directory; the revision lives in its
/// `REVISION` file
struct DirectorySource;

fn read_revision(dir: &Path) -> anyhow::Result<String> {
    Ok(std::fs::read_to_string(dir.join("REVISION"))?.trim().to_string())
}

/// Copy a directory the way a checkout would materialize it
fn copy_tree(from: &Path, to: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(std::fs::read_link(entry.path())?, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl SourceControl for DirectorySource {
    async fn checkout(&self, source: &SourceRef, dest: &Path) -> anyhow::Result<String> {
        let upstream = Path::new(&source.repository);
        if !upstream.is_dir() {
            anyhow::bail!("repository {} not found", source.repository);
        }
        fsutil::remove_dir_if_exists(dest)?;
        copy_tree(upstream, dest)?;
        read_revision(upstream)
    }

    async fn remote_revision(&self, source: &SourceRef) -> anyhow::Result<String> {
        read_revision(Path::new(&source.repository))
    }
}

// ============================================================================
// Test Helpers
// ============================================================================

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    config: Config,
    db: Database,
    supervisor: Arc<RecordingSupervisor>,
    engine: Arc<Engine>,
}

impl Harness {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let mut config = Config::rooted_at(&root);
        config.locks.timeout_secs = 0;

        let db = Database::open_in_memory().unwrap();
        let supervisor = Arc::new(RecordingSupervisor::default());
        let engine = Engine::new(
            config.clone(),
            db.clone(),
            supervisor.clone(),
            Arc::new(DirectorySource),
        );

        Self {
            _tmp: tmp,
            root,
            config,
            db,
            supervisor,
            engine: Arc::new(engine),
        }
    }

    /// Create an upstream repository with `files` at revision `rev`
    fn upstream(&self, name: &str, files: &[(&str, &str)], rev: &str) -> SourceRef {
        let dir = self.root.join("upstream").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        self.push_to(&dir, files, rev);
        SourceRef::new(dir.to_string_lossy(), "main")
    }

    /// Commit `files` on top of the upstream of `source`
    fn push(&self, source: &SourceRef, files: &[(&str, &str)], rev: &str) {
        self.push_to(Path::new(&source.repository), files, rev);
    }

    fn push_to(&self, dir: &Path, files: &[(&str, &str)], rev: &str) {
        for (path, content) in files {
            let path = dir.join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        std::fs::write(dir.join("REVISION"), rev).unwrap();
    }

    fn tree(&self, app: &str) -> PathBuf {
        self.config.paths.apps_dir().join(app)
    }

    fn route(&self, app: &str) -> PathBuf {
        self.config.proxy.routes_dir.join(format!("{}.toml", app))
    }

    /// Nothing of `app` exists anywhere
    fn assert_no_trace(&self, app: &str) {
        assert!(self.db.get_app(app).unwrap().is_none(), "record of {app} left");
        assert!(self.db.get_operation(app).unwrap().is_none(), "journal of {app} left");
        assert!(!self.tree(app).exists(), "tree of {app} left");
        assert!(!self.route(app).exists(), "route of {app} left");
        let prefix = format!("hoist-{}.", app);
        assert!(
            !self.supervisor.unit_names().iter().any(|u| u.starts_with(&prefix)),
            "units of {app} left"
        );
    }
}

fn web_app() -> Vec<(&'static str, &'static str)> {
    vec![("Procfile", "web: ./server\n"), (".env", "GREETING=hello\n")]
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_fresh_add() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");

    let app = h.engine.add("shop", source.clone()).await.unwrap();

    assert_eq!(app.revision.as_deref(), Some("rev1"));
    assert_eq!(app.processes.len(), 1);
    let port = app.primary_port().unwrap();
    assert!((10001..=59999).contains(&port));
    assert!(app.last_deployed_at.is_some());

    let unit = h.supervisor.unit("hoist-shop.web.service").unwrap();
    assert!(unit.contains(&format!("Environment=\"PORT={}\"", port)));
    assert!(unit.contains("Environment=\"GREETING=hello\""));
    assert!(unit.contains("ExecStart=/bin/sh -c \"./server\""));
    assert!(h.supervisor.is_up("hoist-shop.web.service"));

    let route = std::fs::read_to_string(h.route("shop")).unwrap();
    assert!(route.contains(&format!("http://localhost:{}", port)));
    assert!(route.contains("shop.localhost"));

    assert!(h.tree("shop").join("Procfile").is_file());
    assert_eq!(h.db.get_app("shop").unwrap().unwrap(), app);
    assert!(h.db.get_operation("shop").unwrap().is_none());

    let err = h.engine.add("shop", source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NameConflict);
}

#[tokio::test]
async fn test_invalid_name_rejected_before_fetch() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");

    let err = h.engine.add("Shop_1", source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidName);
    assert!(!h.tree("Shop_1").exists());
}

#[tokio::test]
async fn test_declared_port_conflict() {
    let h = Harness::new();
    let alpha = h.upstream(
        "alpha",
        &[("Procfile", "web: ./server\n"), (".env", "PORT=9100\n")],
        "a1",
    );
    let beta = h.upstream(
        "beta",
        &[("Procfile", "web: ./server\n"), (".env", "PORT=9100\n")],
        "b1",
    );

    let app = h.engine.add("alpha", alpha).await.unwrap();
    assert_eq!(app.primary_port(), Some(9100));

    match h.engine.add("beta", beta).await.unwrap_err() {
        DeployError::PortConflict { port, owner } => {
            assert_eq!(port, 9100);
            assert_eq!(owner, "alpha");
        }
        other => panic!("expected PortConflict, got {other:?}"),
    }

    h.assert_no_trace("beta");
    assert!(h.supervisor.is_up("hoist-alpha.web.service"));
}

#[tokio::test]
async fn test_failed_update_rolls_back() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    let before = h.engine.add("shop", source.clone()).await.unwrap();
    let unit_before = h.supervisor.unit("hoist-shop.web.service").unwrap();

    h.push(
        &source,
        &[
            ("Procfile", "web: ./server --v2\n"),
            ("install.sh", "echo building >&2\nexit 1\n"),
        ],
        "rev2",
    );

    let err = h.engine.update("shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstallStepFailed);
    assert!(err.to_string().contains("building"), "{err}");

    let after = h.db.get_app("shop").unwrap().unwrap();
    assert_eq!(after.revision.as_deref(), Some("rev1"));
    assert_eq!(after.primary_port(), before.primary_port());
    assert_eq!(
        std::fs::read_to_string(h.tree("shop").join("Procfile")).unwrap(),
        "web: ./server\n"
    );
    assert!(!h.tree("shop").join("install.sh").exists());
    assert_eq!(h.supervisor.unit("hoist-shop.web.service").unwrap(), unit_before);
    assert!(h.supervisor.is_up("hoist-shop.web.service"));
    assert!(h.db.get_operation("shop").unwrap().is_none());

    let backups = h.engine.backups("shop").unwrap();
    assert_eq!(backups.len(), 1);
    assert_eq!(backups[0].revision.as_deref(), Some("rev1"));
}

#[tokio::test]
async fn test_add_fails_when_process_will_not_start() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    h.supervisor.refuse_start("hoist-shop.web.service");

    let err = h.engine.add("shop", source.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessStartFailed);
    assert!(err.to_string().contains("hoist-shop.web.service"), "{err}");
    h.assert_no_trace("shop");

    h.supervisor.allow_start("hoist-shop.web.service");
    h.engine.add("shop", source).await.unwrap();
    assert!(h.supervisor.is_up("hoist-shop.web.service"));
}

#[tokio::test]
async fn test_update_rolls_back_when_new_process_will_not_start() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    let before = h.engine.add("shop", source.clone()).await.unwrap();
    let unit_before = h.supervisor.unit("hoist-shop.web.service").unwrap();

    h.push(
        &source,
        &[("Procfile", "web: ./server --v2\nworker: ./worker\n")],
        "rev2",
    );
    h.supervisor.refuse_start("hoist-shop.worker.service");

    let err = h.engine.update("shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessStartFailed);

    let after = h.db.get_app("shop").unwrap().unwrap();
    assert_eq!(after.revision.as_deref(), Some("rev1"));
    assert_eq!(after.primary_port(), before.primary_port());
    assert_eq!(after.processes.len(), 1);
    assert_eq!(
        std::fs::read_to_string(h.tree("shop").join("Procfile")).unwrap(),
        "web: ./server\n"
    );
    assert_eq!(h.supervisor.unit_names(), vec!["hoist-shop.web.service"]);
    assert_eq!(h.supervisor.unit("hoist-shop.web.service").unwrap(), unit_before);
    assert!(h.supervisor.is_up("hoist-shop.web.service"));
    assert!(h.db.get_operation("shop").unwrap().is_none());
}

#[tokio::test]
async fn test_successful_update() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    let before = h.engine.add("shop", source.clone()).await.unwrap();

    h.push(&source, &[("Procfile", "web: ./server --v2\n")], "rev2");
    let after = h.engine.update("shop").await.unwrap();

    assert_eq!(after.revision.as_deref(), Some("rev2"));
    assert_eq!(after.primary_port(), before.primary_port());
    assert_eq!(after.created_at, before.created_at);
    assert!(after.backup_ref.is_some());
    assert!(h
        .supervisor
        .unit("hoist-shop.web.service")
        .unwrap()
        .contains("./server --v2"));
}

#[tokio::test]
async fn test_multi_process_fan_out() {
    let h = Harness::new();
    let source = h.upstream(
        "shop",
        &[(
            "Procfile",
            "web: ./server\nworker: ./worker --queue default\n",
        )],
        "rev1",
    );

    let app = h.engine.add("shop", source.clone()).await.unwrap();
    assert_eq!(app.processes.len(), 2);
    let web = &app.processes[0];
    let worker = &app.processes[1];
    assert!(web.primary && web.port.is_some());
    assert!(!worker.primary && worker.port.is_none());

    assert!(h.supervisor.is_up("hoist-shop.web.service"));
    assert!(h.supervisor.is_up("hoist-shop.worker.service"));
    let worker_unit = h.supervisor.unit("hoist-shop.worker.service").unwrap();
    assert!(!worker_unit.contains("Environment=\"PORT="));
    assert!(worker_unit.contains("Environment=\"HOIST_PROCESS=worker\""));

    let route = std::fs::read_to_string(h.route("shop")).unwrap();
    assert_eq!(route.matches("http://localhost:").count(), 1);
    assert!(route.contains(&format!("http://localhost:{}", web.port.unwrap())));

    h.engine.stop("shop").await.unwrap();
    assert!(!h.supervisor.is_up("hoist-shop.web.service"));
    assert!(!h.supervisor.is_up("hoist-shop.worker.service"));

    h.engine.start("shop").await.unwrap();
    let status = h.engine.status("shop").await.unwrap();
    assert_eq!(status.summary(), "running");
    assert_eq!(status.processes.len(), 2);
    assert_eq!(status.processes[1].listening, None);

    // Dropping a process retires its unit
    h.push(&source, &[("Procfile", "web: ./server\n")], "rev2");
    h.engine.update("shop").await.unwrap();
    assert_eq!(h.supervisor.unit_names(), vec!["hoist-shop.web.service"]);
}

#[tokio::test]
async fn test_secondary_declared_port() {
    let h = Harness::new();
    let source = h.upstream(
        "shop",
        &[
            ("Procfile", "web: ./server\nadmin-ui: ./admin\n"),
            (".env", "PORT_ADMIN_UI=9200\n"),
        ],
        "rev1",
    );

    let app = h.engine.add("shop", source).await.unwrap();
    assert_eq!(app.processes[1].port, Some(9200));
    assert!(!app.env.contains_key("PORT_ADMIN_UI"));
    assert!(h
        .supervisor
        .unit("hoist-shop.admin-ui.service")
        .unwrap()
        .contains("Environment=\"PORT=9200\""));
}

#[tokio::test]
async fn test_dashed_names_keep_separate_units() {
    let h = Harness::new();
    let a = h.upstream("a", &[("Procfile", "web: ./server\nb-web: ./admin\n")], "r1");
    let ab = h.upstream("a-b", &[("Procfile", "web: ./other\n")], "r1");

    h.engine.add("a", a).await.unwrap();
    h.engine.add("a-b", ab).await.unwrap();

    assert_eq!(
        h.supervisor.unit_names(),
        vec![
            "hoist-a-b.web.service",
            "hoist-a.b-web.service",
            "hoist-a.web.service"
        ]
    );
    let admin = h.supervisor.unit("hoist-a.b-web.service").unwrap();
    assert!(admin.contains("Environment=\"HOIST_APP=a\""));
    assert!(admin.contains("./admin"));

    h.engine.remove("a-b", true).await.unwrap();
    h.assert_no_trace("a-b");
    assert!(h.supervisor.is_up("hoist-a.web.service"));
    assert!(h.supervisor.is_up("hoist-a.b-web.service"));
    assert_eq!(h.engine.status("a").await.unwrap().summary(), "running");
}

#[tokio::test]
async fn test_unit_owned_by_another_app_is_not_overwritten() {
    let h = Harness::new();
    let foreign = UnitDef {
        name: "hoist-shop.web.service".to_string(),
        process: "web".to_string(),
        content: "Environment=\"HOIST_APP=intruder\"\n".to_string(),
    };
    h.supervisor.write_unit(&foreign).await.unwrap();

    let source = h.upstream("shop", &web_app(), "rev1");
    let err = h.engine.add("shop", source).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConfigWriteFailed);
    assert!(err.to_string().contains("intruder"), "{err}");

    assert_eq!(h.supervisor.unit_names(), vec!["hoist-shop.web.service"]);
    assert_eq!(h.supervisor.unit("hoist-shop.web.service").unwrap(), foreign.content);
    assert!(h.db.get_app("shop").unwrap().is_none());
    assert!(h.db.get_operation("shop").unwrap().is_none());
    assert!(!h.tree("shop").exists());
    assert!(!h.route("shop").exists());
}

#[tokio::test]
async fn test_remove_and_readd_with_restore() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", source.clone()).await.unwrap();

    let vars = BTreeMap::from([
        ("FOO".to_string(), "bar".to_string()),
        ("MEMORY_MAX".to_string(), "1G".to_string()),
    ]);
    let app = h.engine.set_overrides("shop", vars).await.unwrap();
    assert_eq!(app.env.get("FOO").map(String::as_str), Some("bar"));
    let unit = h.supervisor.unit("hoist-shop.web.service").unwrap();
    assert!(unit.contains("MemoryMax=1G"));

    h.engine.remove("shop", false).await.unwrap();
    h.assert_no_trace("shop");

    let saved = h.engine.latest_config_backup("shop").unwrap().unwrap();
    let app = h
        .engine
        .add_with("shop", source.clone(), Some(&saved.id))
        .await
        .unwrap();
    assert_eq!(app.overrides.get("FOO").map(String::as_str), Some("bar"));
    assert!(h
        .supervisor
        .unit("hoist-shop.web.service")
        .unwrap()
        .contains("MemoryMax=1G"));

    h.engine.remove("shop", true).await.unwrap();
    h.assert_no_trace("shop");
    assert!(h.engine.backups("shop").unwrap().is_empty());
}

#[tokio::test]
async fn test_unset_override_restores_env_value() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", source).await.unwrap();

    let vars = BTreeMap::from([("GREETING".to_string(), "bonjour".to_string())]);
    let app = h.engine.set_overrides("shop", vars).await.unwrap();
    assert_eq!(app.env.get("GREETING").map(String::as_str), Some("bonjour"));

    let app = h
        .engine
        .unset_overrides("shop", &["GREETING".to_string()])
        .await
        .unwrap();
    assert!(app.overrides.is_empty());
    assert_eq!(app.env.get("GREETING").map(String::as_str), Some("hello"));

    let bad = BTreeMap::from([("1BAD".to_string(), "x".to_string())]);
    let err = h.engine.set_overrides("shop", bad).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidEnvFile);
}

#[tokio::test]
async fn test_add_is_atomic() {
    let h = Harness::new();

    let unknown = h.upstream("unknown", &[("README.md", "# hi\n")], "r1");
    let err = h.engine.add("unknown", unknown).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnrecognizedApplication);
    h.assert_no_trace("unknown");

    let broken = h.upstream(
        "broken",
        &[("Procfile", "web: ./server\n"), ("install.sh", "exit 3\n")],
        "r1",
    );
    let err = h.engine.add("broken", broken).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstallStepFailed);
    h.assert_no_trace("broken");

    let bad_env = h.upstream(
        "badenv",
        &[("Procfile", "web: ./server\n"), (".env", "A=\"unterminated\n")],
        "r1",
    );
    let err = h.engine.add("badenv", bad_env).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidEnvFile);
    h.assert_no_trace("badenv");

    let missing = SourceRef::new(h.root.join("nowhere").to_string_lossy(), "main");
    let err = h.engine.add("missing", missing).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceFetchFailed);
    h.assert_no_trace("missing");

    let nested = h.upstream("nested", &web_app(), "r1").with_subfolder("services/api");
    let err = h.engine.add("nested", nested).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceFetchFailed);
    h.assert_no_trace("nested");
}

#[tokio::test]
async fn test_subfolder_application() {
    let h = Harness::new();
    let source = h
        .upstream(
            "mono",
            &[("services/api/Procfile", "web: ./api\n")],
            "r1",
        )
        .with_subfolder("services/api");

    h.engine.add("api", source).await.unwrap();
    let unit = h.supervisor.unit("hoist-api.web.service").unwrap();
    let workdir = h.tree("api").join("services/api");
    assert!(unit.contains(&format!("WorkingDirectory=\"{}\"", workdir.display())));
}

#[tokio::test]
async fn test_subfolder_cannot_reach_another_app() {
    let h = Harness::new();
    let shop = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", shop).await.unwrap();

    let evil = h.upstream("evil", &[("README.md", "# hi\n")], "r1").with_subfolder("../shop");
    let err = h.engine.add("evil", evil).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceFetchFailed);
    h.assert_no_trace("evil");

    assert!(h.tree("shop").join("Procfile").is_file());
    assert!(h.supervisor.is_up("hoist-shop.web.service"));
    assert_eq!(h.supervisor.unit_names(), vec!["hoist-shop.web.service"]);
}

#[cfg(unix)]
#[tokio::test]
async fn test_subfolder_symlink_out_of_checkout() {
    let h = Harness::new();
    let shop = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", shop).await.unwrap();

    let evil = h.upstream("evil", &[("README.md", "# hi\n")], "r1");
    std::os::unix::fs::symlink(h.tree("shop"), Path::new(&evil.repository).join("link")).unwrap();

    let err = h
        .engine
        .add("evil", evil.with_subfolder("link"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceFetchFailed);
    assert!(err.to_string().contains("outside"), "{err}");
    h.assert_no_trace("evil");
    assert!(h.tree("shop").join("Procfile").is_file());
}

#[tokio::test]
async fn test_idempotent_generation() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", source).await.unwrap();

    let units = h.supervisor.snapshot();
    let route = std::fs::read_to_string(h.route("shop")).unwrap();

    h.engine.update("shop").await.unwrap();
    assert_eq!(h.supervisor.snapshot(), units);
    assert_eq!(std::fs::read_to_string(h.route("shop")).unwrap(), route);

    h.engine.restart("shop").await.unwrap();
    assert_eq!(h.supervisor.snapshot(), units);
}

// ============================================================================
// Concurrency and recovery
// ============================================================================

#[tokio::test]
async fn test_busy_while_locked() {
    let h = Harness::new();
    let shop = h.upstream("shop", &web_app(), "rev1");
    let other = h.upstream("other", &web_app(), "rev1");
    h.engine.add("shop", shop).await.unwrap();

    let held = AppLock::acquire(&h.config.paths.locks_dir(), "shop", Duration::ZERO)
        .await
        .unwrap();

    let err = h.engine.update("shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);
    let err = h.engine.stop("shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    // Other applications are unaffected
    h.engine.add("other", other).await.unwrap();

    drop(held);
    h.engine.stop("shop").await.unwrap();
}

#[tokio::test]
async fn test_reconcile_interrupted_add() {
    let h = Harness::new();
    h.db.begin_operation("ghost", OperationKind::Add, None).unwrap();
    std::fs::create_dir_all(h.tree("ghost")).unwrap();
    std::fs::write(h.tree("ghost").join("half.txt"), "x").unwrap();
    fsutil::write_atomic(&h.route("ghost"), b"# stale\n").unwrap();
    h.supervisor
        .write_unit(&UnitDef {
            name: "hoist-ghost.web.service".to_string(),
            process: "web".to_string(),
            content: "Environment=\"HOIST_APP=ghost\"\n".to_string(),
        })
        .await
        .unwrap();

    h.engine.reconcile("ghost").await.unwrap();
    h.assert_no_trace("ghost");

    // A later add goes through normally
    let source = h.upstream("ghost", &web_app(), "rev1");
    h.engine.add("ghost", source).await.unwrap();
}

#[tokio::test]
async fn test_reconcile_interrupted_update() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", source).await.unwrap();
    let backup = h.engine.backup("shop").await.unwrap();

    // Simulate a run that died after touching the tree
    h.db.begin_operation("shop", OperationKind::Update, Some(&backup.id))
        .unwrap();
    std::fs::write(h.tree("shop").join("Procfile"), "web: ./half-written\n").unwrap();

    h.engine.reconcile("shop").await.unwrap();
    assert_eq!(
        std::fs::read_to_string(h.tree("shop").join("Procfile")).unwrap(),
        "web: ./server\n"
    );
    assert!(h.db.get_operation("shop").unwrap().is_none());
    assert!(h.supervisor.is_up("hoist-shop.web.service"));
}

#[tokio::test]
async fn test_reconcile_keeps_committed_update() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", source.clone()).await.unwrap();
    h.push(&source, &[("Procfile", "web: ./server --v2\n")], "rev2");
    let updated = h.engine.update("shop").await.unwrap();
    let backup_id = updated.backup_ref.clone().unwrap();

    // Died after the record was written but before the journal was cleared
    h.db.begin_operation("shop", OperationKind::Update, Some(&backup_id))
        .unwrap();

    h.engine.reconcile("shop").await.unwrap();
    let app = h.db.get_app("shop").unwrap().unwrap();
    assert_eq!(app.revision.as_deref(), Some("rev2"));
    assert_eq!(
        std::fs::read_to_string(h.tree("shop").join("Procfile")).unwrap(),
        "web: ./server --v2\n"
    );
    assert!(h
        .supervisor
        .unit("hoist-shop.web.service")
        .unwrap()
        .contains("--v2"));
    assert!(h.db.get_operation("shop").unwrap().is_none());
}

#[tokio::test]
async fn test_reconcile_interrupted_remove() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", source).await.unwrap();

    h.db.begin_operation("shop", OperationKind::Remove, None).unwrap();
    h.engine.reconcile("shop").await.unwrap();

    h.assert_no_trace("shop");
    assert!(h.engine.latest_config_backup("shop").unwrap().is_some());
}

#[tokio::test]
async fn test_missing_backup_needs_repair() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", source).await.unwrap();
    let backup = h.engine.backup("shop").await.unwrap();

    h.db.begin_operation("shop", OperationKind::Update, Some("19700101T000000.000Z"))
        .unwrap();

    let err = h.engine.update("shop").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NeedsRepair);
    let err = h.engine.restore("shop", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NeedsRepair);

    // Naming a snapshot resolves it
    let app = h.engine.restore("shop", Some(&backup.id)).await.unwrap();
    assert_eq!(app.revision.as_deref(), Some("rev1"));
    assert!(h.db.get_operation("shop").unwrap().is_none());
    h.engine.update("shop").await.unwrap();
}

#[tokio::test]
async fn test_restore_previous_revision() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", source.clone()).await.unwrap();
    let first = h.engine.backup("shop").await.unwrap();

    h.push(&source, &[("Procfile", "web: ./server --v2\n")], "rev2");
    h.engine.update("shop").await.unwrap();

    let app = h.engine.restore("shop", Some(&first.id)).await.unwrap();
    assert_eq!(app.revision.as_deref(), Some("rev1"));
    assert_eq!(
        std::fs::read_to_string(h.tree("shop").join("Procfile")).unwrap(),
        "web: ./server\n"
    );
    assert!(!h
        .supervisor
        .unit("hoist-shop.web.service")
        .unwrap()
        .contains("--v2"));

    let err = h.engine.restore("shop", Some("nope")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackupNotFound);
}

#[tokio::test]
async fn test_restore_removed_app_from_full_backup() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    let before = h.engine.add("shop", source).await.unwrap();
    let full = h.engine.backup("shop").await.unwrap();
    h.engine.remove("shop", false).await.unwrap();

    let app = h.engine.restore("shop", Some(&full.id)).await.unwrap();
    assert_eq!(app.primary_port(), before.primary_port());
    assert!(h.tree("shop").join("Procfile").is_file());
    assert!(h.supervisor.is_up("hoist-shop.web.service"));
}

#[tokio::test]
async fn test_logs_and_unknown_app() {
    let h = Harness::new();
    let source = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", source).await.unwrap();

    let logs = h.engine.logs("shop", 20).await.unwrap();
    assert!(logs.contains("hoist-shop.web.service"));

    assert_eq!(
        h.engine.update("nope").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        h.engine.status("nope").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

// ============================================================================
// Autopull
// ============================================================================

#[tokio::test]
async fn test_autopull_updates_moved_branches() {
    let h = Harness::new();
    let shop = h.upstream("shop", &web_app(), "rev1");
    let blog = h.upstream("blog", &web_app(), "rev1");
    h.engine.add("shop", shop.clone()).await.unwrap();
    h.engine.add("blog", blog.clone()).await.unwrap();

    let (_tx, rx) = watch::channel(false);
    let mut poller = Poller::new(h.engine.clone(), Duration::from_secs(3600), rx);

    assert!(poller.poll_once().await.is_empty());

    h.push(&shop, &[("Procfile", "web: ./server --v2\n")], "rev2");
    // A broken upstream is logged and skipped
    std::fs::remove_file(Path::new(&blog.repository).join("REVISION")).unwrap();

    assert_eq!(poller.poll_once().await, vec!["shop".to_string()]);
    poller.drain().await;

    let shop = h.db.get_app("shop").unwrap().unwrap();
    assert_eq!(shop.revision.as_deref(), Some("rev2"));
    let blog = h.db.get_app("blog").unwrap().unwrap();
    assert_eq!(blog.revision.as_deref(), Some("rev1"));

    assert!(poller.poll_once().await.is_empty());
}

#[tokio::test]
async fn test_autopull_leaves_locked_app_for_next_cycle() {
    let h = Harness::new();
    let shop = h.upstream("shop", &web_app(), "rev1");
    h.engine.add("shop", shop.clone()).await.unwrap();

    let (_tx, rx) = watch::channel(false);
    let mut poller = Poller::new(h.engine.clone(), Duration::from_secs(3600), rx);
    h.push(&shop, &[("Procfile", "web: ./server --v2\n")], "rev2");

    let held = AppLock::acquire(&h.config.paths.locks_dir(), "shop", Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(poller.poll_once().await, vec!["shop".to_string()]);
    poller.drain().await;
    let app = h.db.get_app("shop").unwrap().unwrap();
    assert_eq!(app.revision.as_deref(), Some("rev1"));
    assert!(h.db.get_operation("shop").unwrap().is_none());

    drop(held);
    assert_eq!(poller.poll_once().await, vec!["shop".to_string()]);
    poller.drain().await;
    let app = h.db.get_app("shop").unwrap().unwrap();
    assert_eq!(app.revision.as_deref(), Some("rev2"));
}
