//! Deployment engine
//!
//! Drives applications through `validated -> source-ready -> installed ->
//! configured -> live`. Every mutating operation runs under the
//! application's lock and writes a journal entry before its first side
//! effect, so a run cut short is reconciled by the next one:
//!
//! - an interrupted `add` is torn down
//! - an interrupted `update` or `restore` is rolled back from its snapshot,
//!   unless the record was already committed
//! - an interrupted `remove` is finished
//! - a journal entry whose snapshot is gone needs an operator decision

use crate::backup::{BackupInfo, BackupKind, BackupManager};
use crate::config::Config;
use crate::db::{Database, OperationKind};
use crate::envfile::{self, EnvFile};
use crate::error::{DeployError, Result};
use crate::exec::{self, Invocation};
use crate::fsutil;
use crate::git::{GitCli, SourceControl};
use crate::lock::AppLock;
use crate::models::{validate_name, AppRecord, AppStatus, ProcessSpec, ProcessStatus, SourceRef};
use crate::ports::PortAllocator;
use crate::routes::{route_file_name, RouteGenerator};
use crate::supervisor::{Supervisor, SystemdSupervisor};
use crate::topology::Topology;
use crate::units::{self, UnitGenerator};
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Engine {
    config: Config,
    db: Database,
    ports: PortAllocator,
    units: UnitGenerator,
    routes: RouteGenerator,
    backups: BackupManager,
    supervisor: Arc<dyn Supervisor>,
    source: Arc<dyn SourceControl>,
}

/// What a transition of a registered application moves it to
enum Target {
    /// Latest upstream source
    Upstream,
    /// Same tree, new operator overrides
    Overrides(BTreeMap<String, String>),
    /// A snapshot's tree and record
    Snapshot(String),
}

impl Engine {
    pub fn new(
        config: Config,
        db: Database,
        supervisor: Arc<dyn Supervisor>,
        source: Arc<dyn SourceControl>,
    ) -> Self {
        Self {
            ports: PortAllocator::new(db.clone(), config.ports.clone()),
            units: UnitGenerator::new(&config),
            routes: RouteGenerator::new(&config),
            backups: BackupManager::new(config.paths.backups_dir(), config.paths.apps_dir()),
            config,
            db,
            supervisor,
            source,
        }
    }

    /// Engine backed by systemd and the git CLI
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let db = Database::open(config.paths.database())?;
        let supervisor = Arc::new(SystemdSupervisor::new(&config.supervisor));
        Ok(Self::new(config, db, supervisor, Arc::new(GitCli::new())))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn tree_dir(&self, name: &str) -> PathBuf {
        self.config.paths.apps_dir().join(name)
    }

    fn route_path(&self, name: &str) -> PathBuf {
        self.config.proxy.routes_dir.join(route_file_name(name))
    }

    async fn lock(&self, name: &str) -> Result<AppLock> {
        AppLock::acquire(
            &self.config.paths.locks_dir(),
            name,
            self.config.locks.timeout(),
        )
        .await
    }

    fn require(&self, name: &str) -> Result<AppRecord> {
        self.db
            .get_app(name)?
            .ok_or_else(|| DeployError::NotFound(name.to_string()))
    }

    // ==================== Queries ====================

    pub fn list(&self) -> Result<Vec<AppRecord>> {
        Ok(self.db.list_apps()?)
    }

    pub fn get(&self, name: &str) -> Result<AppRecord> {
        self.require(name)
    }

    /// Live status: supervisor state per process plus a TCP probe of its port
    pub async fn status(&self, name: &str) -> Result<AppStatus> {
        let app = self.require(name)?;
        let mut processes = Vec::with_capacity(app.processes.len());

        for process in &app.processes {
            let unit = units::unit_name(&app.name, &process.name);
            let running = self.supervisor.is_running(&unit).await.unwrap_or_else(|e| {
                debug!(unit = %unit, error = %e, "Supervisor query failed");
                false
            });
            let listening = match process.port {
                Some(port) => Some(probe(port).await),
                None => None,
            };
            processes.push(ProcessStatus {
                process: process.name.clone(),
                unit,
                running,
                port: process.port,
                listening,
            });
        }

        Ok(AppStatus {
            name: app.name,
            revision: app.revision,
            last_deployed_at: app.last_deployed_at,
            processes,
        })
    }

    pub async fn logs(&self, name: &str, lines: usize) -> Result<String> {
        let app = self.require(name)?;
        let units: Vec<String> = app
            .processes
            .iter()
            .map(|p| units::unit_name(&app.name, &p.name))
            .collect();
        Ok(self.supervisor.logs(&units, lines).await?)
    }

    /// Run a one-off command in the application's directory and environment
    pub async fn exec(&self, name: &str, argv: &[String]) -> Result<i32> {
        let app = self.require(name)?;
        let Some((program, args)) = argv.split_first() else {
            return Err(DeployError::Internal(anyhow::anyhow!("No command given")));
        };

        let mut inv = Invocation::new(program.as_str())
            .args(args.iter().cloned())
            .cwd(&units::working_dir(&self.config.paths.apps_dir(), &app));
        for (key, value) in process_env(&app, app.primary()) {
            inv = inv.env(key, value);
        }
        Ok(exec::run_interactive(&inv).await?)
    }

    /// Upstream revision of the application's branch
    pub async fn upstream_revision(&self, app: &AppRecord) -> Result<String> {
        self.source
            .remote_revision(&app.source)
            .await
            .map_err(|e| DeployError::SourceFetchFailed(format!("{:#}", e)))
    }

    pub fn backups(&self, name: &str) -> Result<Vec<BackupInfo>> {
        validate_name(name)?;
        self.backups.list(name)
    }

    /// Newest configuration snapshot, offered when re-adding a removed app
    pub fn latest_config_backup(&self, name: &str) -> Result<Option<BackupInfo>> {
        validate_name(name)?;
        self.backups.latest(name, Some(BackupKind::Config))
    }

    // ==================== Lifecycle ====================

    /// Register and deploy a new application. On failure nothing remains.
    pub async fn add(&self, name: &str, source: SourceRef) -> Result<AppRecord> {
        self.add_with(name, source, None).await
    }

    /// Like [`Engine::add`], re-applying the operator overrides saved in
    /// `restore_from` (a snapshot of an earlier application of this name)
    pub async fn add_with(
        &self,
        name: &str,
        source: SourceRef,
        restore_from: Option<&str>,
    ) -> Result<AppRecord> {
        validate_name(name)?;
        source.validate()?;
        let _lock = self.lock(name).await?;
        self.reconcile(name).await?;

        if self.db.app_exists(name)? {
            return Err(DeployError::NameConflict(name.to_string()));
        }
        let overrides = match restore_from {
            Some(id) => self.backups.metadata(name, id)?.record.overrides,
            None => BTreeMap::new(),
        };

        info!(app = %name, repo = %source.repository, branch = %source.branch, "Adding application");
        self.db.begin_operation(name, OperationKind::Add, None)?;
        let result = self.deploy_new(name, source, overrides).await;
        self.finish_add(name, result).await
    }

    async fn finish_add(&self, name: &str, result: Result<AppRecord>) -> Result<AppRecord> {
        match result {
            Ok(record) => {
                self.db.clear_operation(name)?;
                info!(app = %name, revision = ?record.revision, "Application live");
                Ok(record)
            }
            Err(e) => {
                warn!(app = %name, error = %e, "Add failed, removing partial deployment");
                match self.teardown(name).await {
                    Ok(()) => {
                        self.db.clear_operation(name)?;
                        Err(e)
                    }
                    Err(rollback) => {
                        error!(app = %name, error = %rollback, "Cleanup after failed add failed");
                        Err(DeployError::RollbackIncomplete {
                            original: Box::new(e),
                            rollback: rollback.to_string(),
                        })
                    }
                }
            }
        }
    }

    async fn deploy_new(
        &self,
        name: &str,
        source: SourceRef,
        overrides: BTreeMap<String, String>,
    ) -> Result<AppRecord> {
        let tree = self.tree_dir(name);
        fsutil::remove_dir_if_exists(&tree)?;

        let revision = self.fetch(&source, &tree).await?;
        let created_at = Utc::now();
        let (mut record, topology) =
            self.build_record(name, source, revision, overrides, None, created_at)?;

        self.install(&record, &topology).await?;
        self.apply(&record, false).await?;

        record.last_deployed_at = Some(Utc::now());
        self.db.insert_app(&record)?;
        Ok(record)
    }

    /// Re-fetch, re-install and restart. On failure the previous tree,
    /// record and processes are restored and the original error returned.
    pub async fn update(&self, name: &str) -> Result<AppRecord> {
        let _lock = self.lock(name).await?;
        self.reconcile(name).await?;
        let current = self.require(name)?;

        info!(app = %name, "Updating application");
        self.transition(current, Target::Upstream).await
    }

    /// Bring an application back to a snapshot, or re-create a removed one
    /// from it. Without an id the newest snapshot is used.
    pub async fn restore(&self, name: &str, backup_id: Option<&str>) -> Result<AppRecord> {
        validate_name(name)?;
        let _lock = self.lock(name).await?;

        let id = match backup_id {
            Some(id) => id.to_string(),
            None => self
                .backups
                .latest(name, None)?
                .map(|b| b.id)
                .ok_or_else(|| DeployError::BackupNotFound(format!("no backups for {}", name)))?,
        };
        let metadata = self.backups.metadata(name, &id)?;

        match self.reconcile(name).await {
            Ok(()) => {}
            // Naming a snapshot explicitly is the operator's repair decision
            Err(DeployError::NeedsRepair { reason, .. }) if backup_id.is_some() => {
                warn!(app = %name, reason = %reason, backup = %id, "Resolving repair with restore");
                self.db.clear_operation(name)?;
            }
            Err(e) => return Err(e),
        }

        info!(app = %name, backup = %id, kind = %metadata.kind, "Restoring application");
        match self.db.get_app(name)? {
            Some(current) => self.transition(current, Target::Snapshot(id)).await,
            None => {
                self.db.begin_operation(name, OperationKind::Add, None)?;
                let result = match metadata.kind {
                    BackupKind::Full => self.deploy_snapshot(name, &id).await,
                    BackupKind::Config => {
                        let record = metadata.record;
                        self.deploy_new(name, record.source, record.overrides).await
                    }
                };
                self.finish_add(name, result).await
            }
        }
    }

    /// Re-create an unregistered application from a full snapshot
    async fn deploy_snapshot(&self, name: &str, id: &str) -> Result<AppRecord> {
        let mut record = self.backups.metadata(name, id)?.record;
        self.restore_tree(name, id).await?;

        let mut pending = HashSet::new();
        for port in record.ports() {
            self.ports.check_declared(name, port, &pending)?;
            pending.insert(port);
        }
        self.apply(&record, false).await?;

        record.last_deployed_at = Some(Utc::now());
        self.db.insert_app(&record)?;
        Ok(record)
    }

    /// Stop everything, delete generated config and the tree, keep a
    /// configuration snapshot unless `purge`
    pub async fn remove(&self, name: &str, purge: bool) -> Result<()> {
        let _lock = self.lock(name).await?;
        self.reconcile(name).await?;
        let record = self.require(name)?;

        info!(app = %name, purge, "Removing application");
        self.db.begin_operation(name, OperationKind::Remove, None)?;
        self.remove_locked(&record, purge).await?;
        self.db.clear_operation(name)?;
        Ok(())
    }

    async fn remove_locked(&self, record: &AppRecord, purge: bool) -> Result<()> {
        let name = record.name.as_str();
        let backups = self.backups.clone();
        let snapshot = record.clone();
        let backup = tokio::task::spawn_blocking(move || backups.create_config(&snapshot))
            .await
            .map_err(anyhow::Error::from)??;
        debug!(app = %name, backup = %backup.id, "Configuration saved");

        self.teardown(name).await?;
        self.db.delete_app(name)?;

        if purge {
            self.backups.delete_all(name)?;
        }
        info!(app = %name, "Application removed");
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        let _lock = self.lock(name).await?;
        let app = self.require(name)?;
        for process in &app.processes {
            let unit = units::unit_name(name, &process.name);
            self.supervisor
                .start(&unit)
                .await
                .map_err(|e| DeployError::ProcessStartFailed(format!("{}: {:#}", unit, e)))?;
        }
        info!(app = %name, "Started");
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        let _lock = self.lock(name).await?;
        let app = self.require(name)?;
        for process in &app.processes {
            self.supervisor
                .stop(&units::unit_name(name, &process.name))
                .await?;
        }
        info!(app = %name, "Stopped");
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<()> {
        let _lock = self.lock(name).await?;
        let app = self.require(name)?;
        for process in &app.processes {
            let unit = units::unit_name(name, &process.name);
            self.supervisor
                .restart(&unit)
                .await
                .map_err(|e| DeployError::ProcessStartFailed(format!("{}: {:#}", unit, e)))?;
        }
        info!(app = %name, "Restarted");
        Ok(())
    }

    /// Take a full snapshot on demand
    pub async fn backup(&self, name: &str) -> Result<BackupInfo> {
        let _lock = self.lock(name).await?;
        let app = self.require(name)?;
        let backups = self.backups.clone();
        let info = tokio::task::spawn_blocking(move || backups.create_full(&app))
            .await
            .map_err(anyhow::Error::from)??;
        Ok(info)
    }

    // ==================== Operator overrides ====================

    pub fn overrides(&self, name: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.require(name)?.overrides)
    }

    /// Set operator overrides, then regenerate and restart
    pub async fn set_overrides(
        &self,
        name: &str,
        vars: BTreeMap<String, String>,
    ) -> Result<AppRecord> {
        if let Some(bad) = vars.keys().find(|k| !envfile::is_valid_key(k)) {
            return Err(DeployError::InvalidEnvFile {
                line: 0,
                reason: format!("invalid key '{}'", bad),
            });
        }
        let _lock = self.lock(name).await?;
        self.reconcile(name).await?;
        let current = self.require(name)?;

        let mut overrides = current.overrides.clone();
        overrides.extend(vars);
        self.transition(current, Target::Overrides(overrides)).await
    }

    /// Drop operator overrides, then regenerate and restart
    pub async fn unset_overrides(&self, name: &str, keys: &[String]) -> Result<AppRecord> {
        let _lock = self.lock(name).await?;
        self.reconcile(name).await?;
        let current = self.require(name)?;

        let mut overrides = current.overrides.clone();
        for key in keys {
            overrides.remove(key);
        }
        self.transition(current, Target::Overrides(overrides)).await
    }

    // ==================== Transitions ====================

    /// Move a registered application to `target`, snapshotting first and
    /// rolling back to the snapshot on failure
    async fn transition(&self, current: AppRecord, target: Target) -> Result<AppRecord> {
        let name = current.name.clone();
        let backups = self.backups.clone();
        let snapshot = current.clone();
        let tree_changes = !matches!(target, Target::Overrides(_));
        let backup = tokio::task::spawn_blocking(move || {
            if tree_changes {
                backups.create_full(&snapshot)
            } else {
                backups.create_config(&snapshot)
            }
        })
        .await
        .map_err(anyhow::Error::from)??;

        let kind = match target {
            Target::Snapshot(_) => OperationKind::Restore,
            _ => OperationKind::Update,
        };
        self.db.begin_operation(&name, kind, Some(&backup.id))?;

        let result = match target {
            Target::Upstream => self.redeploy(&current, None, true).await,
            Target::Overrides(overrides) => self.redeploy(&current, Some(overrides), false).await,
            Target::Snapshot(id) => self.redeploy_snapshot(&current, &id).await,
        };

        match result {
            Ok(mut record) => {
                record.backup_ref = Some(backup.id.clone());
                record.last_deployed_at = Some(Utc::now());
                if let Err(e) = self.db.update_app(&record) {
                    return self.fail_transition(&name, &backup.id, e).await;
                }
                self.db.clear_operation(&name)?;
                info!(app = %name, revision = ?record.revision, backup = %backup.id, "Application live");
                Ok(record)
            }
            Err(e) => self.fail_transition(&name, &backup.id, e).await,
        }
    }

    async fn fail_transition(
        &self,
        name: &str,
        backup_id: &str,
        original: DeployError,
    ) -> Result<AppRecord> {
        warn!(app = %name, error = %original, backup = %backup_id, "Deploy failed, rolling back");
        match self.rollback_to(name, backup_id).await {
            Ok(()) => {
                self.db.clear_operation(name)?;
                warn!(app = %name, backup = %backup_id, "Rolled back");
                Err(original)
            }
            Err(rollback) => {
                error!(app = %name, error = %rollback, "Rollback failed");
                Err(DeployError::RollbackIncomplete {
                    original: Box::new(original),
                    rollback: rollback.to_string(),
                })
            }
        }
    }

    /// Rebuild from the working tree. `fetch` pulls upstream first;
    /// `overrides` replaces the operator overrides.
    async fn redeploy(
        &self,
        current: &AppRecord,
        overrides: Option<BTreeMap<String, String>>,
        fetch: bool,
    ) -> Result<AppRecord> {
        let name = current.name.as_str();
        let revision = if fetch {
            self.fetch(&current.source, &self.tree_dir(name)).await?
        } else {
            current.revision.clone().unwrap_or_default()
        };
        let overrides = overrides.unwrap_or_else(|| current.overrides.clone());

        let (record, topology) = self.build_record(
            name,
            current.source.clone(),
            revision,
            overrides,
            Some(current),
            current.created_at,
        )?;

        if fetch {
            self.install(&record, &topology).await?;
        }
        self.apply(&record, true).await?;
        Ok(record)
    }

    async fn redeploy_snapshot(&self, current: &AppRecord, id: &str) -> Result<AppRecord> {
        let name = current.name.as_str();
        let metadata = self.backups.metadata(name, id)?;

        if metadata.kind == BackupKind::Config {
            // Only the record was saved; rebuild the current tree with its overrides
            return self
                .redeploy(current, Some(metadata.record.overrides), false)
                .await;
        }

        self.restore_tree(name, id).await?;
        let record = metadata.record;
        let mut pending = HashSet::new();
        for port in record.ports() {
            self.ports.check_declared(name, port, &pending)?;
            pending.insert(port);
        }
        self.apply(&record, true).await?;
        Ok(record)
    }

    /// Put tree, record and processes back exactly as in snapshot `id`
    async fn rollback_to(&self, name: &str, id: &str) -> Result<()> {
        let record = self.backups.metadata(name, id)?.record;
        if self.backups.has_tree(name, id) {
            self.restore_tree(name, id).await?;
        }
        self.apply(&record, true).await?;

        if self.db.app_exists(name)? {
            self.db.update_app(&record)?;
        } else {
            self.db.insert_app(&record)?;
        }
        Ok(())
    }

    // ==================== Reconciliation ====================

    /// Finish or undo whatever an interrupted run left behind
    pub async fn reconcile(&self, name: &str) -> Result<()> {
        let Some(entry) = self.db.get_operation(name)? else {
            return Ok(());
        };

        warn!(
            app = %name,
            kind = entry.kind.as_str(),
            started_at = %entry.started_at,
            "Found interrupted operation"
        );

        match entry.kind {
            OperationKind::Add => {
                if self.db.app_exists(name)? {
                    debug!(app = %name, "Add had committed");
                } else {
                    self.teardown(name).await?;
                    warn!(app = %name, "Removed leftovers of interrupted add");
                }
            }
            OperationKind::Update | OperationKind::Restore
                if entry.backup_id.is_some()
                    && self.db.get_app(name)?.and_then(|r| r.backup_ref) == entry.backup_id =>
            {
                // The record already points at this operation's snapshot
                debug!(app = %name, kind = entry.kind.as_str(), "Operation had committed");
            }
            OperationKind::Update | OperationKind::Restore => {
                let backup_id = entry.backup_id.as_deref().filter(|id| self.backups.exists(name, id));
                let Some(id) = backup_id else {
                    return Err(DeployError::NeedsRepair {
                        name: name.to_string(),
                        reason: format!(
                            "interrupted {} refers to missing backup {}; run `restore {} <backup-id>`",
                            entry.kind.as_str(),
                            entry.backup_id.as_deref().unwrap_or("(none)"),
                            name
                        ),
                    });
                };
                self.rollback_to(name, id).await?;
                warn!(app = %name, backup = %id, "Completed rollback of interrupted operation");
            }
            OperationKind::Remove => {
                match self.db.get_app(name)? {
                    Some(record) => self.remove_locked(&record, false).await?,
                    None => self.teardown(name).await?,
                }
                warn!(app = %name, "Finished interrupted removal");
            }
        }

        self.db.clear_operation(name)?;
        Ok(())
    }

    // ==================== Pipeline steps ====================

    async fn fetch(&self, source: &SourceRef, tree: &std::path::Path) -> Result<String> {
        source.validate()?;
        let revision = self
            .source
            .checkout(source, tree)
            .await
            .map_err(|e| DeployError::SourceFetchFailed(format!("{:#}", e)))?;

        if let Some(sub) = &source.subfolder {
            let missing = || {
                DeployError::SourceFetchFailed(format!(
                    "subfolder '{}' does not exist in the repository",
                    sub
                ))
            };
            // Symlinks inside the checkout must not lead out of it
            let root = tree.canonicalize().map_err(|_| missing())?;
            let dir = tree.join(sub).canonicalize().map_err(|_| missing())?;
            if !dir.is_dir() {
                return Err(missing());
            }
            if !dir.starts_with(&root) {
                return Err(DeployError::SourceFetchFailed(format!(
                    "subfolder '{}' resolves outside the repository",
                    sub
                )));
            }
        }
        debug!(revision = %revision, "Source ready");
        Ok(revision)
    }

    /// Resolve topology, read `.env` and assign ports
    fn build_record(
        &self,
        name: &str,
        source: SourceRef,
        revision: String,
        overrides: BTreeMap<String, String>,
        previous: Option<&AppRecord>,
        created_at: chrono::DateTime<Utc>,
    ) -> Result<(AppRecord, Topology)> {
        let workdir = self.tree_dir(name);
        let workdir = match &source.subfolder {
            Some(sub) => workdir.join(sub),
            None => workdir,
        };

        let topology = Topology::resolve(&workdir, name)?;
        let mut env_file = EnvFile::load(&workdir)?;
        env_file.overlay(&overrides);
        let config_overrides = env_file.overrides()?;

        let mut pending = HashSet::new();
        let mut processes = Vec::with_capacity(topology.processes.len());
        for decl in &topology.processes {
            let declared = if decl.primary {
                env_file.port()?
            } else {
                env_file.process_port(&decl.name)?
            };
            // An undeclared primary keeps the port it had before
            let kept = previous
                .and_then(|p| p.processes.iter().find(|old| old.name == decl.name))
                .and_then(|old| old.port)
                .filter(|_| decl.primary);

            let port = match (declared, kept) {
                (Some(port), _) => Some(self.ports.allocate(name, Some(port), &mut pending)?),
                (None, Some(port)) if self.ports.check_declared(name, port, &pending).is_ok() => {
                    pending.insert(port);
                    Some(port)
                }
                (None, _) if decl.primary => Some(self.ports.allocate(name, None, &mut pending)?),
                (None, _) => None,
            };
            debug!(app = %name, process = %decl.name, port = ?port, "Process planned");

            processes.push(ProcessSpec {
                name: decl.name.clone(),
                command: decl.command.clone(),
                port,
                primary: decl.primary,
            });
        }

        let record = AppRecord {
            name: name.to_string(),
            source,
            processes,
            config_overrides,
            env: env_file.passthrough(),
            overrides,
            revision: Some(revision).filter(|r| !r.is_empty()),
            created_at,
            last_deployed_at: previous.and_then(|p| p.last_deployed_at),
            backup_ref: previous.and_then(|p| p.backup_ref.clone()),
        };
        Ok((record, topology))
    }

    async fn install(&self, record: &AppRecord, topology: &Topology) -> Result<()> {
        let workdir = units::working_dir(&self.config.paths.apps_dir(), record);

        for step in &topology.install_steps {
            let mut inv = step.clone().cwd(&workdir);
            for (key, value) in process_env(record, record.primary()) {
                inv = inv.env(key, value);
            }
            info!(app = %record.name, step = %inv.display(), "Running install step");

            let out = exec::run(&inv).await.map_err(|e| {
                DeployError::InstallStepFailed(format!("{}: {:#}", inv.display(), e))
            })?;
            if !out.success() {
                return Err(DeployError::InstallStepFailed(format!(
                    "`{}` {}",
                    inv.display(),
                    out.describe()
                )));
            }
        }
        Ok(())
    }

    /// Write units and route for `record`, drop units of processes that no
    /// longer exist, then (re)start every process
    async fn apply(&self, record: &AppRecord, restart: bool) -> Result<()> {
        let name = record.name.as_str();

        // Ports are re-validated against the registry at generation time
        let mut seen = HashSet::new();
        for port in record.ports() {
            self.ports.check_declared(name, port, &seen)?;
            seen.insert(port);
        }

        let units = self.units.emit_supervisor_units(record);
        let route = self
            .routes
            .emit_proxy_route(record)
            .map_err(|e| DeployError::ConfigWriteFailed(format!("route for {}: {:#}", name, e)))?;

        for unit in &units {
            let owner = self
                .supervisor
                .unit_owner(&unit.name)
                .await
                .map_err(|e| DeployError::ConfigWriteFailed(format!("{}: {:#}", unit.name, e)))?;
            if let Some(owner) = owner.filter(|o| o != name) {
                return Err(DeployError::ConfigWriteFailed(format!(
                    "unit {} already belongs to application '{}'",
                    unit.name, owner
                )));
            }
        }

        let wanted: HashSet<&str> = units.iter().map(|u| u.name.as_str()).collect();
        let installed = self.supervisor.units_for_app(name).await?;
        for stale in installed.iter().filter(|u| !wanted.contains(u.as_str())) {
            info!(app = %name, unit = %stale, "Retiring unit");
            if let Err(e) = self.supervisor.stop(stale).await {
                debug!(unit = %stale, error = %e, "Stop of retired unit failed");
            }
            if let Err(e) = self.supervisor.disable(stale).await {
                debug!(unit = %stale, error = %e, "Disable of retired unit failed");
            }
            self.supervisor
                .remove_unit(stale)
                .await
                .map_err(|e| DeployError::ConfigWriteFailed(format!("{}: {:#}", stale, e)))?;
        }

        for unit in &units {
            self.supervisor
                .write_unit(unit)
                .await
                .map_err(|e| DeployError::ConfigWriteFailed(format!("{}: {:#}", unit.name, e)))?;
        }

        let route_path = self.route_path(name);
        match &route {
            Some(route) => fsutil::write_atomic(&route_path, route.content.as_bytes())
                .map_err(|e| DeployError::ConfigWriteFailed(format!("{:#}", e)))?,
            None => {
                fsutil::remove_file_if_exists(&route_path)
                    .map_err(|e| DeployError::ConfigWriteFailed(format!("{:#}", e)))?;
            }
        }
        debug!(app = %name, units = units.len(), routed = route.is_some(), "Configuration written");

        self.supervisor
            .reload()
            .await
            .map_err(|e| DeployError::ConfigWriteFailed(format!("supervisor reload: {:#}", e)))?;

        for unit in &units {
            let started: anyhow::Result<()> = async {
                self.supervisor.enable(&unit.name).await?;
                if restart {
                    self.supervisor.restart(&unit.name).await
                } else {
                    self.supervisor.start(&unit.name).await
                }
            }
            .await;
            started.map_err(|e| {
                DeployError::ProcessStartFailed(format!("{}: {:#}", unit.name, e))
            })?;
        }

        let grace = self.config.supervisor.start_grace();
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }
        for unit in &units {
            if !self.supervisor.is_running(&unit.name).await.unwrap_or(false) {
                return Err(DeployError::ProcessStartFailed(format!(
                    "{} exited right after start",
                    unit.name
                )));
            }
        }

        info!(app = %name, processes = units.len(), "Processes running");
        Ok(())
    }

    async fn restore_tree(&self, name: &str, id: &str) -> Result<()> {
        let backups = self.backups.clone();
        let (name, id, dest) = (name.to_string(), id.to_string(), self.tree_dir(name));
        tokio::task::spawn_blocking(move || backups.restore_tree(&name, &id, &dest))
            .await
            .map_err(anyhow::Error::from)?
    }

    /// Stop and delete every unit, the route and the tree of `name`.
    /// Safe to repeat.
    async fn teardown(&self, name: &str) -> Result<()> {
        for unit in self.supervisor.units_for_app(name).await? {
            if let Err(e) = self.supervisor.stop(&unit).await {
                debug!(unit = %unit, error = %e, "Stop during teardown failed");
            }
            if let Err(e) = self.supervisor.disable(&unit).await {
                debug!(unit = %unit, error = %e, "Disable during teardown failed");
            }
            self.supervisor.remove_unit(&unit).await?;
        }
        self.supervisor.reload().await?;

        fsutil::remove_file_if_exists(&self.route_path(name))?;
        fsutil::remove_dir_if_exists(&self.tree_dir(name))?;
        debug!(app = %name, "Torn down");
        Ok(())
    }
}

/// Environment a process of `app` runs with
fn process_env(app: &AppRecord, process: Option<&ProcessSpec>) -> BTreeMap<String, String> {
    let mut env = app.env.clone();
    if let Some(port) = process.and_then(|p| p.port) {
        env.insert("PORT".to_string(), port.to_string());
    }
    env.insert("HOIST_APP".to_string(), app.name.clone());
    env
}

async fn probe(port: u16) -> bool {
    let addr = format!("127.0.0.1:{}", port);
    match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
            debug!(port, error = %e, "Probe failed (connection error)");
            false
        }
        Err(_) => {
            debug!(port, "Probe failed (timeout)");
            false
        }
    }
}
