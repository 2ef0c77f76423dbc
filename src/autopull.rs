//! Autopull poller
//!
//! Periodically compares every application's deployed revision with its
//! upstream branch and updates the ones that moved.

use crate::engine::Engine;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct Poller {
    engine: Arc<Engine>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
    /// Updates started by earlier cycles that may still be running
    in_flight: HashMap<String, JoinHandle<()>>,
}

impl Poller {
    pub fn new(engine: Arc<Engine>, interval: Duration, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            engine,
            interval,
            shutdown_rx,
            in_flight: HashMap::new(),
        }
    }

    /// Poll until shutdown is signalled. The first cycle runs immediately.
    pub async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "Autopull started");

        loop {
            self.poll_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("Autopull shutting down");
                        break;
                    }
                }
            }
        }

        for (name, handle) in self.in_flight.drain() {
            if !handle.is_finished() {
                debug!(app = %name, "Waiting for update to finish");
                let _ = handle.await;
            }
        }
    }

    /// One cycle: check every application, spawn an update for each one
    /// behind upstream. Returns the names that were scheduled.
    pub async fn poll_once(&mut self) -> Vec<String> {
        self.in_flight.retain(|_, handle| !handle.is_finished());

        let apps = match self.engine.list() {
            Ok(apps) => apps,
            Err(e) => {
                error!(error = %e, "Failed to read registry");
                return Vec::new();
            }
        };

        let engine = &*self.engine;
        let in_flight = &self.in_flight;
        let checks = apps
            .iter()
            .filter(|app| !in_flight.contains_key(&app.name))
            .map(|app| async move { (app, engine.upstream_revision(app).await) });

        let mut scheduled = Vec::new();
        for (app, upstream) in join_all(checks).await {
            let upstream = match upstream {
                Ok(rev) => rev,
                Err(e) => {
                    error!(app = %app.name, error = %e, "Upstream check failed");
                    continue;
                }
            };
            if app.revision.as_deref() == Some(upstream.as_str()) {
                debug!(app = %app.name, revision = %upstream, "Up to date");
                continue;
            }

            info!(
                app = %app.name,
                deployed = ?app.revision,
                upstream = %upstream,
                "Upstream changed, updating"
            );
            let engine = self.engine.clone();
            let name = app.name.clone();
            let handle = tokio::spawn(async move {
                match engine.update(&name).await {
                    Ok(record) => info!(app = %name, revision = ?record.revision, "Autopull update complete"),
                    // Nothing was touched; the next cycle retries
                    Err(e) if e.kind().is_rejection() => {
                        warn!(app = %name, kind = %e.kind(), error = %e, "Autopull update skipped")
                    }
                    Err(e) => error!(app = %name, kind = %e.kind(), error = %e, "Autopull update failed"),
                }
            });
            self.in_flight.insert(app.name.clone(), handle);
            scheduled.push(app.name.clone());
        }
        scheduled
    }

    /// Wait for every update spawned so far
    pub async fn drain(&mut self) {
        let handles: Vec<_> = self.in_flight.drain().map(|(_, h)| h).collect();
        join_all(handles).await;
    }
}
