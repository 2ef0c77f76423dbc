//! Port allocation
//!
//! Declared ports are checked against the registry; undeclared ones are
//! drawn at random from the configured range, skipping ports claimed by any
//! application and ports currently bound on the host. The result is
//! provisional until the application record is committed; the store's
//! unique index on process ports catches a concurrent race.

use crate::config::PortsConfig;
use crate::db::Database;
use crate::error::{DeployError, Result};
use rand::Rng;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use tracing::debug;

pub struct PortAllocator {
    db: Database,
    range: PortsConfig,
}

impl PortAllocator {
    pub fn new(db: Database, range: PortsConfig) -> Self {
        Self { db, range }
    }

    /// Pick a port for one process of `app`.
    ///
    /// `pending` holds ports already handed to other processes of the same
    /// application in this pass; the chosen port is added to it.
    pub fn allocate(
        &self,
        app: &str,
        declared: Option<u16>,
        pending: &mut HashSet<u16>,
    ) -> Result<u16> {
        let port = match declared {
            Some(port) => self.check_declared(app, port, pending)?,
            None => self.pick_random(pending)?,
        };
        pending.insert(port);
        Ok(port)
    }

    /// A declared port must not be claimed by another application
    pub fn check_declared(&self, app: &str, port: u16, pending: &HashSet<u16>) -> Result<u16> {
        if port == 0 {
            return Err(DeployError::PortConflict {
                port,
                owner: "reserved".to_string(),
            });
        }
        if pending.contains(&port) {
            return Err(DeployError::PortConflict {
                port,
                owner: app.to_string(),
            });
        }
        if let Some(owner) = self.db.port_owner(port)? {
            if owner != app {
                return Err(DeployError::PortConflict { port, owner });
            }
        }
        debug!(app = %app, port, "Declared port accepted");
        Ok(port)
    }

    fn pick_random(&self, pending: &HashSet<u16>) -> Result<u16> {
        let claimed = self.db.claimed_ports(None)?;
        let mut rng = rand::thread_rng();

        for attempt in 1..=self.range.max_attempts {
            let port = rng.gen_range(self.range.min..=self.range.max);
            if claimed.contains(&port) || pending.contains(&port) {
                continue;
            }
            if !is_bindable(port) {
                debug!(port, attempt, "Port in use on host, retrying");
                continue;
            }
            debug!(port, attempt, "Allocated port");
            return Ok(port);
        }

        Err(DeployError::PortExhausted {
            min: self.range.min,
            max: self.range.max,
            attempts: self.range.max_attempts,
        })
    }
}

/// Whether nothing is listening on `127.0.0.1:<port>` right now
pub fn is_bindable(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}
