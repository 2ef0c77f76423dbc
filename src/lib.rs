//! Hoist - a single-host deployment orchestrator
//!
//! Deploys applications straight from git onto one machine:
//! - Detects how to build and run a source tree (Procfile, Go, Cargo,
//!   Python, Node or a prebuilt binary)
//! - Assigns ports and generates systemd units and Traefik route files
//! - Snapshots before every change and rolls back when a deploy fails
//! - Recovers from interrupted operations through an operation journal
//! - Polls upstream branches and redeploys when they move

pub mod autopull;
pub mod backup;
pub mod config;
pub mod db;
pub mod engine;
pub mod envfile;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod git;
pub mod lock;
pub mod models;
pub mod ports;
pub mod routes;
pub mod supervisor;
pub mod topology;
pub mod units;
