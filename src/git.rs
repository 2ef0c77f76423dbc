//! Source control
//!
//! Working trees are shallow clones of the application's branch. Updates
//! fetch the branch tip and hard-reset onto it; the poller only ever asks
//! the remote for its revision.

use crate::exec::{self, Invocation};
use crate::models::SourceRef;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Materialize the branch tip into `dest`, cloning when `dest` holds no
    /// checkout yet. Returns the checked-out revision.
    async fn checkout(&self, source: &SourceRef, dest: &Path) -> Result<String>;

    /// Revision at the tip of the branch upstream, without touching any tree
    async fn remote_revision(&self, source: &SourceRef) -> Result<String>;
}

/// `git` command-line implementation
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    fn git(dir: Option<&Path>) -> Invocation {
        let inv = Invocation::new("git").env("GIT_TERMINAL_PROMPT", "0");
        match dir {
            Some(dir) => inv.arg("-C").arg(dir.to_string_lossy()),
            None => inv,
        }
    }

    async fn head(dest: &Path) -> Result<String> {
        let out = exec::run_checked(&Self::git(Some(dest)).args(["rev-parse", "HEAD"])).await?;
        Ok(out.stdout.trim().to_string())
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn checkout(&self, source: &SourceRef, dest: &Path) -> Result<String> {
        if dest.join(".git").is_dir() {
            debug!(repo = %source.repository, branch = %source.branch, "Fetching");
            exec::run_checked(&Self::git(Some(dest)).args([
                "fetch",
                "--depth",
                "1",
                "origin",
                source.branch.as_str(),
            ]))
            .await
            .context("git fetch")?;
            exec::run_checked(&Self::git(Some(dest)).args(["reset", "--hard", "FETCH_HEAD"]))
                .await
                .context("git reset")?;
            exec::run_checked(&Self::git(Some(dest)).args(["clean", "-fd"]))
                .await
                .context("git clean")?;
        } else {
            info!(repo = %source.repository, branch = %source.branch, "Cloning");
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            exec::run_checked(
                &Self::git(None)
                    .args(["clone", "--depth", "1", "--single-branch", "--branch"])
                    .arg(source.branch.as_str())
                    .arg(source.repository.as_str())
                    .arg(dest.to_string_lossy()),
            )
            .await
            .context("git clone")?;
        }

        let revision = Self::head(dest).await?;
        debug!(revision = %revision, "Checked out");
        Ok(revision)
    }

    async fn remote_revision(&self, source: &SourceRef) -> Result<String> {
        let refname = format!("refs/heads/{}", source.branch);
        let out = exec::run_checked(
            &Self::git(None).args(["ls-remote", source.repository.as_str(), refname.as_str()]),
        )
        .await
        .context("git ls-remote")?;

        out.stdout
            .split_whitespace()
            .next()
            .map(str::to_string)
            .with_context(|| format!("Branch {} not found upstream", source.branch))
    }
}
