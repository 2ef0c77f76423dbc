//! External command primitive
//!
//! Every subprocess the deployer starts goes through [`run`]: an argv, an
//! optional working directory and extra environment. Nothing is passed
//! through a shell.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Split a command string into argv with shell-words quoting rules
    pub fn parse(command: &str) -> Result<Self> {
        let mut words = shell_words::split(command)
            .with_context(|| format!("Failed to parse command: {}", command))?;
        if words.is_empty() {
            anyhow::bail!("Empty command");
        }
        let program = words.remove(0);
        Ok(Self::new(program).args(words))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

#[derive(Debug, Clone)]
pub struct Output {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last few lines of stderr (or stdout when stderr is empty) for error messages
    pub fn tail(&self, lines: usize) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let all: Vec<&str> = text.trim_end().lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    /// One-line description of the exit, e.g. "exit 2: permission denied"
    pub fn describe(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit {}", code),
            None => "killed by signal".to_string(),
        };
        let tail = self.tail(5);
        if tail.is_empty() {
            status
        } else {
            format!("{}: {}", status, tail)
        }
    }
}

/// Run to completion, capturing output. A non-zero exit is not an error
/// here; callers decide what it means.
pub async fn run(inv: &Invocation) -> Result<Output> {
    debug!(command = %inv.display(), cwd = ?inv.cwd, "Running command");

    let mut cmd = Command::new(&inv.program);
    cmd.args(&inv.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &inv.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &inv.env {
        cmd.env(key, value);
    }

    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to spawn {}", inv.program))?;

    let out = Output {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!(command = %inv.program, code = ?out.code, "Command finished");
    Ok(out)
}

/// Run with the caller's terminal attached; returns the exit code
pub async fn run_interactive(inv: &Invocation) -> Result<i32> {
    debug!(command = %inv.display(), cwd = ?inv.cwd, "Running interactive command");

    let mut cmd = Command::new(&inv.program);
    cmd.args(&inv.args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if let Some(dir) = &inv.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &inv.env {
        cmd.env(key, value);
    }

    let status = cmd
        .status()
        .await
        .with_context(|| format!("Failed to spawn {}", inv.program))?;
    Ok(status.code().unwrap_or(1))
}

/// Run and turn a non-zero exit into an error
pub async fn run_checked(inv: &Invocation) -> Result<Output> {
    let out = run(inv).await?;
    if !out.success() {
        anyhow::bail!("`{}` failed ({})", inv.display(), out.describe());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        let inv = Invocation::parse("git clone --branch 'my branch' repo").unwrap();
        assert_eq!(inv.program, "git");
        assert_eq!(inv.args, vec!["clone", "--branch", "my branch", "repo"]);
        assert!(Invocation::parse("   ").is_err());
        assert!(Invocation::parse("echo 'unterminated").is_err());
    }

    #[test]
    fn test_output_tail() {
        let out = Output {
            code: Some(1),
            stdout: "a\nb\n".to_string(),
            stderr: "one\ntwo\nthree\n".to_string(),
        };
        assert_eq!(out.tail(2), "two\nthree");
        assert_eq!(out.describe(), "exit 1: one\ntwo\nthree");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = run(&Invocation::new("sh")
            .args(["-c", "echo \"$GREETING\"; pwd; echo oops >&2"])
            .cwd(dir.path())
            .env("GREETING", "hi"))
        .await
        .unwrap();

        assert!(out.success());
        let mut lines = out.stdout.lines();
        assert_eq!(lines.next(), Some("hi"));
        assert!(lines.next().unwrap().ends_with(
            dir.path().file_name().unwrap().to_str().unwrap()
        ));
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_checked_fails_on_nonzero() {
        let err = run_checked(&Invocation::new("sh").args(["-c", "echo bad >&2; exit 3"]))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit 3"), "{msg}");
        assert!(msg.contains("bad"), "{msg}");
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        assert!(run(&Invocation::new("definitely-not-a-real-binary-xyz")).await.is_err());
    }
}
