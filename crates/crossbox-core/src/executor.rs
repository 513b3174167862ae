//! Host command execution.

use crate::contract::EnvContract;
use crate::error::ProvisionError;
use crate::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

/// Default per-command timeout. Package and toolchain downloads are slow.
pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// A command to run on the provisioning host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    /// Command to execute (first element is executable).
    pub argv: Vec<String>,

    /// Complete environment; the host environment is cleared first.
    pub env: BTreeMap<String, String>,

    /// Working directory.
    pub cwd: Option<PathBuf>,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,
}

impl HostCommand {
    /// A command running under the environment contract.
    pub fn new<I, S>(contract: &EnvContract, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HostCommand {
            argv: argv.into_iter().map(Into::into).collect(),
            env: contract.process_env(&[]),
            cwd: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Add a variable that is not part of the contract.
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env
            .entry(key.to_string())
            .or_insert_with(|| value.to_string());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    /// Space-joined argv for logs and error messages.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Result of a command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stderr if non-empty, stdout otherwise, trimmed. Used in error reasons.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.trim().to_string()
    }
}

/// The host a provisioning plan is applied to.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    /// Run a command to completion.
    ///
    /// A non-zero exit is returned as `Ok`; only spawn failures and timeouts
    /// are errors.
    async fn run(&self, command: &HostCommand) -> Result<CommandOutput>;

    /// Write a file, replacing it, and set its Unix mode.
    async fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()>;

    /// Create a directory and its parents.
    async fn create_dir_all(&self, path: &Path) -> Result<()>;
}

/// Executes commands as real child processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        ProcessExecutor
    }
}

#[async_trait]
impl HostExecutor for ProcessExecutor {
    async fn run(&self, command: &HostCommand) -> Result<CommandOutput> {
        let start = Instant::now();

        if command.argv.is_empty() {
            return Err(ProvisionError::Config("empty command".to_string()));
        }

        let exe = &command.argv[0];
        let args = &command.argv[1..];
        debug!(command = %command.display(), "Spawning");

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .env_clear()
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let child = cmd.spawn()?;

        let output = if command.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(command.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| ProvisionError::CommandTimeout {
                command: command.display(),
                timeout_secs: command.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        set_mode(path, mode).await
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}
