//! Build orchestrator: what runs when the container starts.
//!
//! An orchestrator receives nothing but the environment contract and the
//! source mounted at `BUILD_DIR`. It compiles for the single registered
//! target, leaves its artifacts in `OUTPUT_DIR`, and reports failure through
//! its exit status. It owns any retry or partial-success semantics itself.

use crate::contract::EnvContract;
use crate::error::BuildError;
use crate::executor::{HostCommand, HostExecutor, DEFAULT_TIMEOUT_SECS};
use crate::toolchain::TargetTriple;
use crate::verify::installed_targets;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub target: TargetTriple,
    /// Files placed in the output directory.
    pub artifacts: Vec<PathBuf>,
    pub duration_ms: u64,
}

/// Contract every build entry point satisfies.
#[async_trait]
pub trait BuildOrchestrator: Send + Sync {
    /// Build the project under `contract`'s build directory.
    async fn run(&self, contract: &EnvContract) -> std::result::Result<BuildOutcome, BuildError>;
}

/// Default orchestrator: `cargo build --release` for the contract's target.
pub struct CargoOrchestrator {
    executor: Arc<dyn HostExecutor>,
    cargo_args: Vec<String>,
    timeout_secs: u64,
}

impl CargoOrchestrator {
    pub fn new(executor: Arc<dyn HostExecutor>) -> Self {
        CargoOrchestrator {
            executor,
            cargo_args: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Extra arguments appended to `cargo build`.
    pub fn with_cargo_args(mut self, args: Vec<String>) -> Self {
        self.cargo_args = args;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn build_command(&self, contract: &EnvContract, target: &TargetTriple) -> HostCommand {
        let mut argv = vec![
            "cargo".to_string(),
            "build".to_string(),
            "--release".to_string(),
            "--target".to_string(),
            target.to_string(),
        ];
        argv.extend(self.cargo_args.iter().cloned());
        HostCommand::new(contract, argv)
            .in_dir(contract.build_dir())
            .with_timeout(self.timeout_secs)
    }
}

#[async_trait]
impl BuildOrchestrator for CargoOrchestrator {
    async fn run(&self, contract: &EnvContract) -> std::result::Result<BuildOutcome, BuildError> {
        let start = Instant::now();
        let target = contract.target()?;

        let installed =
            installed_targets(self.executor.as_ref(), contract, self.timeout_secs).await?;
        if !installed.contains(&target.to_string()) {
            return Err(BuildError::TargetNotRegistered(target.to_string()));
        }

        let output_dir = contract.output_dir();
        self.executor
            .create_dir_all(&output_dir)
            .await
            .map_err(|_| BuildError::OutputDir(output_dir.display().to_string()))?;

        info!(target = %target, build_dir = %contract.build_dir().display(), "Starting build");
        let output = self
            .executor
            .run(&self.build_command(contract, &target))
            .await?;
        if !output.success() {
            return Err(BuildError::CompileFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        let release_dir = contract
            .build_dir()
            .join("target")
            .join(target.to_string())
            .join("release");
        let artifacts = copy_executables(&release_dir, &output_dir).await?;

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            target = %target,
            artifacts = artifacts.len(),
            duration_ms,
            "Build completed"
        );
        Ok(BuildOutcome {
            target,
            artifacts,
            duration_ms,
        })
    }
}

/// Copy every executable regular file in `from` into `to`.
///
/// Returned paths point into `to`, sorted by name.
pub async fn copy_executables(from: &Path, to: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut copied = Vec::new();
    let mut entries = tokio::fs::read_dir(from).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() || !is_executable(&entry.path(), &metadata) {
            continue;
        }
        let dest = to.join(entry.file_name());
        tokio::fs::copy(entry.path(), &dest).await?;
        debug!(artifact = %dest.display(), "Copied artifact");
        copied.push(dest);
    }
    copied.sort();
    Ok(copied)
}

#[cfg(unix)]
fn is_executable(_path: &Path, metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _metadata: &std::fs::Metadata) -> bool {
    path.extension().map(|e| e == "exe").unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_executables_skips_non_executables() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();

        let bin = src.path().join("app");
        std::fs::write(&bin, b"\x7fELF").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(src.path().join("app.d"), b"deps").unwrap();
        std::fs::create_dir(src.path().join("deps")).unwrap();

        let copied = copy_executables(src.path(), dst.path()).await.unwrap();
        assert_eq!(copied, vec![dst.path().join("app")]);
        assert!(dst.path().join("app").exists());
        assert!(!dst.path().join("app.d").exists());
    }

    #[tokio::test]
    async fn test_copy_executables_missing_dir() {
        let dst = tempdir().unwrap();
        assert!(copy_executables(Path::new("/nonexistent/release"), dst.path())
            .await
            .is_err());
    }
}
