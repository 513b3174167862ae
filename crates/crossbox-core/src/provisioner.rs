//! Imperative provisioning: apply a plan to a host, step by step.
//!
//! Steps run strictly in plan order. The first failure aborts the run; there
//! are no retries because every input is pinned, so a failure means a broken
//! pin or an unreachable resource rather than a transient fault.

use crate::error::ProvisionError;
use crate::executor::{HostCommand, HostExecutor};
use crate::image::ImageDigest;
use crate::packages::failed_package_from_apt;
use crate::plan::ProvisionPlan;
use crate::remote::RemoteSource;
use crate::report::{ProvisionReport, StepRecord};
use crate::step::{ProvisionStep, StepOutcome};
use crate::toolchain::InstallerSource;
use crate::verify::{installed_targets, parse_toolchain_name, verify_toolchain, ToolchainReport};
use crate::Result;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Where the fetched installer script is written before it runs.
pub const INSTALLER_PATH: &str = "/tmp/crossbox-rustup-init.sh";

/// A provisioning run that stopped at its first error.
#[derive(Debug, thiserror::Error)]
#[error("provisioning aborted{}: {error}", step_suffix(.step))]
pub struct ProvisionAbort {
    /// Step that failed; `None` when the plan itself was rejected.
    pub step: Option<ProvisionStep>,
    #[source]
    pub error: ProvisionError,
    /// Everything recorded up to and including the failed step.
    pub report: Box<ProvisionReport>,
}

fn step_suffix(step: &Option<ProvisionStep>) -> String {
    step.map(|s| format!(" at {}", s)).unwrap_or_default()
}

/// Applies a [`ProvisionPlan`] through a [`HostExecutor`].
pub struct Provisioner {
    executor: Arc<dyn HostExecutor>,
    remote: Arc<dyn RemoteSource>,
}

/// What a step did, plus anything it learned.
enum StepEffect {
    Applied,
    Skipped,
    Pinned(ImageDigest),
    Verified(ToolchainReport),
}

impl Provisioner {
    pub fn new(executor: Arc<dyn HostExecutor>, remote: Arc<dyn RemoteSource>) -> Self {
        Provisioner { executor, remote }
    }

    /// Execute every step of `plan` in order.
    pub async fn run(
        &self,
        plan: &ProvisionPlan,
    ) -> std::result::Result<ProvisionReport, ProvisionAbort> {
        let start = Instant::now();
        let mut report = ProvisionReport::new(plan.digest(), plan.contract.digest());

        if let Err(error) = plan.validate() {
            report.duration_ms = start.elapsed().as_millis() as u64;
            return Err(ProvisionAbort {
                step: None,
                error,
                report: Box::new(report),
            });
        }

        info!(
            run_id = %report.run_id,
            image = %plan.image,
            channel = %plan.channel,
            target = %plan.target,
            "Starting provisioning"
        );

        let layer_keys = plan.layer_keys();
        let mut completed: BTreeSet<ProvisionStep> = BTreeSet::new();

        for layer in layer_keys {
            let step = layer.step;
            let step_start = Instant::now();
            info!(step = %step, "Executing step");

            let result = match step
                .requires()
                .iter()
                .find(|req| !completed.contains(*req))
            {
                Some(missing) => Err(ProvisionError::OrderViolation {
                    step: step.name().to_string(),
                    requires: missing.name().to_string(),
                }),
                None => self.execute_step(plan, step).await,
            };
            let duration_ms = step_start.elapsed().as_millis() as u64;

            match result {
                Ok(effect) => {
                    let outcome = match effect {
                        StepEffect::Skipped => StepOutcome::Skipped,
                        StepEffect::Applied => StepOutcome::Applied,
                        StepEffect::Pinned(digest) => {
                            info!(digest = %digest, "Base image pinned");
                            report.image_digest = Some(digest);
                            StepOutcome::Applied
                        }
                        StepEffect::Verified(toolchain) => {
                            report.toolchain = Some(toolchain);
                            StepOutcome::Applied
                        }
                    };
                    if outcome == StepOutcome::Skipped {
                        info!(step = %step, "Already satisfied, skipping");
                    }
                    report.steps.push(StepRecord {
                        step,
                        outcome,
                        layer_key: layer.key,
                        duration_ms,
                        error: None,
                    });
                    completed.insert(step);
                }
                Err(err) => {
                    error!(step = %step, error = %err, "Step failed, aborting provisioning");
                    report.steps.push(StepRecord {
                        step,
                        outcome: StepOutcome::Failed,
                        layer_key: layer.key,
                        duration_ms,
                        error: Some(err.to_string()),
                    });
                    report.duration_ms = start.elapsed().as_millis() as u64;
                    return Err(ProvisionAbort {
                        step: Some(step),
                        error: err,
                        report: Box::new(report),
                    });
                }
            }
        }

        report.success = true;
        report.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %report.run_id,
            applied = report.applied_count(),
            skipped = report.skipped_count(),
            "Provisioning completed successfully"
        );
        Ok(report)
    }

    async fn execute_step(&self, plan: &ProvisionPlan, step: ProvisionStep) -> Result<StepEffect> {
        match step {
            ProvisionStep::PinBaseImage => self.pin_base_image(plan).await,
            ProvisionStep::InstallSystemPackages => self.install_system_packages(plan).await,
            ProvisionStep::InstallToolchain => self.install_toolchain(plan).await,
            ProvisionStep::RegisterTarget => self.register_target(plan).await,
            ProvisionStep::VerifyToolchain => {
                let toolchain = verify_toolchain(
                    self.executor.as_ref(),
                    &plan.contract,
                    &plan.target,
                    &plan.linkers(),
                    plan.command_timeout_secs,
                )
                .await?;
                Ok(StepEffect::Verified(toolchain))
            }
            ProvisionStep::FixEnvironment => self.fix_environment(plan).await,
            ProvisionStep::InstallEntryPoint => self.install_entry_point(plan).await,
        }
    }

    fn command<I, S>(&self, plan: &ProvisionPlan, argv: I) -> HostCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HostCommand::new(&plan.contract, argv).with_timeout(plan.command_timeout_secs)
    }

    async fn pin_base_image(&self, plan: &ProvisionPlan) -> Result<StepEffect> {
        let digest = self
            .remote
            .resolve_image(&plan.image)
            .await
            .map_err(|e| match e {
                ProvisionError::UnresolvablePin { .. } => e,
                other => ProvisionError::UnresolvablePin {
                    reference: plan.image.to_string(),
                    reason: other.to_string(),
                },
            })?;
        Ok(StepEffect::Pinned(digest))
    }

    async fn missing_packages(&self, plan: &ProvisionPlan) -> Result<Vec<String>> {
        let query = self.command(plan, plan.packages.status_query());
        // dpkg-query exits non-zero when some package is unknown but still
        // reports the ones it knows, so only a spawn failure is an error.
        let output = self.executor.run(&query).await?;
        Ok(plan.packages.missing_from_status(&output.stdout))
    }

    async fn install_system_packages(&self, plan: &ProvisionPlan) -> Result<StepEffect> {
        let missing = self
            .missing_packages(plan)
            .await
            .map_err(|e| ProvisionError::PackageInstall {
                package: None,
                reason: e.to_string(),
            })?;
        if missing.is_empty() {
            return Ok(StepEffect::Skipped);
        }
        debug!(missing = ?missing, "Installing system packages");

        let failed = |e: ProvisionError| ProvisionError::PackageInstall {
            package: None,
            reason: e.to_string(),
        };

        let update = self
            .command(plan, ["apt-get", "update"])
            .with_env("DEBIAN_FRONTEND", "noninteractive");
        let output = self.executor.run(&update).await.map_err(failed)?;
        if !output.success() {
            return Err(ProvisionError::PackageInstall {
                package: None,
                reason: format!("apt-get update failed: {}", output.diagnostic()),
            });
        }

        let install = self
            .command(plan, plan.packages.install_command())
            .with_env("DEBIAN_FRONTEND", "noninteractive");
        let output = self.executor.run(&install).await.map_err(failed)?;
        if !output.success() {
            return Err(ProvisionError::PackageInstall {
                package: failed_package_from_apt(&output.stderr),
                reason: output.diagnostic(),
            });
        }

        let still_missing = self.missing_packages(plan).await.map_err(failed)?;
        if let Some(package) = still_missing.into_iter().next() {
            return Err(ProvisionError::PackageInstall {
                package: Some(package),
                reason: "not installed after apt-get install".to_string(),
            });
        }
        Ok(StepEffect::Applied)
    }

    /// Installed toolchain names and which of them is the default.
    async fn toolchains(&self, plan: &ProvisionPlan) -> Result<(Vec<String>, Option<String>)> {
        let list = self.command(plan, ["rustup", "toolchain", "list"]);
        let output = match self.executor.run(&list).await {
            Ok(output) if output.success() => output,
            // No rustup yet.
            Ok(_) => return Ok((Vec::new(), None)),
            Err(ProvisionError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((Vec::new(), None))
            }
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        let mut default = None;
        for line in output.stdout.lines() {
            if let Some(name) = parse_toolchain_name(line) {
                if line.contains("(default)") {
                    default = Some(name.to_string());
                }
                names.push(name.to_string());
            }
        }
        Ok((names, default))
    }

    async fn install_toolchain(&self, plan: &ProvisionPlan) -> Result<StepEffect> {
        let channel = plan.channel.name();
        let toolchain = plan.channel.toolchain_dir(&plan.host);
        let failed = |reason: String| ProvisionError::ToolchainInstall {
            channel: channel.clone(),
            reason,
        };

        // The installer probes for a working linker.
        let probe = self.command(plan, ["cc", "--version"]);
        match self.executor.run(&probe).await {
            Ok(output) if output.success() => {}
            _ => {
                return Err(failed(
                    "no working linker (cc); system packages must be installed first".to_string(),
                ))
            }
        }

        let (installed, default) = self
            .toolchains(plan)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if installed.contains(&toolchain) {
            if default.as_deref() == Some(toolchain.as_str()) {
                return Ok(StepEffect::Skipped);
            }
            // Present but not the default: make it the one `rustc` resolves to.
            debug!(toolchain = %toolchain, previous = ?default, "Switching default toolchain");
            let switch = self.command(plan, ["rustup", "default", toolchain.as_str()]);
            let output = self
                .executor
                .run(&switch)
                .await
                .map_err(|e| failed(e.to_string()))?;
            if !output.success() {
                return Err(failed(format!(
                    "cannot make {} the default: {}",
                    toolchain,
                    output.diagnostic()
                )));
            }
            return Ok(StepEffect::Applied);
        }

        let script = self
            .remote
            .fetch(&plan.installer.url)
            .await
            .map_err(|e| failed(format!("installer fetch failed: {}", e)))?;
        verify_installer(&plan.installer, &script).map_err(failed)?;

        let installer_path = Path::new(INSTALLER_PATH);
        self.executor
            .write_file(installer_path, &script, 0o755)
            .await
            .map_err(|e| failed(e.to_string()))?;

        let mut argv = vec!["sh".to_string(), INSTALLER_PATH.to_string()];
        argv.extend(InstallerSource::installer_args(&plan.channel));
        let output = self
            .executor
            .run(&self.command(plan, argv))
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !output.success() {
            return Err(failed(format!(
                "installer exited with code {}: {}",
                output.exit_code,
                output.diagnostic()
            )));
        }

        let (installed, default) = self
            .toolchains(plan)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !installed.contains(&toolchain) {
            return Err(failed(format!("{} not listed after install", toolchain)));
        }
        if default.as_deref() != Some(toolchain.as_str()) {
            return Err(failed(format!(
                "{} installed but the default is {}",
                toolchain,
                default.unwrap_or_else(|| "unset".to_string())
            )));
        }
        Ok(StepEffect::Applied)
    }

    async fn register_target(&self, plan: &ProvisionPlan) -> Result<StepEffect> {
        let triple = plan.target.to_string();
        let failed = |reason: String| ProvisionError::TargetRegistration {
            triple: triple.clone(),
            reason,
        };

        let installed = installed_targets(
            self.executor.as_ref(),
            &plan.contract,
            plan.command_timeout_secs,
        )
        .await
        .map_err(|e| failed(e.to_string()))?;
        if installed.contains(&triple) {
            return Ok(StepEffect::Skipped);
        }

        let toolchain = plan.channel.toolchain_dir(&plan.host);
        let add = self.command(
            plan,
            ["rustup", "target", "add", "--toolchain", toolchain.as_str(), triple.as_str()],
        );
        let output = self
            .executor
            .run(&add)
            .await
            .map_err(|e| failed(e.to_string()))?;
        if !output.success() {
            return Err(failed(output.diagnostic()));
        }

        let installed = installed_targets(
            self.executor.as_ref(),
            &plan.contract,
            plan.command_timeout_secs,
        )
        .await
        .map_err(|e| failed(e.to_string()))?;
        if !installed.contains(&triple) {
            return Err(failed("target not listed after registration".to_string()));
        }
        Ok(StepEffect::Applied)
    }

    async fn fix_environment(&self, plan: &ProvisionPlan) -> Result<StepEffect> {
        let contract = &plan.contract;
        for dir in [contract.build_dir(), contract.output_dir()] {
            self.executor.create_dir_all(&dir).await?;
        }
        let json = serde_json::to_vec_pretty(contract)?;
        self.executor
            .write_file(&plan.contract_file, &json, 0o644)
            .await?;
        debug!(
            file = %plan.contract_file.display(),
            digest = %contract.digest(),
            "Environment contract persisted"
        );
        Ok(StepEffect::Applied)
    }

    async fn install_entry_point(&self, plan: &ProvisionPlan) -> Result<StepEffect> {
        let path = &plan.entrypoint.path;
        let contents = plan.entrypoint.contents()?;
        self.executor
            .write_file(path, &contents, crate::entrypoint::ENTRYPOINT_MODE)
            .await
            .map_err(|e| ProvisionError::EntryPoint {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(StepEffect::Applied)
    }
}

/// Check a fetched installer against its pinned checksum.
fn verify_installer(source: &InstallerSource, script: &[u8]) -> std::result::Result<(), String> {
    if script.is_empty() {
        return Err("installer is empty".to_string());
    }
    if let Some(expected) = &source.sha256 {
        let actual = hex::encode(Sha256::digest(script));
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(format!(
                "installer checksum mismatch: expected {}, got {}",
                expected, actual
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisionConfig;
    use crate::executor::CommandOutput;
    use crate::fakes::FakeRemote;
    use async_trait::async_trait;

    /// Fails every spawn with the configured error.
    struct Unspawnable(fn() -> ProvisionError);

    #[async_trait]
    impl HostExecutor for Unspawnable {
        async fn run(&self, _command: &HostCommand) -> Result<CommandOutput> {
            Err((self.0)())
        }

        async fn write_file(&self, _path: &Path, _contents: &[u8], _mode: u32) -> Result<()> {
            Ok(())
        }

        async fn create_dir_all(&self, _path: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn provisioner_with(error: fn() -> ProvisionError) -> Provisioner {
        Provisioner::new(Arc::new(Unspawnable(error)), Arc::new(FakeRemote::new()))
    }

    #[tokio::test]
    async fn test_missing_rustup_means_no_toolchains() {
        let plan = ProvisionConfig::default().into_plan().unwrap();
        let provisioner = provisioner_with(|| {
            ProvisionError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "rustup"))
        });
        let (names, default) = provisioner.toolchains(&plan).await.unwrap();
        assert!(names.is_empty());
        assert_eq!(default, None);
    }

    #[tokio::test]
    async fn test_toolchain_list_timeout_is_an_error() {
        let plan = ProvisionConfig::default().into_plan().unwrap();
        let provisioner = provisioner_with(|| ProvisionError::CommandTimeout {
            command: "rustup toolchain list".to_string(),
            timeout_secs: 1,
        });
        assert!(matches!(
            provisioner.toolchains(&plan).await,
            Err(ProvisionError::CommandTimeout { .. })
        ));
    }

    #[test]
    fn test_verify_installer_checksum() {
        let script = b"#!/bin/sh\necho install\n";
        let sum = hex::encode(Sha256::digest(script));

        let pinned = InstallerSource {
            sha256: Some(sum.to_uppercase()),
            ..InstallerSource::default()
        };
        assert!(verify_installer(&pinned, script).is_ok());

        let wrong = InstallerSource {
            sha256: Some("0".repeat(64)),
            ..InstallerSource::default()
        };
        assert!(verify_installer(&wrong, script)
            .unwrap_err()
            .contains("checksum mismatch"));

        assert!(verify_installer(&InstallerSource::default(), b"").is_err());
    }

    #[test]
    fn test_abort_display() {
        let abort = ProvisionAbort {
            step: Some(ProvisionStep::RegisterTarget),
            error: ProvisionError::TargetRegistration {
                triple: "x".into(),
                reason: "unknown".into(),
            },
            report: Box::new(ProvisionReport::new(String::new(), String::new())),
        };
        assert_eq!(
            abort.to_string(),
            "provisioning aborted at register_target: target registration failed for 'x': unknown"
        );
    }
}
