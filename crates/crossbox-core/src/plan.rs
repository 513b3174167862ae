//! Ordered provisioning plan and layer cache keys.

use crate::contract::EnvContract;
use crate::entrypoint::EntryPointSpec;
use crate::error::ProvisionError;
use crate::image::{BaseImageRef, ImageDigest};
use crate::labels::ImageLabels;
use crate::packages::SystemPackageSet;
use crate::step::ProvisionStep;
use crate::toolchain::{InstallerSource, TargetTriple, ToolchainChannel};
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// A validated, fully-typed provisioning plan.
///
/// Built from [`crate::config::ProvisionConfig::into_plan`]. The step list is
/// checked so that every step's prerequisites appear before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionPlan {
    pub image: BaseImageRef,
    pub packages: SystemPackageSet,
    pub channel: ToolchainChannel,
    pub installer: InstallerSource,
    pub target: TargetTriple,
    pub host: TargetTriple,
    pub contract: EnvContract,
    pub entrypoint: EntryPointSpec,
    pub labels: ImageLabels,
    pub contract_file: PathBuf,
    pub command_timeout_secs: u64,
    pub steps: Vec<ProvisionStep>,
}

/// Cache key of one step, chained over every step before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerKey {
    pub step: ProvisionStep,
    pub key: String,
}

impl ProvisionPlan {
    /// Check step ordering.
    ///
    /// - the plan must start by pinning the base image, so a bad pin aborts
    ///   before anything else runs
    /// - no step appears twice
    /// - every prerequisite of a step appears earlier in the list
    pub fn validate(&self) -> Result<()> {
        match self.steps.first() {
            Some(ProvisionStep::PinBaseImage) => {}
            Some(first) => {
                return Err(ProvisionError::OrderViolation {
                    step: first.name().to_string(),
                    requires: ProvisionStep::PinBaseImage.name().to_string(),
                })
            }
            None => return Err(ProvisionError::Config("plan has no steps".to_string())),
        }

        for (i, step) in self.steps.iter().enumerate() {
            if self.steps[..i].contains(step) {
                return Err(ProvisionError::Config(format!(
                    "step '{}' appears more than once",
                    step
                )));
            }
            for req in step.requires() {
                if !self.steps[..i].contains(req) {
                    return Err(ProvisionError::OrderViolation {
                        step: step.name().to_string(),
                        requires: req.name().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Replace the step list, validating the new order.
    pub fn with_steps(mut self, steps: Vec<ProvisionStep>) -> Result<Self> {
        self.steps = steps;
        self.validate()?;
        Ok(self)
    }

    /// Pin the base image to a resolved digest.
    pub fn with_image_digest(mut self, digest: ImageDigest) -> Self {
        self.image = self.image.with_digest(digest);
        self
    }

    /// Linker commands the toolchain needs for the host and the target.
    pub fn linkers(&self) -> Vec<&'static str> {
        let mut linkers = vec!["cc"];
        if self.target.is_musl() && self.target.arch == self.host.arch {
            linkers.push("musl-gcc");
        }
        linkers
    }

    /// Content that determines a step's effect.
    pub fn fingerprint(&self, step: ProvisionStep) -> String {
        match step {
            ProvisionStep::PinBaseImage => self.image.to_string(),
            ProvisionStep::InstallSystemPackages => self.packages.names().join(" "),
            ProvisionStep::InstallToolchain => format!(
                "{} {} {}",
                self.channel,
                self.installer.url,
                self.installer.sha256.as_deref().unwrap_or("-")
            ),
            ProvisionStep::RegisterTarget => self.target.to_string(),
            ProvisionStep::VerifyToolchain => self.linkers().join(" "),
            ProvisionStep::FixEnvironment => format!(
                "{} {}",
                self.contract.digest(),
                self.contract_file.display()
            ),
            ProvisionStep::InstallEntryPoint => format!(
                "{} {}",
                self.entrypoint.path.display(),
                serde_json::to_string(&self.entrypoint.source).unwrap_or_default()
            ),
        }
    }

    /// Chained cache keys, one per step.
    ///
    /// Changing a step's input changes its key and every key after it; an
    /// unchanged prefix keeps its keys and can be reused.
    pub fn layer_keys(&self) -> Vec<LayerKey> {
        let mut previous = String::new();
        self.steps
            .iter()
            .map(|step| {
                let mut hasher = Sha256::new();
                hasher.update(previous.as_bytes());
                hasher.update(b"\0");
                hasher.update(step.name().as_bytes());
                hasher.update(b"\0");
                hasher.update(self.fingerprint(*step).as_bytes());
                previous = hex::encode(hasher.finalize());
                LayerKey {
                    step: *step,
                    key: previous.clone(),
                }
            })
            .collect()
    }

    /// Digest of the whole plan (the last layer key).
    pub fn digest(&self) -> String {
        self.layer_keys()
            .last()
            .map(|k| k.key.clone())
            .unwrap_or_default()
    }
}
