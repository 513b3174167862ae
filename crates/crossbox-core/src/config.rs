//! Provisioning configuration
//!
//! Loaded from a TOML file (every field has a default), then overridden by a
//! few `CROSSBOX_*` environment variables. [`ProvisionConfig::into_plan`]
//! validates the raw values into a typed [`ProvisionPlan`].

use crate::contract::{ContractPaths, EnvContract};
use crate::entrypoint::EntryPointSpec;
use crate::error::ProvisionError;
use crate::executor::DEFAULT_TIMEOUT_SECS;
use crate::image::BaseImageRef;
use crate::labels::ImageLabels;
use crate::packages::{SystemPackageSet, DEFAULT_PACKAGES};
use crate::plan::ProvisionPlan;
use crate::step::ProvisionStep;
use crate::toolchain::{InstallerSource, TargetTriple, ToolchainChannel};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "crossbox.toml";

/// Where the provisioned contract is persisted inside the image.
pub const DEFAULT_CONTRACT_FILE: &str = "/etc/crossbox/contract.json";

/// Raw provisioning configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Base image, `distribution:version`
    pub image: String,
    /// Toolchain channel
    pub channel: String,
    /// Compile target triple registered with the toolchain manager
    pub target: String,
    /// Host triple of the base image
    pub host: String,
    /// System packages installed before the toolchain
    pub packages: Vec<String>,
    /// Toolchain installer source
    pub installer: InstallerSource,
    /// Filesystem layout of the environment contract
    pub paths: ContractPaths,
    /// Entry point declaration
    pub entrypoint: EntryPointSpec,
    /// Image labels
    pub labels: ImageLabels,
    /// Persisted contract location
    pub contract_file: PathBuf,
    /// Per-command timeout in seconds (0 = none)
    pub command_timeout_secs: u64,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        ProvisionConfig {
            image: "ubuntu:18.04".to_string(),
            channel: "nightly".to_string(),
            target: "x86_64-unknown-linux-musl".to_string(),
            host: "x86_64-unknown-linux-gnu".to_string(),
            packages: DEFAULT_PACKAGES.iter().map(|s| s.to_string()).collect(),
            installer: InstallerSource::default(),
            paths: ContractPaths::default(),
            entrypoint: EntryPointSpec::default(),
            labels: ImageLabels::default(),
            contract_file: PathBuf::from(DEFAULT_CONTRACT_FILE),
            command_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ProvisionConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Load a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading configuration from {:?}", path);
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load `path` if given, else `crossbox.toml` in the current directory
    /// if present, else defaults. Environment overrides are applied last.
    pub fn discover(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::load(p)?,
            None if Path::new(CONFIG_FILE).exists() => Self::load(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides(|k| std::env::var(k).ok()))
    }

    /// Apply `CROSSBOX_IMAGE`, `CROSSBOX_CHANNEL` and `CROSSBOX_TARGET`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(image) = lookup("CROSSBOX_IMAGE") {
            self.image = image;
        }
        if let Some(channel) = lookup("CROSSBOX_CHANNEL") {
            self.channel = channel;
        }
        if let Some(target) = lookup("CROSSBOX_TARGET") {
            self.target = target;
        }
        self
    }

    /// Validate into a typed plan.
    pub fn into_plan(self) -> Result<ProvisionPlan> {
        let image = BaseImageRef::parse(&self.image)?;
        let channel = ToolchainChannel::parse(&self.channel)?;
        let target = TargetTriple::parse(&self.target)?;
        let host = TargetTriple::parse(&self.host)?;
        let packages = SystemPackageSet::new(self.packages)?;
        self.installer.validate()?;
        self.entrypoint.validate()?;
        if !self.contract_file.is_absolute() {
            return Err(ProvisionError::Config(format!(
                "contract_file must be absolute: {}",
                self.contract_file.display()
            )));
        }

        if channel.is_floating() {
            warn!(
                channel = %channel,
                "Floating toolchain channel: content can change between image builds"
            );
        }

        let contract = EnvContract::build(&self.paths, &channel, &host, &target)?;

        let plan = ProvisionPlan {
            image,
            packages,
            channel,
            installer: self.installer,
            target,
            host,
            contract,
            entrypoint: self.entrypoint,
            labels: self.labels,
            contract_file: self.contract_file,
            command_timeout_secs: self.command_timeout_secs,
            steps: ProvisionStep::ALL.to_vec(),
        };
        plan.validate()?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let plan = ProvisionConfig::default().into_plan().unwrap();
        assert_eq!(plan.image.to_string(), "ubuntu:18.04");
        assert_eq!(plan.channel, ToolchainChannel::Nightly);
        assert_eq!(plan.target, TargetTriple::musl_x86_64());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ProvisionConfig::from_toml_str(
            r#"
            image = "debian:12"
            channel = "1.79.0"

            [paths]
            output_dir = "/artifacts"
            "#,
        )
        .unwrap();
        assert_eq!(config.image, "debian:12");
        assert_eq!(config.channel, "1.79.0");
        assert_eq!(config.target, "x86_64-unknown-linux-musl");
        assert_eq!(config.paths.output_dir, PathBuf::from("/artifacts"));
        assert_eq!(config.paths.build_dir, PathBuf::from("/build"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ProvisionConfig::from_toml_str("imagee = \"ubuntu:18.04\"").unwrap_err();
        assert!(matches!(err, ProvisionError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let config = ProvisionConfig::default().with_env_overrides(|k| match k {
            "CROSSBOX_CHANNEL" => Some("stable".to_string()),
            "CROSSBOX_TARGET" => Some("aarch64-unknown-linux-musl".to_string()),
            _ => None,
        });
        assert_eq!(config.channel, "stable");
        assert_eq!(config.target, "aarch64-unknown-linux-musl");
        assert_eq!(config.image, "ubuntu:18.04");
    }

    #[test]
    fn test_invalid_values_fail_plan() {
        let bad_image = ProvisionConfig {
            image: "ubuntu:latest".to_string(),
            ..ProvisionConfig::default()
        };
        assert!(matches!(
            bad_image.into_plan(),
            Err(ProvisionError::InvalidImageRef { .. })
        ));

        let bad_target = ProvisionConfig {
            target: "musl".to_string(),
            ..ProvisionConfig::default()
        };
        assert!(matches!(
            bad_target.into_plan(),
            Err(ProvisionError::InvalidTriple(_))
        ));

        let bad_channel = ProvisionConfig {
            channel: "tip".to_string(),
            ..ProvisionConfig::default()
        };
        assert!(matches!(
            bad_channel.into_plan(),
            Err(ProvisionError::InvalidChannel(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "target = \"armv7-unknown-linux-musleabihf\"\n").unwrap();

        let config = ProvisionConfig::load(&path).unwrap();
        assert_eq!(config.target, "armv7-unknown-linux-musleabihf");
        assert!(ProvisionConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
