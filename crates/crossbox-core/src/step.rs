//! Provisioning step definitions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The seven provisioning steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStep {
    /// Resolve the base image tag to a digest
    PinBaseImage,

    /// apt-get install the system package set
    InstallSystemPackages,

    /// Run the toolchain manager installer for the channel
    InstallToolchain,

    /// rustup target add <triple>
    RegisterTarget,

    /// Version-query manager, compiler and linker
    VerifyToolchain,

    /// Persist the environment contract and create its directories
    FixEnvironment,

    /// Install the orchestrator at its fixed path
    InstallEntryPoint,
}

impl ProvisionStep {
    /// Every step in canonical order.
    pub const ALL: [ProvisionStep; 7] = [
        ProvisionStep::PinBaseImage,
        ProvisionStep::InstallSystemPackages,
        ProvisionStep::InstallToolchain,
        ProvisionStep::RegisterTarget,
        ProvisionStep::VerifyToolchain,
        ProvisionStep::FixEnvironment,
        ProvisionStep::InstallEntryPoint,
    ];

    /// Get the step name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            ProvisionStep::PinBaseImage => "pin_base_image",
            ProvisionStep::InstallSystemPackages => "install_system_packages",
            ProvisionStep::InstallToolchain => "install_toolchain",
            ProvisionStep::RegisterTarget => "register_target",
            ProvisionStep::VerifyToolchain => "verify_toolchain",
            ProvisionStep::FixEnvironment => "fix_environment",
            ProvisionStep::InstallEntryPoint => "install_entry_point",
        }
    }

    /// Steps whose postconditions this step depends on.
    ///
    /// Pin and entry-point placement depend on nothing, so a layered builder
    /// may reorder or cache them independently.
    pub fn requires(&self) -> &'static [ProvisionStep] {
        match self {
            ProvisionStep::PinBaseImage => &[],
            ProvisionStep::InstallSystemPackages => &[],
            ProvisionStep::InstallToolchain => &[ProvisionStep::InstallSystemPackages],
            ProvisionStep::RegisterTarget => &[ProvisionStep::InstallToolchain],
            ProvisionStep::VerifyToolchain => &[ProvisionStep::RegisterTarget],
            ProvisionStep::FixEnvironment => &[],
            ProvisionStep::InstallEntryPoint => &[],
        }
    }

    /// Whether a failure in this step can be caused by an unreachable network.
    pub fn touches_network(&self) -> bool {
        matches!(
            self,
            ProvisionStep::PinBaseImage
                | ProvisionStep::InstallSystemPackages
                | ProvisionStep::InstallToolchain
                | ProvisionStep::RegisterTarget
        )
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a step ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step changed the host.
    Applied,
    /// The postcondition already held; nothing was done.
    Skipped,
    /// The step failed and provisioning stopped.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names() {
        assert_eq!(ProvisionStep::PinBaseImage.name(), "pin_base_image");
        assert_eq!(ProvisionStep::RegisterTarget.name(), "register_target");
        assert_eq!(ProvisionStep::InstallEntryPoint.to_string(), "install_entry_point");
    }

    #[test]
    fn test_canonical_order_satisfies_requirements() {
        for (i, step) in ProvisionStep::ALL.iter().enumerate() {
            for req in step.requires() {
                let pos = ProvisionStep::ALL.iter().position(|s| s == req).unwrap();
                assert!(pos < i, "{} must come after {}", step, req);
            }
        }
    }

    #[test]
    fn test_dependency_chain() {
        assert_eq!(
            ProvisionStep::InstallToolchain.requires(),
            &[ProvisionStep::InstallSystemPackages]
        );
        assert_eq!(
            ProvisionStep::RegisterTarget.requires(),
            &[ProvisionStep::InstallToolchain]
        );
        assert!(ProvisionStep::PinBaseImage.requires().is_empty());
        assert!(ProvisionStep::InstallEntryPoint.requires().is_empty());
    }

    #[test]
    fn test_outcome_serializes_snake_case() {
        let json = serde_json::to_string(&StepOutcome::Skipped).unwrap();
        assert_eq!(json, "\"skipped\"");
    }
}
