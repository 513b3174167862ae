//! crossbox core library
//!
//! Typed provisioning plan for a hermetic musl cross-compile build image,
//! the provisioner that applies it to a host, the Dockerfile renderer that
//! expresses it as cacheable layers, and the build orchestrator contract the
//! image's entry point satisfies.

pub mod config;
pub mod contract;
pub mod dockerfile;
pub mod entrypoint;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod image;
pub mod labels;
pub mod orchestrator;
pub mod packages;
pub mod plan;
pub mod provisioner;
pub mod remote;
pub mod report;
pub mod step;
pub mod telemetry;
pub mod toolchain;
pub mod verify;

pub use config::ProvisionConfig;
pub use contract::{ContractPaths, EnvContract, CONTRACT_KEYS};
pub use dockerfile::{render_dockerfile, write_context, ContextFile};
pub use entrypoint::{EntryPointSpec, EntrySource};
pub use error::{BuildError, ProvisionError};
pub use executor::{CommandOutput, HostCommand, HostExecutor, ProcessExecutor};
pub use image::{BaseImageRef, ImageDigest};
pub use labels::ImageLabels;
pub use orchestrator::{BuildOrchestrator, BuildOutcome, CargoOrchestrator};
pub use packages::SystemPackageSet;
pub use plan::{LayerKey, ProvisionPlan};
pub use provisioner::{ProvisionAbort, Provisioner};
pub use remote::{HttpRemote, RemoteSource};
pub use report::{ProvisionReport, StepRecord};
pub use step::{ProvisionStep, StepOutcome};
pub use telemetry::init_tracing;
pub use toolchain::{InstallerSource, TargetTriple, ToolchainChannel};
pub use verify::ToolchainReport;

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;
