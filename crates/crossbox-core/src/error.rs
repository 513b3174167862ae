//! Error types for crossbox-core

use thiserror::Error;

/// Errors that abort provisioning.
///
/// Every variant is fatal: the provisioner stops at the first one and never
/// retries, since all inputs are pinned.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Base image reference failed to parse or floats
    #[error("invalid base image reference '{reference}': {reason}")]
    InvalidImageRef { reference: String, reason: String },

    /// Registry has no such image
    #[error("base image '{reference}' could not be resolved: {reason}")]
    UnresolvablePin { reference: String, reason: String },

    /// A system package failed to install
    #[error("system package installation failed{}: {reason}", package_suffix(.package))]
    PackageInstall {
        package: Option<String>,
        reason: String,
    },

    /// Installer fetch, checksum or run failed
    #[error("toolchain installation failed for channel '{channel}': {reason}")]
    ToolchainInstall { channel: String, reason: String },

    /// The toolchain manager rejected the target
    #[error("target registration failed for '{triple}': {reason}")]
    TargetRegistration { triple: String, reason: String },

    /// A version query failed after installation
    #[error("toolchain verification failed: {tool}: {reason}")]
    Verification { tool: String, reason: String },

    /// Malformed target triple
    #[error("invalid target triple '{0}'")]
    InvalidTriple(String),

    /// Malformed toolchain channel
    #[error("invalid toolchain channel '{0}'")]
    InvalidChannel(String),

    /// A step ran, or was planned, before its prerequisite
    #[error("step '{step}' requires '{requires}' to complete first")]
    OrderViolation { step: String, requires: String },

    /// Entry point could not be installed
    #[error("entry point installation failed at {path}: {reason}")]
    EntryPoint { path: String, reason: String },

    /// Environment contract is malformed
    #[error("environment contract error: {0}")]
    Contract(String),

    /// Configuration file or override is invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// External command exceeded its time limit
    #[error("command '{command}' timed out after {timeout_secs} seconds")]
    CommandTimeout { command: String, timeout_secs: u64 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error (registry or installer fetch)
    #[error("HTTP error: {0}")]
    Http(String),
}

fn package_suffix(package: &Option<String>) -> String {
    package
        .as_deref()
        .map(|p| format!(" ({p})"))
        .unwrap_or_default()
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        ProvisionError::Http(err.to_string())
    }
}

impl From<toml::de::Error> for ProvisionError {
    fn from(err: toml::de::Error) -> Self {
        ProvisionError::Config(err.to_string())
    }
}

/// Errors reported by a build orchestrator.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Contract variable absent from the environment
    #[error("environment contract variable {0} is not set")]
    MissingVariable(String),

    /// The requested target was never registered in this image
    #[error("target '{0}' is not registered with the toolchain")]
    TargetNotRegistered(String),

    /// The compiler exited non-zero
    #[error("build failed with exit code {exit_code}")]
    CompileFailed { exit_code: i32, stderr: String },

    /// Output directory missing or not writable
    #[error("output directory {0} is not usable")]
    OutputDir(String),

    /// Failure bubbled up from the host layer
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Process exit status the entry point should report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::CompileFailed { exit_code, .. } if *exit_code != 0 => *exit_code,
            _ => 1,
        }
    }
}
