//! Toolchain smoke test
//!
//! Not a functional build: the active toolchain must be the one the contract
//! names, every tool must answer a version query, and that toolchain's target
//! list must contain the registered triple. The point is to fail the
//! image build early instead of failing a later CI build.

use crate::contract::EnvContract;
use crate::error::ProvisionError;
use crate::executor::{HostCommand, HostExecutor};
use crate::toolchain::TargetTriple;
use crate::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Versions reported by the provisioned tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainReport {
    /// Output of `rustup show active-toolchain`
    pub toolchain: String,
    pub rustup: String,
    pub rustc: String,
    pub cargo: String,
    /// Linker command → reported version line
    pub linkers: BTreeMap<String, String>,
    /// Output of `rustup target list --installed`
    pub installed_targets: Vec<String>,
}

impl ToolchainReport {
    pub fn has_target(&self, triple: &TargetTriple) -> bool {
        let wanted = triple.to_string();
        self.installed_targets.iter().any(|t| *t == wanted)
    }
}

/// Extract the first `X.Y.Z[-pre]` version from a `--version` line.
pub fn parse_version(output: &str) -> Option<String> {
    let re = Regex::new(r"\b(\d+\.\d+\.\d+(?:-[0-9A-Za-z.]+)?)").ok()?;
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse `rustup target list --installed`.
pub fn parse_target_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim().trim_end_matches(" (installed)").to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

/// Toolchain name from `rustup toolchain list` or `rustup show active-toolchain`
/// output, without the ` (default)` style annotations.
pub fn parse_toolchain_name(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

async fn query_version(
    executor: &dyn HostExecutor,
    contract: &EnvContract,
    tool: &str,
    timeout_secs: u64,
) -> Result<String> {
    let cmd = HostCommand::new(contract, [tool, "--version"]).with_timeout(timeout_secs);
    let output = executor.run(&cmd).await.map_err(|e| ProvisionError::Verification {
        tool: tool.to_string(),
        reason: e.to_string(),
    })?;
    if !output.success() {
        return Err(ProvisionError::Verification {
            tool: tool.to_string(),
            reason: format!("exit code {}: {}", output.exit_code, output.diagnostic()),
        });
    }
    let first_line = output.stdout.lines().next().unwrap_or_default().trim();
    let version = parse_version(first_line).unwrap_or_else(|| first_line.to_string());
    debug!(tool = %tool, version = %version, "Version query");
    Ok(version)
}

/// Read the targets installed for the contract's toolchain.
pub async fn installed_targets(
    executor: &dyn HostExecutor,
    contract: &EnvContract,
    timeout_secs: u64,
) -> Result<Vec<String>> {
    let mut argv = vec!["rustup", "target", "list", "--installed"];
    if let Some(toolchain) = contract.toolchain() {
        argv.extend(["--toolchain", toolchain]);
    }
    let cmd = HostCommand::new(contract, argv).with_timeout(timeout_secs);
    let output = executor.run(&cmd).await?;
    if !output.success() {
        return Err(ProvisionError::Verification {
            tool: "rustup".to_string(),
            reason: format!("target list failed: {}", output.diagnostic()),
        });
    }
    Ok(parse_target_list(&output.stdout))
}

/// Toolchain `rustc` and `cargo` resolve to.
pub async fn active_toolchain(
    executor: &dyn HostExecutor,
    contract: &EnvContract,
    timeout_secs: u64,
) -> Result<String> {
    let cmd = HostCommand::new(contract, ["rustup", "show", "active-toolchain"])
        .with_timeout(timeout_secs);
    let output = executor.run(&cmd).await?;
    if !output.success() {
        return Err(ProvisionError::Verification {
            tool: "rustup".to_string(),
            reason: format!("no active toolchain: {}", output.diagnostic()),
        });
    }
    output
        .stdout
        .lines()
        .find_map(parse_toolchain_name)
        .map(str::to_string)
        .ok_or_else(|| ProvisionError::Verification {
            tool: "rustup".to_string(),
            reason: "no active toolchain".to_string(),
        })
}

/// Query the manager, compiler, build tool and linkers.
pub async fn verify_toolchain(
    executor: &dyn HostExecutor,
    contract: &EnvContract,
    target: &TargetTriple,
    linkers: &[&str],
    timeout_secs: u64,
) -> Result<ToolchainReport> {
    let toolchain = active_toolchain(executor, contract, timeout_secs)
        .await
        .map_err(|e| match e {
            ProvisionError::Verification { .. } => e,
            other => ProvisionError::Verification {
                tool: "rustup".to_string(),
                reason: other.to_string(),
            },
        })?;
    if let Some(expected) = contract.toolchain() {
        if toolchain != expected {
            return Err(ProvisionError::Verification {
                tool: "rustup".to_string(),
                reason: format!("active toolchain is {}, expected {}", toolchain, expected),
            });
        }
    }

    let rustup = query_version(executor, contract, "rustup", timeout_secs).await?;
    let rustc = query_version(executor, contract, "rustc", timeout_secs).await?;
    let cargo = query_version(executor, contract, "cargo", timeout_secs).await?;

    let mut linker_versions = BTreeMap::new();
    for linker in linkers {
        let version = query_version(executor, contract, linker, timeout_secs).await?;
        linker_versions.insert(linker.to_string(), version);
    }

    let installed = installed_targets(executor, contract, timeout_secs).await?;
    let report = ToolchainReport {
        toolchain,
        rustup,
        rustc,
        cargo,
        linkers: linker_versions,
        installed_targets: installed,
    };

    if !report.has_target(target) {
        return Err(ProvisionError::Verification {
            tool: "rustup".to_string(),
            reason: format!("target {} is not installed", target),
        });
    }

    info!(
        toolchain = %report.toolchain,
        rustc = %report.rustc,
        target = %target,
        "Toolchain verified"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("rustc 1.80.0-nightly (7c52d2db6 2024-06-03)"),
            Some("1.80.0-nightly".to_string())
        );
        assert_eq!(
            parse_version("rustup 1.27.1 (54dd3d00f 2024-04-24)"),
            Some("1.27.1".to_string())
        );
        assert_eq!(
            parse_version("cc (Ubuntu 7.5.0-3ubuntu1~18.04) 7.5.0"),
            Some("7.5.0-3ubuntu1".to_string())
        );
        assert_eq!(parse_version("no version here"), None);
    }

    #[test]
    fn test_parse_target_list() {
        let out = "x86_64-unknown-linux-gnu\nx86_64-unknown-linux-musl\n\n";
        assert_eq!(
            parse_target_list(out),
            vec!["x86_64-unknown-linux-gnu", "x86_64-unknown-linux-musl"]
        );
        assert_eq!(
            parse_target_list("x86_64-unknown-linux-musl (installed)\n"),
            vec!["x86_64-unknown-linux-musl"]
        );
    }

    #[test]
    fn test_parse_toolchain_name() {
        assert_eq!(
            parse_toolchain_name("nightly-x86_64-unknown-linux-gnu (default)"),
            Some("nightly-x86_64-unknown-linux-gnu")
        );
        assert_eq!(
            parse_toolchain_name("nightly-2024-05-01-x86_64-unknown-linux-gnu"),
            Some("nightly-2024-05-01-x86_64-unknown-linux-gnu")
        );
        assert_eq!(parse_toolchain_name("   "), None);
    }

    #[test]
    fn test_report_has_target() {
        let report = ToolchainReport {
            toolchain: "nightly-x86_64-unknown-linux-gnu".into(),
            rustup: "1.27.1".into(),
            rustc: "1.80.0".into(),
            cargo: "1.80.0".into(),
            linkers: BTreeMap::new(),
            installed_targets: vec!["x86_64-unknown-linux-musl".into()],
        };
        assert!(report.has_target(&TargetTriple::musl_x86_64()));
        assert!(!report.has_target(&TargetTriple::gnu_x86_64()));
    }
}
