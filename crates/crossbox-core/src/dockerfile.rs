//! Declarative rendition of a provisioning plan.
//!
//! Each step becomes one or more Dockerfile instructions so that a layered
//! image builder caches it as its own layer. The environment contract is an
//! image-level `ENV` block placed directly below `FROM`: the toolchain steps
//! already depend on `RUSTUP_HOME`, `CARGO_HOME` and `PATH`, so it cannot wait
//! for its own step position.

use crate::contract::EnvContract;
use crate::error::ProvisionError;
use crate::plan::ProvisionPlan;
use crate::provisioner::INSTALLER_PATH;
use crate::step::ProvisionStep;
use crate::toolchain::InstallerSource;
use crate::Result;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Name of the contract file inside the build context.
pub const CONTRACT_CONTEXT_NAME: &str = "contract.json";

/// Name of the orchestrator binary inside the build context.
pub const ORCHESTRATOR_CONTEXT_NAME: &str = "crossbox";

/// A file the Dockerfile `COPY`s from the build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    /// Path relative to the context root
    pub name: String,
    pub contents: Vec<u8>,
    pub mode: u32,
}

/// Render the plan as a Dockerfile.
pub fn render_dockerfile(plan: &ProvisionPlan) -> String {
    let mut out = String::new();
    if plan.image.digest.is_none() {
        warn!(image = %plan.image, "Base image is not pinned to a digest");
    }

    let _ = writeln!(out, "# syntax=docker/dockerfile:1");
    let _ = writeln!(out, "# plan {}", plan.digest());
    let _ = writeln!(out, "FROM {}", plan.image);
    let _ = writeln!(out);

    for (key, value) in plan.labels.pairs() {
        let _ = writeln!(out, "LABEL {}={}", key, quote(value));
    }
    let _ = writeln!(out);

    out.push_str(&env_block(&plan.contract));
    let _ = writeln!(out);

    for (index, layer) in plan.layer_keys().iter().enumerate() {
        if layer.step == ProvisionStep::PinBaseImage {
            continue;
        }
        let _ = writeln!(
            out,
            "# {}. {} (layer {})",
            index + 1,
            layer.step,
            &layer.key[..12]
        );
        for instruction in step_instructions(plan, layer.step) {
            let _ = writeln!(out, "{}", instruction);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "ENTRYPOINT {}", plan.entrypoint.exec_form());
    out
}

fn env_block(contract: &EnvContract) -> String {
    let vars = contract.ordered();
    let mut block = String::from("ENV");
    for (i, (key, value)) in vars.iter().enumerate() {
        let sep = if i + 1 < vars.len() { " \\" } else { "" };
        let _ = write!(block, " {}={}{}\n   ", key, quote(value), sep);
    }
    block.truncate(block.trim_end().len());
    block.push('\n');
    block
}

fn step_instructions(plan: &ProvisionPlan, step: ProvisionStep) -> Vec<String> {
    match step {
        ProvisionStep::PinBaseImage => Vec::new(),
        ProvisionStep::InstallSystemPackages => vec![format!(
            "RUN apt-get update \\\n && DEBIAN_FRONTEND=noninteractive {} \\\n && rm -rf /var/lib/apt/lists/*",
            plan.packages.install_command().join(" ")
        )],
        ProvisionStep::InstallToolchain => vec![installer_run(plan)],
        ProvisionStep::RegisterTarget => vec![format!(
            "RUN rustup target add --toolchain {} {}",
            plan.channel.toolchain_dir(&plan.host),
            plan.target
        )],
        ProvisionStep::VerifyToolchain => {
            let toolchain = plan.channel.toolchain_dir(&plan.host);
            let mut checks = vec![format!(
                "rustup show active-toolchain | grep -q '^{} '",
                toolchain
            )];
            checks.extend(
                ["rustup", "rustc", "cargo"]
                    .iter()
                    .chain(plan.linkers().iter())
                    .map(|tool| format!("{} --version", tool)),
            );
            checks.push(format!(
                "rustup target list --installed --toolchain {} | grep -qx {}",
                toolchain, plan.target
            ));
            vec![format!("RUN {}", checks.join(" \\\n && "))]
        }
        ProvisionStep::FixEnvironment => {
            let contract_dir = plan
                .contract_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));
            vec![
                format!(
                    "RUN mkdir -p \"$BUILD_DIR\" \"$OUTPUT_DIR\" {}",
                    contract_dir.display()
                ),
                format!(
                    "COPY {} {}",
                    CONTRACT_CONTEXT_NAME,
                    plan.contract_file.display()
                ),
            ]
        }
        ProvisionStep::InstallEntryPoint => {
            let mut lines = Vec::new();
            if let Some(binary) = plan.entrypoint.orchestrator_binary() {
                lines.push(format!(
                    "COPY --chmod=0755 {} {}",
                    ORCHESTRATOR_CONTEXT_NAME,
                    binary.display()
                ));
            }
            lines.push(format!(
                "COPY --chmod=0755 {} {}",
                plan.entrypoint.context_name(),
                plan.entrypoint.path.display()
            ));
            lines
        }
    }
}

fn installer_run(plan: &ProvisionPlan) -> String {
    let installer = &plan.installer;
    let mut parts = vec![format!(
        "curl --proto '=https' --tlsv1.2 -sSf {} -o {}",
        installer.url, INSTALLER_PATH
    )];
    if let Some(sha256) = &installer.sha256 {
        parts.push(format!(
            "echo \"{}  {}\" | sha256sum -c -",
            sha256.to_lowercase(),
            INSTALLER_PATH
        ));
    }
    parts.push(format!(
        "sh {} {}",
        INSTALLER_PATH,
        InstallerSource::installer_args(&plan.channel).join(" ")
    ));
    parts.push(format!("rm {}", INSTALLER_PATH));
    format!("RUN {}", parts.join(" \\\n && "))
}

/// Double-quote a value for `ENV`/`LABEL`.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Files the rendered Dockerfile expects next to it.
///
/// The orchestrator binary is not included: when the entry point is the
/// built-in shim, the caller must place it at [`ORCHESTRATOR_CONTEXT_NAME`].
pub fn context_files(plan: &ProvisionPlan) -> Result<Vec<ContextFile>> {
    Ok(vec![
        ContextFile {
            name: "Dockerfile".to_string(),
            contents: render_dockerfile(plan).into_bytes(),
            mode: 0o644,
        },
        ContextFile {
            name: CONTRACT_CONTEXT_NAME.to_string(),
            contents: serde_json::to_vec_pretty(&plan.contract)?,
            mode: 0o644,
        },
        ContextFile {
            name: plan.entrypoint.context_name(),
            contents: plan.entrypoint.contents()?,
            mode: crate::entrypoint::ENTRYPOINT_MODE,
        },
    ])
}

/// Write a complete build context into `dir`.
pub async fn write_context(plan: &ProvisionPlan, dir: &Path) -> Result<Vec<PathBuf>> {
    let entry_name = plan.entrypoint.context_name();
    let reserved = ["Dockerfile", CONTRACT_CONTEXT_NAME, ORCHESTRATOR_CONTEXT_NAME];
    if reserved.contains(&entry_name.as_str()) {
        return Err(ProvisionError::EntryPoint {
            path: plan.entrypoint.path.display().to_string(),
            reason: format!("file name '{}' is reserved in the build context", entry_name),
        });
    }

    tokio::fs::create_dir_all(dir).await?;
    let mut written = Vec::new();
    for file in context_files(plan)? {
        let path = dir.join(&file.name);
        tokio::fs::write(&path, &file.contents).await?;
        set_mode(&path, file.mode).await?;
        written.push(path);
    }
    info!(dir = %dir.display(), files = written.len(), "Build context written");
    Ok(written)
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisionConfig;
    use crate::image::ImageDigest;
    use tempfile::tempdir;

    fn plan() -> ProvisionPlan {
        ProvisionConfig::default().into_plan().unwrap()
    }

    #[test]
    fn test_env_block_follows_from() {
        let text = render_dockerfile(&plan());
        let from = text.find("FROM ").unwrap();
        let env = text.find("\nENV ").unwrap();
        let apt = text.find("apt-get install").unwrap();
        let curl = text.find("curl --proto").unwrap();
        assert!(from < env && env < apt && apt < curl);
    }

    #[test]
    fn test_pinned_from_line() {
        let digest = ImageDigest::parse(&format!("sha256:{}", "ab".repeat(32))).unwrap();
        let text = render_dockerfile(&plan().with_image_digest(digest.clone()));
        assert!(text.contains(&format!("FROM ubuntu:18.04@{}\n", digest)));
    }

    #[test]
    fn test_installer_checksum_line() {
        let mut plan = plan();
        plan.installer.sha256 = Some("AB".repeat(32));
        let text = render_dockerfile(&plan);
        assert!(text.contains(&format!(
            "echo \"{}  {}\" | sha256sum -c -",
            "ab".repeat(32),
            INSTALLER_PATH
        )));
        assert!(text.contains("--default-toolchain nightly --no-modify-path"));
    }

    #[test]
    fn test_file_entry_point_has_no_orchestrator_copy() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("build.sh");
        std::fs::write(&script, "#!/bin/sh\nmake\n").unwrap();

        let mut plan = plan();
        plan.entrypoint.source = crate::entrypoint::EntrySource::File { path: script };
        let text = render_dockerfile(&plan);
        assert!(!text.contains("COPY --chmod=0755 crossbox "));
        assert!(text.contains("COPY --chmod=0755 entrypoint.sh /entrypoint.sh"));
    }

    #[tokio::test]
    async fn test_reserved_entry_point_name() {
        let dir = tempdir().unwrap();
        let mut plan = plan();
        plan.entrypoint.path = PathBuf::from("/usr/local/bin/crossbox");
        assert!(matches!(
            write_context(&plan, dir.path()).await,
            Err(ProvisionError::EntryPoint { .. })
        ));
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"a "b" \c"#), r#""a \"b\" \\c""#);
    }

    #[tokio::test]
    async fn test_write_context() {
        let dir = tempdir().unwrap();
        let written = write_context(&plan(), dir.path()).await.unwrap();
        assert_eq!(written.len(), 3);

        let contract: EnvContract = serde_json::from_slice(
            &std::fs::read(dir.path().join(CONTRACT_CONTEXT_NAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(contract, plan().contract);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("entrypoint.sh"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
