//! crossbox - hermetic musl cross-compilation build images
//!
//! ## Commands
//!
//! - `plan`: Show the validated provisioning plan and its layer keys
//! - `dockerfile`: Render the plan as a Dockerfile or a full build context
//! - `provision`: Apply the plan to the current host
//! - `verify`: Smoke-test an already provisioned toolchain
//! - `env`: Print the environment variable contract
//! - `resolve`: Resolve the base image tag to a registry digest
//! - `build`: Container entry point; compile for the registered target

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbox_core::dockerfile::ORCHESTRATOR_CONTEXT_NAME;
use crossbox_core::verify::verify_toolchain;
use crossbox_core::{
    init_tracing, write_context, BuildOrchestrator, CargoOrchestrator, EnvContract,
    HostExecutor, HttpRemote, ProcessExecutor, ProvisionConfig, ProvisionPlan, ProvisionReport,
    Provisioner, RemoteSource,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Level};

#[derive(Parser)]
#[command(name = "crossbox")]
#[command(author = "crossbox contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Hermetic musl cross-compilation build images", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (default: ./crossbox.toml when present)
    #[arg(short, long, global = true, env = "CROSSBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Override the base image (`distribution:version`)
    #[arg(long, global = true)]
    image: Option<String>,

    /// Override the toolchain channel
    #[arg(long, global = true)]
    channel: Option<String>,

    /// Override the compile target triple
    #[arg(long, global = true)]
    target: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the provisioning plan and per-step layer keys
    Plan,

    /// Render the plan as a Dockerfile
    Dockerfile {
        /// Resolve the base image pin against the registry first
        #[arg(long)]
        resolve: bool,

        /// Write a complete build context here instead of printing
        #[arg(long)]
        context: Option<PathBuf>,

        /// Orchestrator binary copied into the context (default: this executable)
        #[arg(long)]
        orchestrator: Option<PathBuf>,
    },

    /// Apply the plan to the current host
    Provision {
        /// Write the JSON run report here
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Query tool versions and installed targets on the current host
    Verify,

    /// Print the environment variable contract
    Env {
        /// Print as JSON instead of KEY=value lines
        #[arg(long = "as-json")]
        as_json: bool,
    },

    /// Resolve the base image tag to a digest
    Resolve,

    /// Build the project in BUILD_DIR for BUILD_TARGET (container entry point)
    Build {
        /// Extra arguments passed to `cargo build`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cargo_args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    // The entry point never reads configuration; the contract comes from the
    // image environment.
    if let Commands::Build { cargo_args } = &cli.command {
        let code = cmd_build(cargo_args.clone()).await;
        std::process::exit(code);
    }

    let plan = load_plan(&cli)?;
    match cli.command {
        Commands::Plan => cmd_plan(&plan),
        Commands::Dockerfile {
            resolve,
            context,
            orchestrator,
        } => cmd_dockerfile(plan, resolve, context.as_deref(), orchestrator.as_deref()).await,
        Commands::Provision { report } => cmd_provision(&plan, report.as_deref()).await,
        Commands::Verify => cmd_verify(&plan).await,
        Commands::Env { as_json } => {
            print!("{}", format_env(&plan.contract, as_json)?);
            Ok(())
        }
        Commands::Resolve => cmd_resolve(&plan).await,
        Commands::Build { .. } => Ok(()),
    }
}

/// Configuration file, then `CROSSBOX_*` variables, then command-line flags.
fn load_plan(cli: &Cli) -> Result<ProvisionPlan> {
    let mut config = ProvisionConfig::discover(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(image) = &cli.image {
        config.image = image.clone();
    }
    if let Some(channel) = &cli.channel {
        config.channel = channel.clone();
    }
    if let Some(target) = &cli.target {
        config.target = target.clone();
    }
    config
        .into_plan()
        .context("Invalid provisioning configuration")
}

fn cmd_plan(plan: &ProvisionPlan) -> Result<()> {
    println!("Image:    {}", plan.image);
    println!("Channel:  {}", plan.channel);
    println!("Target:   {}", plan.target);
    println!("Packages: {}", plan.packages.names().join(" "));
    println!("Contract: {}", &plan.contract.digest()[..12]);
    println!();
    for (i, layer) in plan.layer_keys().iter().enumerate() {
        println!("{}. {:<24} {}", i + 1, layer.step, &layer.key[..12]);
    }
    println!();
    println!("Plan digest: {}", plan.digest());
    Ok(())
}

async fn cmd_dockerfile(
    mut plan: ProvisionPlan,
    resolve: bool,
    context: Option<&Path>,
    orchestrator: Option<&Path>,
) -> Result<()> {
    if resolve {
        let remote = HttpRemote::new().context("Failed to create HTTP client")?;
        let digest = remote
            .resolve_image(&plan.image)
            .await
            .context("Failed to resolve base image")?;
        plan = plan.with_image_digest(digest);
    }

    let Some(dir) = context else {
        print!("{}", crossbox_core::render_dockerfile(&plan));
        return Ok(());
    };

    let written = write_context(&plan, dir)
        .await
        .with_context(|| format!("Failed to write build context to {:?}", dir))?;
    for path in &written {
        println!("wrote {}", path.display());
    }

    if plan.entrypoint.orchestrator_binary().is_some() {
        let binary = match orchestrator {
            Some(p) => p.to_path_buf(),
            None => {
                if !self_is_static() {
                    warn!(
                        "Copying this dynamically linked crossbox into the image; \
                         pass --orchestrator with a musl build if it cannot run on {}",
                        plan.image
                    );
                }
                std::env::current_exe().context("Cannot locate the crossbox executable")?
            }
        };
        let dest = dir.join(ORCHESTRATOR_CONTEXT_NAME);
        tokio::fs::copy(&binary, &dest)
            .await
            .with_context(|| format!("Failed to copy {:?} into the context", binary))?;
        println!("wrote {}", dest.display());
    }
    Ok(())
}

/// Whether the running executable is a static musl build.
fn self_is_static() -> bool {
    cfg!(target_env = "musl")
}

async fn cmd_provision(plan: &ProvisionPlan, report_path: Option<&Path>) -> Result<()> {
    let executor: Arc<dyn HostExecutor> = Arc::new(ProcessExecutor::new());
    let remote: Arc<dyn RemoteSource> =
        Arc::new(HttpRemote::new().context("Failed to create HTTP client")?);
    let provisioner = Provisioner::new(executor, remote);

    match provisioner.run(plan).await {
        Ok(report) => {
            print_report(&report);
            if let Some(path) = report_path {
                save_report(&report, path)?;
            }
            Ok(())
        }
        Err(abort) => {
            print_report(&abort.report);
            if let Some(path) = report_path {
                save_report(&abort.report, path)?;
            }
            Err(abort.into())
        }
    }
}

fn print_report(report: &ProvisionReport) {
    for record in &report.steps {
        let outcome = serde_json::to_value(record.outcome)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        println!(
            "{:<24} {:<8} {:>7}ms",
            record.step.name(),
            outcome,
            record.duration_ms
        );
        if let Some(err) = &record.error {
            println!("  error: {}", err);
        }
    }
    if let Some(digest) = &report.image_digest {
        println!("Image digest: {}", digest);
    }
    println!(
        "{} in {}ms ({} applied, {} skipped)",
        if report.success { "Provisioned" } else { "FAILED" },
        report.duration_ms,
        report.applied_count(),
        report.skipped_count()
    );
}

fn save_report(report: &ProvisionReport, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write report to {:?}", path))?;
    info!(path = %path.display(), "Report written");
    Ok(())
}

async fn cmd_verify(plan: &ProvisionPlan) -> Result<()> {
    let executor = ProcessExecutor::new();
    let report = verify_toolchain(
        &executor,
        &plan.contract,
        &plan.target,
        &plan.linkers(),
        plan.command_timeout_secs,
    )
    .await
    .context("Toolchain verification failed")?;

    println!("toolchain {}", report.toolchain);
    println!("rustup  {}", report.rustup);
    println!("rustc   {}", report.rustc);
    println!("cargo   {}", report.cargo);
    for (linker, version) in &report.linkers {
        println!("{:<7} {}", linker, version);
    }
    println!("targets {}", report.installed_targets.join(", "));
    Ok(())
}

/// Contract as `KEY=value` lines, or as a JSON object.
fn format_env(contract: &EnvContract, as_json: bool) -> Result<String> {
    if as_json {
        let map: serde_json::Map<String, serde_json::Value> = contract
            .ordered()
            .into_iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        return Ok(format!("{}\n", serde_json::to_string_pretty(&map)?));
    }
    Ok(contract
        .ordered()
        .into_iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect())
}

async fn cmd_resolve(plan: &ProvisionPlan) -> Result<()> {
    let remote = HttpRemote::new().context("Failed to create HTTP client")?;
    let digest = remote
        .resolve_image(&plan.image)
        .await
        .context("Failed to resolve base image")?;
    println!("{}", plan.image.with_digest(digest));
    Ok(())
}

/// Run the default orchestrator; returns the process exit status.
async fn cmd_build(cargo_args: Vec<String>) -> i32 {
    let contract = match EnvContract::from_process_env() {
        Ok(contract) => contract,
        Err(err) => {
            error!(error = %err, "Environment contract incomplete; is this a provisioned image?");
            return err.exit_code();
        }
    };

    let orchestrator =
        CargoOrchestrator::new(Arc::new(ProcessExecutor::new())).with_cargo_args(cargo_args);
    match orchestrator.run(&contract).await {
        Ok(outcome) => {
            for artifact in &outcome.artifacts {
                println!("{}", artifact.display());
            }
            0
        }
        Err(err) => {
            if let crossbox_core::BuildError::CompileFailed { stderr, .. } = &err {
                eprint!("{}", stderr);
            }
            error!(error = %err, "Build failed");
            err.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "crossbox",
            "plan",
            "--verbose",
            "--target",
            "aarch64-unknown-linux-musl",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.target.as_deref(), Some("aarch64-unknown-linux-musl"));
        assert!(matches!(cli.command, Commands::Plan));
    }

    #[test]
    fn test_build_passes_cargo_args_through() {
        let cli =
            Cli::try_parse_from(["crossbox", "build", "--features", "vendored", "--locked"])
                .unwrap();
        match cli.command {
            Commands::Build { cargo_args } => {
                assert_eq!(cargo_args, vec!["--features", "vendored", "--locked"]);
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_build_without_args() {
        let cli = Cli::try_parse_from(["crossbox", "build"]).unwrap();
        assert!(matches!(cli.command, Commands::Build { ref cargo_args } if cargo_args.is_empty()));
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "crossbox",
            "--channel",
            "nightly-2024-06-01",
            "--image",
            "debian:12.5",
            "env",
        ])
        .unwrap();
        let plan = load_plan(&cli).unwrap();
        assert_eq!(plan.channel.name(), "nightly-2024-06-01");
        assert_eq!(plan.image.to_string(), "debian:12.5");
    }

    #[test]
    fn test_invalid_target_rejected() {
        let cli = Cli::try_parse_from(["crossbox", "--target", "not a triple", "plan"]).unwrap();
        assert!(load_plan(&cli).is_err());
    }

    #[test]
    fn test_self_is_static_follows_target_env() {
        #[cfg(target_env = "gnu")]
        assert!(!self_is_static());
        #[cfg(target_env = "musl")]
        assert!(self_is_static());
    }

    #[test]
    fn test_format_env() {
        let plan = ProvisionConfig::default().into_plan().unwrap();
        let lines = format_env(&plan.contract, false).unwrap();
        assert!(lines.starts_with("BUILD_DIR=/build\n"));
        assert!(lines.contains("BUILD_TARGET=x86_64-unknown-linux-musl\n"));

        let json: serde_json::Value =
            serde_json::from_str(&format_env(&plan.contract, true).unwrap()).unwrap();
        assert_eq!(json["OUTPUT_DIR"], "/output");
    }

    #[tokio::test]
    async fn test_dockerfile_context_copies_orchestrator() {
        let dir = tempfile::tempdir().unwrap();
        let fake_binary = dir.path().join("fake-crossbox");
        std::fs::write(&fake_binary, b"binary").unwrap();
        let context = dir.path().join("ctx");

        let plan = ProvisionConfig::default().into_plan().unwrap();
        cmd_dockerfile(plan, false, Some(&context), Some(&fake_binary))
            .await
            .unwrap();

        assert!(context.join("Dockerfile").exists());
        assert!(context.join("entrypoint.sh").exists());
        assert_eq!(
            std::fs::read(context.join(ORCHESTRATOR_CONTEXT_NAME)).unwrap(),
            b"binary"
        );
    }
}
