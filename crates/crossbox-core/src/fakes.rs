//! In-memory fakes for the host and network seams (testing only)
//!
//! `FakeHost` simulates a bare Debian-family image: apt, dpkg, the rustup
//! installer, rustup itself, the compilers and cargo. `FakeRemote` stands in
//! for the image registry and the installer host.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::ProvisionError;
use crate::executor::{CommandOutput, HostCommand, HostExecutor};
use crate::image::{BaseImageRef, ImageDigest};
use crate::packages::DEFAULT_PACKAGES;
use crate::remote::RemoteSource;
use crate::toolchain::DEFAULT_INSTALLER_URL;
use crate::Result;

pub const FAKE_RUSTUP_VERSION: &str = "rustup 1.27.1 (54dd3d00f 2024-04-24)";
pub const FAKE_RUSTC_VERSION: &str = "rustc 1.80.0-nightly (7c52d2db6 2024-06-03)";
pub const FAKE_CARGO_VERSION: &str = "cargo 1.80.0-nightly (34a6a87d8 2024-06-04)";
pub const FAKE_CC_VERSION: &str = "cc (Ubuntu 7.5.0-3ubuntu1~18.04) 7.5.0";

/// Installer script served by [`FakeRemote::new`].
pub const FAKE_INSTALLER: &[u8] = b"#!/bin/sh\n# rustup-init\n";

// ---------------------------------------------------------------------------
// FakeHost
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HostState {
    host_triple: String,
    available_packages: BTreeSet<String>,
    installed_packages: BTreeSet<String>,
    rustup_installed: bool,
    toolchains: Vec<String>,
    default_toolchain: Option<String>,
    known_targets: BTreeSet<String>,
    /// Toolchain name → installed targets
    targets: BTreeMap<String, BTreeSet<String>>,
    files: BTreeMap<PathBuf, (Vec<u8>, u32)>,
    dirs: BTreeSet<PathBuf>,
    artifacts: Vec<String>,
    failures: Vec<(String, CommandOutput)>,
    hangs: Vec<String>,
    history: Vec<HostCommand>,
}

/// A simulated provisioning host backed by a `Mutex`-guarded state.
#[derive(Debug)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHost {
    /// A bare `x86_64-unknown-linux-gnu` image with nothing installed.
    pub fn new() -> Self {
        let host = "x86_64-unknown-linux-gnu".to_string();
        let available = DEFAULT_PACKAGES
            .iter()
            .copied()
            .chain(["git", "cmake", "libssl-dev", "gcc-aarch64-linux-gnu"])
            .map(str::to_string)
            .collect();
        let known_targets = [
            "x86_64-unknown-linux-gnu",
            "x86_64-unknown-linux-musl",
            "aarch64-unknown-linux-gnu",
            "aarch64-unknown-linux-musl",
            "i686-unknown-linux-musl",
            "armv7-unknown-linux-musleabihf",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        FakeHost {
            state: Mutex::new(HostState {
                host_triple: host,
                available_packages: available,
                installed_packages: BTreeSet::new(),
                rustup_installed: false,
                toolchains: Vec::new(),
                default_toolchain: None,
                known_targets,
                targets: BTreeMap::new(),
                files: BTreeMap::new(),
                dirs: BTreeSet::new(),
                artifacts: vec!["app".to_string()],
                failures: Vec::new(),
                hangs: Vec::new(),
                history: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark packages as already installed.
    pub fn with_installed_packages(self, packages: &[&str]) -> Self {
        {
            let mut state = self.state();
            for p in packages {
                state.available_packages.insert(p.to_string());
                state.installed_packages.insert(p.to_string());
            }
        }
        self
    }

    /// Binaries `cargo build` leaves in the release directory.
    pub fn with_artifacts(self, names: &[&str]) -> Self {
        self.state().artifacts = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Make every command whose argv starts with `prefix` exit with
    /// `exit_code` and `stderr`.
    pub fn fail_on(self, prefix: &str, exit_code: i32, stderr: &str) -> Self {
        self.state().failures.push((
            prefix.to_string(),
            CommandOutput {
                exit_code,
                stdout: String::new(),
                stderr: stderr.to_string(),
                duration_ms: 0,
            },
        ));
        self
    }

    /// Make every command whose argv starts with `prefix` time out.
    pub fn hang_on(self, prefix: &str) -> Self {
        self.state().hangs.push(prefix.to_string());
        self
    }

    /// Every command run so far.
    pub fn history(&self) -> Vec<HostCommand> {
        self.state().history.clone()
    }

    /// Display strings of every command run so far.
    pub fn commands(&self) -> Vec<String> {
        self.state().history.iter().map(HostCommand::display).collect()
    }

    /// Whether any command starting with `prefix` ran.
    pub fn ran(&self, prefix: &str) -> bool {
        self.commands().iter().any(|c| c.starts_with(prefix))
    }

    pub fn clear_history(&self) {
        self.state().history.clear();
    }

    pub fn installed_packages(&self) -> Vec<String> {
        self.state().installed_packages.iter().cloned().collect()
    }

    /// Targets of the default toolchain.
    pub fn installed_targets(&self) -> Vec<String> {
        let state = self.state();
        state
            .default_toolchain
            .as_ref()
            .map(|t| state.targets_of(t))
            .unwrap_or_default()
    }

    pub fn targets_of(&self, toolchain: &str) -> Vec<String> {
        self.state().targets_of(toolchain)
    }

    pub fn default_toolchain(&self) -> Option<String> {
        self.state().default_toolchain.clone()
    }

    /// Contents and mode of a file written through the executor.
    pub fn file(&self, path: &Path) -> Option<(Vec<u8>, u32)> {
        self.state().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &Path) -> bool {
        self.state().dirs.contains(path)
    }
}

fn reply(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: stdout.into(),
        stderr: stderr.into(),
        duration_ms: 0,
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    reply(0, stdout, "")
}

fn not_found(program: &str) -> CommandOutput {
    reply(127, "", format!("sh: 1: {}: not found", program))
}

fn flag_value<'a>(argv: &'a [String], flag: &str) -> Option<&'a str> {
    argv.iter()
        .position(|a| a == flag)
        .and_then(|i| argv.get(i + 1))
        .map(String::as_str)
}

impl HostState {
    fn has_linker(&self) -> bool {
        self.installed_packages.contains("build-essential")
    }

    fn targets_of(&self, toolchain: &str) -> Vec<String> {
        self.targets
            .get(toolchain)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Toolchain named by `--toolchain`, else the default.
    fn selected_toolchain(&self, args: &[&str]) -> Option<String> {
        args.iter()
            .position(|a| *a == "--toolchain")
            .and_then(|i| args.get(i + 1))
            .map(|t| t.to_string())
            .or_else(|| self.default_toolchain.clone())
    }

    fn dispatch(&mut self, command: &HostCommand) -> Result<CommandOutput> {
        let argv: Vec<&str> = command.argv.iter().map(String::as_str).collect();
        let output = match argv.as_slice() {
            ["dpkg-query", "-W", _format, packages @ ..] => self.dpkg_query(packages),
            ["apt-get", "update"] => ok("Reading package lists... Done\n"),
            ["apt-get", "install", args @ ..] => self.apt_install(args),
            ["cc", "--version"] if self.has_linker() => ok(format!("{}\n", FAKE_CC_VERSION)),
            ["musl-gcc", "--version"] if self.installed_packages.contains("musl-tools") => {
                ok(format!("{}\n", FAKE_CC_VERSION))
            }
            ["sh", script, ..] => self.run_installer(script, &command.argv),
            ["rustup", args @ ..] if self.rustup_installed => self.rustup(args),
            ["rustc", "--version"] if self.default_toolchain.is_some() => {
                ok(format!("{}\n", FAKE_RUSTC_VERSION))
            }
            ["cargo", "--version"] if self.default_toolchain.is_some() => {
                ok(format!("{}\n", FAKE_CARGO_VERSION))
            }
            ["cargo", "build", ..] if self.default_toolchain.is_some() => {
                self.cargo_build(command)?
            }
            [program, ..] => not_found(program),
            [] => return Err(ProvisionError::Config("empty command".to_string())),
        };
        Ok(output)
    }

    fn dpkg_query(&self, packages: &[&str]) -> CommandOutput {
        let mut stdout = String::new();
        let mut stderr = String::new();
        for p in packages {
            if self.installed_packages.contains(*p) {
                stdout.push_str(&format!("{} install ok installed\n", p));
            } else {
                stderr.push_str(&format!("dpkg-query: no packages found matching {}\n", p));
            }
        }
        reply(if stderr.is_empty() { 0 } else { 1 }, stdout, stderr)
    }

    fn apt_install(&mut self, args: &[&str]) -> CommandOutput {
        let packages: Vec<&str> = args.iter().copied().filter(|a| !a.starts_with('-')).collect();
        if let Some(unknown) = packages
            .iter()
            .find(|p| !self.available_packages.contains(**p))
        {
            return reply(100, "", format!("E: Unable to locate package {}\n", unknown));
        }
        for p in packages {
            self.installed_packages.insert(p.to_string());
        }
        ok("")
    }

    fn run_installer(&mut self, script: &str, argv: &[String]) -> CommandOutput {
        if !self.files.contains_key(Path::new(script)) {
            return reply(127, "", format!("sh: 0: cannot open {}: No such file", script));
        }
        if !self.has_linker() {
            return reply(1, "", "error: no working linker (cc) found\n");
        }
        let channel = flag_value(argv, "--default-toolchain").unwrap_or("stable");
        let toolchain = format!("{}-{}", channel, self.host_triple);
        if !self.toolchains.contains(&toolchain) {
            self.toolchains.push(toolchain.clone());
        }
        self.rustup_installed = true;
        let host = self.host_triple.clone();
        self.targets.entry(toolchain.clone()).or_default().insert(host);
        self.default_toolchain = Some(toolchain);
        ok(format!("info: default toolchain set to '{}'\n", channel))
    }

    fn rustup(&mut self, args: &[&str]) -> CommandOutput {
        match args {
            ["--version"] => ok(format!("{}\n", FAKE_RUSTUP_VERSION)),
            ["toolchain", "list"] if self.toolchains.is_empty() => ok("no installed toolchains\n"),
            ["toolchain", "list"] => {
                let mut out = String::new();
                for t in &self.toolchains {
                    let suffix = if self.default_toolchain.as_ref() == Some(t) {
                        " (default)"
                    } else {
                        ""
                    };
                    out.push_str(&format!("{}{}\n", t, suffix));
                }
                ok(out)
            }
            ["show", "active-toolchain"] => match &self.default_toolchain {
                Some(t) => ok(format!("{} (default)\n", t)),
                None => reply(1, "", "error: no default toolchain is configured\n"),
            },
            ["default", toolchain] => {
                if !self.toolchains.iter().any(|t| t.as_str() == *toolchain) {
                    return reply(
                        1,
                        "",
                        format!("error: toolchain '{}' is not installed\n", toolchain),
                    );
                }
                self.default_toolchain = Some(toolchain.to_string());
                ok(format!("info: default toolchain set to '{}'\n", toolchain))
            }
            ["target", "list", "--installed", rest @ ..] => {
                let Some(toolchain) = self.selected_toolchain(rest) else {
                    return reply(1, "", "error: no default toolchain is configured\n");
                };
                if !self.toolchains.contains(&toolchain) {
                    return reply(
                        1,
                        "",
                        format!("error: toolchain '{}' is not installed\n", toolchain),
                    );
                }
                let mut out = String::new();
                for t in self.targets_of(&toolchain) {
                    out.push_str(&t);
                    out.push('\n');
                }
                ok(out)
            }
            ["target", "add", rest @ ..] if !rest.is_empty() => {
                let Some(toolchain) = self.selected_toolchain(rest) else {
                    return reply(1, "", "error: no default toolchain is configured\n");
                };
                let triple = rest[rest.len() - 1];
                if !self.toolchains.contains(&toolchain) {
                    return reply(
                        1,
                        "",
                        format!("error: toolchain '{}' is not installed\n", toolchain),
                    );
                }
                if !self.known_targets.contains(triple) {
                    return reply(
                        1,
                        "",
                        format!(
                            "error: toolchain '{}' does not support target '{}'\n",
                            toolchain, triple
                        ),
                    );
                }
                self.targets
                    .entry(toolchain)
                    .or_default()
                    .insert(triple.to_string());
                reply(0, "", format!("info: installing component 'rust-std' for '{}'\n", triple))
            }
            _ => reply(1, "", format!("error: unrecognized rustup arguments {:?}\n", args)),
        }
    }

    /// Writes the configured artifacts into the real release directory.
    fn cargo_build(&self, command: &HostCommand) -> Result<CommandOutput> {
        let Some(target) = flag_value(&command.argv, "--target") else {
            return Ok(reply(1, "", "error: --target is required\n"));
        };
        let installed = self
            .default_toolchain
            .as_ref()
            .and_then(|t| self.targets.get(t))
            .is_some_and(|t| t.contains(target));
        if !installed {
            return Ok(reply(
                101,
                "",
                format!(
                    "error[E0463]: can't find crate for `std`\n  = note: the `{}` target may not be installed\n",
                    target
                ),
            ));
        }
        let Some(cwd) = &command.cwd else {
            return Ok(reply(101, "", "error: could not find `Cargo.toml`\n"));
        };

        let release = cwd.join("target").join(target).join("release");
        std::fs::create_dir_all(&release)?;
        for name in &self.artifacts {
            let path = release.join(name);
            std::fs::write(&path, b"\x7fELF fake static binary")?;
            set_executable(&path)?;
            std::fs::write(release.join(format!("{}.d", name)), b"deps")?;
        }
        Ok(reply(
            0,
            "",
            "    Finished `release` profile [optimized] target(s)\n",
        ))
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl HostExecutor for FakeHost {
    async fn run(&self, command: &HostCommand) -> Result<CommandOutput> {
        let mut state = self.state();
        state.history.push(command.clone());

        let display = command.display();
        if state.hangs.iter().any(|p| display.starts_with(p.as_str())) {
            return Err(ProvisionError::CommandTimeout {
                command: display,
                timeout_secs: command.timeout_secs,
            });
        }
        if let Some((_, output)) = state
            .failures
            .iter()
            .find(|(prefix, _)| display.starts_with(prefix.as_str()))
        {
            return Ok(output.clone());
        }
        state.dispatch(command)
    }

    async fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
        self.state()
            .files
            .insert(path.to_path_buf(), (contents.to_vec(), mode));
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut state = self.state();
        for ancestor in path.ancestors() {
            state.dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeRemote
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RemoteState {
    images: BTreeMap<String, ImageDigest>,
    documents: BTreeMap<String, Vec<u8>>,
    requests: Vec<String>,
}

/// In-memory registry and HTTPS host.
#[derive(Debug, Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
}

impl FakeRemote {
    /// Knows `ubuntu:18.04` and serves [`FAKE_INSTALLER`] at the default
    /// installer URL.
    pub fn new() -> Self {
        Self::empty()
            .with_image("ubuntu:18.04")
            .with_document(DEFAULT_INSTALLER_URL, FAKE_INSTALLER)
    }

    /// Knows nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an image; its digest is derived from the reference.
    pub fn with_image(self, reference: &str) -> Self {
        let digest = Self::digest_for(reference);
        self.state().images.insert(reference.to_string(), digest);
        self
    }

    pub fn with_document(self, url: &str, body: &[u8]) -> Self {
        self.state()
            .documents
            .insert(url.to_string(), body.to_vec());
        self
    }

    /// Digest the fake registry reports for `reference`.
    pub fn digest_for(reference: &str) -> ImageDigest {
        ImageDigest(format!(
            "sha256:{}",
            hex::encode(Sha256::digest(reference.as_bytes()))
        ))
    }

    /// Every image reference and URL requested so far.
    pub fn requests(&self) -> Vec<String> {
        self.state().requests.clone()
    }
}

#[async_trait]
impl RemoteSource for FakeRemote {
    async fn resolve_image(&self, image: &BaseImageRef) -> Result<ImageDigest> {
        let mut state = self.state();
        state.requests.push(image.to_string());

        let unpinned = BaseImageRef {
            digest: None,
            ..image.clone()
        }
        .to_string();
        let digest = state
            .images
            .get(&unpinned)
            .cloned()
            .ok_or_else(|| ProvisionError::UnresolvablePin {
                reference: image.to_string(),
                reason: "manifest unknown".to_string(),
            })?;

        match &image.digest {
            Some(pinned) if pinned != &digest => Err(ProvisionError::UnresolvablePin {
                reference: image.to_string(),
                reason: format!("registry reports {}", digest),
            }),
            _ => Ok(digest),
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut state = self.state();
        state.requests.push(url.to_string());
        state
            .documents
            .get(url)
            .cloned()
            .ok_or_else(|| ProvisionError::Http(format!("404 Not Found: {}", url)))
    }
}
