//! Environment variable contract
//!
//! The contract replaces shell-profile exports with an explicit, immutable
//! name → value map. It is fixed once at provisioning time and injected into
//! every process the image spawns, including the entry point.

use crate::error::{BuildError, ProvisionError};
use crate::toolchain::{TargetTriple, ToolchainChannel};
use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const BUILD_DIR: &str = "BUILD_DIR";
pub const OUTPUT_DIR: &str = "OUTPUT_DIR";
pub const RUST_BACKTRACE: &str = "RUST_BACKTRACE";
pub const RUSTUP_HOME: &str = "RUSTUP_HOME";
pub const CARGO_HOME: &str = "CARGO_HOME";
pub const PATH: &str = "PATH";
pub const RUST_TOOLCHAIN_PREFIX: &str = "RUST_TOOLCHAIN_PREFIX";
pub const BUILD_TARGET: &str = "BUILD_TARGET";

/// Every key the contract carries, in rendering order.
pub const CONTRACT_KEYS: &[&str] = &[
    BUILD_DIR,
    OUTPUT_DIR,
    RUST_BACKTRACE,
    RUSTUP_HOME,
    CARGO_HOME,
    PATH,
    RUST_TOOLCHAIN_PREFIX,
    BUILD_TARGET,
];

/// Base search path of a Debian-family image, before the toolchain bin dir.
pub const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Filesystem layout the contract is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractPaths {
    pub build_dir: PathBuf,
    pub output_dir: PathBuf,
    pub rustup_home: PathBuf,
    pub cargo_home: PathBuf,
    pub backtrace: bool,
}

impl Default for ContractPaths {
    fn default() -> Self {
        ContractPaths {
            build_dir: PathBuf::from("/build"),
            output_dir: PathBuf::from("/output"),
            rustup_home: PathBuf::from("/usr/local/rustup"),
            cargo_home: PathBuf::from("/usr/local/cargo"),
            backtrace: true,
        }
    }
}

/// Immutable environment contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvContract {
    vars: BTreeMap<String, String>,
}

impl EnvContract {
    /// Derive the contract from paths, channel and triples.
    pub fn build(
        paths: &ContractPaths,
        channel: &ToolchainChannel,
        host: &TargetTriple,
        target: &TargetTriple,
    ) -> Result<Self> {
        for (label, path) in [
            ("build_dir", &paths.build_dir),
            ("output_dir", &paths.output_dir),
            ("rustup_home", &paths.rustup_home),
            ("cargo_home", &paths.cargo_home),
        ] {
            if !path.is_absolute() {
                return Err(ProvisionError::Contract(format!(
                    "{} must be an absolute path, got {:?}",
                    label, path
                )));
            }
        }
        if paths.build_dir == paths.output_dir {
            return Err(ProvisionError::Contract(
                "build_dir and output_dir must differ".to_string(),
            ));
        }

        let cargo_bin = paths.cargo_home.join("bin");
        let toolchain_prefix = paths
            .rustup_home
            .join("toolchains")
            .join(channel.toolchain_dir(host));

        let mut vars = BTreeMap::new();
        vars.insert(BUILD_DIR.to_string(), display(&paths.build_dir));
        vars.insert(OUTPUT_DIR.to_string(), display(&paths.output_dir));
        vars.insert(
            RUST_BACKTRACE.to_string(),
            if paths.backtrace { "1" } else { "0" }.to_string(),
        );
        vars.insert(RUSTUP_HOME.to_string(), display(&paths.rustup_home));
        vars.insert(CARGO_HOME.to_string(), display(&paths.cargo_home));
        vars.insert(
            PATH.to_string(),
            format!("{}:{}", display(&cargo_bin), SYSTEM_PATH),
        );
        vars.insert(RUST_TOOLCHAIN_PREFIX.to_string(), display(&toolchain_prefix));
        vars.insert(BUILD_TARGET.to_string(), target.to_string());

        Ok(EnvContract { vars })
    }

    /// Read the contract back from the current process environment.
    ///
    /// This is how the entry point receives it: the image sets every key at
    /// image level, so a missing key means the image was not provisioned.
    pub fn from_process_env() -> std::result::Result<Self, BuildError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the contract from an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> std::result::Result<Self, BuildError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut vars = BTreeMap::new();
        for key in CONTRACT_KEYS {
            let value = lookup(key).ok_or_else(|| BuildError::MissingVariable(key.to_string()))?;
            vars.insert(key.to_string(), value);
        }
        let contract = EnvContract { vars };
        TargetTriple::parse(contract.get(BUILD_TARGET).unwrap_or_default())?;
        Ok(contract)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Variables in [`CONTRACT_KEYS`] order.
    pub fn ordered(&self) -> Vec<(&str, &str)> {
        CONTRACT_KEYS
            .iter()
            .filter_map(|k| self.vars.get(*k).map(|v| (*k, v.as_str())))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    pub fn build_dir(&self) -> PathBuf {
        PathBuf::from(self.get(BUILD_DIR).unwrap_or_default())
    }

    pub fn output_dir(&self) -> PathBuf {
        PathBuf::from(self.get(OUTPUT_DIR).unwrap_or_default())
    }

    pub fn cargo_bin(&self) -> PathBuf {
        Path::new(self.get(CARGO_HOME).unwrap_or_default()).join("bin")
    }

    /// Toolchain name (`<channel>-<host>`) the prefix points at.
    pub fn toolchain(&self) -> Option<&str> {
        self.get(RUST_TOOLCHAIN_PREFIX)
            .and_then(|prefix| prefix.trim_end_matches('/').rsplit('/').next())
            .filter(|name| !name.is_empty())
    }

    /// Target triple the entry point compiles for.
    pub fn target(&self) -> Result<TargetTriple> {
        TargetTriple::parse(self.get(BUILD_TARGET).unwrap_or_default())
    }

    /// SHA-256 over the sorted `key=value` pairs.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.vars {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\0");
        }
        hex::encode(hasher.finalize())
    }

    /// Contract plus per-command extras, for a spawned process.
    ///
    /// Extras never override contract keys.
    pub fn process_env(&self, extra: &[(String, String)]) -> BTreeMap<String, String> {
        let mut env = self.vars.clone();
        for (key, value) in extra {
            env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        env
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> EnvContract {
        EnvContract::build(
            &ContractPaths::default(),
            &ToolchainChannel::Nightly,
            &TargetTriple::gnu_x86_64(),
            &TargetTriple::musl_x86_64(),
        )
        .unwrap()
    }

    #[test]
    fn test_default_contract_values() {
        let c = contract();
        assert_eq!(c.get(BUILD_DIR), Some("/build"));
        assert_eq!(c.get(OUTPUT_DIR), Some("/output"));
        assert_eq!(c.get(RUST_BACKTRACE), Some("1"));
        assert_eq!(c.get(RUSTUP_HOME), Some("/usr/local/rustup"));
        assert_eq!(c.get(CARGO_HOME), Some("/usr/local/cargo"));
        assert_eq!(
            c.get(RUST_TOOLCHAIN_PREFIX),
            Some("/usr/local/rustup/toolchains/nightly-x86_64-unknown-linux-gnu")
        );
        assert_eq!(c.get(BUILD_TARGET), Some("x86_64-unknown-linux-musl"));
        assert!(c.get(PATH).unwrap().starts_with("/usr/local/cargo/bin:"));
        assert_eq!(c.toolchain(), Some("nightly-x86_64-unknown-linux-gnu"));
    }

    #[test]
    fn test_ordered_covers_every_key() {
        let c = contract();
        let keys: Vec<&str> = c.ordered().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, CONTRACT_KEYS);
    }

    #[test]
    fn test_digest_deterministic() {
        assert_eq!(contract().digest(), contract().digest());
        assert_eq!(contract().digest().len(), 64);
    }

    #[test]
    fn test_digest_changes_with_target() {
        let other = EnvContract::build(
            &ContractPaths::default(),
            &ToolchainChannel::Nightly,
            &TargetTriple::gnu_x86_64(),
            &TargetTriple::parse("aarch64-unknown-linux-musl").unwrap(),
        )
        .unwrap();
        assert_ne!(contract().digest(), other.digest());
    }

    #[test]
    fn test_rejects_relative_and_overlapping_paths() {
        let relative = ContractPaths {
            build_dir: PathBuf::from("build"),
            ..ContractPaths::default()
        };
        assert!(EnvContract::build(
            &relative,
            &ToolchainChannel::Nightly,
            &TargetTriple::gnu_x86_64(),
            &TargetTriple::musl_x86_64()
        )
        .is_err());

        let same = ContractPaths {
            output_dir: PathBuf::from("/build"),
            ..ContractPaths::default()
        };
        assert!(EnvContract::build(
            &same,
            &ToolchainChannel::Nightly,
            &TargetTriple::gnu_x86_64(),
            &TargetTriple::musl_x86_64()
        )
        .is_err());
    }

    #[test]
    fn test_from_lookup_roundtrip() {
        let c = contract();
        let back = EnvContract::from_lookup(|k| c.get(k).map(str::to_string)).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_from_lookup_missing_key() {
        let c = contract();
        let err = EnvContract::from_lookup(|k| {
            if k == BUILD_TARGET {
                None
            } else {
                c.get(k).map(str::to_string)
            }
        })
        .unwrap_err();
        assert!(matches!(err, BuildError::MissingVariable(ref k) if k == BUILD_TARGET));
    }

    #[test]
    fn test_process_env_extras_cannot_override() {
        let c = contract();
        let env = c.process_env(&[
            ("PATH".to_string(), "/tmp/evil".to_string()),
            ("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string()),
        ]);
        assert_eq!(env.get("PATH").map(String::as_str), c.get(PATH));
        assert_eq!(
            env.get("DEBIAN_FRONTEND").map(String::as_str),
            Some("noninteractive")
        );
    }
}
