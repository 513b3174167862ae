//! Toolchain channel, compile target triple and installer source.

use crate::error::ProvisionError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default pinned installer URL for the toolchain manager.
pub const DEFAULT_INSTALLER_URL: &str = "https://sh.rustup.rs";

/// Named toolchain release stream, fixed for the lifetime of an image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ToolchainChannel {
    Stable,
    Beta,
    Nightly,
    /// `nightly-YYYY-MM-DD`
    DatedNightly(String),
    /// Numbered release such as `1.79.0` or `1.79`
    Release(String),
}

impl ToolchainChannel {
    /// Parse a channel name as accepted by the toolchain manager.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match raw {
            "stable" => return Ok(ToolchainChannel::Stable),
            "beta" => return Ok(ToolchainChannel::Beta),
            "nightly" => return Ok(ToolchainChannel::Nightly),
            _ => {}
        }

        if let Some(date) = raw.strip_prefix("nightly-") {
            return match chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d") {
                Ok(_) => Ok(ToolchainChannel::DatedNightly(date.to_string())),
                Err(_) => Err(ProvisionError::InvalidChannel(raw.to_string())),
            };
        }

        let parts: Vec<&str> = raw.split('.').collect();
        let numeric = (2..=3).contains(&parts.len())
            && parts
                .iter()
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
        if numeric {
            return Ok(ToolchainChannel::Release(raw.to_string()));
        }

        Err(ProvisionError::InvalidChannel(raw.to_string()))
    }

    /// Whether the channel's content can change without its name changing.
    pub fn is_floating(&self) -> bool {
        matches!(
            self,
            ToolchainChannel::Stable | ToolchainChannel::Beta | ToolchainChannel::Nightly
        )
    }

    /// Channel name passed to the installer and the toolchain manager.
    pub fn name(&self) -> String {
        match self {
            ToolchainChannel::Stable => "stable".to_string(),
            ToolchainChannel::Beta => "beta".to_string(),
            ToolchainChannel::Nightly => "nightly".to_string(),
            ToolchainChannel::DatedNightly(date) => format!("nightly-{}", date),
            ToolchainChannel::Release(version) => version.clone(),
        }
    }

    /// Directory name of the installed toolchain for a given host triple.
    pub fn toolchain_dir(&self, host: &TargetTriple) -> String {
        format!("{}-{}", self.name(), host)
    }
}

impl fmt::Display for ToolchainChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ToolchainChannel {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        ToolchainChannel::parse(s)
    }
}

impl TryFrom<String> for ToolchainChannel {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self> {
        ToolchainChannel::parse(&value)
    }
}

impl From<ToolchainChannel> for String {
    fn from(value: ToolchainChannel) -> Self {
        value.name()
    }
}

/// Compile target triple: architecture, vendor, OS and optional libc/ABI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TargetTriple {
    pub arch: String,
    pub vendor: String,
    pub os: String,
    pub env: Option<String>,
}

impl TargetTriple {
    /// Parse `arch-vendor-os[-env]`.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let parts: Vec<&str> = raw.split('-').collect();
        let well_formed = (3..=4).contains(&parts.len())
            && parts.iter().all(|p| {
                !p.is_empty()
                    && p.chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            });
        if !well_formed {
            return Err(ProvisionError::InvalidTriple(raw.to_string()));
        }

        Ok(TargetTriple {
            arch: parts[0].to_string(),
            vendor: parts[1].to_string(),
            os: parts[2].to_string(),
            env: parts.get(3).map(|s| s.to_string()),
        })
    }

    /// Default cross target: 64-bit Linux against musl.
    pub fn musl_x86_64() -> Self {
        TargetTriple {
            arch: "x86_64".to_string(),
            vendor: "unknown".to_string(),
            os: "linux".to_string(),
            env: Some("musl".to_string()),
        }
    }

    /// Default host triple of the build image.
    pub fn gnu_x86_64() -> Self {
        TargetTriple {
            arch: "x86_64".to_string(),
            vendor: "unknown".to_string(),
            os: "linux".to_string(),
            env: Some("gnu".to_string()),
        }
    }

    pub fn is_musl(&self) -> bool {
        self.env
            .as_deref()
            .map(|e| e.starts_with("musl"))
            .unwrap_or(false)
    }
}

impl fmt::Display for TargetTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.arch, self.vendor, self.os)?;
        if let Some(env) = &self.env {
            write!(f, "-{}", env)?;
        }
        Ok(())
    }
}

impl FromStr for TargetTriple {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        TargetTriple::parse(s)
    }
}

impl TryFrom<String> for TargetTriple {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self> {
        TargetTriple::parse(&value)
    }
}

impl From<TargetTriple> for String {
    fn from(value: TargetTriple) -> Self {
        value.to_string()
    }
}

/// Where the toolchain manager installer comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerSource {
    /// HTTPS URL of the installer script
    pub url: String,
    /// Expected SHA-256 of the script, hex encoded
    #[serde(default)]
    pub sha256: Option<String>,
}

impl Default for InstallerSource {
    fn default() -> Self {
        InstallerSource {
            url: DEFAULT_INSTALLER_URL.to_string(),
            sha256: None,
        }
    }
}

impl InstallerSource {
    /// Reject plain HTTP and malformed checksums.
    pub fn validate(&self) -> Result<()> {
        if !self.url.starts_with("https://") {
            return Err(ProvisionError::Config(format!(
                "installer URL must use https: {}",
                self.url
            )));
        }
        if let Some(sum) = &self.sha256 {
            if sum.len() != 64 || !sum.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ProvisionError::Config(format!(
                    "installer sha256 must be 64 hex characters: {}",
                    sum
                )));
            }
        }
        Ok(())
    }

    /// Arguments passed to the installer script.
    ///
    /// `--no-modify-path` keeps shell startup files untouched; the
    /// environment contract alone controls tool resolution.
    pub fn installer_args(channel: &ToolchainChannel) -> Vec<String> {
        vec![
            "-y".to_string(),
            "--profile".to_string(),
            "minimal".to_string(),
            "--default-toolchain".to_string(),
            channel.name(),
            "--no-modify-path".to_string(),
        ]
    }
}
