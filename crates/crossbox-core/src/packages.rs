//! System package set installed before the toolchain.

use crate::error::ProvisionError;
use crate::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Packages needed to cross-compile against musl on a Debian-family base.
pub const DEFAULT_PACKAGES: &[&str] = &[
    "build-essential",
    "pkg-config",
    "musl",
    "musl-dev",
    "musl-tools",
    "curl",
    "ca-certificates",
];

/// Fixed, ordered, de-duplicated set of OS packages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct SystemPackageSet(Vec<String>);

impl SystemPackageSet {
    /// Build a set, keeping first-occurrence order.
    pub fn new<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for name in names {
            let name = name.into().trim().to_string();
            if !is_valid_package_name(&name) {
                return Err(ProvisionError::Config(format!(
                    "invalid package name '{}'",
                    name
                )));
            }
            if !out.contains(&name) {
                out.push(name);
            }
        }
        if out.is_empty() {
            return Err(ProvisionError::Config(
                "system package set must not be empty".to_string(),
            ));
        }
        Ok(SystemPackageSet(out))
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|p| p == name)
    }

    /// `dpkg-query` invocation reporting install status per package.
    pub fn status_query(&self) -> Vec<String> {
        let mut cmd = vec![
            "dpkg-query".to_string(),
            "-W".to_string(),
            "-f=${Package} ${Status}\\n".to_string(),
        ];
        cmd.extend(self.0.iter().cloned());
        cmd
    }

    /// `apt-get install` invocation for the whole set.
    pub fn install_command(&self) -> Vec<String> {
        let mut cmd = vec![
            "apt-get".to_string(),
            "install".to_string(),
            "-y".to_string(),
            "--no-install-recommends".to_string(),
        ];
        cmd.extend(self.0.iter().cloned());
        cmd
    }

    /// Packages from this set missing in `dpkg-query` output.
    pub fn missing_from_status(&self, status_output: &str) -> Vec<String> {
        let installed: Vec<&str> = status_output
            .lines()
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let name = parts.next()?;
                let rest: Vec<&str> = parts.collect();
                // "install ok installed"
                (rest.last() == Some(&"installed") && rest.first() == Some(&"install"))
                    .then_some(name)
            })
            .collect();

        self.0
            .iter()
            .filter(|p| !installed.iter().any(|i| strip_arch(i) == p.as_str()))
            .cloned()
            .collect()
    }
}

impl Default for SystemPackageSet {
    fn default() -> Self {
        SystemPackageSet(DEFAULT_PACKAGES.iter().map(|s| s.to_string()).collect())
    }
}

impl TryFrom<Vec<String>> for SystemPackageSet {
    type Error = ProvisionError;

    fn try_from(value: Vec<String>) -> Result<Self> {
        SystemPackageSet::new(value)
    }
}

impl From<SystemPackageSet> for Vec<String> {
    fn from(value: SystemPackageSet) -> Self {
        value.0
    }
}

fn strip_arch(name: &str) -> &str {
    name.split(':').next().unwrap_or(name)
}

/// Debian policy: lowercase alphanumerics plus `+ - .`, at least two chars,
/// starting with an alphanumeric.
fn is_valid_package_name(name: &str) -> bool {
    name.len() >= 2
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.'))
}

/// Extract the package apt complained about from its stderr.
pub fn failed_package_from_apt(stderr: &str) -> Option<String> {
    let patterns = [
        r"Unable to locate package ([a-z0-9][a-z0-9+.\-]+)",
        r"Package '?([a-z0-9][a-z0-9+.\-]+)'? has no installation candidate",
        r"([a-z0-9][a-z0-9+.\-]+) : Depends:",
    ];
    patterns.iter().find_map(|pattern| {
        Regex::new(pattern)
            .ok()?
            .captures(stderr)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_set_has_linker_and_musl() {
        let set = SystemPackageSet::default();
        assert!(set.contains("build-essential"));
        assert!(set.contains("pkg-config"));
        assert!(set.contains("musl-tools"));
        assert!(set.contains("musl-dev"));
    }

    #[test]
    fn test_new_dedups_preserving_order() {
        let set = SystemPackageSet::new(["musl-tools", "pkg-config", "musl-tools"]).unwrap();
        assert_eq!(set.names(), &["musl-tools".to_string(), "pkg-config".to_string()]);
    }

    #[test]
    fn test_new_rejects_invalid() {
        assert!(SystemPackageSet::new(Vec::<String>::new()).is_err());
        assert!(SystemPackageSet::new(["Bad_Name"]).is_err());
        assert!(SystemPackageSet::new(["x"]).is_err());
        assert!(SystemPackageSet::new(["pkg; rm -rf /"]).is_err());
    }

    #[test]
    fn test_install_command() {
        let set = SystemPackageSet::new(["musl-tools"]).unwrap();
        assert_eq!(
            set.install_command(),
            vec!["apt-get", "install", "-y", "--no-install-recommends", "musl-tools"]
        );
    }

    #[test]
    fn test_missing_from_status() {
        let set = SystemPackageSet::new(["build-essential", "musl-tools", "pkg-config"]).unwrap();
        let status = "build-essential install ok installed\n\
                      musl-tools:amd64 install ok installed\n\
                      pkg-config deinstall ok config-files\n";
        assert_eq!(set.missing_from_status(status), vec!["pkg-config".to_string()]);
        assert!(set
            .missing_from_status(
                "build-essential install ok installed\nmusl-tools install ok installed\npkg-config install ok installed\n"
            )
            .is_empty());
    }

    #[test]
    fn test_failed_package_from_apt() {
        assert_eq!(
            failed_package_from_apt("E: Unable to locate package musl-toolz"),
            Some("musl-toolz".to_string())
        );
        assert_eq!(
            failed_package_from_apt("E: Package 'libfoo-dev' has no installation candidate"),
            Some("libfoo-dev".to_string())
        );
        assert_eq!(failed_package_from_apt("E: network unreachable"), None);
    }
}
