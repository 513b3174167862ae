//! Container entry point: the only process a started container runs.

use crate::error::ProvisionError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Mode the entry point is installed with.
pub const ENTRYPOINT_MODE: u32 = 0o755;

/// Where the built-in orchestrator binary lives inside the image.
pub const DEFAULT_ORCHESTRATOR_BINARY: &str = "/usr/local/bin/crossbox";

/// What the entry point file contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntrySource {
    /// Small shell shim that execs `crossbox build`.
    Builtin { binary: PathBuf },
    /// A user-supplied orchestrator script or binary.
    File { path: PathBuf },
}

impl Default for EntrySource {
    fn default() -> Self {
        EntrySource::Builtin {
            binary: PathBuf::from(DEFAULT_ORCHESTRATOR_BINARY),
        }
    }
}

/// Fixed-path entry point declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryPointSpec {
    /// Absolute path inside the image.
    pub path: PathBuf,
    pub source: EntrySource,
}

impl Default for EntryPointSpec {
    fn default() -> Self {
        EntryPointSpec {
            path: PathBuf::from("/entrypoint.sh"),
            source: EntrySource::default(),
        }
    }
}

impl EntryPointSpec {
    pub fn validate(&self) -> Result<()> {
        if !self.path.is_absolute() || self.path.file_name().is_none() {
            return Err(ProvisionError::EntryPoint {
                path: self.path.display().to_string(),
                reason: "entry point path must be an absolute file path".to_string(),
            });
        }
        if let EntrySource::Builtin { binary } = &self.source {
            if !binary.is_absolute() {
                return Err(ProvisionError::EntryPoint {
                    path: binary.display().to_string(),
                    reason: "orchestrator binary path must be absolute".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Bytes to install at [`EntryPointSpec::path`].
    pub fn contents(&self) -> Result<Vec<u8>> {
        match &self.source {
            EntrySource::Builtin { binary } => Ok(builtin_script(binary).into_bytes()),
            EntrySource::File { path } => {
                std::fs::read(path).map_err(|e| ProvisionError::EntryPoint {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// File name used inside a Docker build context.
    pub fn context_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "entrypoint.sh".to_string())
    }

    /// Exec-form `ENTRYPOINT` array.
    pub fn exec_form(&self) -> String {
        format!("[\"{}\"]", self.path.display())
    }

    /// Orchestrator binary the built-in shim execs, if any.
    pub fn orchestrator_binary(&self) -> Option<&Path> {
        match &self.source {
            EntrySource::Builtin { binary } => Some(binary),
            EntrySource::File { .. } => None,
        }
    }
}

fn builtin_script(binary: &Path) -> String {
    format!(
        "#!/bin/sh\nset -eu\nexec {} build \"$@\"\n",
        binary.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_builtin_script_execs_orchestrator() {
        let spec = EntryPointSpec::default();
        let script = String::from_utf8(spec.contents().unwrap()).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("exec /usr/local/bin/crossbox build"));
        assert_eq!(spec.exec_form(), r#"["/entrypoint.sh"]"#);
        assert_eq!(spec.context_name(), "entrypoint.sh");
    }

    #[test]
    fn test_file_source() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("build.sh");
        std::fs::write(&script, "#!/bin/sh\nmake\n").unwrap();

        let spec = EntryPointSpec {
            path: PathBuf::from("/usr/local/bin/build.sh"),
            source: EntrySource::File { path: script },
        };
        assert_eq!(spec.contents().unwrap(), b"#!/bin/sh\nmake\n");
        assert_eq!(spec.context_name(), "build.sh");
        assert!(spec.orchestrator_binary().is_none());
    }

    #[test]
    fn test_missing_file_source() {
        let spec = EntryPointSpec {
            path: PathBuf::from("/entrypoint.sh"),
            source: EntrySource::File {
                path: PathBuf::from("/nonexistent/build.sh"),
            },
        };
        assert!(matches!(
            spec.contents(),
            Err(ProvisionError::EntryPoint { .. })
        ));
    }

    #[test]
    fn test_validate() {
        assert!(EntryPointSpec::default().validate().is_ok());
        let relative = EntryPointSpec {
            path: PathBuf::from("entrypoint.sh"),
            ..EntryPointSpec::default()
        };
        assert!(relative.validate().is_err());
    }
}
