//! Base image references
//!
//! A base image is always pinned to an exact `distribution:version` tag and,
//! once resolved, to a content digest. Floating tags are rejected so that a
//! rebuild at the same pin starts from the same filesystem.

use crate::error::ProvisionError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tags that move over time and therefore never count as a pin.
const FLOATING_TAGS: &[&str] = &["latest", "edge", "rolling", "devel"];

/// Content digest of a resolved image manifest (`sha256:<hex>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageDigest(pub String);

impl ImageDigest {
    /// Parse and validate a `sha256:<64 hex>` digest.
    pub fn parse(raw: &str) -> Result<Self> {
        let hex_part = raw.strip_prefix("sha256:").ok_or_else(|| {
            ProvisionError::InvalidImageRef {
                reference: raw.to_string(),
                reason: "digest must start with sha256:".to_string(),
            }
        })?;
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ProvisionError::InvalidImageRef {
                reference: raw.to_string(),
                reason: "digest must be 64 hex characters".to_string(),
            });
        }
        Ok(ImageDigest(raw.to_ascii_lowercase()))
    }

    /// Short form for logs (first 12 hex characters).
    pub fn short(&self) -> &str {
        let hex_part = self.0.strip_prefix("sha256:").unwrap_or(&self.0);
        &hex_part[..12.min(hex_part.len())]
    }
}

impl fmt::Display for ImageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Exact base image identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BaseImageRef {
    /// Optional registry host (`ghcr.io`, `registry.example.com:5000`)
    pub registry: Option<String>,
    /// Repository path, e.g. `ubuntu` or `myorg/builder`
    pub repository: String,
    /// Version tag, never floating
    pub tag: String,
    /// Digest pinned alongside the tag
    pub digest: Option<ImageDigest>,
}

impl BaseImageRef {
    /// Parse `[registry/]repository:tag[@sha256:...]`.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| ProvisionError::InvalidImageRef {
            reference: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("reference is empty"));
        }

        let (name, digest) = match trimmed.split_once('@') {
            Some((name, digest)) => (name, Some(ImageDigest::parse(digest)?)),
            None => (trimmed, None),
        };

        // The tag separator is the last ':' after the last '/', so that a
        // registry port is not mistaken for a tag.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (path, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (&name[..last_slash + i], &name[last_slash + i + 1..]),
            None => return Err(invalid("a version tag is required")),
        };

        if tag.is_empty() {
            return Err(invalid("a version tag is required"));
        }
        if FLOATING_TAGS.contains(&tag) {
            return Err(invalid("floating tags are not pins"));
        }
        if !tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(invalid("tag contains invalid characters"));
        }

        let (registry, repository) = split_registry(path);
        if repository.is_empty()
            || !repository.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/')
            })
        {
            return Err(invalid("repository must be lowercase [a-z0-9._-/]"));
        }

        Ok(BaseImageRef {
            registry,
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest,
        })
    }

    /// Distribution name (last path component of the repository).
    pub fn distribution(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// Repository path as the registry API expects it
    /// (`library/` is implied for official Docker Hub images).
    pub fn api_repository(&self) -> String {
        if self.registry.is_none() && !self.repository.contains('/') {
            format!("library/{}", self.repository)
        } else {
            self.repository.clone()
        }
    }

    /// Return a copy pinned to `digest`.
    pub fn with_digest(&self, digest: ImageDigest) -> Self {
        BaseImageRef {
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// `repository:tag` without registry or digest.
    pub fn short_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

fn split_registry(path: &str) -> (Option<String>, &str) {
    match path.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            (Some(first.to_string()), rest)
        }
        _ => (None, path),
    }
}

impl fmt::Display for BaseImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        write!(f, "{}:{}", self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for BaseImageRef {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self> {
        BaseImageRef::parse(s)
    }
}

impl TryFrom<String> for BaseImageRef {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self> {
        BaseImageRef::parse(&value)
    }
}

impl From<BaseImageRef> for String {
    fn from(value: BaseImageRef) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:c95a8e48bf88e9849f3e0f723d9f49fa12c5a00cfc6e60d2bc99d87555295e4c";

    #[test]
    fn test_parse_official_image() {
        let image = BaseImageRef::parse("ubuntu:18.04").unwrap();
        assert_eq!(image.registry, None);
        assert_eq!(image.repository, "ubuntu");
        assert_eq!(image.tag, "18.04");
        assert_eq!(image.distribution(), "ubuntu");
        assert_eq!(image.api_repository(), "library/ubuntu");
        assert_eq!(image.to_string(), "ubuntu:18.04");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let image = BaseImageRef::parse("localhost:5000/team/base:1.2").unwrap();
        assert_eq!(image.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(image.repository, "team/base");
        assert_eq!(image.tag, "1.2");
        assert_eq!(image.distribution(), "base");
        assert_eq!(image.api_repository(), "team/base");
    }

    #[test]
    fn test_parse_with_digest() {
        let raw = format!("ubuntu:18.04@{}", DIGEST);
        let image = BaseImageRef::parse(&raw).unwrap();
        assert_eq!(image.digest, Some(ImageDigest(DIGEST.to_string())));
        assert_eq!(image.to_string(), raw);
    }

    #[test]
    fn test_rejects_floating_and_missing_tags() {
        assert!(BaseImageRef::parse("ubuntu").is_err());
        assert!(BaseImageRef::parse("ubuntu:").is_err());
        assert!(BaseImageRef::parse("ubuntu:latest").is_err());
        assert!(BaseImageRef::parse("").is_err());
        assert!(BaseImageRef::parse("Ubuntu:18.04").is_err());
        assert!(BaseImageRef::parse("localhost:5000/base").is_err());
    }

    #[test]
    fn test_rejects_bad_digest() {
        assert!(BaseImageRef::parse("ubuntu:18.04@sha256:abc").is_err());
        assert!(BaseImageRef::parse("ubuntu:18.04@md5:abc").is_err());
    }

    #[test]
    fn test_digest_short() {
        let digest = ImageDigest::parse(DIGEST).unwrap();
        assert_eq!(digest.short(), "c95a8e48bf88");
    }

    #[test]
    fn test_serde_roundtrip_as_string() {
        let image = BaseImageRef::parse("debian:bookworm-slim").unwrap();
        let json = serde_json::to_string(&image).unwrap();
        assert_eq!(json, "\"debian:bookworm-slim\"");
        let back: BaseImageRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, image);
    }
}
