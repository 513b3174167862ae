//! Network collaborators: the image registry and the installer host.
//!
//! Provisioning touches the network in exactly two places, both at image
//! build time: resolving the base image pin and fetching the toolchain
//! installer. Nothing here is called at container run time.

use crate::error::ProvisionError;
use crate::image::{BaseImageRef, ImageDigest};
use crate::Result;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
const DOCKER_HUB_AUTH: &str = "https://auth.docker.io/token";
const DOCKER_HUB_SERVICE: &str = "registry.docker.io";
const DIGEST_HEADER: &str = "docker-content-digest";

const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// Remote resources consulted while provisioning.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Resolve a base image tag to its manifest digest.
    ///
    /// Returns `UnresolvablePin` when the registry has no such image, or
    /// when the reference carries a digest the registry does not report.
    async fn resolve_image(&self, image: &BaseImageRef) -> Result<ImageDigest>;

    /// Fetch a document over HTTPS.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// Registry v2 and HTTPS client backed by `reqwest`.
pub struct HttpRemote {
    http_client: reqwest::Client,
}

impl HttpRemote {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("crossbox/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .https_only(true)
            .build()?;
        Ok(HttpRemote { http_client })
    }

    async fn bearer_token(&self, realm: &str, service: &str, scope: &str) -> Result<String> {
        let response = self
            .http_client
            .get(realm)
            .query(&[("service", service), ("scope", scope)])
            .send()
            .await?
            .error_for_status()?;
        let token: TokenResponse = response.json().await?;
        Ok(token.token)
    }

    async fn head_manifest(&self, url: &str, token: Option<&str>) -> Result<reqwest::Response> {
        let mut request = self.http_client.head(url).header(ACCEPT, MANIFEST_TYPES);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        Ok(request.send().await?)
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn resolve_image(&self, image: &BaseImageRef) -> Result<ImageDigest> {
        let host = image
            .registry
            .clone()
            .unwrap_or_else(|| DOCKER_HUB_REGISTRY.to_string());
        let repository = image.api_repository();
        let url = format!("https://{}/v2/{}/manifests/{}", host, repository, image.tag);
        let scope = format!("repository:{}:pull", repository);
        info!(image = %image, "Resolving base image pin");

        let unresolvable = |reason: String| ProvisionError::UnresolvablePin {
            reference: image.to_string(),
            reason,
        };

        let token = if image.registry.is_none() {
            Some(
                self.bearer_token(DOCKER_HUB_AUTH, DOCKER_HUB_SERVICE, &scope)
                    .await?,
            )
        } else {
            None
        };

        let mut response = self.head_manifest(&url, token.as_deref()).await?;
        if response.status() == StatusCode::UNAUTHORIZED && token.is_none() {
            let challenge = parse_bearer_challenge(response.headers())
                .ok_or_else(|| unresolvable("registry requires unsupported auth".to_string()))?;
            let token = self
                .bearer_token(&challenge.realm, &challenge.service, &scope)
                .await?;
            response = self.head_manifest(&url, Some(&token)).await?;
        }

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(unresolvable("manifest not found".to_string())),
            status => return Err(unresolvable(format!("registry returned {}", status))),
        }

        let digest = response
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unresolvable("registry did not report a digest".to_string()))?;
        let digest = ImageDigest::parse(digest)?;
        debug!(digest = %digest, "Registry digest");

        if let Some(pinned) = &image.digest {
            if pinned != &digest {
                return Err(unresolvable(format!(
                    "pinned digest {} does not match registry digest {}",
                    pinned, digest
                )));
            }
        }

        Ok(digest)
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!(url = %url, "Fetching");
        let response = self.http_client.get(url).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

/// Parsed `WWW-Authenticate: Bearer realm=...,service=...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: String,
}

fn parse_bearer_challenge(headers: &HeaderMap) -> Option<BearerChallenge> {
    let value = headers.get(WWW_AUTHENTICATE)?.to_str().ok()?;
    parse_bearer_header(value)
}

/// Parse the value of a Bearer `WWW-Authenticate` header.
pub fn parse_bearer_header(value: &str) -> Option<BearerChallenge> {
    let params = value.strip_prefix("Bearer ")?;
    let re = Regex::new(r#"(\w+)="([^"]*)""#).ok()?;
    let mut realm = None;
    let mut service = String::new();
    for caps in re.captures_iter(params) {
        match &caps[1] {
            "realm" => realm = Some(caps[2].to_string()),
            "service" => service = caps[2].to_string(),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer_header() {
        let challenge = parse_bearer_header(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:a/b:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://ghcr.io/token");
        assert_eq!(challenge.service, "ghcr.io");
    }

    #[test]
    fn test_parse_bearer_header_rejects_basic() {
        assert!(parse_bearer_header(r#"Basic realm="x""#).is_none());
        assert!(parse_bearer_header(r#"Bearer service="x""#).is_none());
    }

    #[test]
    fn test_http_remote_builds() {
        assert!(HttpRemote::new().is_ok());
    }
}
