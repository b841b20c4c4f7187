//! OCI registry client: resolves tags to digests, probes for cached base
//! images, and pushes multi-arch manifest indexes.

pub mod auth;

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RegistryError;
use auth::Credentials;

const MANIFEST_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";
const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const DOCKER_MANIFEST_LIST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

#[derive(Debug, Clone)]
pub struct TlsTrust {
    pub insecure: bool,
    pub ca_file: Option<String>,
}

impl Default for TlsTrust {
    fn default() -> Self {
        TlsTrust {
            insecure: false,
            ca_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct ManifestDescriptor {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    digest: Option<String>,
    platform: Option<PlatformDescriptor>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct PlatformDescriptor {
    os: String,
    architecture: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct ManifestIndex {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    manifests: Vec<ManifestDescriptor>,
}

pub struct RegistryClient {
    http: Client,
    credentials: Credentials,
    retry: ExponentialBuilder,
    /// `http` for an `insecure` registry (matching how local/dev registries
    /// are almost always reached — plain HTTP on `localhost:5000`-style
    /// addresses), `https` otherwise.
    scheme: &'static str,
}

impl RegistryClient {
    pub fn new(credentials: Credentials, tls: &TlsTrust) -> Result<Self, RegistryError> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30));
        if tls.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(ca_file) = &tls.ca_file {
            let pem = std::fs::read(ca_file).map_err(|_| RegistryError::Auth {
                repo: ca_file.clone(),
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| RegistryError::Network(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| RegistryError::Network(e.to_string()))?;
        Ok(RegistryClient {
            http,
            credentials,
            retry: ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(8))
                .with_jitter()
                .with_max_times(3),
            scheme: if tls.insecure { "http" } else { "https" },
        })
    }

    /// Resolves `repo:tag` to a concrete manifest digest for `platform`,
    /// selecting the per-platform entry if the tag names an image index.
    pub async fn resolve_digest(&self, repo: &str, tag: &str, platform: &str) -> Result<String, RegistryError> {
        self.probe(repo, tag, platform)
            .await?
            .ok_or_else(|| RegistryError::MalformedManifest {
                repo: repo.to_string(),
                tag: tag.to_string(),
                reason: "manifest not found".to_string(),
            })
    }

    /// Like `resolve_digest` but returns `None` on a 404 instead of erroring.
    pub async fn probe(&self, repo: &str, tag: &str, platform: &str) -> Result<Option<String>, RegistryError> {
        let url = self.manifest_url(repo, tag);

        let fetched = (|| async { self.fetch_manifest(&url).await })
            .retry(self.retry)
            .when(|e: &RegistryError| e.is_transient())
            .notify(|err: &RegistryError, dur: Duration| {
                warn!(?err, delay_ms = dur.as_millis(), "retrying registry manifest fetch");
            })
            .await?;

        let Fetched {
            status,
            body,
            content_type,
            content_digest,
        } = fetched;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RegistryError::Http {
                status: status.to_string(),
                transient: status.is_server_error(),
            });
        }

        if content_type.contains("image.index") || content_type.contains("manifest.list") {
            let index: ManifestIndex = serde_json::from_slice(&body).map_err(|e| RegistryError::MalformedManifest {
                repo: repo.to_string(),
                tag: tag.to_string(),
                reason: e.to_string(),
            })?;
            let (os, arch) = split_platform(platform);
            let matched = index.manifests.into_iter().find(|m| {
                m.platform
                    .as_ref()
                    .map(|p| p.os == os && p.architecture == arch)
                    .unwrap_or(false)
            });
            return Ok(matched.and_then(|m| m.digest));
        }

        // Single-manifest response: the registry's `Docker-Content-Digest`
        // header is authoritative; fall back to a local digest of the raw
        // body if a registry implementation omits it.
        Ok(Some(content_digest.unwrap_or_else(|| digest_of(&body))))
    }

    /// Creates an OCI image index referencing each platform's manifest
    /// digest and pushes it under `tag`, returning the index's own digest.
    pub async fn push_multiarch(
        &self,
        repo: &str,
        tag: &str,
        per_platform_digests: &[(String, String)],
    ) -> Result<String, RegistryError> {
        let manifests = per_platform_digests
            .iter()
            .map(|(platform, digest)| {
                let (os, architecture) = split_platform(platform);
                ManifestDescriptor {
                    media_type: Some(MANIFEST_MEDIA_TYPE.to_string()),
                    digest: Some(digest.clone()),
                    platform: Some(PlatformDescriptor {
                        os: os.to_string(),
                        architecture: architecture.to_string(),
                    }),
                }
            })
            .collect();

        let index = ManifestIndex {
            media_type: Some(MANIFEST_INDEX_MEDIA_TYPE.to_string()),
            manifests,
        };
        let body = serde_json::to_vec(&index).map_err(|e| RegistryError::MalformedManifest {
            repo: repo.to_string(),
            tag: tag.to_string(),
            reason: e.to_string(),
        })?;

        let url = self.manifest_url(repo, tag);
        let local_digest = digest_of(&body);

        let repo_owned = repo.to_string();
        let response = (|| async {
            let mut req = self
                .http
                .put(&url)
                .header("Content-Type", MANIFEST_INDEX_MEDIA_TYPE)
                .body(body.clone());
            req = self.credentials.apply(req, &repo_owned);
            req.send().await.map_err(|e| RegistryError::Network(e.to_string()))
        })
        .retry(self.retry)
        .when(|e: &RegistryError| e.is_transient())
        .await?;

        if !response.status().is_success() {
            return Err(RegistryError::Http {
                status: response.status().to_string(),
                transient: response.status().is_server_error(),
            });
        }

        let digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or(local_digest);

        debug!(repo = %repo, tag = %tag, "pushed multi-arch manifest index");
        Ok(digest)
    }

    fn manifest_url(&self, repo: &str, reference: &str) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme,
            self.credentials.registry_host(repo),
            repo_path(repo),
            reference
        )
    }

    async fn fetch_manifest(&self, url: &str) -> Result<Fetched, RegistryError> {
        let accept = [
            MANIFEST_INDEX_MEDIA_TYPE,
            DOCKER_MANIFEST_LIST_MEDIA_TYPE,
            MANIFEST_MEDIA_TYPE,
            "application/vnd.docker.distribution.manifest.v2+json",
        ]
        .join(", ");

        let mut req = self.http.get(url).header("Accept", accept);
        req = self.credentials.apply(req, url);

        let response = req.send().await.map_err(|e| RegistryError::Network(e.to_string()))?;
        let status = response.status();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let content_digest = response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(|e| RegistryError::Network(e.to_string()))?;
        Ok(Fetched {
            status,
            body: body.to_vec(),
            content_type,
            content_digest,
        })
    }
}

struct Fetched {
    status: StatusCode,
    body: Vec<u8>,
    content_type: String,
    content_digest: Option<String>,
}

fn split_platform(platform: &str) -> (&str, &str) {
    platform.split_once('/').unwrap_or((platform, ""))
}

fn repo_path(repo: &str) -> &str {
    match repo.split_once('/') {
        Some((host, rest)) if host.contains('.') || host.contains(':') => rest,
        _ => repo,
    }
}

fn digest_of(body: &[u8]) -> String {
    use sha2::Digest;
    format!("sha256:{}", hex::encode(sha2::Sha256::digest(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_path_strips_registry_host() {
        assert_eq!(repo_path("registry.example.com/myapp/builder"), "myapp/builder");
        assert_eq!(repo_path("myapp/builder"), "myapp/builder");
        assert_eq!(repo_path("localhost:5000/myapp"), "myapp");
    }

    #[test]
    fn split_platform_separates_os_and_arch() {
        assert_eq!(split_platform("linux/amd64"), ("linux", "amd64"));
        assert_eq!(split_platform("linux/arm64"), ("linux", "arm64"));
    }
}
