//! Credentials-helper abstraction: per-registry bearer/basic auth, resolved
//! from the user config's `auth` table or the environment.

use reqwest::RequestBuilder;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Holds per-host credentials and applies them to outgoing requests. A host
/// with no configured entry is accessed anonymously.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    by_host: BTreeMap<String, RegistryAuth>,
}

impl Credentials {
    pub fn new(by_host: BTreeMap<String, RegistryAuth>) -> Self {
        Credentials { by_host }
    }

    /// Extracts the registry host from a `repo` reference (`host/ns/image`)
    /// or a full manifest URL, defaulting to Docker Hub's registry host for
    /// bare repo names.
    pub fn registry_host(&self, repo_or_url: &str) -> String {
        if let Some(rest) = repo_or_url.strip_prefix("https://").or_else(|| repo_or_url.strip_prefix("http://")) {
            return rest.split('/').next().unwrap_or(rest).to_string();
        }
        match repo_or_url.split_once('/') {
            Some((host, _)) if host.contains('.') || host.contains(':') || host == "localhost" => host.to_string(),
            _ => "registry-1.docker.io".to_string(),
        }
    }

    pub fn apply(&self, req: RequestBuilder, repo_or_url: &str) -> RequestBuilder {
        let host = self.registry_host(repo_or_url);
        match self.by_host.get(&host) {
            Some(auth) => req.basic_auth(&auth.username, Some(&auth.password)),
            None => req,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_host_defaults_to_docker_hub_for_bare_repos() {
        let c = Credentials::default();
        assert_eq!(c.registry_host("library/nginx"), "registry-1.docker.io");
    }

    #[test]
    fn registry_host_extracts_explicit_host() {
        let c = Credentials::default();
        assert_eq!(c.registry_host("ghcr.io/acme/app"), "ghcr.io");
        assert_eq!(c.registry_host("localhost:5000/app"), "localhost:5000");
    }
}
