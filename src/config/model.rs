//! Deserialized shapes of the two YAML documents tplbuild reads: the
//! project config (`tplbuild.yml`) and the user config
//! (`~/.tplbuildconfig.yml`).

use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_version")]
    pub version: String,
    pub base_image_repo: Option<String>,
    #[serde(default)]
    pub stage_image_name: Option<String>,
    #[serde(default)]
    pub stage_push_name: Option<String>,
    #[serde(default = "default_platforms")]
    pub platforms: Vec<String>,
    #[serde(default = "default_profile_name")]
    pub default_profile: String,
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,
    #[serde(default)]
    pub contexts: BTreeMap<String, ContextConfig>,
    #[serde(default)]
    pub stages: BTreeMap<String, StageOverride>,
    #[serde(default = "default_template_paths")]
    pub template_paths: Vec<String>,
    pub template_entrypoint: String,
    #[serde(default)]
    pub dockerfile_syntax: Option<String>,
}

fn default_version() -> String {
    "1".to_string()
}

fn default_platforms() -> Vec<String> {
    vec!["linux/amd64".to_string()]
}

fn default_profile_name() -> String {
    "default".to_string()
}

fn default_template_paths() -> Vec<String> {
    vec![".".to_string()]
}

/// A named profile: an arbitrary template-variable map, passed to the
/// renderer verbatim as `vars`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    #[serde(flatten)]
    pub vars: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContextConfig {
    pub base_dir: String,
    /// Octal umask string (e.g. `"022"`); `null`/absent preserves raw mode
    /// bits (see `context::apply_umask`).
    #[serde(default)]
    pub umask: Option<String>,
    #[serde(default)]
    pub ignore_file: Option<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
}

impl ContextConfig {
    pub fn parsed_umask(&self) -> Option<u32> {
        self.umask.as_deref().and_then(|s| u32::from_str_radix(s, 8).ok())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StageOverride {
    #[serde(default)]
    pub base: Option<bool>,
    #[serde(default)]
    pub image_names: Vec<String>,
    #[serde(default)]
    pub push_names: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub auth: BTreeMap<String, AuthEntry>,
}

impl Default for UserConfig {
    fn default() -> Self {
        UserConfig {
            client: ClientConfig::default(),
            registry: RegistryConfig::default(),
            parallelism: None,
            auth: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_type")]
    pub r#type: String,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandTemplateConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            r#type: default_client_type(),
            commands: BTreeMap::new(),
        }
    }
}

fn default_client_type() -> String {
    "docker".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandTemplateConfig {
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub ssl_context: SslContextConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SslContextConfig {
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub cafile: Option<String>,
    #[serde(default)]
    pub capath: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthEntry {
    pub username: String,
    pub password: String,
}
