//! Ties the pipeline stages together: render → parse → graph build →
//! source-lock fill → context hash → content hash → base-probe → plan →
//! execute → state persist (spec.md §3 "Lifecycle").
//!
//! This is the library's single entry point; `main.rs`/`cli.rs` only parse
//! arguments and call into `Project`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tera::Tera;
use tokio_util::sync::CancellationToken;

use crate::config::model::{ProjectConfig, UserConfig};
use crate::config::template::{self, UserConfigView};
use crate::config::{self};
use crate::context::BuildContext;
use crate::error::{ConfigError, GraphError, TplbuildError};
use crate::executor::{self, BuilderClient, CommandTemplate, CommandTemplates, ExecutorOptions, SubprocessBuilderClient};
use crate::graph::{self, Graph, ImageNode, NodeId};
use crate::hash;
use crate::parser::{self, stage};
use crate::planner;
use crate::registry::auth::{Credentials, RegistryAuth};
use crate::registry::{RegistryClient, TlsTrust};
use crate::state::StateStore;

/// The fully loaded project: parsed config, template engine, state store,
/// and the collaborators (registry/builder clients) every command needs.
pub struct Project {
    pub root: PathBuf,
    pub config: ProjectConfig,
    pub user_config: UserConfig,
    pub state: StateStore,
    pub tera: Tera,
    registry: RegistryClient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildKind {
    /// `base-build`: targets `BaseImage` nodes, pushing each to
    /// `base_image_repo` under its content-hash tag so later runs (and other
    /// checkouts) can probe-hit it.
    Base,
    /// `build`: targets `StageImage` nodes, local only — no push.
    Build,
    /// `publish`: targets `StageImage` nodes and pushes every configured
    /// `push_name`/`image_name`.
    Publish,
}

pub struct RunOptions {
    pub profile: String,
    pub platforms: Vec<String>,
    pub stage_filter: Vec<String>,
    pub kind: BuildKind,
    pub check_only: bool,
    pub update_sources: bool,
    pub keep_intermediate_tags: bool,
}

/// Outcome of a (possibly `--check`) run: which base images were already
/// cached vs. needed a build, used by `base-build --check`'s exit code and
/// by `base-lookup`/`source-lookup`.
pub struct RunReport {
    pub built: Vec<String>,
    pub cached: Vec<String>,
    pub out_of_date: bool,
}

impl Project {
    pub fn load(project_config_path: &Path, user_config_path: &Path) -> Result<Self, TplbuildError> {
        let config = config::load_project_config(project_config_path)?;
        let user_config = config::load_user_config(user_config_path)?;

        let base_stage_names = Vec::new(); // filled in after a render; validated again per-run.
        if let Err(errors) = config::validate(&config, &base_stage_names) {
            // Report only the first here; callers that need every error can
            // call `config::validate` directly with a real stage list.
            return Err(TplbuildError::Config(errors.into_iter().next().unwrap()));
        }

        let root = project_config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let state_path = root.join(".tplbuilddata.json");
        let state = StateStore::load(&state_path)?;

        let tera = template::build_engine(&config.template_paths)?;

        let credentials = build_credentials(&user_config);
        let tls = TlsTrust {
            insecure: user_config.registry.ssl_context.insecure,
            ca_file: user_config.registry.ssl_context.cafile.clone(),
        };
        let registry = RegistryClient::new(credentials, &tls)?;

        Ok(Project {
            root,
            config,
            user_config,
            state,
            tera,
            registry,
        })
    }

    fn profile(&self, name: &str) -> Result<&crate::config::model::Profile, TplbuildError> {
        self.config
            .profiles
            .get(name)
            .ok_or_else(|| TplbuildError::Config(ConfigError::UnknownProfile { profile: name.to_string() }))
    }

    /// Renders the entrypoint template for `profile` and parses/classifies
    /// it into stages. Shared by every platform's graph (the rendered
    /// Dockerfile text doesn't vary per platform; only the graph's
    /// `SourceImage`/node platform tags do).
    pub fn render_stages(&self, profile_name: &str) -> Result<Vec<stage::Stage>, TplbuildError> {
        let empty_profile = crate::config::model::Profile::default();
        let profile = if self.config.profiles.is_empty() {
            &empty_profile
        } else {
            self.profile(profile_name)?
        };
        let view = UserConfigView::from_config(&self.user_config);
        let rendered = template::render_entrypoint(&self.tera, &self.config.template_entrypoint, profile_name, profile, &view)?;

        let mut stages = parser::parse(&rendered, true)?;
        let base_overrides: BTreeMap<String, bool> = self
            .config
            .stages
            .iter()
            .filter_map(|(name, cfg)| cfg.base.map(|b| (name.clone(), b)))
            .collect();
        parser::classify_stages(&mut stages, &stage::default_base_prefixes(), &stage::default_anon_prefixes(), &base_overrides);

        let base_names: Vec<String> = stages.iter().filter(|s| s.is_base).map(|s| s.name.clone()).collect();
        if let Err(errors) = config::validate(&self.config, &base_names) {
            return Err(TplbuildError::Config(errors.into_iter().next().unwrap()));
        }

        Ok(stages)
    }

    /// Builds the image-node DAG for one platform, then stamps publish
    /// tags onto `StageImage` nodes from the project config's
    /// `stage_image_name`/`stage_push_name` templates and any
    /// per-stage `image_names`/`push_names` override.
    pub fn build_graph(&self, stages: &[stage::Stage], platform: &str, profile_name: &str) -> Result<Graph, TplbuildError> {
        let mut g = graph::build_graph(stages, platform, profile_name)?;
        self.stamp_publish_tags(&mut g, profile_name)?;
        Ok(g)
    }

    fn stamp_publish_tags(&self, g: &mut Graph, profile_name: &str) -> Result<(), TplbuildError> {
        for node in g.dag.node_weights_mut() {
            if let ImageNode::StageImage { stage_name, publish_tags, .. } = node {
                let stage_name = stage_name.as_str();
                let mut tags = self
                    .config
                    .stages
                    .get(stage_name)
                    .map(|o| o.push_names.clone())
                    .unwrap_or_default();
                if tags.is_empty() {
                    if let Some(template_name) = &self.config.stage_push_name {
                        tags.push(render_name_template(template_name, stage_name, profile_name)?);
                    }
                }
                if tags.is_empty() {
                    let mut image_names = self
                        .config
                        .stages
                        .get(stage_name)
                        .map(|o| o.image_names.clone())
                        .unwrap_or_default();
                    if image_names.is_empty() {
                        if let Some(template_name) = &self.config.stage_image_name {
                            image_names.push(render_name_template(template_name, stage_name, profile_name)?);
                        }
                    }
                    tags = image_names;
                }
                *publish_tags = tags;
            }
        }
        Ok(())
    }

    /// Resolves every distinct `SourceImage` in `graph` to a concrete
    /// digest: from the state-store lock unless `force_update`, otherwise
    /// (or on a cache miss) via the registry, with the freshly-resolved
    /// digest persisted back immediately.
    pub async fn resolve_sources(&self, graph: &mut Graph, force_update: bool) -> Result<(), TplbuildError> {
        let ids: Vec<NodeId> = graph.dag.node_indices().collect();
        for id in ids {
            let (repo, tag, platform) = match &graph.dag[id] {
                ImageNode::SourceImage { repo, tag, platform, .. } => (repo.clone(), tag.clone(), platform.clone()),
                _ => continue,
            };

            let locked = if force_update { None } else { self.state.source_digest(&repo, &tag, &platform) };
            let digest = match locked {
                Some(d) => d,
                None => {
                    let d = self.registry.resolve_digest(&repo, &tag, &platform).await?;
                    self.state.record_source(&repo, &tag, &platform, d.clone())?;
                    d
                }
            };

            if let ImageNode::SourceImage { digest: slot, .. } = &mut graph.dag[id] {
                *slot = Some(digest);
            }
        }
        Ok(())
    }

    /// Computes `files_hash` for every `ContextImage` node by walking the
    /// configured context's base directory.
    pub fn compute_context_hashes(&self, graph: &mut Graph) -> Result<(), TplbuildError> {
        let ids: Vec<NodeId> = graph.dag.node_indices().collect();
        for id in ids {
            let name = match &graph.dag[id] {
                ImageNode::ContextImage { context_name, .. } => context_name.clone(),
                _ => continue,
            };
            let cfg = self
                .config
                .contexts
                .get(&name)
                .cloned()
                .unwrap_or_else(|| crate::config::model::ContextConfig {
                    base_dir: name.clone(),
                    umask: None,
                    ignore_file: None,
                    ignore: Vec::new(),
                });
            let ctx = BuildContext {
                name: name.clone(),
                base_dir: self.root.join(&cfg.base_dir),
                umask: cfg.parsed_umask(),
                ignore_file: cfg.ignore_file.as_ref().map(|f| self.root.join(f)),
                ignore: cfg.ignore.clone(),
            };
            let files_hash = ctx.files_hash()?;
            if let ImageNode::ContextImage { files_hash: slot, .. } = &mut graph.dag[id] {
                *slot = Some(files_hash);
            }
        }
        Ok(())
    }

    pub fn hash_graph(&self, graph: &mut Graph) -> Result<HashMap<NodeId, String>, GraphError> {
        let salt = self.state.salt();
        hash::hash_graph(graph, &salt)
    }

    /// Probes `base_image_repo:<content_hash>[-<platform>]` for every
    /// `BaseImage` target; populates the returned `satisfied` map and
    /// records each hit in the state store.
    pub async fn probe_base_images(&self, graph: &Graph, platform: &str) -> Result<HashMap<NodeId, String>, TplbuildError> {
        let mut satisfied = HashMap::new();
        let Some(repo_template) = &self.config.base_image_repo else {
            return Ok(satisfied);
        };
        for id in graph.dag.node_indices() {
            if let ImageNode::BaseImage { content_hash: Some(hash), .. } = &graph.dag[id] {
                if let Some(cached) = self.state.base_digest(hash, platform) {
                    satisfied.insert(id, cached);
                    continue;
                }
                let tag = format!("{}-{}", hash, sanitize_platform(platform));
                if let Some(digest) = self.registry.probe(repo_template, &tag, platform).await? {
                    self.state.record_base(hash, platform, digest.clone())?;
                    satisfied.insert(id, digest);
                }
            }
        }
        Ok(satisfied)
    }

    fn builder_client(&self, platform: &str) -> Arc<dyn BuilderClient> {
        Arc::new(SubprocessBuilderClient::new(command_templates(&self.user_config), platform.to_string()))
    }

    /// Plans and, unless `check_only`, executes the work needed to realize
    /// `targets` on `platform`. Persists newly-built base images' digests
    /// into the state store, and — for `Base`/`Publish` — pushes the
    /// resulting images to the registry.
    pub async fn plan_and_execute(
        &self,
        graph: &Graph,
        targets: &[NodeId],
        satisfied: &HashMap<NodeId, String>,
        platform: &str,
        kind: BuildKind,
        check_only: bool,
        keep_intermediate_tags: bool,
        multi_platform: bool,
    ) -> Result<RunReport, TplbuildError> {
        let plan = planner::plan(graph, targets, satisfied)?;

        let cached: Vec<String> = plan
            .entries
            .iter()
            .filter_map(|e| match e {
                planner::PlanEntry::AlreadyCached { digest, .. } => Some(digest.clone()),
                _ => None,
            })
            .collect();
        let will_build = plan.entries.iter().any(|e| matches!(e, planner::PlanEntry::Chain { .. }));

        if check_only {
            return Ok(RunReport {
                built: Vec::new(),
                cached,
                out_of_date: will_build,
            });
        }

        let client = self.builder_client(platform);
        let options = ExecutorOptions {
            max_parallel: self.user_config.parallelism.unwrap_or_else(num_cpus_fallback),
            platform: platform.to_string(),
            keep_intermediate_tags,
        };
        executor::execute(&plan, Arc::clone(&client), options, CancellationToken::new()).await?;

        let mut built = Vec::new();
        for node in targets {
            if satisfied.contains_key(node) {
                continue;
            }
            match (&graph.dag[*node], kind) {
                (ImageNode::BaseImage { content_hash: Some(hash), .. }, BuildKind::Base) => {
                    let local_tag = format!("base:{}", graph.dag[*node].stage_name().unwrap_or_default());
                    let published = self.push_base_image(client.as_ref(), hash, platform, &local_tag).await?;
                    if let Some(tag) = published {
                        built.push(tag);
                    }
                }
                (ImageNode::StageImage { publish_tags, .. }, BuildKind::Publish) if !publish_tags.is_empty() => {
                    for tag in publish_tags {
                        if multi_platform {
                            let per_platform_tag = format!("{}-{}", tag, sanitize_platform(platform));
                            client.tag(tag, &per_platform_tag).await.map_err(TplbuildError::Build)?;
                            client.push(&per_platform_tag).await.map_err(TplbuildError::Build)?;
                            built.push(per_platform_tag);
                        } else {
                            client.push(tag).await.map_err(TplbuildError::Build)?;
                            built.push(tag.clone());
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(RunReport {
            built,
            cached,
            out_of_date: false,
        })
    }

    /// Tags and pushes a just-built base image to `base_image_repo` under
    /// its content-hash (the cache key later runs probe for), then records
    /// the resulting registry tag in the state store. No-op if no
    /// `base_image_repo` is configured.
    async fn push_base_image(
        &self,
        client: &dyn BuilderClient,
        content_hash: &str,
        platform: &str,
        local_tag: &str,
    ) -> Result<Option<String>, TplbuildError> {
        let Some(repo) = &self.config.base_image_repo else {
            return Ok(None);
        };
        let registry_tag = format!("{}:{}-{}", repo, content_hash, sanitize_platform(platform));
        client.tag(local_tag, &registry_tag).await.map_err(TplbuildError::Build)?;
        client.push(&registry_tag).await.map_err(TplbuildError::Build)?;
        self.state.record_base(content_hash, platform, registry_tag.clone())?;
        Ok(Some(registry_tag))
    }

    /// Selects the graph nodes `kind` operates over — `BaseImage` nodes for
    /// `Base`, `StageImage` nodes for `Build`/`Publish` — narrowed to
    /// `stage_filter` when non-empty (mirroring how the teacher's
    /// orchestrator filters services by name).
    pub fn select_targets(&self, graph: &Graph, kind: BuildKind, stage_filter: &[String]) -> Vec<NodeId> {
        graph
            .dag
            .node_indices()
            .filter(|&id| {
                let node = &graph.dag[id];
                let matches_kind = match kind {
                    BuildKind::Base => node.is_base_image(),
                    BuildKind::Build | BuildKind::Publish => node.is_stage_image(),
                };
                if !matches_kind {
                    return false;
                }
                if stage_filter.is_empty() {
                    return true;
                }
                node.stage_name().map(|n| stage_filter.iter().any(|f| f == n)).unwrap_or(false)
            })
            .collect()
    }

    /// End-to-end: render, build the per-platform graph, lock sources,
    /// hash contexts and content, probe the registry for already-cached
    /// base images, then plan and (unless `check_only`) execute — once per
    /// configured platform.
    pub async fn run(&self, opts: &RunOptions) -> Result<Vec<(String, RunReport)>, TplbuildError> {
        let stages = self.render_stages(&opts.profile)?;
        let multi_platform = opts.kind == BuildKind::Publish && opts.platforms.len() > 1;
        let mut reports = Vec::new();
        let mut publish_tags_seen: Vec<String> = Vec::new();
        for platform in &opts.platforms {
            let mut graph = self.build_graph(&stages, platform, &opts.profile)?;
            self.resolve_sources(&mut graph, opts.update_sources).await?;
            self.compute_context_hashes(&mut graph)?;
            self.hash_graph(&mut graph)?;
            let satisfied = self.probe_base_images(&graph, platform).await?;
            let targets = self.select_targets(&graph, opts.kind, &opts.stage_filter);

            if multi_platform && !opts.check_only {
                for id in &targets {
                    if let ImageNode::StageImage { publish_tags, .. } = &graph.dag[*id] {
                        for tag in publish_tags {
                            if !publish_tags_seen.contains(tag) {
                                publish_tags_seen.push(tag.clone());
                            }
                        }
                    }
                }
            }

            let report = self
                .plan_and_execute(
                    &graph,
                    &targets,
                    &satisfied,
                    platform,
                    opts.kind,
                    opts.check_only,
                    opts.keep_intermediate_tags,
                    multi_platform,
                )
                .await?;
            reports.push((platform.clone(), report));
        }

        if multi_platform && !opts.check_only {
            for tag in &publish_tags_seen {
                self.push_manifest_index(tag, &opts.platforms).await?;
            }
        }

        Ok(reports)
    }

    /// Assembles and pushes an OCI image index for `canonical_tag`,
    /// referencing the per-platform manifest each platform's run just
    /// pushed under `<canonical_tag>-<platform>`.
    async fn push_manifest_index(&self, canonical_tag: &str, platforms: &[String]) -> Result<(), TplbuildError> {
        let (repo, tag) = split_repo_tag(canonical_tag);
        let mut per_platform_digests = Vec::new();
        for platform in platforms {
            let per_platform_tag = format!("{}-{}", tag, sanitize_platform(platform));
            let digest = self.registry.resolve_digest(&repo, &per_platform_tag, platform).await?;
            per_platform_digests.push((platform.clone(), digest));
        }
        self.registry.push_multiarch(&repo, &tag, &per_platform_digests).await?;
        Ok(())
    }

    /// `--update-salt`: rotates the project salt, invalidating every base
    /// image's content hash.
    pub fn rotate_salt(&self, new_salt: String) -> Result<(), TplbuildError> {
        self.state.set_salt(new_salt)?;
        Ok(())
    }
}

fn render_name_template(template: &str, stage_name: &str, profile: &str) -> Result<String, TplbuildError> {
    let mut tera = Tera::default();
    tera.add_raw_template("name", template).map_err(|e| TplbuildError::Config(ConfigError::Render(e.to_string())))?;
    let mut ctx = tera::Context::new();
    ctx.insert("stage", stage_name);
    ctx.insert("profile", profile);
    tera.render("name", &ctx).map_err(|e| TplbuildError::Config(ConfigError::Render(e.to_string())))
}

fn sanitize_platform(platform: &str) -> String {
    platform.replace('/', "-")
}

fn split_repo_tag(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !repo.is_empty() && !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (reference.to_string(), "latest".to_string()),
    }
}

fn build_credentials(user_config: &UserConfig) -> Credentials {
    let mut by_host = BTreeMap::new();
    for (host, entry) in &user_config.auth {
        by_host.insert(
            host.clone(),
            RegistryAuth {
                username: entry.username.clone(),
                password: entry.password.clone(),
            },
        );
    }
    Credentials::new(by_host)
}

fn command_templates(user_config: &UserConfig) -> CommandTemplates {
    let get = |name: &str, default_argv: &[&str]| -> CommandTemplate {
        user_config
            .client
            .commands
            .get(name)
            .map(|c| CommandTemplate {
                argv: c.argv.clone(),
                env: c.env.clone(),
            })
            .unwrap_or_else(|| CommandTemplate {
                argv: default_argv.iter().map(|s| s.to_string()).collect(),
                env: BTreeMap::new(),
            })
    };

    let program = match user_config.client.r#type.as_str() {
        "podman" => "podman",
        "buildx" => "docker",
        _ => "docker",
    };

    CommandTemplates {
        build: get(
            "build",
            &[program, "build", "--platform", "{platform}", "-t", "{target_image}", "-"],
        ),
        tag: get("tag", &[program, "tag", "{source_image}", "{target_image}"]),
        push: get("push", &[program, "push", "{image}"]),
        pull: get("pull", &[program, "pull", "{image}"]),
        untag: get("untag", &[program, "rmi", "{image}"]),
        platform: get("platform", &[program, "version", "--format", "{{.Server.Os}}/{{.Server.Arch}}"]),
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_platform_replaces_slash() {
        assert_eq!(sanitize_platform("linux/amd64"), "linux-amd64");
    }

    #[test]
    fn render_name_template_substitutes_stage_and_profile() {
        let rendered = render_name_template("acme/{{ stage }}:{{ profile }}", "app", "release").unwrap();
        assert_eq!(rendered, "acme/app:release");
    }
}
