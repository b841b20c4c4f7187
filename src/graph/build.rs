//! Graph construction: lowers a stage list into a DAG of `ImageNode`s.

use std::collections::BTreeMap;

use petgraph::graph::DiGraph;

use crate::error::GraphError;
use crate::parser::instruction::Verb;
use crate::parser::stage::Stage;

use super::node::{ImageNode, NodeId};

pub struct Graph {
    pub dag: DiGraph<ImageNode, ()>,
    /// Terminal node per stage, after base/stage/anon wrapping.
    pub stage_terminal: BTreeMap<String, NodeId>,
    /// One `ContextImage` node per distinct context name referenced.
    pub context_nodes: BTreeMap<String, NodeId>,
    /// Top-level targets in source order: base images to probe/build, and
    /// stage images to publish.
    pub roots: Vec<NodeId>,
}

impl Graph {
    fn context_node(&mut self, name: &str) -> NodeId {
        if let Some(id) = self.context_nodes.get(name) {
            return *id;
        }
        let id = self.dag.add_node(ImageNode::ContextImage {
            context_name: name.to_string(),
            files_hash: None,
        });
        self.context_nodes.insert(name.to_string(), id);
        id
    }
}

/// Builds the image-node DAG for one platform from a parsed, classified
/// stage list.
///
/// `known_contexts` is the set of context names declared in the project
/// config's `contexts:` map; any COPY `--from=` operand that is neither a
/// known stage nor a known context is treated as an external image
/// reference and becomes a fresh `SourceImage`.
pub fn build_graph(
    stages: &[Stage],
    platform: &str,
    profile: &str,
) -> Result<Graph, GraphError> {
    let mut graph = Graph {
        dag: DiGraph::new(),
        stage_terminal: BTreeMap::new(),
        context_nodes: BTreeMap::new(),
        roots: Vec::new(),
    };

    let mut stage_names: Vec<&str> = Vec::new();
    for s in stages {
        stage_names.push(&s.name);
    }

    for stage in stages {
        let parent = resolve_from(&mut graph, stage, platform)?;

        let mut current = parent;
        for instruction in &stage.instructions {
            let mut extra_deps = Vec::new();

            if instruction.verb == Verb::Copy || instruction.verb == Verb::Add {
                if let Some(from) = instruction.from_flag() {
                    if let Some(&target) = graph.stage_terminal.get(from) {
                        extra_deps.push(target);
                    } else if stage_names.iter().any(|n| *n == from) {
                        return Err(GraphError::UnresolvedFrom(stage.name.clone(), from.to_string()));
                    } else {
                        // Either a known context name or an external image
                        // reference; both are legitimate secondary deps.
                        extra_deps.push(resolve_copy_from_target(&mut graph, from, platform));
                    }
                } else if instruction.verb.consumes_context() {
                    extra_deps.push(graph.context_node(&instruction.context));
                }
            }

            let node = ImageNode::BuildStep {
                parent: current,
                instruction: instruction.clone(),
                extra_deps: extra_deps.clone(),
                platform: platform.to_string(),
            };
            let next = graph.dag.add_node(node);
            graph.dag.add_edge(current, next, ());
            for dep in &extra_deps {
                graph.dag.add_edge(*dep, next, ());
            }
            current = next;
        }

        let wrapped = if stage.is_base {
            let n = graph.dag.add_node(ImageNode::BaseImage {
                parent: current,
                stage_name: stage.name.clone(),
                platform: platform.to_string(),
                profile: profile.to_string(),
                content_hash: None,
                resolved_digest: None,
            });
            graph.dag.add_edge(current, n, ());
            n
        } else if stage.is_anon {
            current
        } else {
            let n = graph.dag.add_node(ImageNode::StageImage {
                parent: current,
                stage_name: stage.name.clone(),
                publish_tags: Vec::new(),
                platform: platform.to_string(),
                profile: profile.to_string(),
                content_hash: None,
            });
            graph.dag.add_edge(current, n, ());
            n
        };

        if graph.stage_terminal.insert(stage.name.clone(), wrapped).is_some() {
            return Err(GraphError::DuplicateStageName(stage.name.clone()));
        }
        if stage.is_base || !stage.is_anon {
            graph.roots.push(wrapped);
        }
    }

    enforce_base_anon_invariant(&graph, stages)?;
    validate_acyclic(&graph)?;

    Ok(graph)
}

fn resolve_from(graph: &mut Graph, stage: &Stage, platform: &str) -> Result<NodeId, GraphError> {
    if let Some(&terminal) = graph.stage_terminal.get(&stage.base) {
        return Ok(terminal);
    }
    let (repo, tag) = split_repo_tag(&stage.base);
    Ok(graph.dag.add_node(ImageNode::SourceImage {
        repo,
        tag,
        platform: platform.to_string(),
        digest: None,
    }))
}

/// Resolves a COPY `--from=` operand that isn't a prior stage name: either
/// a configured context name (reused if already a node) or a fresh
/// external `SourceImage`.
fn resolve_copy_from_target(graph: &mut Graph, from: &str, platform: &str) -> NodeId {
    if graph.context_nodes.contains_key(from) {
        return graph.context_node(from);
    }
    if looks_like_context_name(from) {
        return graph.context_node(from);
    }
    let (repo, tag) = split_repo_tag(from);
    graph.dag.add_node(ImageNode::SourceImage {
        repo,
        tag,
        platform: platform.to_string(),
        digest: None,
    })
}

/// A conservative heuristic: a bare identifier with no `/`, `:`, or `.` is
/// much more likely to be a context name than a registry reference (real
/// image refs almost always carry at least a tag or a namespace).
fn looks_like_context_name(s: &str) -> bool {
    !s.contains('/') && !s.contains(':') && !s.contains('.')
}

fn split_repo_tag(reference: &str) -> (String, String) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !repo.is_empty() && !tag.contains('/') => {
            (repo.to_string(), tag.to_string())
        }
        _ => (reference.to_string(), "latest".to_string()),
    }
}

/// Invariant: a `base` stage's descendants may not depend on an `anon`
/// stage.
fn enforce_base_anon_invariant(graph: &Graph, stages: &[Stage]) -> Result<(), GraphError> {
    let anon_names: Vec<&str> = stages.iter().filter(|s| s.is_anon).map(|s| s.name.as_str()).collect();
    for stage in stages.iter().filter(|s| s.is_base) {
        for instruction in &stage.instructions {
            if let Some(from) = instruction.from_flag() {
                if anon_names.contains(&from) {
                    return Err(GraphError::BaseDependsOnAnon {
                        base: stage.name.clone(),
                        anon: from.to_string(),
                    });
                }
            }
        }
        if anon_names.contains(&stage.base.as_str()) {
            return Err(GraphError::BaseDependsOnAnon {
                base: stage.name.clone(),
                anon: stage.base.clone(),
            });
        }
    }
    Ok(())
}

fn validate_acyclic(graph: &Graph) -> Result<(), GraphError> {
    use petgraph::algo::toposort;
    toposort(&graph.dag, None).map_err(|cycle| {
        GraphError::Cycle(format!("{:?}", graph.dag[cycle.node_id()].kind_name()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{classify_stages, parse, stage};
    use std::collections::BTreeMap;

    fn build(text: &str) -> Graph {
        let mut stages = parse(text, true).unwrap();
        classify_stages(
            &mut stages,
            &stage::default_base_prefixes(),
            &stage::default_anon_prefixes(),
            &BTreeMap::new(),
        );
        build_graph(&stages, "linux/amd64", "default").unwrap()
    }

    #[test]
    fn simple_two_stage_graph_has_one_root_per_publishable_stage() {
        let g = build("FROM golang:1.22 AS builder\nRUN build\nFROM scratch\nCOPY --from=builder /app /app\n");
        assert_eq!(g.stage_terminal.len(), 2);
        assert_eq!(g.roots.len(), 2);
    }

    #[test]
    fn base_stage_is_wrapped_in_a_base_image_node() {
        let g = build("FROM golang:1.22 AS base-deps\nRUN go mod download\n");
        let node = g.stage_terminal.get("base-deps").unwrap();
        assert!(g.dag[*node].is_base_image());
    }

    #[test]
    fn anon_stage_is_unwrapped_and_pruned_from_roots_if_unreachable() {
        let g = build("FROM golang:1.22 AS anon-scratch\nRUN true\n");
        let node = g.stage_terminal.get("anon-scratch").unwrap();
        assert!(!g.dag[*node].is_base_image());
        assert!(!g.dag[*node].is_stage_image());
        assert!(g.roots.is_empty());
    }

    #[test]
    fn copy_from_unknown_stage_becomes_external_source_image() {
        let g = build("FROM scratch AS s\nCOPY --from=python:3.10 /a /a\n");
        let node = *g.stage_terminal.get("s").unwrap();
        let extra = g.dag[node].extra_deps();
        assert_eq!(extra.len(), 1);
        assert!(matches!(g.dag[extra[0]], ImageNode::SourceImage { .. }));
    }

    #[test]
    fn base_depending_on_anon_stage_is_rejected() {
        let mut stages = parse(
            "FROM scratch AS anon-helper\nRUN true\nFROM scratch AS base-app\nCOPY --from=anon-helper /a /a\n",
            true,
        )
        .unwrap();
        classify_stages(
            &mut stages,
            &stage::default_base_prefixes(),
            &stage::default_anon_prefixes(),
            &BTreeMap::new(),
        );
        let err = build_graph(&stages, "linux/amd64", "default").unwrap_err();
        assert!(matches!(err, GraphError::BaseDependsOnAnon { .. }));
    }
}
