//! Planner: partitions the hashed DAG into a minimal, reverse-topologically
//! ordered list of builder invocations.
//!
//! Graph edges point from dependency to dependent (mirroring the graph
//! builder's node-creation order), so a plain `toposort` yields dependencies
//! before the entries that consume them.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::Direction;
use uuid::Uuid;

use crate::error::GraphError;
use crate::graph::{Graph, ImageNode, NodeId};
use crate::parser::instruction::Instruction;

/// One unit of work handed to the executor.
#[derive(Debug, Clone)]
pub enum PlanEntry {
    /// A linear run of `BuildStep`s built as a single builder invocation.
    Chain {
        base: ChainBase,
        /// Instructions in the chain, in build order.
        steps: Vec<NodeId>,
        /// Canonicalised Dockerfile text for each step in `steps`, with any
        /// `--from=` flag already rewritten to the resolved tag it
        /// references — self-contained, so the executor never needs the
        /// graph to assemble a build.
        lines: Vec<String>,
        /// Tag assigned to this chain's output; referenced by dependents.
        output_tag: String,
        /// Secondary-dependency tags this chain's steps require as inputs
        /// (resolved COPY `--from=` targets and build contexts).
        input_tags: Vec<String>,
        /// Node this chain terminates at.
        terminal: NodeId,
    },
    /// Tags/publishes an already-built node under one or more final names.
    Tag {
        node: NodeId,
        /// The tag this node's image already carries (a chain's
        /// `output_tag`, another entry's published tag, or a resolved
        /// source digest) — what the executor tags *from*.
        source_tag: String,
        tags: Vec<String>,
    },
    /// The node's content hash already resolved to an existing registry
    /// digest; no work is required.
    AlreadyCached { node: NodeId, digest: String },
}

#[derive(Debug, Clone)]
pub enum ChainBase {
    Source { repo: String, tag: String },
    Tag(String),
}

pub struct Plan {
    pub entries: Vec<PlanEntry>,
    /// Every intermediate tag created by the plan, for cleanup bookkeeping.
    pub intermediate_tags: Vec<String>,
}

/// Builds a plan to realize `targets` (a subset of `graph`'s nodes — base
/// images to probe/build, or stage images to publish).
///
/// `satisfied` maps a node to its already-resolved digest (from a prior
/// registry probe); such nodes are dropped from the plan as `AlreadyCached`
/// and their dependencies are pruned from the plan entirely.
pub fn plan(
    graph: &Graph,
    targets: &[NodeId],
    satisfied: &HashMap<NodeId, String>,
) -> Result<Plan, GraphError> {
    let order = toposort(&graph.dag, None)
        .map_err(|cycle| GraphError::Cycle(format!("{:?}", graph.dag[cycle.node_id()].kind_name())))?;

    let needed = reachable_unsatisfied(graph, targets, satisfied);
    let fan_out = compute_fan_out(graph, &needed);
    let chains = build_chains(graph, &order, &needed, &fan_out);

    let mut chain_of_member: HashMap<NodeId, usize> = HashMap::new();
    for (idx, chain) in chains.iter().enumerate() {
        for &n in chain {
            chain_of_member.insert(n, idx);
        }
    }

    let mut entries = Vec::new();
    let mut intermediate_tags = Vec::new();
    let mut output_tag_of: HashMap<NodeId, String> = HashMap::new();

    for &node_id in &order {
        if !needed.contains(&node_id) {
            continue;
        }
        if let Some(digest) = satisfied.get(&node_id) {
            entries.push(PlanEntry::AlreadyCached {
                node: node_id,
                digest: digest.clone(),
            });
            output_tag_of.insert(node_id, digest.clone());
            continue;
        }

        match &graph.dag[node_id] {
            ImageNode::BuildStep { .. } => {
                let idx = chain_of_member[&node_id];
                if chains[idx][0] != node_id {
                    // Not this chain's head; already covered by the Chain
                    // entry emitted when we reached the head.
                    continue;
                }
                let steps = chains[idx].clone();
                let base = chain_base(graph, steps[0], satisfied, &output_tag_of);
                let mut input_tags = Vec::new();
                let mut lines = Vec::new();
                for &step in &steps {
                    input_tags.extend(extra_deps_tags(graph, step, satisfied, &output_tag_of));
                    lines.push(render_step_line(graph, step, satisfied, &output_tag_of));
                }
                let terminal = *steps.last().unwrap();
                let output_tag = format!("tplbuild-{}", Uuid::new_v4());
                intermediate_tags.push(output_tag.clone());
                output_tag_of.insert(terminal, output_tag.clone());
                entries.push(PlanEntry::Chain {
                    base,
                    steps,
                    lines,
                    output_tag,
                    input_tags,
                    terminal,
                });
            }
            ImageNode::BaseImage { parent, stage_name, .. } => {
                let tag = output_tag_of
                    .get(parent)
                    .cloned()
                    .unwrap_or_else(|| source_tag(graph, *parent));
                entries.push(PlanEntry::Tag {
                    node: node_id,
                    source_tag: tag.clone(),
                    tags: vec![format!("base:{}", stage_name)],
                });
                output_tag_of.insert(node_id, tag);
            }
            ImageNode::StageImage {
                parent,
                publish_tags,
                stage_name,
                ..
            } => {
                let tag = output_tag_of
                    .get(parent)
                    .cloned()
                    .unwrap_or_else(|| source_tag(graph, *parent));
                let tags = if publish_tags.is_empty() {
                    vec![stage_name.clone()]
                } else {
                    publish_tags.clone()
                };
                entries.push(PlanEntry::Tag {
                    node: node_id,
                    source_tag: tag.clone(),
                    tags,
                });
                output_tag_of.insert(node_id, tag);
            }
            ImageNode::SourceImage { .. } | ImageNode::ContextImage { .. } => {
                // Leaves contribute no standalone plan entry; they're folded
                // into the `ChainBase`/`input_tags` of the steps that
                // reference them.
            }
        }
    }

    Ok(Plan {
        entries,
        intermediate_tags,
    })
}

fn reachable_unsatisfied(
    graph: &Graph,
    targets: &[NodeId],
    satisfied: &HashMap<NodeId, String>,
) -> HashSet<NodeId> {
    let mut seen = HashSet::new();
    let mut stack: Vec<NodeId> = targets.to_vec();
    while let Some(n) = stack.pop() {
        if !seen.insert(n) {
            continue;
        }
        if satisfied.contains_key(&n) {
            continue;
        }
        for dep in graph.dag.neighbors_directed(n, Direction::Incoming) {
            stack.push(dep);
        }
    }
    seen
}

/// Fan-out: for each needed node, how many needed nodes depend on it.
fn compute_fan_out(graph: &Graph, needed: &HashSet<NodeId>) -> HashMap<NodeId, usize> {
    needed
        .iter()
        .map(|&n| {
            let count = graph
                .dag
                .neighbors_directed(n, Direction::Outgoing)
                .filter(|d| needed.contains(d))
                .count();
            (n, count)
        })
        .collect()
}

/// Groups `BuildStep` nodes into maximal chains: `v0 -> v1 -> ... -> vk`
/// where each `vi` has fan-out 1 and its sole dependent (via the primary
/// parent edge) is `vi+1`, also a plain `BuildStep`.
fn build_chains(
    graph: &Graph,
    order: &[NodeId],
    needed: &HashSet<NodeId>,
    fan_out: &HashMap<NodeId, usize>,
) -> Vec<Vec<NodeId>> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut chains = Vec::new();

    for &node_id in order {
        if !needed.contains(&node_id) || visited.contains(&node_id) {
            continue;
        }
        if !matches!(graph.dag[node_id], ImageNode::BuildStep { .. }) {
            continue;
        }
        // Only start a chain at a node that isn't itself the sole successor
        // of another chainable BuildStep — otherwise it gets picked up as a
        // continuation below.
        if is_chain_continuation(graph, node_id, needed, fan_out) {
            continue;
        }

        let mut chain = vec![node_id];
        visited.insert(node_id);
        let mut cursor = node_id;
        while fan_out.get(&cursor).copied().unwrap_or(0) == 1 {
            let Some(next) = sole_build_step_successor(graph, cursor, needed) else {
                break;
            };
            chain.push(next);
            visited.insert(next);
            cursor = next;
        }
        chains.push(chain);
    }

    chains
}

fn is_chain_continuation(
    graph: &Graph,
    node_id: NodeId,
    needed: &HashSet<NodeId>,
    fan_out: &HashMap<NodeId, usize>,
) -> bool {
    match &graph.dag[node_id] {
        ImageNode::BuildStep { parent, .. } => {
            needed.contains(parent)
                && matches!(graph.dag[*parent], ImageNode::BuildStep { .. })
                && fan_out.get(parent).copied().unwrap_or(0) == 1
                && sole_build_step_successor(graph, *parent, needed) == Some(node_id)
        }
        _ => false,
    }
}

fn sole_build_step_successor(graph: &Graph, node: NodeId, needed: &HashSet<NodeId>) -> Option<NodeId> {
    graph
        .dag
        .neighbors_directed(node, Direction::Outgoing)
        .find(|&d| needed.contains(&d) && matches!(graph.dag[d], ImageNode::BuildStep { parent, .. } if parent == node))
}

fn chain_base(
    graph: &Graph,
    first_step: NodeId,
    satisfied: &HashMap<NodeId, String>,
    output_tag_of: &HashMap<NodeId, String>,
) -> ChainBase {
    let parent = match &graph.dag[first_step] {
        ImageNode::BuildStep { parent, .. } => *parent,
        _ => unreachable!("chain base always starts from a BuildStep"),
    };
    if let Some(tag) = output_tag_of.get(&parent) {
        return ChainBase::Tag(tag.clone());
    }
    match &graph.dag[parent] {
        ImageNode::SourceImage { repo, tag, digest, .. } => ChainBase::Source {
            repo: repo.clone(),
            tag: digest.clone().or_else(|| satisfied.get(&parent).cloned()).unwrap_or_else(|| tag.clone()),
        },
        _ => ChainBase::Tag(source_tag(graph, parent)),
    }
}

fn extra_deps_tags(
    graph: &Graph,
    step: NodeId,
    satisfied: &HashMap<NodeId, String>,
    output_tag_of: &HashMap<NodeId, String>,
) -> Vec<String> {
    let deps = match &graph.dag[step] {
        ImageNode::BuildStep { extra_deps, .. } => extra_deps.clone(),
        _ => Vec::new(),
    };
    deps.into_iter()
        .map(|d| {
            output_tag_of
                .get(&d)
                .cloned()
                .or_else(|| satisfied.get(&d).cloned())
                .unwrap_or_else(|| source_tag(graph, d))
        })
        .collect()
}

/// Renders one chain step's Dockerfile line, rewriting a `--from=` flag (if
/// present) to the resolved tag of whatever it points at: a prior stage's
/// output, a named context, or an external image reference.
fn render_step_line(
    graph: &Graph,
    step: NodeId,
    satisfied: &HashMap<NodeId, String>,
    output_tag_of: &HashMap<NodeId, String>,
) -> String {
    let instruction = match &graph.dag[step] {
        ImageNode::BuildStep { instruction, .. } => instruction,
        _ => unreachable!("chain steps are always BuildStep nodes"),
    };
    if instruction.from_flag().is_none() {
        return instruction.canonical();
    }
    let resolved = extra_deps_tags(graph, step, satisfied, output_tag_of);
    let Some(tag) = resolved.first() else {
        return instruction.canonical();
    };
    let mut flags = instruction.flags.clone();
    flags.insert("from".to_string(), tag.clone());
    Instruction {
        flags,
        ..instruction.clone()
    }
    .canonical()
}

fn source_tag(graph: &Graph, node: NodeId) -> String {
    match &graph.dag[node] {
        ImageNode::SourceImage { repo, tag, digest, .. } => digest.clone().unwrap_or_else(|| format!("{}:{}", repo, tag)),
        ImageNode::ContextImage { context_name, .. } => format!("context:{}", context_name),
        _ => format!("node-{}", node.index()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build_graph;
    use crate::hash::hash_graph;
    use crate::parser::{classify_stages, parse, stage};
    use std::collections::BTreeMap;

    fn graph_for(text: &str) -> Graph {
        let mut stages = parse(text, true).unwrap();
        classify_stages(
            &mut stages,
            &stage::default_base_prefixes(),
            &stage::default_anon_prefixes(),
            &BTreeMap::new(),
        );
        let mut g = build_graph(&stages, "linux/amd64", "default").unwrap();
        for node in g.dag.node_weights_mut() {
            if let ImageNode::SourceImage { digest, .. } = node {
                *digest = Some("sha256:deadbeef".to_string());
            }
            if let ImageNode::ContextImage { files_hash, .. } = node {
                *files_hash = Some("filehash".to_string());
            }
        }
        hash_graph(&mut g, "salt").unwrap();
        g
    }

    #[test]
    fn single_stage_becomes_one_chain_plus_one_tag_entry() {
        let g = graph_for("FROM golang:1.22 AS app\nRUN a\nRUN b\nRUN c\n");
        let target = g.stage_terminal["app"];
        let p = plan(&g, &[target], &HashMap::new()).unwrap();
        let chains: Vec<_> = p.entries.iter().filter(|e| matches!(e, PlanEntry::Chain { .. })).collect();
        assert_eq!(chains.len(), 1);
        if let PlanEntry::Chain { steps, .. } = chains[0] {
            assert_eq!(steps.len(), 3);
        }
    }

    #[test]
    fn dependencies_precede_dependents_in_plan_order() {
        let g = graph_for("FROM golang:1.22 AS builder\nRUN build\nFROM scratch\nCOPY --from=builder /app /app\n");
        let stage_1 = g.stage_terminal["1"];
        let p = plan(&g, &[stage_1], &HashMap::new()).unwrap();
        let mut seen_builder_chain = false;
        let mut order_ok = true;
        for entry in &p.entries {
            if let PlanEntry::Chain { terminal, .. } = entry {
                if *terminal == g.stage_terminal["builder"] {
                    seen_builder_chain = true;
                }
            }
            if let PlanEntry::Tag { node, .. } = entry {
                if *node == stage_1 && !seen_builder_chain {
                    order_ok = false;
                }
            }
        }
        assert!(order_ok, "dependent stage tagged before its builder dependency");
    }

    #[test]
    fn already_satisfied_base_image_prunes_its_dependencies_from_the_plan() {
        let g = graph_for("FROM golang:1.22 AS base-deps\nRUN go mod download\n");
        let base = g.stage_terminal["base-deps"];
        let mut satisfied = HashMap::new();
        satisfied.insert(base, "sha256:cached".to_string());
        let p = plan(&g, &[base], &satisfied).unwrap();
        assert_eq!(p.entries.len(), 1);
        assert!(matches!(p.entries[0], PlanEntry::AlreadyCached { .. }));
    }

    #[test]
    fn fan_out_point_is_built_once_and_shared() {
        let g = graph_for(
            "FROM golang:1.22 AS base-deps\nRUN go mod download\nFROM base-deps AS a\nRUN build-a\nFROM base-deps AS b\nRUN build-b\n",
        );
        let a = g.stage_terminal["a"];
        let b = g.stage_terminal["b"];
        let base_deps_wrapper = g.stage_terminal["base-deps"];
        let base_deps_step = match &g.dag[base_deps_wrapper] {
            ImageNode::BaseImage { parent, .. } => *parent,
            _ => panic!("base-deps should be wrapped in a BaseImage node"),
        };
        let p = plan(&g, &[a, b], &HashMap::new()).unwrap();
        let base_deps_chain_count = p
            .entries
            .iter()
            .filter(|e| matches!(e, PlanEntry::Chain { terminal, .. } if *terminal == base_deps_step))
            .count();
        assert_eq!(base_deps_chain_count, 1);
    }
}
