//! Content hasher: assigns a stable symbolic content hash to every node.

use std::collections::HashMap;

use petgraph::algo::toposort;
use sha2::{Digest, Sha256};

use crate::error::GraphError;
use crate::graph::{Graph, ImageNode, NodeId};

/// Computes `H(n)` for every node in `graph`, in dependency order, and
/// writes the result back onto `BaseImage`/`StageImage` nodes'
/// `content_hash` field. `StageImage` hashes are not used for caching —
/// published stages always build fresh — but are still computed here for
/// diagnostics and plan tie-breaking.
///
/// Requires every `SourceImage` to already carry a resolved `digest` and
/// every `ContextImage` to already carry a computed `files_hash` — callers
/// run source-lock resolution and context hashing before calling this.
pub fn hash_graph(graph: &mut Graph, salt: &str) -> Result<HashMap<NodeId, String>, GraphError> {
    let order = toposort(&graph.dag, None)
        .map_err(|cycle| GraphError::Cycle(format!("{:?}", graph.dag[cycle.node_id()].kind_name())))?;

    let mut hashes: HashMap<NodeId, String> = HashMap::new();

    for node_id in order {
        let h = {
            let node = &graph.dag[node_id];
            compute_hash(node, &hashes, salt)?
        };
        hashes.insert(node_id, h.clone());
        let node = &mut graph.dag[node_id];
        node.set_content_hash(h);
    }

    Ok(hashes)
}

fn compute_hash(
    node: &ImageNode,
    hashes: &HashMap<NodeId, String>,
    salt: &str,
) -> Result<String, GraphError> {
    match node {
        ImageNode::SourceImage {
            repo,
            tag,
            platform,
            digest,
        } => {
            let digest = digest
                .as_deref()
                .ok_or_else(|| GraphError::UnresolvedFrom(repo.clone(), tag.clone()))?;
            Ok(mix(&["source", repo, tag, platform, digest]))
        }
        ImageNode::ContextImage {
            context_name,
            files_hash,
        } => {
            let files_hash = files_hash
                .as_deref()
                .ok_or_else(|| GraphError::UnresolvedFrom(context_name.clone(), "files_hash".to_string()))?;
            Ok(mix(&["ctx", context_name, files_hash]))
        }
        ImageNode::BuildStep {
            parent,
            instruction,
            extra_deps,
            platform,
        } => {
            let parent_hash = hash_of(hashes, *parent)?;
            let mut parts = vec!["step".to_string(), parent_hash, instruction.canonical()];
            for dep in extra_deps {
                parts.push(hash_of(hashes, *dep)?);
            }
            parts.push(platform.clone());
            parts.push(salt.to_string());
            Ok(mix(&parts.iter().map(String::as_str).collect::<Vec<_>>()))
        }
        ImageNode::BaseImage {
            parent,
            platform,
            profile,
            ..
        } => {
            let parent_hash = hash_of(hashes, *parent)?;
            Ok(mix(&["base", &parent_hash, profile, platform, salt]))
        }
        ImageNode::StageImage {
            parent,
            platform,
            profile,
            ..
        } => {
            let parent_hash = hash_of(hashes, *parent)?;
            Ok(mix(&["stage", &parent_hash, profile, platform, salt]))
        }
    }
}

fn hash_of(hashes: &HashMap<NodeId, String>, id: NodeId) -> Result<String, GraphError> {
    hashes
        .get(&id)
        .cloned()
        .ok_or_else(|| GraphError::Cycle(format!("{:?}", id)))
}

fn mix(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}
