//! `ImageNode`: the DAG vertex, modeled as a tagged enum rather than a
//! trait hierarchy.
//!
//! `BaseImage` and `StageImage` both wrap a single terminal node (normally
//! the stage's last `BuildStep`) rather than re-embedding the stage's
//! instruction list: a base image's content hash is the same as its
//! wrapped terminal step's, just tagged `base` instead of `step`, so the
//! instruction chain is recovered by walking `parent` rather than
//! duplicated onto the wrapper. See DESIGN.md for this reading of the
//! data model.

use crate::parser::instruction::Instruction;

pub type NodeId = petgraph::graph::NodeIndex;

#[derive(Debug, Clone)]
pub enum ImageNode {
    SourceImage {
        repo: String,
        tag: String,
        platform: String,
        digest: Option<String>,
    },
    ContextImage {
        context_name: String,
        files_hash: Option<String>,
    },
    BaseImage {
        parent: NodeId,
        stage_name: String,
        platform: String,
        profile: String,
        content_hash: Option<String>,
        resolved_digest: Option<String>,
    },
    BuildStep {
        parent: NodeId,
        instruction: Instruction,
        /// Non-primary graph dependencies: the implicit build context (for
        /// a plain COPY/ADD) or the resolved COPY `--from=` target (a
        /// prior stage's terminal node, a named context, or an external
        /// image). Almost always 0 or 1 entries; modeled as a `Vec` because
        /// the content-hash formula folds in every extra dependency's hash,
        /// not just one.
        extra_deps: Vec<NodeId>,
        /// The platform this step's graph was built for (spec.md §4.3's
        /// content-hash formula folds this in directly, not just via the
        /// stage's `SourceImage`/`BaseImage` ancestry).
        platform: String,
    },
    StageImage {
        parent: NodeId,
        stage_name: String,
        publish_tags: Vec<String>,
        platform: String,
        profile: String,
        content_hash: Option<String>,
    },
}

impl ImageNode {
    pub fn platform(&self) -> Option<&str> {
        match self {
            ImageNode::SourceImage { platform, .. }
            | ImageNode::BaseImage { platform, .. }
            | ImageNode::StageImage { platform, .. }
            | ImageNode::BuildStep { platform, .. } => Some(platform),
            ImageNode::ContextImage { .. } => None,
        }
    }

    pub fn content_hash(&self) -> Option<&str> {
        match self {
            ImageNode::BaseImage { content_hash, .. } => content_hash.as_deref(),
            ImageNode::StageImage { content_hash, .. } => content_hash.as_deref(),
            _ => None,
        }
    }

    pub fn set_content_hash(&mut self, hash: String) {
        match self {
            ImageNode::BaseImage { content_hash, .. } => *content_hash = Some(hash),
            ImageNode::StageImage { content_hash, .. } => *content_hash = Some(hash),
            _ => {}
        }
    }

    pub fn primary_parent(&self) -> Option<NodeId> {
        match self {
            ImageNode::SourceImage { .. } | ImageNode::ContextImage { .. } => None,
            ImageNode::BaseImage { parent, .. }
            | ImageNode::BuildStep { parent, .. }
            | ImageNode::StageImage { parent, .. } => Some(*parent),
        }
    }

    /// Non-primary dependencies. Also mirrored as petgraph edges (so
    /// toposort and readiness checks see them), but kept here too so the
    /// planner can tell primary from secondary edges when deciding chain
    /// formation: only the primary parent edge extends a chain.
    pub fn extra_deps(&self) -> &[NodeId] {
        match self {
            ImageNode::BuildStep { extra_deps, .. } => extra_deps,
            _ => &[],
        }
    }

    pub fn is_base_image(&self) -> bool {
        matches!(self, ImageNode::BaseImage { .. })
    }

    pub fn is_stage_image(&self) -> bool {
        matches!(self, ImageNode::StageImage { .. })
    }

    pub fn stage_name(&self) -> Option<&str> {
        match self {
            ImageNode::BaseImage { stage_name, .. } | ImageNode::StageImage { stage_name, .. } => {
                Some(stage_name)
            }
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ImageNode::SourceImage { .. } => "source",
            ImageNode::ContextImage { .. } => "ctx",
            ImageNode::BaseImage { .. } => "base",
            ImageNode::BuildStep { .. } => "step",
            ImageNode::StageImage { .. } => "stage",
        }
    }
}
