//! Graph builder: lowers stages into a DAG of `ImageNode`s.

pub mod build;
pub mod node;

pub use build::{build_graph, Graph};
pub use node::{ImageNode, NodeId};
