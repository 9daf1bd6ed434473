//! Node variants of the dependency graph.
//!
//! The variant set is closed: sources, builder recipes, applications (one
//! builder bound to concrete inputs) and the files an application
//! generates. Nodes live in the [`Graph`](crate::Graph) arena and refer to
//! each other through [`NodeId`] handles, which sidesteps ownership cycles
//! between forward and reverse edge sets.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use kiln_hash::Fingerprint;

use crate::context::BuildHandle;
use crate::error::Result;

/// Stable handle to a node in the graph arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A build recipe, parameterised once and applied to many inputs.
///
/// Implementations live outside the engine (a compiler driver, a linker, a
/// code generator); the engine only relies on this contract:
///
/// - `fingerprint` must be pure and must change with any semantic change
///   to the recipe or its parameters.
/// - `build` must write exactly the requested output paths, must not
///   modify its inputs, and must return the absolute paths of every file
///   it read beyond the explicit inputs.
pub trait Builder: Send + Sync {
    /// Short recipe name used in progress output.
    fn name(&self) -> &str;

    /// Fingerprint over the recipe identity and its static parameters.
    fn fingerprint(&self) -> Fingerprint;

    /// Number of outputs produced for `input_count` inputs.
    fn output_count(&self, input_count: usize) -> usize;

    /// Produce `outputs` from `inputs`.
    fn build(
        &self,
        handle: &BuildHandle<'_>,
        inputs: &[PathBuf],
        outputs: &[PathBuf],
    ) -> Result<Vec<PathBuf>>;
}

pub(crate) struct SourceFile {
    pub path: PathBuf,
}

pub(crate) struct BuilderNode {
    pub recipe: Arc<dyn Builder>,
}

pub(crate) struct Application {
    pub builder: NodeId,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    /// Learned at update time; `None` until the first hit or build.
    pub implicit_deps: Option<Vec<NodeId>>,
}

pub(crate) struct GeneratedFile {
    pub application: NodeId,
    pub index: usize,
    pub name: String,
}

pub(crate) enum NodeKind {
    Source(SourceFile),
    Builder(BuilderNode),
    Application(Application),
    Generated(GeneratedFile),
}

pub(crate) struct Node {
    pub kind: NodeKind,
    /// Forward dependencies: the nodes this node is built from.
    pub deps: HashSet<NodeId>,
    /// Optional role names for dependencies, kept consistent with `deps`.
    pub named_deps: HashMap<String, NodeId>,
    /// Reverse dependencies: the nodes built from this node.
    pub reverse_deps: HashSet<NodeId>,
    /// Targets that transitively depend on this node.
    pub targets: HashSet<NodeId>,
    pub dirty: bool,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            deps: HashSet::new(),
            named_deps: HashMap::new(),
            reverse_deps: HashSet::new(),
            targets: HashSet::new(),
            dirty: false,
        }
    }
}
