//! The dependency graph: an arena of typed nodes with forward and reverse
//! edges, fingerprinting and target registration.
//!
//! Build scripts declare applications against fresh nodes; registration
//! walks each declared target, merges duplicate source files into their
//! canonical instance, stamps target membership and collects the nodes an
//! update run starts from.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::trace;

use kiln_cache::Cache;
use kiln_hash::{hash_file, Fingerprint, FingerprintHasher};

use crate::error::{GraphError, Result};
use crate::node::{
    Application, Builder, BuilderNode, GeneratedFile, Node, NodeId, NodeKind, SourceFile,
};

/// Variant tags fed into fingerprints so that different node kinds can
/// never collide on otherwise identical constituents.
const APPLICATION_TAG: &str = "application";
const GENERATED_TAG: &str = "generated";

/// Stands in for the implicit-dependency list while none is known; this is
/// what makes the partial fingerprint distinct from every full one.
const UNRESOLVED_DEPS_TAG: &str = "unresolved";

/// One registered target: the (possibly merged) target node and the nodes
/// with no dependencies that seed an update of this target.
pub struct TargetData {
    pub node: NodeId,
    pub(crate) start_nodes: HashSet<NodeId>,
}

/// Arena of nodes addressed by [`NodeId`] handles.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
    /// Canonical source-file node per absolute path.
    files: HashMap<PathBuf, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::new(kind));
        id
    }

    // ========== Node Construction ==========

    /// The canonical source-file node for `path`, created on first use.
    pub fn source_file(&mut self, path: impl AsRef<Path>) -> NodeId {
        let path = absolute(path.as_ref());
        if let Some(&id) = self.files.get(&path) {
            return id;
        }
        let id = self.push(NodeKind::Source(SourceFile { path: path.clone() }));
        self.files.insert(path, id);
        id
    }

    /// A fresh, unregistered source-file node.
    ///
    /// Build scripts may declare the same path in independent subgraphs;
    /// duplicates are merged into the canonical instance when a target
    /// containing them is registered.
    pub fn new_source_file(&mut self, path: impl AsRef<Path>) -> NodeId {
        let path = absolute(path.as_ref());
        self.push(NodeKind::Source(SourceFile { path }))
    }

    /// Register a builder recipe as a graph node.
    pub fn builder(&mut self, recipe: Arc<dyn Builder>) -> NodeId {
        self.push(NodeKind::Builder(BuilderNode { recipe }))
    }

    /// Bind `builder` to `inputs`, producing the generated-file nodes.
    ///
    /// `output_names` must match the builder's output count when given;
    /// `None` entries (or a missing list) fall back to positional names.
    pub fn apply(
        &mut self,
        builder: NodeId,
        inputs: &[NodeId],
        output_names: Option<&[Option<&str>]>,
    ) -> std::result::Result<Vec<NodeId>, GraphError> {
        let recipe = match &self.node(builder).kind {
            NodeKind::Builder(b) => Arc::clone(&b.recipe),
            _ => return Err(GraphError::NotABuilder),
        };
        let count = recipe.output_count(inputs.len());
        let names: Vec<Option<String>> = match output_names {
            None => vec![None; count],
            Some(names) => {
                if names.len() != count {
                    return Err(GraphError::OutputNameCount {
                        expected: count,
                        given: names.len(),
                    });
                }
                names.iter().map(|n| n.map(str::to_owned)).collect()
            }
        };

        let app = self.push(NodeKind::Application(Application {
            builder,
            inputs: inputs.to_vec(),
            outputs: Vec::new(),
            implicit_deps: None,
        }));
        self.add_dependency(app, builder, None)?;
        for &input in inputs {
            self.add_dependency(app, input, None)?;
        }

        let mut outputs = Vec::with_capacity(count);
        for (index, name) in names.into_iter().enumerate() {
            let name = name.unwrap_or_else(|| format!("output{:02}", index));
            let output = self.push(NodeKind::Generated(GeneratedFile {
                application: app,
                index,
                name,
            }));
            self.add_dependency(output, app, None)?;
            outputs.push(output);
        }
        match &mut self.node_mut(app).kind {
            NodeKind::Application(a) => a.outputs = outputs.clone(),
            _ => unreachable!("node was just created as an application"),
        }
        Ok(outputs)
    }

    // ========== Edge Algebra ==========

    /// Add a forward edge `node → dep` (and the matching reverse edge),
    /// optionally under a role name.
    pub fn add_dependency(
        &mut self,
        node: NodeId,
        dep: NodeId,
        name: Option<&str>,
    ) -> std::result::Result<(), GraphError> {
        if self.node(node).deps.contains(&dep) {
            return Err(GraphError::DependencyAlreadyExists);
        }
        if let Some(name) = name {
            if self.node(node).named_deps.contains_key(name) {
                return Err(GraphError::DependencyNameTaken(name.to_owned()));
            }
            self.node_mut(node).named_deps.insert(name.to_owned(), dep);
        }
        self.node_mut(node).deps.insert(dep);
        self.node_mut(dep).reverse_deps.insert(node);
        Ok(())
    }

    /// Remove the edge `node → dep`, dropping any role names for it.
    pub fn remove_dependency(
        &mut self,
        node: NodeId,
        dep: NodeId,
    ) -> std::result::Result<(), GraphError> {
        if !self.node(node).deps.contains(&dep) {
            return Err(GraphError::DependencyMissing);
        }
        self.node_mut(node).named_deps.retain(|_, v| *v != dep);
        self.node_mut(node).deps.remove(&dep);
        self.node_mut(dep).reverse_deps.remove(&node);
        Ok(())
    }

    /// Dependency registered under a role name, if any.
    pub fn named_dependency(&self, node: NodeId, name: &str) -> Option<NodeId> {
        self.node(node).named_deps.get(name).copied()
    }

    // ========== Fingerprinting ==========

    /// Content fingerprint of a node.
    ///
    /// Source files hash their bytes; builders their recipe; generated
    /// files derive from their application. An application hashes with
    /// whatever implicit dependencies it currently knows, so before the
    /// first update its full fingerprint equals its partial one's shape
    /// with the unresolved marker.
    pub fn node_hash(&self, id: NodeId) -> Result<Fingerprint> {
        match &self.node(id).kind {
            NodeKind::Source(source) => Ok(hash_file(&source.path)?),
            NodeKind::Builder(builder) => Ok(builder.recipe.fingerprint()),
            NodeKind::Application(app) => self.application_hash(id, app.implicit_deps.as_deref()),
            NodeKind::Generated(generated) => {
                let application = self.node_hash(generated.application)?;
                let mut hasher = FingerprintHasher::new();
                hasher.push_text(GENERATED_TAG);
                hasher.push_bytes(application.as_bytes());
                hasher.push_text(generated.index);
                hasher.push_text(&generated.name);
                Ok(hasher.finish())
            }
        }
    }

    /// Application fingerprint excluding implicit dependencies: the cache
    /// lookup key for candidate dependency sets.
    pub fn partial_fingerprint(&self, app: NodeId) -> Result<Fingerprint> {
        self.application_hash(app, None)
    }

    fn application_hash(&self, id: NodeId, implicit: Option<&[NodeId]>) -> Result<Fingerprint> {
        let app = match &self.node(id).kind {
            NodeKind::Application(app) => app,
            _ => return Err(GraphError::NotAnApplication.into()),
        };
        let mut hasher = FingerprintHasher::new();
        hasher.push_text(APPLICATION_TAG);
        hasher.push_bytes(self.node_hash(app.builder)?.as_bytes());
        for &input in &app.inputs {
            hasher.push_bytes(self.node_hash(input)?.as_bytes());
        }
        match implicit {
            Some(deps) => {
                for &dep in deps {
                    hasher.push_bytes(self.node_hash(dep)?.as_bytes());
                }
            }
            None => hasher.push_text(UNRESOLVED_DEPS_TAG),
        }
        Ok(hasher.finish())
    }

    /// Replace an application's implicit dependencies, keeping the edge
    /// sets in step. Edges are only removed for learned dependencies, so a
    /// file that is both an explicit input and a scanned dependency keeps
    /// its input edge.
    pub(crate) fn set_implicit_dependencies(
        &mut self,
        id: NodeId,
        deps: Option<Vec<NodeId>>,
    ) -> std::result::Result<(), GraphError> {
        let (old, inputs, builder) = match &self.node(id).kind {
            NodeKind::Application(app) => (
                app.implicit_deps.clone(),
                app.inputs.clone(),
                app.builder,
            ),
            _ => return Err(GraphError::NotAnApplication),
        };

        if let Some(old) = old {
            for dep in old {
                if dep != builder && !inputs.contains(&dep) {
                    self.remove_dependency(id, dep)?;
                }
            }
        }
        if let Some(deps) = &deps {
            for &dep in deps {
                if !self.node(id).deps.contains(&dep) {
                    self.add_dependency(id, dep, None)?;
                }
            }
        }
        match &mut self.node_mut(id).kind {
            NodeKind::Application(app) => app.implicit_deps = deps,
            _ => unreachable!("kind checked above"),
        }
        Ok(())
    }

    // ========== Lookups ==========

    /// Canonical node for an already-registered path.
    pub fn find_file(&self, path: &Path) -> Option<NodeId> {
        self.files.get(&absolute(path)).copied()
    }

    /// Display name of a target node (the generated file's name).
    pub fn target_name(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Generated(generated) => Some(&generated.name),
            _ => None,
        }
    }

    /// Concrete filesystem path of a file node: a source file's own path,
    /// or a generated file's location inside the cache.
    pub(crate) fn file_path(&self, id: NodeId, cache: &Cache) -> Result<PathBuf> {
        match &self.node(id).kind {
            NodeKind::Source(source) => Ok(source.path.clone()),
            NodeKind::Generated(generated) => {
                let full = self.node_hash(generated.application)?;
                Ok(cache.entry_dir(&full).join(&generated.name))
            }
            _ => Err(GraphError::NotAFile.into()),
        }
    }

    /// Human-readable description used in progress output.
    pub fn describe(&self, id: NodeId) -> String {
        match &self.node(id).kind {
            NodeKind::Source(source) => source.path.display().to_string(),
            NodeKind::Builder(builder) => builder.recipe.name().to_owned(),
            NodeKind::Application(app) => {
                let inputs: Vec<String> =
                    app.inputs.iter().map(|&i| self.describe(i)).collect();
                format!("{}({})", self.describe(app.builder), inputs.join(", "))
            }
            NodeKind::Generated(generated) => {
                format!("{}[{}]", self.describe(generated.application), generated.index)
            }
        }
    }

    /// Graphviz rendering of the whole graph, dependencies pointing at
    /// their dependents.
    pub fn to_graphviz(&self) -> String {
        let mut out = String::from("digraph nodes {\n");
        for (index, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(
                out,
                "  n{} [label=\"{}\"];",
                index,
                self.describe(NodeId(index as u32)).replace('"', "'")
            );
            for dep in &node.deps {
                let _ = writeln!(out, "  {} -> n{};", dep, index);
            }
        }
        out.push_str("}\n");
        out
    }

    // ========== Target Registration ==========

    /// Walk a declared target, merging duplicate source files into their
    /// canonical instances, stamping target membership, checking edge
    /// consistency and collecting start nodes.
    ///
    /// Returns the target data for this target; the contained node may
    /// differ from the argument when the target itself was a duplicate.
    pub(crate) fn register_target(
        &mut self,
        target: NodeId,
    ) -> std::result::Result<TargetData, GraphError> {
        let mut target = target;
        let mut start_nodes = HashSet::new();
        let mut queue = VecDeque::from([target]);

        while let Some(mut id) = queue.pop_front() {
            if let NodeKind::Source(source) = &self.node(id).kind {
                if !self.node(id).deps.is_empty() {
                    return Err(GraphError::MalformedSourceFile(source.path.clone()));
                }
                let path = source.path.clone();
                match self.files.get(&path).copied() {
                    Some(canonical) if canonical != id => {
                        trace!(?path, duplicate = %id, %canonical, "merging source file");
                        // Re-point everything that depended on the
                        // duplicate, carrying role names across.
                        let dependents: Vec<NodeId> =
                            self.node(id).reverse_deps.iter().copied().collect();
                        for dependent in dependents {
                            let role = self
                                .node(dependent)
                                .named_deps
                                .iter()
                                .find(|(_, &v)| v == id)
                                .map(|(k, _)| k.clone());
                            self.remove_dependency(dependent, id)?;
                            self.add_dependency(dependent, canonical, role.as_deref())?;
                            self.replace_in_inputs(dependent, id, canonical);
                        }
                        // The target is always visited first, so replacing
                        // the handle here covers the duplicate-is-target
                        // edge case before anything points at it.
                        if id == target {
                            target = canonical;
                        }
                        id = canonical;
                    }
                    Some(_) => {}
                    None => {
                        self.files.insert(path, id);
                    }
                }
            }

            if self.node_mut(id).targets.insert(target) {
                queue.extend(self.node(id).deps.iter().copied());
            }

            self.node_mut(id).dirty = true;
            if self.node(id).deps.is_empty() {
                start_nodes.insert(id);
            }
        }

        Ok(TargetData { node: target, start_nodes })
    }

    /// Rewrite ordered input lists after a source-file merge.
    fn replace_in_inputs(&mut self, node: NodeId, old: NodeId, new: NodeId) {
        if let NodeKind::Application(app) = &mut self.node_mut(node).kind {
            for input in &mut app.inputs {
                if *input == old {
                    *input = new;
                }
            }
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::context::BuildHandle;

    struct NullBuilder {
        outputs: usize,
    }

    impl Builder for NullBuilder {
        fn name(&self) -> &str {
            "null"
        }

        fn fingerprint(&self) -> Fingerprint {
            let mut hasher = FingerprintHasher::new();
            hasher.push_text("NullBuilder");
            hasher.push_text(self.outputs);
            hasher.finish()
        }

        fn output_count(&self, _input_count: usize) -> usize {
            self.outputs
        }

        fn build(
            &self,
            _handle: &BuildHandle<'_>,
            _inputs: &[PathBuf],
            outputs: &[PathBuf],
        ) -> Result<Vec<PathBuf>> {
            for output in outputs {
                fs::write(output, "")?;
            }
            Ok(Vec::new())
        }
    }

    fn builder_node(graph: &mut Graph, outputs: usize) -> NodeId {
        graph.builder(Arc::new(NullBuilder { outputs }))
    }

    /// Forward and reverse edge sets must mirror each other exactly.
    fn assert_edges_consistent(graph: &Graph) {
        for (index, node) in graph.nodes.iter().enumerate() {
            let id = NodeId(index as u32);
            for &dep in &node.deps {
                assert!(
                    graph.node(dep).reverse_deps.contains(&id),
                    "missing reverse edge {} -> {}",
                    dep,
                    id
                );
            }
            for &dependent in &node.reverse_deps {
                assert!(
                    graph.node(dependent).deps.contains(&id),
                    "missing forward edge {} -> {}",
                    dependent,
                    id
                );
            }
        }
    }

    // ========== Edge Algebra ==========

    #[test]
    fn edges_exist_in_both_directions() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/a");
        let b = builder_node(&mut graph, 1);
        let app = graph.apply(b, &[a], None).unwrap();
        assert_edges_consistent(&graph);
        assert_eq!(app.len(), 1);
    }

    #[test]
    fn duplicate_edge_is_rejected() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/a");
        let b = builder_node(&mut graph, 1);
        graph.add_dependency(b, a, None).unwrap();
        assert!(matches!(
            graph.add_dependency(b, a, None),
            Err(GraphError::DependencyAlreadyExists)
        ));
    }

    #[test]
    fn removing_a_missing_edge_is_rejected() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/a");
        let b = builder_node(&mut graph, 1);
        assert!(matches!(
            graph.remove_dependency(b, a),
            Err(GraphError::DependencyMissing)
        ));
    }

    #[test]
    fn removal_drops_role_names() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/a");
        let b = builder_node(&mut graph, 1);
        graph.add_dependency(b, a, Some("main")).unwrap();
        assert_eq!(graph.named_dependency(b, "main"), Some(a));

        graph.remove_dependency(b, a).unwrap();
        assert_eq!(graph.named_dependency(b, "main"), None);
        assert_edges_consistent(&graph);
    }

    #[test]
    fn role_names_are_unique() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/a");
        let b = graph.source_file("/tmp/b");
        let builder = builder_node(&mut graph, 1);
        graph.add_dependency(builder, a, Some("main")).unwrap();
        assert!(matches!(
            graph.add_dependency(builder, b, Some("main")),
            Err(GraphError::DependencyNameTaken(_))
        ));
    }

    // ========== Apply ==========

    #[test]
    fn apply_creates_outputs_with_positional_names() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/a");
        let builder = builder_node(&mut graph, 2);
        let outputs = graph.apply(builder, &[a], None).unwrap();
        assert_eq!(graph.target_name(outputs[0]), Some("output00"));
        assert_eq!(graph.target_name(outputs[1]), Some("output01"));
    }

    #[test]
    fn apply_checks_the_name_count() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/a");
        let builder = builder_node(&mut graph, 2);
        assert!(matches!(
            graph.apply(builder, &[a], Some(&[Some("only")])),
            Err(GraphError::OutputNameCount {
                expected: 2,
                given: 1
            })
        ));
    }

    #[test]
    fn apply_requires_a_builder_node() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/a");
        assert!(matches!(
            graph.apply(a, &[], None),
            Err(GraphError::NotABuilder)
        ));
    }

    // ========== Fingerprinting ==========

    struct HashFixture {
        dir: TempDir,
        graph: Graph,
    }

    impl HashFixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                graph: Graph::new(),
            }
        }

        fn file(&mut self, name: &str, content: &str) -> NodeId {
            let path = self.dir.path().join(name);
            fs::write(&path, content).unwrap();
            self.graph.source_file(path)
        }
    }

    #[test]
    fn source_hash_follows_content() {
        let mut fx = HashFixture::new();
        let a = fx.file("a.txt", "one");
        let before = fx.graph.node_hash(a).unwrap();
        fs::write(fx.dir.path().join("a.txt"), "two").unwrap();
        assert_ne!(fx.graph.node_hash(a).unwrap(), before);
    }

    #[test]
    fn partial_fingerprint_differs_from_resolved_full() {
        let mut fx = HashFixture::new();
        let a = fx.file("a.txt", "input");
        let dep = fx.file("dep.txt", "scanned");
        let builder = builder_node(&mut fx.graph, 1);
        let outputs = fx.graph.apply(builder, &[a], None).unwrap();
        let app = match &fx.graph.node(outputs[0]).kind {
            NodeKind::Generated(g) => g.application,
            _ => unreachable!(),
        };

        let partial = fx.graph.partial_fingerprint(app).unwrap();
        // Unresolved applications hash like their partial fingerprint.
        assert_eq!(fx.graph.node_hash(app).unwrap(), partial);

        fx.graph
            .set_implicit_dependencies(app, Some(vec![dep]))
            .unwrap();
        let full = fx.graph.node_hash(app).unwrap();
        assert_ne!(full, partial);
        // The lookup key is independent of the learned dependencies.
        assert_eq!(fx.graph.partial_fingerprint(app).unwrap(), partial);
    }

    #[test]
    fn generated_hash_depends_on_index_and_name() {
        let mut fx = HashFixture::new();
        let a = fx.file("a.txt", "input");
        let builder = builder_node(&mut fx.graph, 2);
        let outputs = fx
            .graph
            .apply(builder, &[a], Some(&[Some("left"), Some("right")]))
            .unwrap();
        assert_ne!(
            fx.graph.node_hash(outputs[0]).unwrap(),
            fx.graph.node_hash(outputs[1]).unwrap()
        );
    }

    #[test]
    fn replacing_implicit_deps_swaps_edges() {
        let mut fx = HashFixture::new();
        let a = fx.file("a.txt", "input");
        let dep1 = fx.file("dep1.txt", "one");
        let dep2 = fx.file("dep2.txt", "two");
        let builder = builder_node(&mut fx.graph, 1);
        fx.graph.apply(builder, &[a], None).unwrap();
        let app = fx.graph.node(a).reverse_deps.iter().copied().next().unwrap();

        fx.graph
            .set_implicit_dependencies(app, Some(vec![dep1]))
            .unwrap();
        assert!(fx.graph.node(app).deps.contains(&dep1));

        fx.graph
            .set_implicit_dependencies(app, Some(vec![dep2]))
            .unwrap();
        assert!(!fx.graph.node(app).deps.contains(&dep1));
        assert!(fx.graph.node(app).deps.contains(&dep2));
        assert_edges_consistent(&fx.graph);
    }

    #[test]
    fn input_doubling_as_implicit_dep_keeps_its_edge() {
        let mut fx = HashFixture::new();
        let a = fx.file("a.txt", "input");
        let builder = builder_node(&mut fx.graph, 1);
        fx.graph.apply(builder, &[a], None).unwrap();
        let app = fx.graph.node(a).reverse_deps.iter().copied().next().unwrap();

        fx.graph
            .set_implicit_dependencies(app, Some(vec![a]))
            .unwrap();
        fx.graph.set_implicit_dependencies(app, None).unwrap();
        // The explicit input edge must survive the implicit-list reset.
        assert!(fx.graph.node(app).deps.contains(&a));
        assert_edges_consistent(&fx.graph);
    }

    // ========== Target Registration ==========

    #[test]
    fn registration_stamps_targets_and_start_nodes() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/reg-a");
        let builder = builder_node(&mut graph, 1);
        let outputs = graph.apply(builder, &[a], None).unwrap();
        let target = outputs[0];

        let data = graph.register_target(target).unwrap();
        assert_eq!(data.node, target);
        // Leaves of the target's cone: the source file and the builder.
        assert!(data.start_nodes.contains(&a));
        assert!(data.start_nodes.contains(&builder));

        for id in [a, builder, target] {
            assert!(graph.node(id).targets.contains(&target));
            assert!(graph.node(id).dirty);
        }
    }

    #[test]
    fn duplicate_source_files_merge_to_one_instance() {
        let mut graph = Graph::new();
        let dup_path = "/tmp/shared.c";
        let first = graph.new_source_file(dup_path);
        let second = graph.new_source_file(dup_path);
        assert_ne!(first, second);

        let builder = builder_node(&mut graph, 1);
        let out1 = graph.apply(builder, &[first], None).unwrap()[0];
        let out2 = graph.apply(builder, &[second], None).unwrap()[0];

        graph.register_target(out1).unwrap();
        graph.register_target(out2).unwrap();

        let canonical = graph.find_file(Path::new(dup_path)).unwrap();
        for out in [out1, out2] {
            let app = match &graph.node(out).kind {
                NodeKind::Generated(g) => g.application,
                _ => unreachable!(),
            };
            assert!(graph.node(app).deps.contains(&canonical));
            assert_eq!(graph.node(app).inputs_for_test(), vec![canonical]);
        }
        assert_edges_consistent(&graph);
    }

    #[test]
    fn duplicate_target_is_replaced_by_the_canonical_node() {
        let mut graph = Graph::new();
        let canonical = graph.source_file("/tmp/lone.txt");
        graph.register_target(canonical).unwrap();

        let duplicate = graph.new_source_file("/tmp/lone.txt");
        let data = graph.register_target(duplicate).unwrap();
        assert_eq!(data.node, canonical);
    }

    #[test]
    fn source_file_with_dependencies_is_malformed() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/mal-a");
        let b = graph.source_file("/tmp/mal-b");
        graph.add_dependency(a, b, None).unwrap();
        assert!(matches!(
            graph.register_target(a),
            Err(GraphError::MalformedSourceFile(_))
        ));
    }

    #[test]
    fn merge_carries_role_names() {
        let mut graph = Graph::new();
        let canonical = graph.source_file("/tmp/role.txt");
        graph.register_target(canonical).unwrap();

        let duplicate = graph.new_source_file("/tmp/role.txt");
        let builder = builder_node(&mut graph, 1);
        let out = graph.apply(builder, &[], None).unwrap()[0];
        let app = match &graph.node(out).kind {
            NodeKind::Generated(g) => g.application,
            _ => unreachable!(),
        };
        graph.add_dependency(app, duplicate, Some("script")).unwrap();

        graph.register_target(out).unwrap();
        assert_eq!(graph.named_dependency(app, "script"), Some(canonical));
    }

    // ========== Rendering ==========

    #[test]
    fn graphviz_dump_lists_nodes_and_edges() {
        let mut graph = Graph::new();
        let a = graph.source_file("/tmp/dot-a");
        let builder = builder_node(&mut graph, 1);
        graph.apply(builder, &[a], None).unwrap();

        let dot = graph.to_graphviz();
        assert!(dot.starts_with("digraph"));
        assert!(dot.contains("/tmp/dot-a"));
        assert!(dot.contains(&format!("{} -> ", a)));
    }

    impl Node {
        fn inputs_for_test(&self) -> Vec<NodeId> {
            match &self.kind {
                NodeKind::Application(app) => app.inputs.clone(),
                _ => Vec::new(),
            }
        }
    }
}
