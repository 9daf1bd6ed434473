//! The update engine: target bookkeeping, blocker-counting traversal and
//! the parallel worker pool.
//!
//! An update run has two phases. Phase 1 walks reverse edges from the
//! initial dirty set and counts, for every node in a selected target's
//! cone, how many direct predecessors will run before it. Phase 2 seeds
//! the dirty nodes into a pool of worker threads; every completed node
//! decrements its dependents' counters, and a node is submitted exactly
//! when its counter reaches zero. Graph and cache mutations happen under
//! the engine lock; builder work runs outside it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use kiln_cache::{Cache, DEFAULT_SIZE_LIMIT};
use kiln_config::Config;
use kiln_hash::Fingerprint;

use crate::context::BuildHandle;
use crate::error::{EngineError, GraphError, Result};
use crate::graph::{Graph, TargetData};
use crate::node::{NodeId, NodeKind};
use crate::progress::{self, Progress, ProgressSender};

/// Default update parallelism
pub const DEFAULT_WORKERS: usize = 4;

/// Worker count leaving room for the builders' own child processes:
/// half the cores, capped at [`DEFAULT_WORKERS`].
pub fn auto_worker_count() -> usize {
    (num_cpus::get() / 2).clamp(1, DEFAULT_WORKERS)
}

/// Tunables for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub build_directory: PathBuf,
    pub cache_size_limit: u64,
    pub workers: usize,
    pub command_timeout: Duration,
}

impl EngineOptions {
    pub fn new(build_directory: impl Into<PathBuf>) -> Self {
        Self {
            build_directory: build_directory.into(),
            cache_size_limit: DEFAULT_SIZE_LIMIT,
            workers: DEFAULT_WORKERS,
            command_timeout: Duration::from_secs(600),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            build_directory: config.build_directory().to_path_buf(),
            cache_size_limit: config.cache_size_limit(),
            workers: config.engine.workers.unwrap_or_else(auto_worker_count),
            command_timeout: Duration::from_secs(config.engine.command_timeout_secs),
        }
    }
}

struct EngineState {
    graph: Graph,
    /// Registered targets per build script.
    target_data: HashMap<String, Vec<TargetData>>,
}

struct Shared {
    build_directory: PathBuf,
    temp_directory: PathBuf,
    workers: usize,
    command_timeout: Duration,
    /// The engine-wide lock: graph, target bookkeeping.
    state: Mutex<EngineState>,
    /// The cache carries its own lock; always taken after `state`.
    cache: Mutex<Cache>,
}

/// Build-system state: the dependency graph, the registered targets and
/// the output cache, plus the machinery to update targets in parallel.
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Open (or create) the build tree and restore cache metadata left by
    /// a previous run.
    pub fn new(options: EngineOptions) -> Result<Self> {
        fs::create_dir_all(&options.build_directory)?;
        let mut cache = Cache::open(
            options.build_directory.join("cache"),
            options.cache_size_limit,
        );
        cache.load()?;

        Ok(Self {
            shared: Arc::new(Shared {
                temp_directory: options.build_directory.join("tmp"),
                build_directory: options.build_directory,
                workers: options.workers.max(1),
                command_timeout: options.command_timeout,
                state: Mutex::new(EngineState {
                    graph: Graph::new(),
                    target_data: HashMap::new(),
                }),
                cache: Mutex::new(cache),
            }),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(EngineOptions::from_config(config))
    }

    pub fn build_directory(&self) -> &Path {
        &self.shared.build_directory
    }

    /// Run graph declarations under the engine lock.
    pub fn configure<R>(&self, f: impl FnOnce(&mut Graph) -> R) -> R {
        f(&mut self.shared.state.lock().unwrap().graph)
    }

    /// Register the declared targets of a build script, replacing any
    /// earlier registration for the same script.
    pub fn set_targets(
        &self,
        script: &str,
        targets: Vec<NodeId>,
    ) -> std::result::Result<(), GraphError> {
        let mut state = self.shared.state.lock().unwrap();
        let mut data = Vec::with_capacity(targets.len());
        for target in targets {
            data.push(state.graph.register_target(target)?);
        }
        // The records are complete before they become visible to any
        // update run.
        state.target_data.insert(script.to_owned(), data);
        Ok(())
    }

    /// Update targets of `script`, all of them when `target_names` is
    /// `None`. Returns immediately; progress flows through the returned
    /// channel and the first failure arrives at its end.
    pub fn update(&self, script: &str, target_names: Option<&[&str]>) -> Progress {
        self.update_with_changes(script, target_names, &[])
    }

    /// Like [`Engine::update`], seeding additional externally changed
    /// paths (e.g. from a filesystem monitor) into the dirty set.
    pub fn update_with_changes(
        &self,
        script: &str,
        target_names: Option<&[&str]>,
        changed_paths: &[PathBuf],
    ) -> Progress {
        let (sender, progress) = progress::channel();
        let shared = Arc::clone(&self.shared);
        let script = script.to_owned();
        let names: Option<Vec<String>> =
            target_names.map(|names| names.iter().map(|n| (*n).to_owned()).collect());
        let changed = changed_paths.to_vec();

        thread::Builder::new()
            .name("kiln-update".into())
            .spawn(move || {
                match run_update(&shared, &script, names.as_deref(), &changed, &sender) {
                    Ok(()) => sender.finish(),
                    Err(error) => sender.fail(error),
                }
            })
            .expect("failed to spawn update coordinator");
        progress
    }

    /// Current on-disk location of a target's file.
    pub fn target_path(&self, target: NodeId) -> Result<PathBuf> {
        let state = self.shared.state.lock().unwrap();
        let cache = self.shared.cache.lock().unwrap();
        state.graph.file_path(target, &cache)
    }

    /// Symlink the selected targets' cached files into `output_directory`
    /// under their target names. Links are relative whenever the output
    /// directory lives inside the build tree.
    pub fn publish(
        &self,
        script: &str,
        target_names: Option<&[&str]>,
        output_directory: &Path,
    ) -> Result<()> {
        let state = self.shared.state.lock().unwrap();
        let cache = self.shared.cache.lock().unwrap();
        let selected = select_targets(&state, script, target_names)?;

        fs::create_dir_all(output_directory)?;
        let climb = output_directory
            .strip_prefix(&self.shared.build_directory)
            .ok()
            .map(|relative| {
                let mut up = PathBuf::from("..");
                for _ in relative.components().skip(1) {
                    up.push("..");
                }
                up
            });

        for data in selected {
            let name = state
                .graph
                .target_name(data.node)
                .ok_or(GraphError::NotAFile)?
                .to_owned();
            let cached = state.graph.file_path(data.node, &cache)?;
            let link = output_directory.join(&name);

            match fs::symlink_metadata(&link) {
                Ok(_) => fs::remove_file(&link)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let link_target = match (&climb, cached.strip_prefix(&self.shared.build_directory)) {
                (Some(up), Ok(relative)) => up.join(relative),
                _ => fs::canonicalize(&cached).unwrap_or_else(|_| cached.clone()),
            };
            debug!(?link, target = ?link_target, "publishing");
            std::os::unix::fs::symlink(&link_target, &link)?;
        }
        Ok(())
    }

    /// Persist cache metadata; call when the engine goes idle.
    pub fn save(&self) -> Result<()> {
        self.shared.cache.lock().unwrap().save()?;
        Ok(())
    }
}

fn select_targets<'a>(
    state: &'a EngineState,
    script: &str,
    names: Option<&[&str]>,
) -> std::result::Result<Vec<&'a TargetData>, GraphError> {
    let data = state
        .target_data
        .get(script)
        .ok_or_else(|| GraphError::UnknownScript(script.to_owned()))?;
    Ok(match names {
        None => data.iter().collect(),
        Some(names) => data
            .iter()
            .filter(|d| {
                state
                    .graph
                    .target_name(d.node)
                    .is_some_and(|n| names.contains(&n))
            })
            .collect(),
    })
}

/// Phase 1: walk reverse edges from the initial dirty set (hanging off a
/// virtual head) and count blockers for every node in a selected target's
/// cone. Nodes outside every selected cone are reported back instead of
/// being counted.
pub(crate) fn count_blockers(
    graph: &Graph,
    selected: &HashSet<NodeId>,
    dirty: &[NodeId],
) -> (HashMap<NodeId, usize>, HashSet<NodeId>) {
    let mut need_update: HashMap<NodeId, usize> = HashMap::new();
    let mut externally_dirty = HashSet::new();
    let mut queue = VecDeque::new();

    let mut count_edge =
        |node: NodeId, queue: &mut VecDeque<NodeId>, externally_dirty: &mut HashSet<NodeId>| {
            if graph.node(node).targets.is_disjoint(selected) {
                externally_dirty.insert(node);
                return;
            }
            let first = !need_update.contains_key(&node);
            *need_update.entry(node).or_insert(0) += 1;
            if first {
                queue.push_back(node);
            }
        };

    for &node in dirty {
        count_edge(node, &mut queue, &mut externally_dirty);
    }
    while let Some(node) = queue.pop_front() {
        let dependents: Vec<NodeId> = graph.node(node).reverse_deps.iter().copied().collect();
        for dependent in dependents {
            count_edge(dependent, &mut queue, &mut externally_dirty);
        }
    }
    (need_update, externally_dirty)
}

struct Scheduler<'a> {
    shared: &'a Arc<Shared>,
    sender: &'a ProgressSender,
    stop: &'a Arc<AtomicBool>,
    need_update: HashMap<NodeId, usize>,
    job_tx: crossbeam_channel::Sender<NodeId>,
    in_flight: usize,
    first_error: Option<EngineError>,
}

impl Scheduler<'_> {
    /// Account one satisfied predecessor of `node` and submit it to the
    /// pool when the last one completes. Nodes with no counted blockers
    /// (initial dirty leaves, nodes outside the counted cone) are updated
    /// synchronously in the caller.
    fn maybe_submit(&mut self, node: NodeId) {
        if self.stop.load(Ordering::SeqCst) {
            return;
        }
        match self.need_update.get_mut(&node) {
            None => {
                if let Err(error) = update_node(self.shared, node, self.stop, self.sender) {
                    self.record_error(error);
                }
            }
            Some(blockers) => {
                *blockers -= 1;
                if *blockers == 0 {
                    self.need_update.remove(&node);
                    if self.job_tx.send(node).is_ok() {
                        self.in_flight += 1;
                    }
                }
            }
        }
    }

    fn record_error(&mut self, error: EngineError) {
        self.stop.store(true, Ordering::SeqCst);
        if self.first_error.is_none() {
            warn!(%error, "update failed");
            self.first_error = Some(error);
        }
    }
}

fn run_update(
    shared: &Arc<Shared>,
    script: &str,
    names: Option<&[String]>,
    changed: &[PathBuf],
    sender: &ProgressSender,
) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));

    // Phase 1, single-threaded under the engine lock.
    let (need_update, dirty) = {
        let state = shared.state.lock().unwrap();
        let borrowed: Option<Vec<&str>> =
            names.map(|names| names.iter().map(String::as_str).collect());
        let selected = select_targets(&state, script, borrowed.as_deref())?;
        let targets: HashSet<NodeId> = selected.iter().map(|d| d.node).collect();

        let mut dirty: HashSet<NodeId> = HashSet::new();
        for data in &selected {
            sender.log(format!("target {}", state.graph.describe(data.node)));
            dirty.extend(data.start_nodes.iter().copied());
        }
        for path in changed {
            if let Some(node) = state.graph.find_file(path) {
                dirty.insert(node);
            }
        }
        let dirty: Vec<NodeId> = dirty.into_iter().collect();

        let (need_update, externally_dirty) = count_blockers(&state.graph, &targets, &dirty);
        if !externally_dirty.is_empty() {
            debug!(
                count = externally_dirty.len(),
                "dirty nodes outside the selected targets"
            );
        }
        (need_update, dirty)
    };

    // Phase 2: worker pool plus completion-driven submission.
    let (job_tx, job_rx) = crossbeam_channel::unbounded::<NodeId>();
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<(NodeId, Result<()>)>();

    let mut workers = Vec::with_capacity(shared.workers);
    for index in 0..shared.workers {
        let job_rx = job_rx.clone();
        let done_tx = done_tx.clone();
        let shared = Arc::clone(shared);
        let stop = Arc::clone(&stop);
        let sender = sender.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("kiln-worker-{index}"))
                .spawn(move || {
                    while let Ok(node) = job_rx.recv() {
                        let result = update_node(&shared, node, &stop, &sender);
                        if done_tx.send((node, result)).is_err() {
                            break;
                        }
                    }
                })
                .expect("failed to spawn update worker"),
        );
    }
    drop(job_rx);
    drop(done_tx);

    let mut scheduler = Scheduler {
        shared,
        sender,
        stop: &stop,
        need_update,
        job_tx,
        in_flight: 0,
        first_error: None,
    };
    for node in dirty {
        scheduler.maybe_submit(node);
    }
    while scheduler.in_flight > 0 {
        let (node, result) = match done_rx.recv() {
            Ok(completion) => completion,
            // A worker died without reporting back (a panicking builder);
            // stop submitting and surface the loss.
            Err(_) => {
                scheduler.record_error(EngineError::BuilderFailed(
                    "update worker terminated unexpectedly".into(),
                ));
                break;
            }
        };
        scheduler.in_flight -= 1;
        match result {
            Ok(()) => {
                let dependents: Vec<NodeId> = {
                    let state = shared.state.lock().unwrap();
                    state.graph.node(node).reverse_deps.iter().copied().collect()
                };
                for dependent in dependents {
                    scheduler.maybe_submit(dependent);
                }
            }
            Err(error) => scheduler.record_error(error),
        }
    }

    let Scheduler {
        job_tx, first_error, ..
    } = scheduler;
    drop(job_tx);
    for worker in workers {
        let _ = worker.join();
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// One node's update. Only applications carry work; everything else is
/// already up to date the moment its dependencies are.
fn update_node(
    shared: &Shared,
    node: NodeId,
    stop: &AtomicBool,
    sender: &ProgressSender,
) -> Result<()> {
    if stop.load(Ordering::SeqCst) {
        return Err(EngineError::Cancelled);
    }
    let is_application = {
        let state = shared.state.lock().unwrap();
        matches!(state.graph.node(node).kind, NodeKind::Application(_))
    };
    if is_application {
        update_application(shared, node, stop, sender)?;
    }
    shared.state.lock().unwrap().graph.node_mut(node).dirty = false;
    Ok(())
}

/// The application update protocol: try to rehydrate a cached result via
/// the partial fingerprint; on a miss, run the builder in a scratch
/// directory and store what it produced and what it read.
fn update_application(
    shared: &Shared,
    app: NodeId,
    stop: &AtomicBool,
    sender: &ProgressSender,
) -> Result<()> {
    struct PreparedBuild {
        recipe: Arc<dyn crate::node::Builder>,
        inputs: Vec<NodeId>,
        input_paths: Vec<PathBuf>,
        output_names: Vec<String>,
        partial: Fingerprint,
        description: String,
    }

    let prepared = {
        let mut state = shared.state.lock().unwrap();
        let mut cache = shared.cache.lock().unwrap();

        let partial = state.graph.partial_fingerprint(app)?;
        let candidates = cache.get_candidate_implicit_dependencies(&partial);

        let mut resolved = None;
        'candidates: for deps in candidates {
            let mut nodes = Vec::with_capacity(deps.len());
            for (path, stored) in &deps {
                let node = state.graph.source_file(path);
                match state.graph.node_hash(node) {
                    Ok(current) if current == *stored => nodes.push(node),
                    // Changed or unreadable: this candidate is stale.
                    _ => continue 'candidates,
                }
            }
            resolved = Some(nodes);
            break;
        }

        if let Some(nodes) = resolved {
            adopt_targets(&mut state.graph, app, &nodes);
            state.graph.set_implicit_dependencies(app, Some(nodes))?;
            let full = state.graph.node_hash(app)?;
            cache.accessed(&full)?;
            sender.log(format!("cached {}", state.graph.describe(app)));
            return Ok(());
        }
        state.graph.set_implicit_dependencies(app, None)?;

        let (builder, inputs, outputs) = match &state.graph.node(app).kind {
            NodeKind::Application(a) => (a.builder, a.inputs.clone(), a.outputs.clone()),
            _ => return Err(GraphError::NotAnApplication.into()),
        };
        let recipe = match &state.graph.node(builder).kind {
            NodeKind::Builder(b) => Arc::clone(&b.recipe),
            _ => return Err(GraphError::NotABuilder.into()),
        };
        let input_paths = inputs
            .iter()
            .map(|&input| state.graph.file_path(input, &cache))
            .collect::<Result<Vec<_>>>()?;
        let output_names = outputs
            .iter()
            .map(|&output| {
                state
                    .graph
                    .target_name(output)
                    .map(str::to_owned)
                    .ok_or(GraphError::NotAFile.into())
            })
            .collect::<Result<Vec<_>>>()?;

        PreparedBuild {
            recipe,
            inputs,
            input_paths,
            output_names,
            partial,
            description: state.graph.describe(app),
        }
    };

    sender.log(format!("building {}", prepared.description));
    let handle = BuildHandle::new(
        &shared.temp_directory,
        shared.command_timeout,
        stop,
        sender,
    );
    handle.check_cancelled()?;

    let scratch = handle.tempdir()?;
    let output_paths: Vec<PathBuf> = prepared
        .output_names
        .iter()
        .map(|name| scratch.path().join(name))
        .collect();
    let scanned = prepared
        .recipe
        .build(&handle, &prepared.input_paths, &output_paths)?;

    // Fold the build results back into the graph and the cache.
    let mut state = shared.state.lock().unwrap();
    let mut cache = shared.cache.lock().unwrap();

    let mut implicit = Vec::with_capacity(scanned.len());
    let mut remembered = Vec::with_capacity(scanned.len());
    for path in scanned {
        if !path.is_absolute() {
            return Err(EngineError::RelativeImplicitDependency(path));
        }
        let node = state.graph.source_file(&path);
        let fingerprint = state.graph.node_hash(node)?;
        remembered.push((path, fingerprint));
        implicit.push(node);
    }
    adopt_targets(&mut state.graph, app, &implicit);
    state.graph.set_implicit_dependencies(app, Some(implicit.clone()))?;

    let full = state.graph.node_hash(app)?;
    cache.put(full, prepared.partial, &output_paths, remembered)?;
    handle.check_cancelled()?;

    for &node in prepared.inputs.iter().chain(implicit.iter()) {
        touch(&state.graph, &mut cache, node)?;
    }
    Ok(())
}

/// Everything a target depends on belongs to that target; newly learned
/// implicit dependencies inherit the application's targets.
fn adopt_targets(graph: &mut Graph, app: NodeId, nodes: &[NodeId]) {
    let targets: Vec<NodeId> = graph.node(app).targets.iter().copied().collect();
    for &node in nodes {
        graph
            .node_mut(node)
            .targets
            .extend(targets.iter().copied());
    }
}

/// Touch the cache entry behind a file node, keeping the entries an
/// update actually used at the recent end of the eviction order.
fn touch(graph: &Graph, cache: &mut Cache, node: NodeId) -> Result<()> {
    if let NodeKind::Generated(generated) = &graph.node(node).kind {
        let full = graph.node_hash(generated.application)?;
        cache.accessed(&full)?;
    }
    Ok(())
}
