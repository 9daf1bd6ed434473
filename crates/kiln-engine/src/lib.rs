//! # kiln-engine
//!
//! The build core: a dependency graph of sources, builders, applications
//! and generated files; content-addressed caching of every build step;
//! and a parallel update engine that walks the graph from dirty leaves in
//! dependency order.
//!
//! A driver declares builders and applies them to inputs through
//! [`Graph`], registers the resulting targets with [`Engine::set_targets`]
//! and asks for an update; progress and the first failure stream back
//! through [`Progress`]. Builder implementations live outside this crate
//! and reach the engine only through [`BuildHandle`].

pub mod context;
pub mod engine;
pub mod error;
pub mod graph;
pub mod node;
pub mod progress;

pub use context::BuildHandle;
pub use engine::{auto_worker_count, Engine, EngineOptions, DEFAULT_WORKERS};
pub use error::{EngineError, GraphError, Result};
pub use graph::{Graph, TargetData};
pub use node::{Builder, NodeId};
pub use progress::{Progress, ProgressSender};
