//! Error types for the graph and the update engine.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use kiln_cache::CacheError;

/// Graph misuse. These indicate a bug in the declaring build script or in
/// the engine itself and are never downgraded.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("dependency already exists")]
    DependencyAlreadyExists,

    #[error("dependency name {0:?} is already taken")]
    DependencyNameTaken(String),

    #[error("removing a dependency that is not present")]
    DependencyMissing,

    #[error("source file {0} must not have dependencies")]
    MalformedSourceFile(PathBuf),

    #[error("builder produces {expected} outputs but {given} names were given")]
    OutputNameCount { expected: usize, given: usize },

    #[error("node is not a builder")]
    NotABuilder,

    #[error("node is not an application")]
    NotAnApplication,

    #[error("node does not resolve to a file")]
    NotAFile,

    #[error("no targets registered for build script {0:?}")]
    UnknownScript(String),
}

/// Errors surfaced by an update run.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("builder failed: {0}")]
    BuilderFailed(String),

    #[error("command {argv:?} exited with code {code}")]
    CommandFailed {
        argv: Vec<String>,
        stdout: String,
        stderr: String,
        code: i32,
    },

    #[error("command {argv:?} timed out after {timeout:?}")]
    Timeout {
        argv: Vec<String>,
        timeout: Duration,
    },

    #[error("builder returned a relative implicit dependency: {0}")]
    RelativeImplicitDependency(PathBuf),

    #[error("update cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
