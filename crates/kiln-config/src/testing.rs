//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage an isolated project and build
//! tree per test.
//!
//! # Usage
//!
//! ```ignore
//! use kiln_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.project_root, env.build_dir and env.cache_dir() are isolated
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Project root for the test
    pub project_root: PathBuf,
    /// Isolated build directory
    pub build_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let project_root = root.join("project");
        let build_dir = project_root.join("build");
        std::fs::create_dir_all(&project_root)?;
        std::fs::create_dir_all(&build_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            project_root,
            build_dir,
            test_id,
        })
    }

    /// Get the cache directory: `<build>/cache`
    pub fn cache_dir(&self) -> PathBuf {
        self.build_dir.join("cache")
    }

    /// Get the publish directory: `<build>/output`
    pub fn output_dir(&self) -> PathBuf {
        self.build_dir.join("output")
    }

    /// Create a test file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.project_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a test directory
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.project_root.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Config pointing at this environment's build tree
    pub fn config(&self) -> crate::Config {
        let mut cfg = crate::Config::default();
        cfg.build.directory = self.build_dir.clone();
        cfg
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.project_root.exists());
        assert!(env.build_dir.exists());
    }

    #[test]
    fn environments_are_isolated() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.build_dir, env2.build_dir);
    }

    #[test]
    fn create_file_writes_content() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("src/input.c", b"int main;").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"int main;");
    }

    #[test]
    fn config_points_at_the_build_tree() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        assert_eq!(cfg.cache_directory(), env.cache_dir());
    }
}
