//! # kiln-config
//!
//! Configuration management for kiln.
//!
//! Loads configuration from:
//! 1. `~/.kiln/config.toml` (global)
//! 2. `.kiln/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        eprintln!(
            "[kiln-config] WARNING: Failed to load config: {}. Using defaults.",
            e
        );
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Current config schema version
pub const CONFIG_VERSION: u32 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Config schema version (for forward compatibility)
    pub config_version: u32,
    pub build: BuildConfig,
    pub cache: CacheConfig,
    pub engine: EngineConfig,
    pub monitor: MonitorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            build: BuildConfig::default(),
            cache: CacheConfig::default(),
            engine: EngineConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// Load config from standard locations (CWD-relative project config)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_for_project(Path::new("."))
    }

    /// Load config for a specific project root directory.
    /// Resolution order: global → project → env vars.
    pub fn load_for_project(project_root: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.kiln/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load project config (<project_root>/.kiln/config.toml)
        let project_config_path = project_root.join(".kiln/config.toml");
        if project_config_path.exists() {
            debug!("Loading project config from {:?}", project_config_path);
            let contents = std::fs::read_to_string(&project_config_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config.merge(project_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        // 4. Resolve the build directory relative to the project root
        if config.build.directory.is_relative() {
            config.build.directory = project_root.join(&config.build.directory);
        }

        Ok(config)
    }

    /// Global config path: ~/.kiln/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".kiln/config.toml"))
    }

    /// Merge another config (project overrides global).
    /// Non-default values from `other` replace values in `self`.
    fn merge(&mut self, other: Config) {
        // Build
        let default_build = BuildConfig::default();
        if other.build.directory != default_build.directory {
            self.build.directory = other.build.directory;
        }
        if other.build.output_directory != default_build.output_directory {
            self.build.output_directory = other.build.output_directory;
        }

        // Cache
        let default_cache = CacheConfig::default();
        if other.cache.size_limit != default_cache.size_limit {
            self.cache.size_limit = other.cache.size_limit;
        }

        // Engine
        let default_engine = EngineConfig::default();
        if other.engine.workers != default_engine.workers {
            self.engine.workers = other.engine.workers;
        }
        if other.engine.command_timeout_secs != default_engine.command_timeout_secs {
            self.engine.command_timeout_secs = other.engine.command_timeout_secs;
        }
        if other.engine.idle_timeout_secs != default_engine.idle_timeout_secs {
            self.engine.idle_timeout_secs = other.engine.idle_timeout_secs;
        }

        // Monitor
        let default_monitor = MonitorConfig::default();
        if other.monitor.debounce_ms != default_monitor.debounce_ms {
            self.monitor.debounce_ms = other.monitor.debounce_ms;
        }
    }

    /// Apply environment variable overrides (highest priority)
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("KILN_BUILD_DIR") {
            self.build.directory = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("KILN_OUTPUT_DIR") {
            self.build.output_directory = Some(PathBuf::from(dir));
        }
        if let Ok(limit) = std::env::var("KILN_CACHE_LIMIT") {
            if let Ok(bytes) = limit.parse() {
                self.cache.size_limit = bytes;
            }
        }
        if let Ok(workers) = std::env::var("KILN_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.engine.workers = Some(n);
            }
        }
        if let Ok(timeout) = std::env::var("KILN_COMMAND_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.engine.command_timeout_secs = secs;
            }
        }
    }

    /// Generate TOML template for `kiln init`.
    pub fn init_toml() -> String {
        let default = Config::default();
        format!(
            r#"# kiln project configuration
config_version = 1

[build]
directory = "{build_dir}"
# output_directory = "<build>/output"

[cache]
# size_limit = {size_limit}

[engine]
# workers = 4
# command_timeout_secs = {timeout}

# [monitor]
# debounce_ms = 200
"#,
            build_dir = default.build.directory.display(),
            size_limit = default.cache.size_limit,
            timeout = default.engine.command_timeout_secs,
        )
    }

    // ========== Convenience Accessors ==========

    /// Get the build directory
    pub fn build_directory(&self) -> &Path {
        &self.build.directory
    }

    /// Get the output directory (defaults to `<build>/output`)
    pub fn output_directory(&self) -> PathBuf {
        self.build
            .output_directory
            .clone()
            .unwrap_or_else(|| self.build.directory.join("output"))
    }

    /// Get the cache directory: `<build>/cache`
    pub fn cache_directory(&self) -> PathBuf {
        self.build.directory.join("cache")
    }

    /// Get the cache size limit in bytes
    pub fn cache_size_limit(&self) -> u64 {
        self.cache.size_limit
    }
}

/// Build tree layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    /// Build directory (resolved relative to the project root)
    pub directory: PathBuf,
    /// Where target symlinks are published (None = `<build>/output`)
    pub output_directory: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("build"),
            output_directory: None,
        }
    }
}

/// Output cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache budget in bytes
    pub size_limit: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            size_limit: 1_000_000_000,
        }
    }
}

/// Update engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of parallel update workers (None = auto)
    pub workers: Option<usize>,
    /// Per-command timeout inside builders, in seconds
    pub command_timeout_secs: u64,
    /// Idle shutdown timeout for a hosting daemon, in seconds
    pub idle_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: None,
            command_timeout_secs: 600,
            idle_timeout_secs: 20 * 60,
        }
    }
}

/// Filesystem monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Event settle window in milliseconds
    pub debounce_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self { debounce_ms: 200 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Lock for tests that modify environment variables to prevent race
    // conditions when tests run in parallel
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    // ========== Default Values Tests ==========

    #[test]
    fn default_config_has_all_sections() {
        let config = Config::default();

        assert_eq!(config.build.directory, PathBuf::from("build"));
        assert!(config.build.output_directory.is_none());
        assert_eq!(config.cache.size_limit, 1_000_000_000);
        assert!(config.engine.workers.is_none());
        assert_eq!(config.engine.command_timeout_secs, 600);
        assert_eq!(config.engine.idle_timeout_secs, 1200);
        assert_eq!(config.monitor.debounce_ms, 200);
    }

    #[test]
    fn derived_directories_follow_the_build_dir() {
        let mut config = Config::default();
        config.build.directory = PathBuf::from("/work/build");

        assert_eq!(config.cache_directory(), PathBuf::from("/work/build/cache"));
        assert_eq!(
            config.output_directory(),
            PathBuf::from("/work/build/output")
        );

        config.build.output_directory = Some(PathBuf::from("/elsewhere"));
        assert_eq!(config.output_directory(), PathBuf::from("/elsewhere"));
    }

    // ========== TOML Tests ==========

    #[test]
    fn toml_roundtrip_preserves_all_values() {
        let original = Config::default();
        let toml_str = toml::to_string(&original).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(original.build.directory, parsed.build.directory);
        assert_eq!(original.cache.size_limit, parsed.cache.size_limit);
        assert_eq!(
            original.engine.command_timeout_secs,
            parsed.engine.command_timeout_secs
        );
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let partial_toml = r#"
[cache]
size_limit = 4096
"#;
        let config: Config = toml::from_str(partial_toml).unwrap();

        assert_eq!(config.cache.size_limit, 4096);
        assert_eq!(config.build.directory, PathBuf::from("build"));
        assert_eq!(config.engine.command_timeout_secs, 600);
    }

    #[test]
    fn empty_config_uses_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cache.size_limit, Config::default().cache.size_limit);
    }

    #[test]
    fn invalid_toml_returns_error() {
        let result: Result<Config, _> = toml::from_str("invalid { toml }");
        assert!(result.is_err());
    }

    #[test]
    fn init_template_parses_back() {
        let config: Config = toml::from_str(&Config::init_toml()).unwrap();
        assert_eq!(config.build.directory, PathBuf::from("build"));
    }

    // ========== Config Merge Tests ==========

    #[test]
    fn merge_replaces_non_default_values() {
        let mut base = Config::default();
        let mut overlay = Config::default();
        overlay.cache.size_limit = 123;
        overlay.engine.workers = Some(2);

        base.merge(overlay);
        assert_eq!(base.cache.size_limit, 123);
        assert_eq!(base.engine.workers, Some(2));
    }

    #[test]
    fn merge_keeps_base_for_default_values() {
        let mut base = Config::default();
        base.cache.size_limit = 123;

        base.merge(Config::default());
        assert_eq!(base.cache.size_limit, 123);
    }

    // ========== Environment Override Tests ==========

    #[test]
    fn env_override_cache_limit() {
        let _guard = ENV_LOCK.lock().unwrap(); // Serialize env tests
        let mut config = Config::default();

        std::env::set_var("KILN_CACHE_LIMIT", "2048");
        config.apply_env_overrides();
        std::env::remove_var("KILN_CACHE_LIMIT");

        assert_eq!(config.cache.size_limit, 2048);
    }

    #[test]
    fn env_override_workers() {
        let _guard = ENV_LOCK.lock().unwrap(); // Serialize env tests
        let mut config = Config::default();

        std::env::set_var("KILN_WORKERS", "8");
        config.apply_env_overrides();
        std::env::remove_var("KILN_WORKERS");

        assert_eq!(config.engine.workers, Some(8));
    }

    #[test]
    fn env_override_invalid_workers_ignored() {
        let _guard = ENV_LOCK.lock().unwrap(); // Serialize env tests
        let mut config = Config::default();

        std::env::set_var("KILN_WORKERS", "not_a_number");
        config.apply_env_overrides();
        std::env::remove_var("KILN_WORKERS");

        assert!(config.engine.workers.is_none());
    }

    // ========== Project Loading ==========

    #[test]
    fn project_config_overrides_and_build_dir_resolves() {
        let _guard = ENV_LOCK.lock().unwrap(); // load_for_project reads env
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join(".kiln")).unwrap();
        std::fs::write(
            temp.path().join(".kiln/config.toml"),
            "[cache]\nsize_limit = 512\n",
        )
        .unwrap();

        let config = Config::load_for_project(temp.path()).unwrap();
        assert_eq!(config.cache.size_limit, 512);
        assert_eq!(config.build.directory, temp.path().join("build"));
    }
}
