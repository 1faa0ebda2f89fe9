//! Configuration for conductor.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CONDUCTOR_HOME, CONDUCTOR_QUEUE_FILE)
//! 2. Config file (.conductor/config.yaml)
//! 3. Defaults (~/.conductor)
//!
//! Config file discovery:
//! - Searches current directory and parents for .conductor/config.yaml
//! - Paths in config file are relative to the .conductor/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::cache::MemoryCache;
use crate::core::retry::RetryPolicy;
use crate::offline::DEFAULT_MAX_ATTEMPTS;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const HOME_ENV: &str = "CONDUCTOR_HOME";
const QUEUE_FILE_ENV: &str = "CONDUCTOR_QUEUE_FILE";
const QUEUE_FILE_NAME: &str = "offline_queue.jsonl";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
    #[serde(default)]
    pub queue: Option<QueueConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .conductor/)
    pub home: Option<String>,
    /// Offline queue log (relative to .conductor/)
    pub queue_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub max_entries: Option<usize>,
    pub default_ttl_ms: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub max_attempts: Option<u32>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// Offline queue log
    pub queue_file: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Default policy for jobs without their own
    pub retry: RetryPolicy,
    pub cache: CacheSettings,
    pub queue: QueueSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheSettings {
    /// 0 = unlimited
    pub max_entries: usize,
    pub default_ttl_ms: Option<u64>,
    pub sweep_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl_ms: None,
            sweep_interval_ms: 60_000,
        }
    }
}

impl CacheSettings {
    /// Build an in-memory cache with these limits
    pub fn build(&self) -> MemoryCache {
        MemoryCache::new(self.max_entries).with_default_ttl(self.default_ttl_ms.map(Duration::from_millis))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSettings {
    pub max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".conductor").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".conductor");

    resolve_config(find_config_file(), default_home, |key| std::env::var(key).ok())
}

fn resolve_config(
    config_file: Option<PathBuf>,
    default_home: PathBuf,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ResolvedConfig> {
    let parsed = match config_file {
        Some(ref path) => Some(load_config_file(path)?),
        None => None,
    };
    // Paths in the file are relative to .conductor/
    let conductor_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));
    let paths = parsed.as_ref().map(|c| c.paths.clone()).unwrap_or_default();

    let home = if let Some(env_home) = env(HOME_ENV) {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = paths.home {
        resolve_path(conductor_dir, home_path)
    } else {
        default_home
    };

    let queue_file = if let Some(env_queue) = env(QUEUE_FILE_ENV) {
        PathBuf::from(env_queue)
    } else if let Some(ref queue_path) = paths.queue_file {
        resolve_path(conductor_dir, queue_path)
    } else {
        home.join(QUEUE_FILE_NAME)
    };

    let retry = parsed
        .as_ref()
        .and_then(|c| c.retry.clone())
        .unwrap_or_default();

    let defaults = CacheSettings::default();
    let cache = match parsed.as_ref().and_then(|c| c.cache.as_ref()) {
        Some(cache) => CacheSettings {
            max_entries: cache.max_entries.unwrap_or(defaults.max_entries),
            default_ttl_ms: cache.default_ttl_ms,
            sweep_interval_ms: cache.sweep_interval_ms.unwrap_or(defaults.sweep_interval_ms),
        },
        None => defaults,
    };

    let queue = QueueSettings {
        max_attempts: parsed
            .as_ref()
            .and_then(|c| c.queue.as_ref())
            .and_then(|q| q.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS),
    };

    Ok(ResolvedConfig {
        home,
        queue_file,
        config_file,
        retry,
        cache,
        queue,
    })
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (bypasses the cache)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the conductor home directory
pub fn conductor_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the offline queue log path
pub fn queue_file() -> Result<PathBuf> {
    Ok(config()?.queue_file.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(temp: &TempDir, yaml: &str) -> PathBuf {
        let conductor_dir = temp.path().join(".conductor");
        std::fs::create_dir_all(&conductor_dir).unwrap();

        let config_path = conductor_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", yaml).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let home = PathBuf::from("/users/test/.conductor");
        let config = resolve_config(None, home.clone(), no_env).unwrap();

        assert_eq!(config.home, home);
        assert_eq!(config.queue_file, home.join("offline_queue.jsonl"));
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.cache, CacheSettings::default());
        assert_eq!(config.queue.max_attempts, 5);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            &temp,
            r#"
version: "1.0"
paths:
  queue_file: ./state/queue.jsonl
retry:
  max_retries: 2
  base_delay_ms: 250
cache:
  max_entries: 64
  default_ttl_ms: 5000
queue:
  max_attempts: 8
"#,
        );

        let config = resolve_config(Some(config_path.clone()), PathBuf::from("/unused"), no_env).unwrap();

        let conductor_dir = config_path.parent().unwrap();
        assert_eq!(config.queue_file, conductor_dir.join("./state/queue.jsonl"));
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.cache.max_entries, 64);
        assert_eq!(config.cache.default_ttl_ms, Some(5000));
        assert_eq!(config.cache.sweep_interval_ms, 60_000);
        assert_eq!(config.queue.max_attempts, 8);
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "version: \"1.0\"\npaths:\n  home: ./state\n");

        let config = resolve_config(Some(config_path), PathBuf::from("/unused"), |key| match key {
            "CONDUCTOR_HOME" => Some("/srv/conductor".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/conductor"));
        assert_eq!(config.queue_file, PathBuf::from("/srv/conductor/offline_queue.jsonl"));
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(&temp, "paths: [not, a, map]");
        let err = resolve_config(Some(config_path), PathBuf::from("/unused"), no_env).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }

    #[test]
    fn test_cache_settings_build() {
        let settings = CacheSettings {
            max_entries: 3,
            default_ttl_ms: Some(100),
            sweep_interval_ms: 0,
        };
        assert_eq!(settings.build().max_entries(), 3);
        assert_eq!(settings.sweep_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
