//! Configuration for pipewright.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PIPEWRIGHT_HOME, PIPEWRIGHT_WORKSPACE)
//! 2. Config file (.pipewright/config.yaml)
//! 3. Defaults (~/.pipewright, current directory as workspace)
//!
//! Config file discovery:
//! - Searches current directory and parents for .pipewright/config.yaml
//! - `paths.home` is relative to the .pipewright/ directory
//! - `paths.workspace` is relative to the project root (parent of .pipewright/)

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{HttpProviderGateway, ModelPrice, PricingTable};
use crate::core::SafetyLimits;

const CONFIG_DIR: &str = ".pipewright";
const HOME_ENV: &str = "PIPEWRIGHT_HOME";
const WORKSPACE_ENV: &str = "PIPEWRIGHT_WORKSPACE";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub safety: Option<SafetyLimits>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub pricing: BTreeMap<String, ModelPrice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .pipewright/)
    pub home: Option<String>,
    /// Root for file steps (relative to the project root)
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state: pipelines and execution logs
    pub home: PathBuf,
    /// Root directory for file steps
    pub workspace: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub safety: SafetyLimits,
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Price overrides on top of the built-in table
    pub pricing: BTreeMap<String, ModelPrice>,
}

impl ResolvedConfig {
    pub fn pipelines_dir(&self) -> PathBuf {
        self.home.join("pipelines")
    }

    pub fn executions_dir(&self) -> PathBuf {
        self.home.join("executions")
    }

    /// Built-in prices with configured overrides applied
    pub fn pricing_table(&self) -> PricingTable {
        let mut table = PricingTable::default();
        for (model, price) in &self.pricing {
            table.set_price(model.clone(), *price);
        }
        table
    }

    /// Gateway with configured base URL overrides
    pub fn provider_gateway(&self) -> HttpProviderGateway {
        self.providers
            .iter()
            .filter_map(|(name, provider)| provider.base_url.as_ref().map(|url| (name, url)))
            .fold(HttpProviderGateway::new(), |gateway, (name, url)| {
                gateway.with_base_url(name.clone(), url.clone())
            })
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
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

/// Resolve a path that may be relative to `base`
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

/// Values taken from the process environment
#[derive(Debug, Default)]
struct Environment {
    home: Option<PathBuf>,
    workspace: Option<PathBuf>,
    default_home: PathBuf,
    current_dir: PathBuf,
}

impl Environment {
    fn capture() -> Result<Self> {
        Ok(Self {
            home: std::env::var_os(HOME_ENV).map(PathBuf::from),
            workspace: std::env::var_os(WORKSPACE_ENV).map(PathBuf::from),
            default_home: dirs::home_dir()
                .context("Failed to determine home directory")?
                .join(CONFIG_DIR),
            current_dir: std::env::current_dir().context("Failed to determine current directory")?,
        })
    }
}

/// Merge an optional config file with the environment
fn resolve(file: Option<(PathBuf, ConfigFile)>, env: Environment) -> ResolvedConfig {
    let Some((config_path, config)) = file else {
        return ResolvedConfig {
            home: env.home.unwrap_or(env.default_home),
            workspace: env.workspace.unwrap_or(env.current_dir),
            config_file: None,
            safety: SafetyLimits::default(),
            providers: BTreeMap::new(),
            pricing: BTreeMap::new(),
        };
    };

    let config_dir = config_path.parent().unwrap_or(Path::new(".")).to_path_buf();
    let project_root = config_dir.parent().unwrap_or(Path::new(".")).to_path_buf();

    let home = env.home.unwrap_or_else(|| match config.paths.home {
        Some(ref home) => resolve_path(&config_dir, home),
        None => env.default_home.clone(),
    });

    let workspace = env.workspace.unwrap_or_else(|| match config.paths.workspace {
        Some(ref workspace) => resolve_path(&project_root, workspace),
        None => project_root.clone(),
    });

    ResolvedConfig {
        home,
        workspace,
        config_file: Some(config_path),
        safety: config.safety.unwrap_or_default(),
        providers: config.providers,
        pricing: config.pricing,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    Ok(resolve(file, Environment::capture()?))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Load configuration again, bypassing the cache
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the pipelines directory ($PIPEWRIGHT_HOME/pipelines)
pub fn pipelines_dir() -> Result<PathBuf> {
    Ok(config()?.pipelines_dir())
}

/// Get the executions directory ($PIPEWRIGHT_HOME/executions)
pub fn executions_dir() -> Result<PathBuf> {
    Ok(config()?.executions_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn env() -> Environment {
        Environment {
            home: None,
            workspace: None,
            default_home: PathBuf::from("/users/ada/.pipewright"),
            current_dir: PathBuf::from("/users/ada/project"),
        }
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, env());

        assert_eq!(config.home, PathBuf::from("/users/ada/.pipewright"));
        assert_eq!(config.workspace, PathBuf::from("/users/ada/project"));
        assert_eq!(config.pipelines_dir(), PathBuf::from("/users/ada/.pipewright/pipelines"));
        assert!(config.config_file.is_none());
        assert_eq!(config.safety, SafetyLimits::default());
    }

    #[test]
    fn test_env_overrides_file() {
        let file = ConfigFile {
            paths: PathsConfig {
                home: Some("state".to_string()),
                workspace: None,
            },
            ..Default::default()
        };
        let config = resolve(
            Some((PathBuf::from("/repo/.pipewright/config.yaml"), file)),
            Environment {
                home: Some(PathBuf::from("/override")),
                ..env()
            },
        );

        assert_eq!(config.home, PathBuf::from("/override"));
        assert_eq!(config.workspace, PathBuf::from("/repo"));
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_dir = temp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir).unwrap();

        let config_path = config_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1"
paths:
  home: ./state
  workspace: ./work
safety:
  max_steps: 10
  step_timeout_seconds: 30
providers:
  local:
    base_url: http://localhost:8080/v1
pricing:
  llama:
    input_per_1k: 0.0
    output_per_1k: 0.0001
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        let config = resolve(Some((config_path, parsed)), env());

        assert_eq!(config.home, config_dir.join("state"));
        assert_eq!(config.workspace, temp.path().join("work"));
        assert_eq!(config.safety.max_steps, 10);
        assert_eq!(config.safety.step_timeout_seconds, 30);
        // unset safety fields keep their defaults
        assert_eq!(config.safety.run_timeout_seconds, 3600);
        assert_eq!(
            config.providers["local"].base_url.as_deref(),
            Some("http://localhost:8080/v1")
        );
        assert_eq!(config.pricing_table().price("llama-3").output_per_1k, 0.0001);
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
