//! Engine configuration.
//!
//! Loaded from TOML, then overridden from `FUSE_POLICY_*` environment
//! variables.

use crate::error::{PolicyError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_OPA_BIN: &str = "FUSE_POLICY_OPA_BIN";
pub const ENV_WORK_DIR: &str = "FUSE_POLICY_WORK_DIR";
pub const ENV_COMPILE_TIMEOUT_MS: &str = "FUSE_POLICY_COMPILE_TIMEOUT_MS";
pub const ENV_EVAL_TIMEOUT_MS: &str = "FUSE_POLICY_EVAL_TIMEOUT_MS";
pub const ENV_REMOTE_URL: &str = "FUSE_POLICY_REMOTE_URL";
pub const ENV_REMOTE_TIMEOUT_MS: &str = "FUSE_POLICY_REMOTE_TIMEOUT_MS";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// External OPA toolchain settings.
    pub toolchain: ToolchainConfig,

    /// Remote policy source. Absent means local-only.
    pub remote: Option<RemoteConfig>,
}

/// Settings for the out-of-process OPA toolchain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Path or name of the `opa` binary.
    pub binary: String,

    /// Time bound for `opa build`, in milliseconds.
    pub compile_timeout_ms: u64,

    /// Time bound for `opa eval`, in milliseconds.
    pub eval_timeout_ms: u64,

    /// Directory temporary work areas are created in. Defaults to the system temp dir.
    pub work_dir: Option<PathBuf>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            binary: "opa".to_string(),
            compile_timeout_ms: 30_000,
            eval_timeout_ms: 10_000,
            work_dir: None,
        }
    }
}

impl ToolchainConfig {
    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn eval_timeout(&self) -> Duration {
        Duration::from_millis(self.eval_timeout_ms)
    }
}

/// Settings for the HTTP policy source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL; policies are fetched from `{base_url}/policies/{id}`.
    pub base_url: String,

    /// Request timeout in milliseconds.
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_remote_timeout_ms() -> u64 {
    5_000
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: default_remote_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl EngineConfig {
    /// Parses a TOML document. Environment overrides are not applied.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Loads a TOML file and applies environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PolicyError::ConfigError(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(binary) = lookup(ENV_OPA_BIN) {
            self.toolchain.binary = binary;
        }
        if let Some(dir) = lookup(ENV_WORK_DIR) {
            self.toolchain.work_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = lookup(ENV_COMPILE_TIMEOUT_MS) {
            self.toolchain.compile_timeout_ms = parse_millis(ENV_COMPILE_TIMEOUT_MS, &ms)?;
        }
        if let Some(ms) = lookup(ENV_EVAL_TIMEOUT_MS) {
            self.toolchain.eval_timeout_ms = parse_millis(ENV_EVAL_TIMEOUT_MS, &ms)?;
        }
        if let Some(url) = lookup(ENV_REMOTE_URL) {
            match self.remote.as_mut() {
                Some(remote) => remote.base_url = url,
                None => self.remote = Some(RemoteConfig::new(url)),
            }
        }
        if let Some(ms) = lookup(ENV_REMOTE_TIMEOUT_MS) {
            let timeout_ms = parse_millis(ENV_REMOTE_TIMEOUT_MS, &ms)?;
            match self.remote.as_mut() {
                Some(remote) => remote.timeout_ms = timeout_ms,
                None => {
                    return Err(PolicyError::ConfigError(format!(
                        "{} is set but no remote source is configured",
                        ENV_REMOTE_TIMEOUT_MS
                    )))
                }
            }
        }
        Ok(())
    }
}

fn parse_millis(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| PolicyError::ConfigError(format!("{} must be a whole number of milliseconds, got '{}'", name, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.toolchain.binary, "opa");
        assert_eq!(config.toolchain.compile_timeout(), Duration::from_secs(30));
        assert_eq!(config.toolchain.eval_timeout(), Duration::from_secs(10));
        assert!(config.remote.is_none());
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
[toolchain]
binary = "/usr/local/bin/opa"
eval_timeout_ms = 2500

[remote]
base_url = "https://policies.internal"
"#,
        )
        .unwrap();

        assert_eq!(config.toolchain.binary, "/usr/local/bin/opa");
        assert_eq!(config.toolchain.eval_timeout_ms, 2500);
        assert_eq!(config.toolchain.compile_timeout_ms, 30_000);
        let remote = config.remote.unwrap();
        assert_eq!(remote.base_url, "https://policies.internal");
        assert_eq!(remote.timeout_ms, 5_000);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = EngineConfig::from_toml_str("[toolchain]\neval_timeout_ms = \"soon\"");
        assert!(matches!(result, Err(PolicyError::ConfigError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_env_with(env(&[
                (ENV_OPA_BIN, "/opt/opa"),
                (ENV_WORK_DIR, "/var/tmp/fuse"),
                (ENV_EVAL_TIMEOUT_MS, " 750 "),
                (ENV_REMOTE_URL, "http://localhost:8080"),
                (ENV_REMOTE_TIMEOUT_MS, "1200"),
            ]))
            .unwrap();

        assert_eq!(config.toolchain.binary, "/opt/opa");
        assert_eq!(config.toolchain.work_dir, Some(PathBuf::from("/var/tmp/fuse")));
        assert_eq!(config.toolchain.eval_timeout_ms, 750);
        let remote = config.remote.unwrap();
        assert_eq!(remote.base_url, "http://localhost:8080");
        assert_eq!(remote.timeout_ms, 1200);
    }

    #[test]
    fn test_malformed_env_override() {
        let mut config = EngineConfig::default();
        let result = config.apply_env_with(env(&[(ENV_COMPILE_TIMEOUT_MS, "30s")]));
        assert!(matches!(result, Err(PolicyError::ConfigError(_))));
    }

    #[test]
    fn test_remote_timeout_without_remote() {
        let mut config = EngineConfig::default();
        let result = config.apply_env_with(env(&[(ENV_REMOTE_TIMEOUT_MS, "100")]));
        assert!(matches!(result, Err(PolicyError::ConfigError(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[toolchain]\ncompile_timeout_ms = 9000\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert!(config.toolchain.compile_timeout_ms == 9000 || std::env::var(ENV_COMPILE_TIMEOUT_MS).is_ok());
        assert!(EngineConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
