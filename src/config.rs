//! Configuration management for patchloom
//!
//! Stores settings in ~/.config/patchloom/config.json. Every section is
//! optional; missing fields take their defaults.

use crate::generate::client::DEFAULT_MODEL;
use crate::graph::{ImportResolver, DEFAULT_EXTENSIONS, DEFAULT_LONG_FILE_LINES};
use crate::reflection::{Pass, ReflectionSettings, DEFAULT_MAX_ITERATIONS, DEFAULT_PASS_THRESHOLD};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_API_KEY: &str = "OPENROUTER_API_KEY";
pub const ENV_MODEL: &str = "PATCHLOOM_MODEL";
pub const ENV_MAX_CONCURRENT_JOBS: &str = "PATCHLOOM_MAX_CONCURRENT_JOBS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openrouter_api_key: Option<String>,
    /// OpenRouter model id; falls back to the built-in default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub reflection: ReflectionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_retries_per_step: u32,
    /// Retry delay is `backoff_base_ms * 2^attempt`
    pub backoff_base_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries_per_step: 3,
            backoff_base_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub max_iterations: usize,
    pub pass_threshold: u32,
    pub long_file_lines: usize,
    pub disabled_passes: Vec<Pass>,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
            long_file_lines: DEFAULT_LONG_FILE_LINES,
            disabled_passes: Vec::new(),
        }
    }
}

impl ReflectionConfig {
    pub fn settings(&self) -> ReflectionSettings {
        ReflectionSettings {
            max_iterations: self.max_iterations,
            pass_threshold: self.pass_threshold,
            disabled_passes: self.disabled_passes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent_jobs: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_retries: 3,
            backoff_base_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub extensions: Vec<String>,
    /// Import prefix -> directory, e.g. `"@/" -> "src/"`
    pub path_aliases: BTreeMap<String, String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            path_aliases: BTreeMap::new(),
        }
    }
}

impl ResolverConfig {
    pub fn resolver(&self) -> ImportResolver {
        ImportResolver::new(self.extensions.clone(), self.path_aliases.clone())
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("patchloom"))
    }

    /// Get the config file path
    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from the default location, or return defaults.
    /// Environment overrides are applied either way.
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Load config from `path`. A corrupt file is moved aside and defaults used.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path().context("could not determine config directory")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create config directory {}", dir.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        write_config_atomic(path, &content)
            .with_context(|| format!("failed to write config to {}", path.display()))
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup(ENV_MODEL).filter(|m| !m.trim().is_empty()) {
            self.model = Some(model.trim().to_string());
        }
        if let Some(raw) = lookup(ENV_MAX_CONCURRENT_JOBS) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.queue.max_concurrent_jobs = n,
                _ => tracing::warn!(value = %raw, "ignoring invalid {}", ENV_MAX_CONCURRENT_JOBS),
            }
        }
    }

    /// Get the OpenRouter API key; the environment takes precedence
    pub fn get_api_key(&self) -> Option<String> {
        std::env::var(ENV_API_KEY)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.openrouter_api_key.clone())
    }

    pub fn model(&self) -> String {
        self.model.clone().unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/patchloom/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600)) {
            tracing::warn!(error = %e, "failed to set config file permissions");
        }
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.openrouter_api_key.is_none());
        assert_eq!(config.orchestrator.max_retries_per_step, 3);
        assert_eq!(config.queue.max_concurrent_jobs, 3);
        assert_eq!(config.reflection.max_iterations, 5);
        assert_eq!(config.reflection.long_file_lines, 500);
        assert_eq!(config.model(), DEFAULT_MODEL);
    }

    #[test]
    fn test_partial_sections_take_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"queue": {"max_concurrent_jobs": 8}, "reflection": {"disabled_passes": ["logic_review"]}}"#,
        )
        .unwrap();
        assert_eq!(config.queue.max_concurrent_jobs, 8);
        assert_eq!(config.queue.max_retries, 3);
        let settings = config.reflection.settings();
        assert!(!settings.is_enabled(Pass::LogicReview));
        assert!(settings.is_enabled(Pass::Syntax));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(|key| match key {
            ENV_MODEL => Some("openai/gpt-4o".to_string()),
            ENV_MAX_CONCURRENT_JOBS => Some("6".to_string()),
            _ => None,
        });
        assert_eq!(config.model(), "openai/gpt-4o");
        assert_eq!(config.queue.max_concurrent_jobs, 6);

        config.apply_overrides(|key| (key == ENV_MAX_CONCURRENT_JOBS).then(|| "zero".to_string()));
        assert_eq!(config.queue.max_concurrent_jobs, 6);
    }

    #[test]
    fn test_save_and_corrupt_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut config = Config::default();
        config.resolver.path_aliases.insert("@/".into(), "src/".into());
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path), config);

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(Config::load_from(&path), Config::default());
        assert!(path.with_extension("json.corrupt").exists());
        assert!(!path.exists());
    }
}
