//! Application configuration loaded from `sceneloop.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Environment override for `engine.executable_path`, consumed only when the
/// config field is absent.
pub const ENGINE_PATH_ENV: &str = "SCENELOOP_ENGINE_PATH";
/// Environment override for `llm.api_key`, consumed only when the config
/// field is absent.
pub const API_KEY_ENV: &str = "SCENELOOP_API_KEY";

/// Default config file name searched in the working directory.
pub const CONFIG_FILE: &str = "sceneloop.toml";

const CONFIG_TEMPLATE: &str = r#"# sceneloop configuration

[engine]
# Path to the authoring engine binary (e.g. a headless Blender).
# May also be supplied via the SCENELOOP_ENGINE_PATH environment variable.
# executable_path = "/usr/bin/blender"
timeout_seconds = 120

[llm]
# "hosted" (OpenAI-compatible API) or "local" (Ollama-compatible server).
backend = "hosted"
model_name = "gpt-4o"
# api_key = "..."            # or set SCENELOOP_API_KEY
# base_url = "http://localhost:11434"   # local backend only

[pipeline]
max_iterations = 5
output_dir = "./sessions"
"#;

/// Main configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values; the engine path
/// and credentials are validated at the point of use, not at parse time, so
/// `doctor` can report on an incomplete setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Filesystem path to the authoring engine binary.
    pub executable_path: Option<PathBuf>,
    /// Wall-clock budget per engine invocation (execution and render each).
    pub timeout_seconds: u64,
    /// Truncate captured engine stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable_path: None,
            timeout_seconds: 120,
            output_limit_bytes: 100_000,
        }
    }
}

/// Which model capability backs script generation and critique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// Hosted OpenAI-compatible chat API.
    Hosted,
    /// Local Ollama-compatible server.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub model_name: String,
    pub api_key: Option<String>,
    /// Server base URL for the local backend.
    pub base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::Hosted,
            model_name: "gpt-4o".to_string(),
            api_key: None,
            base_url: "http://localhost:11434".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_iterations: u32,
    pub output_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            output_dir: PathBuf::from("./sessions"),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.engine.timeout_seconds == 0 {
            return Err(anyhow!("engine.timeout_seconds must be > 0"));
        }
        if self.engine.output_limit_bytes == 0 {
            return Err(anyhow!("engine.output_limit_bytes must be > 0"));
        }
        if self.pipeline.max_iterations == 0 {
            return Err(anyhow!("pipeline.max_iterations must be > 0"));
        }
        if self.llm.model_name.trim().is_empty() {
            return Err(anyhow!("llm.model_name must not be empty"));
        }
        Ok(())
    }

    /// Engine path from config, falling back to [`ENGINE_PATH_ENV`] only
    /// when the config field is absent.
    pub fn engine_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.engine.executable_path {
            return Some(path.clone());
        }
        std::env::var_os(ENGINE_PATH_ENV).map(PathBuf::from)
    }

    /// API credential from config, falling back to [`API_KEY_ENV`] only when
    /// the config field is absent.
    pub fn api_key(&self) -> Option<String> {
        if let Some(key) = &self.llm.api_key {
            return Some(key.clone());
        }
        std::env::var(API_KEY_ENV).ok()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Write the commented default config template.
///
/// Refuses to overwrite an existing file unless `force` is set.
pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    write_atomic(path, CONFIG_TEMPLATE)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn template_round_trips_through_parser() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        write_default_config(&path, false).expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.engine.timeout_seconds, 120);
        assert_eq!(cfg.pipeline.max_iterations, 5);
        assert_eq!(cfg.llm.backend, LlmBackend::Hosted);
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE);
        write_default_config(&path, false).expect("write");
        let err = write_default_config(&path, false).unwrap_err();
        assert!(err.to_string().contains("already exists"));
        write_default_config(&path, true).expect("force overwrite");
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut cfg = Config::default();
        cfg.engine.timeout_seconds = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_field_wins_over_environment() {
        let mut cfg = Config::default();
        cfg.engine.executable_path = Some(PathBuf::from("/opt/engine"));
        cfg.llm.api_key = Some("from-config".to_string());
        // Env vars are only consulted when the field is absent, so explicit
        // values must win regardless of the process environment.
        assert_eq!(cfg.engine_path(), Some(PathBuf::from("/opt/engine")));
        assert_eq!(cfg.api_key(), Some("from-config".to_string()));
    }
}
