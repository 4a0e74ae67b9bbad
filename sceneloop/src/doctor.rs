//! Setup checklist for `sceneloop doctor`.
//!
//! Deterministic: given unchanged configuration and environment, repeated
//! runs produce identical results. Checks report, never repair.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::instrument;

use crate::io::config::{Config, LlmBackend, load_config};
use crate::io::engine::EngineSandbox;
use crate::llm::local::LocalModel;

/// One pass/fail item in the checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DoctorCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl DoctorCheck {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: detail.into(),
        }
    }
}

pub fn all_passed(checks: &[DoctorCheck]) -> bool {
    checks.iter().all(|check| check.passed)
}

/// Validate the external-engine path, model credentials, and output root.
#[instrument(skip_all)]
pub fn run_doctor(config_path: &Path) -> Vec<DoctorCheck> {
    let mut checks = Vec::new();

    if config_path.exists() {
        checks.push(DoctorCheck::pass("config file", config_path.display().to_string()));
    } else {
        checks.push(DoctorCheck::fail(
            "config file",
            format!("{} not found (run `sceneloop init`)", config_path.display()),
        ));
    }
    // A missing file loads as defaults, so the remaining checks still run.
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            checks.push(DoctorCheck::fail("config valid", format!("{err:#}")));
            return checks;
        }
    };

    check_engine(&config, &mut checks);
    check_model(&config, &mut checks);
    check_output_root(&config, &mut checks);
    checks
}

fn check_engine(config: &Config, checks: &mut Vec<DoctorCheck>) {
    let Some(path) = config.engine_path() else {
        checks.push(DoctorCheck::fail(
            "engine path",
            format!(
                "engine.executable_path is not configured and {} is unset",
                crate::io::config::ENGINE_PATH_ENV
            ),
        ));
        return;
    };

    if !path.exists() {
        checks.push(DoctorCheck::fail(
            "engine binary",
            format!("not found at {}", path.display()),
        ));
        return;
    }
    checks.push(DoctorCheck::pass("engine binary", path.display().to_string()));

    match EngineSandbox::new(&path).probe() {
        Ok(version) => checks.push(DoctorCheck::pass("engine responds", version)),
        Err(err) => checks.push(DoctorCheck::fail("engine responds", format!("{err:#}"))),
    }
}

fn check_model(config: &Config, checks: &mut Vec<DoctorCheck>) {
    match config.llm.backend {
        LlmBackend::Hosted => match config.api_key() {
            Some(key) => checks.push(DoctorCheck::pass("api credential", mask_key(&key))),
            None => checks.push(DoctorCheck::fail(
                "api credential",
                format!(
                    "llm.api_key is not configured and {} is unset",
                    crate::io::config::API_KEY_ENV
                ),
            )),
        },
        LlmBackend::Local => {
            let probe = LocalModel::new(
                config.llm.base_url.clone(),
                config.llm.model_name.clone(),
            )
            .and_then(|model| model.probe());
            match probe {
                Ok(()) => checks.push(DoctorCheck::pass("model server", config.llm.base_url.clone())),
                Err(err) => checks.push(DoctorCheck::fail("model server", format!("{err:#}"))),
            }
        }
    }
}

fn check_output_root(config: &Config, checks: &mut Vec<DoctorCheck>) {
    let dir = &config.pipeline.output_dir;
    let probe = dir.join(".doctor-probe");
    let result = fs::create_dir_all(dir)
        .and_then(|()| fs::write(&probe, b"probe"))
        .and_then(|()| fs::remove_file(&probe));
    match result {
        Ok(()) => checks.push(DoctorCheck::pass("output root writable", dir.display().to_string())),
        Err(err) => checks.push(DoctorCheck::fail(
            "output root writable",
            format!("{}: {err}", dir.display()),
        )),
    }
}

fn mask_key(key: &str) -> String {
    if key.len() <= 8 {
        return "***".to_string();
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}
