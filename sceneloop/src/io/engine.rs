//! Execution sandbox adapter for the authoring engine.
//!
//! The [`ScriptRunner`] trait decouples the orchestrator from the real
//! engine; tests use scripted runners that return predetermined outcomes
//! without spawning processes. [`EngineSandbox`] treats each attempt as an
//! opaque batch job: stage the script with injected path parameters, spawn
//! the engine headless, capture output, kill on timeout, classify the result.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::ExecutionOutcome;
use crate::io::process::run_with_timeout;

/// Name of the injected constant holding the mandatory save destination.
pub const OUTPUT_SCENE_VAR: &str = "OUTPUT_SCENE_PATH";
/// Name of the injected constant holding the edit-mode input scene.
pub const INPUT_SCENE_VAR: &str = "INPUT_SCENE_PATH";

/// Parameters for one sandboxed script execution.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Generated script text (before path injection).
    pub script: String,
    /// Existing scene the script must load first (edit mode only).
    pub input_scene: Option<PathBuf>,
    /// Where the script must save the resulting scene. Its presence after a
    /// clean exit is the success signal.
    pub output_scene: PathBuf,
    /// Where the adapter stages the composed (injected) script.
    pub staged_script_path: PathBuf,
    /// Where captured engine stdout/stderr is written.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over script execution backends.
pub trait ScriptRunner {
    /// Run the script in isolation and classify the result. `Err` is
    /// reserved for adapter-internal faults; script-level failures are
    /// expressed as [`ExecutionOutcome`] variants.
    fn execute(&self, request: &ExecRequest) -> Result<ExecutionOutcome>;
}

/// Sandbox that spawns the real engine in headless scripting mode.
#[derive(Debug, Clone)]
pub struct EngineSandbox {
    executable: PathBuf,
}

impl EngineSandbox {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Cheap reachability check: run `--version` under a short timeout.
    /// Returns the reported version line.
    pub fn probe(&self) -> Result<String> {
        let mut cmd = Command::new(&self.executable);
        cmd.arg("--version");
        let output = run_with_timeout(cmd, Duration::from_secs(10), 10_000)
            .with_context(|| format!("run {} --version", self.executable.display()))?;
        if output.timed_out || !output.status.success() {
            return Err(anyhow!(
                "engine at {} is not responding to --version",
                self.executable.display()
            ));
        }
        Ok(output
            .stdout_lossy()
            .lines()
            .next()
            .unwrap_or_default()
            .to_string())
    }
}

impl ScriptRunner for EngineSandbox {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), edit = request.input_scene.is_some()))]
    fn execute(&self, request: &ExecRequest) -> Result<ExecutionOutcome> {
        info!(script = %request.staged_script_path.display(), "executing scene script");

        if let Some(violation) = check_script_contract(&request.script, request.input_scene.is_some())
        {
            warn!(violation, "script rejected before execution");
            return Ok(ExecutionOutcome::ScriptError {
                message: violation.to_string(),
            });
        }

        let staged = compose_script(request);
        if let Some(parent) = request.staged_script_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create script dir {}", parent.display()))?;
        }
        fs::write(&request.staged_script_path, staged)
            .with_context(|| format!("write {}", request.staged_script_path.display()))?;

        let mut cmd = Command::new(&self.executable);
        cmd.arg("--background")
            .arg("--python")
            .arg(&request.staged_script_path)
            .env("PYTHONDONTWRITEBYTECODE", "1");

        let output = run_with_timeout(cmd, request.timeout, request.output_limit_bytes)
            .context("run engine")?;
        write_log(&request.log_path, &output.render_log())?;

        if output.timed_out {
            return Ok(ExecutionOutcome::TimedOut {
                elapsed_secs: output.elapsed.as_secs(),
            });
        }

        let stderr = output.stderr_lossy();
        if output.status.code().is_none() || has_crash_marker(&stderr) {
            return Ok(ExecutionOutcome::EngineCrashed {
                message: extract_error_trace(&stderr),
            });
        }
        if !output.status.success() {
            return Ok(ExecutionOutcome::ScriptError {
                message: extract_error_trace(&stderr),
            });
        }
        // The engine often exits 0 even when the script raised; a traceback
        // in stderr is still a script failure.
        if stderr.contains("Traceback") {
            return Ok(ExecutionOutcome::ScriptError {
                message: extract_error_trace(&stderr),
            });
        }
        if !request.output_scene.exists() {
            // The contract requires an explicit save step; a silently missing
            // artifact is a generation bug, not a success.
            return Ok(ExecutionOutcome::ScriptError {
                message: format!(
                    "script exited cleanly but did not save the scene to {OUTPUT_SCENE_VAR}"
                ),
            });
        }

        debug!(scene = %request.output_scene.display(), "execution succeeded");
        Ok(ExecutionOutcome::Succeeded {
            scene_file: request.output_scene.clone(),
        })
    }
}

/// Validate the generated script against the collaborator contract before
/// spending an engine invocation on it.
///
/// Returns a violation message, or `None` when the script may run.
pub fn check_script_contract(script: &str, edit_mode: bool) -> Option<&'static str> {
    if !script.contains(OUTPUT_SCENE_VAR) {
        return Some("script never references OUTPUT_SCENE_PATH: the mandatory save step is missing");
    }
    if edit_mode && !script.contains(INPUT_SCENE_VAR) {
        return Some(
            "edit-mode script never references INPUT_SCENE_PATH: the existing scene would not be loaded",
        );
    }
    None
}

/// Prepend the injected path constants so scripts never hardcode paths.
fn compose_script(request: &ExecRequest) -> String {
    let mut header = String::from("# staged by sceneloop\nimport bpy\n\n");
    header.push_str(&format!(
        "{OUTPUT_SCENE_VAR} = r\"{}\"\n",
        request.output_scene.display()
    ));
    if let Some(input) = &request.input_scene {
        header.push_str(&format!("{INPUT_SCENE_VAR} = r\"{}\"\n", input.display()));
    }
    header.push('\n');

    // Drop a duplicate engine-API import; everything else is kept verbatim.
    let body: Vec<&str> = request
        .script
        .lines()
        .filter(|line| line.trim() != "import bpy")
        .collect();
    header + &body.join("\n") + "\n"
}

fn has_crash_marker(stderr: &str) -> bool {
    const MARKERS: [&str; 3] = [
        "Segmentation fault",
        "Aborted (core dumped)",
        "EXCEPTION_ACCESS_VIOLATION",
    ];
    MARKERS.iter().any(|m| stderr.contains(m))
}

/// Extract the most relevant error portion from engine stderr: the Python
/// traceback when present, otherwise lines mentioning errors, otherwise the
/// final lines.
pub fn extract_error_trace(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.trim().lines().collect();
    if lines.is_empty() {
        return "no error output captured".to_string();
    }

    if let Some(start) = lines.iter().position(|l| l.starts_with("Traceback")) {
        return lines[start..].join("\n");
    }

    let error_lines: Vec<&str> = lines
        .iter()
        .filter(|l| l.contains("Error") || l.contains("Exception"))
        .copied()
        .collect();
    if !error_lines.is_empty() {
        return error_lines.join("\n");
    }

    let tail_start = lines.len().saturating_sub(10);
    lines[tail_start..].join("\n")
}

fn write_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
