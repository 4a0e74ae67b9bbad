//! Render adapter: produces the evaluation views for a scene file.
//!
//! Runs under the same subprocess isolation and timeout discipline as the
//! execution sandbox. Creation mode renders the canonical four-view set plus
//! a rotating composite animation; edit mode renders named cameras that must
//! already exist in the scene, failing explicitly when one does not.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument};

use crate::core::types::{RenderSet, RenderView, ViewSpec};
use crate::io::engine::extract_error_trace;
use crate::io::process::run_with_timeout;

const RENDER_TEMPLATE: &str = include_str!("../templates/render_views.py");

/// Parameters for one render invocation.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Scene file produced by a successful execution.
    pub scene_file: PathBuf,
    pub view_spec: ViewSpec,
    /// Directory receiving `view_<name>.png` files and the animation.
    pub render_dir: PathBuf,
    /// Where the adapter stages the composed render script.
    pub staged_script_path: PathBuf,
    /// Where captured engine stdout/stderr is written.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over render backends.
pub trait Renderer {
    /// Produce the requested views. Any failure — including a named
    /// viewpoint missing from the scene — is an error, never a silently
    /// reduced render set.
    fn render(&self, request: &RenderRequest) -> Result<RenderSet>;
}

/// Renderer that spawns the real engine in headless mode.
#[derive(Debug, Clone)]
pub struct EngineRenderer {
    executable: PathBuf,
}

impl EngineRenderer {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

impl Renderer for EngineRenderer {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn render(&self, request: &RenderRequest) -> Result<RenderSet> {
        info!(scene = %request.scene_file.display(), "rendering evaluation views");
        if !request.scene_file.exists() {
            bail!("scene file {} does not exist", request.scene_file.display());
        }

        let staged = compose_render_script(request);
        if let Some(parent) = request.staged_script_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create script dir {}", parent.display()))?;
        }
        fs::write(&request.staged_script_path, staged)
            .with_context(|| format!("write {}", request.staged_script_path.display()))?;
        fs::create_dir_all(&request.render_dir)
            .with_context(|| format!("create render dir {}", request.render_dir.display()))?;

        let mut cmd = Command::new(&self.executable);
        cmd.arg("--background")
            .arg("--python")
            .arg(&request.staged_script_path)
            .env("PYTHONDONTWRITEBYTECODE", "1");

        let output = run_with_timeout(cmd, request.timeout, request.output_limit_bytes)
            .context("run engine render")?;
        write_log(&request.log_path, &output.render_log())?;

        if output.timed_out {
            bail!("render timed out after {}s", output.elapsed.as_secs());
        }
        let stderr = output.stderr_lossy();
        if !output.status.success() || stderr.contains("Traceback") {
            bail!("render failed: {}", extract_error_trace(&stderr));
        }

        collect_render_set(&request.render_dir, &request.view_spec)
    }
}

/// Gather the expected view files after a render run. Every requested view
/// must exist; the animation is optional.
pub fn collect_render_set(render_dir: &Path, view_spec: &ViewSpec) -> Result<RenderSet> {
    let mut views = Vec::new();
    for name in view_spec.view_names() {
        let image = render_dir.join(format!("view_{name}.png"));
        if !image.exists() {
            return Err(anyhow!(
                "expected view '{name}' was not rendered ({} missing)",
                image.display()
            ));
        }
        views.push(RenderView { name, image });
    }

    let animation = render_dir.join("turntable.mp4");
    let animation = animation.exists().then_some(animation);
    debug!(views = views.len(), animation = animation.is_some(), "render set collected");
    RenderSet::new(views, animation)
}

fn compose_render_script(request: &RenderRequest) -> String {
    let names: Vec<String> = request
        .view_spec
        .view_names()
        .iter()
        .map(|n| format!("'{}'", n.replace('\'', "")))
        .collect();
    let canonical = matches!(request.view_spec, ViewSpec::Canonical);

    let mut header = String::from("# staged by sceneloop\n");
    header.push_str(&format!("SCENE_PATH = r\"{}\"\n", request.scene_file.display()));
    header.push_str(&format!("RENDER_DIR = r\"{}\"\n", request.render_dir.display()));
    header.push_str(&format!("VIEW_NAMES = [{}]\n", names.join(", ")));
    header.push_str(&format!(
        "USE_CANONICAL_VIEWS = {}\n",
        if canonical { "True" } else { "False" }
    ));
    // The rotating composite only makes sense for the canonical orbit.
    header.push_str(&format!(
        "RENDER_ANIMATION = {}\n\n",
        if canonical { "True" } else { "False" }
    ));
    header + RENDER_TEMPLATE
}

fn write_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
