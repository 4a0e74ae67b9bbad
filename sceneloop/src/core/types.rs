//! Shared deterministic types for the refinement loop.
//!
//! These types define stable contracts between pipeline stages. They should
//! not depend on external state or I/O and must remain deterministic across
//! runs.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Terminal and in-flight states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Iterations are still being executed.
    Running,
    /// A critique accepted an iteration.
    Passed,
    /// The iteration budget ran out (or the session was cancelled); the best
    /// completed iteration is presented.
    Exhausted,
    /// Setup failed before the loop could run a single iteration.
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self != SessionStatus::Running
    }
}

/// Whether a session builds a scene from scratch or mutates an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Create,
    Edit,
}

/// Classified result of running a mutation script in the engine sandbox.
///
/// Exactly one variant is recorded per iteration. Failure variants carry
/// enough text to feed the next generation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The script ran to completion and saved the output scene file.
    Succeeded { scene_file: PathBuf },
    /// The script itself failed: non-zero exit, an error trace in the
    /// captured output, a violated script contract, or a missing output
    /// scene despite a clean exit.
    ScriptError { message: String },
    /// Wall clock exceeded the configured timeout; the engine process was
    /// force-killed.
    TimedOut { elapsed_secs: u64 },
    /// The engine process itself aborted (signal, segfault, internal crash).
    EngineCrashed { message: String },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded { .. })
    }

    /// One-line classified description of a failure, `None` on success.
    pub fn failure_summary(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Succeeded { .. } => None,
            ExecutionOutcome::ScriptError { message } => {
                Some(format!("script error: {message}"))
            }
            ExecutionOutcome::TimedOut { elapsed_secs } => Some(format!(
                "execution timed out after {elapsed_secs}s; the scene may be too expensive to build or render"
            )),
            ExecutionOutcome::EngineCrashed { message } => {
                Some(format!("engine crashed: {message}"))
            }
        }
    }
}

/// A single rendered view of the scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderView {
    pub name: String,
    pub image: PathBuf,
}

/// Ordered set of rendered views plus an optional rotating composite.
///
/// Invariant: contains at least one view (enforced by [`RenderSet::new`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderSet {
    views: Vec<RenderView>,
    pub animation: Option<PathBuf>,
}

impl RenderSet {
    pub fn new(views: Vec<RenderView>, animation: Option<PathBuf>) -> Result<Self> {
        if views.is_empty() {
            bail!("render set must contain at least one view");
        }
        Ok(Self { views, animation })
    }

    pub fn views(&self) -> &[RenderView] {
        &self.views
    }

    /// The first view's image, used as the presented render of an iteration.
    pub fn primary(&self) -> &Path {
        &self.views[0].image
    }

    pub fn view(&self, name: &str) -> Option<&Path> {
        self.views
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.image.as_path())
    }
}

/// Which viewpoints the render adapter must produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewSpec {
    /// The fixed four-view set used for scenes built from scratch.
    Canonical,
    /// Named cameras that must already exist in the scene (edit mode).
    /// A missing camera is an explicit render failure, never skipped.
    Named(Vec<String>),
}

/// Canonical view names rendered in creation mode, in presentation order.
pub const CANONICAL_VIEWS: [&str; 4] = ["front", "top", "side", "iso"];

impl ViewSpec {
    pub fn view_names(&self) -> Vec<String> {
        match self {
            ViewSpec::Canonical => CANONICAL_VIEWS.iter().map(|s| (*s).to_string()).collect(),
            ViewSpec::Named(names) => names.clone(),
        }
    }
}

/// What the critique compares renders against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Target {
    /// Creation mode: the textual description of the desired scene.
    Description { text: String },
    /// Edit mode: the appearance the scene should converge to.
    GoalImages { images: Vec<PathBuf> },
}
