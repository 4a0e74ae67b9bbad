//! Session and iteration records.
//!
//! A session is the root of ownership: iterations, the clarification
//! exchange, and the selected result are all reachable only through it.
//! Iterations are sealed (read-only) once their critique is recorded and the
//! history is append-only; "editing the script" means the generator reads the
//! previous sealed record and emits a new one.

use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::rubric::CritiqueResult;
use crate::core::types::{ExecutionOutcome, Mode, RenderSet, SessionStatus};

/// Everything needed to start one end-to-end generation request.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The user's description of the target appearance.
    pub prompt: String,
    /// Optional style-reference image, consulted by generator and critic.
    pub reference_image: Option<PathBuf>,
    /// Goal images the scene should converge to (edit mode).
    pub goal_images: Vec<PathBuf>,
    /// Existing scene to mutate. Presence switches the session to edit mode.
    pub starting_scene: Option<PathBuf>,
    /// Named viewpoints to render in edit mode; ignored in creation mode.
    pub edit_views: Vec<String>,
    /// Whether the clarification gate may run before iteration 1.
    pub interactive: bool,
    pub max_iterations: u32,
    /// Parent directory under which the session directory is created.
    pub output_root: PathBuf,
}

impl SessionConfig {
    pub fn new(prompt: impl Into<String>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            reference_image: None,
            goal_images: Vec::new(),
            starting_scene: None,
            edit_views: Vec::new(),
            interactive: true,
            max_iterations: 5,
            output_root: output_root.into(),
        }
    }

    pub fn mode(&self) -> Mode {
        if self.starting_scene.is_some() {
            Mode::Edit
        } else {
            Mode::Create
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prompt.trim().is_empty() {
            bail!("prompt must not be empty");
        }
        if self.max_iterations == 0 {
            bail!("max_iterations must be > 0");
        }
        if self.starting_scene.is_none() && !self.edit_views.is_empty() {
            bail!("edit views require a starting scene");
        }
        Ok(())
    }
}

/// One question asked before iteration 1 and the user's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationEntry {
    pub question: String,
    pub answer: String,
}

/// The (at most one) clarification round of a session. Empty when the prompt
/// was judged unambiguous or clarification was disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarificationExchange {
    pub entries: Vec<ClarificationEntry>,
}

impl ClarificationExchange {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the exchange as the "Additional details" block merged into
    /// generator prompts.
    pub fn as_details(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("- {}: {}", e.question, e.answer))
            .collect();
        Some(lines.join("\n"))
    }
}

/// One sealed generate→execute→render→critique attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    /// 1-based, gapless, strictly increasing within a session.
    pub index: u32,
    /// Script text as generated (before path injection). Empty when script
    /// generation itself failed.
    pub script: String,
    pub outcome: ExecutionOutcome,
    /// Present only when execution succeeded and rendering produced views.
    pub renders: Option<RenderSet>,
    /// Always present once sealed; failed iterations carry a synthetic
    /// zero-score critique describing the failure class.
    pub critique: CritiqueResult,
    pub duration_ms: u64,
}

/// One end-to-end generation request in a terminal or in-flight state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub prompt: String,
    pub mode: Mode,
    pub created_at: DateTime<Utc>,
    pub output_dir: PathBuf,
    pub status: SessionStatus,
    pub clarification: ClarificationExchange,
    pub iterations: Vec<Iteration>,
    /// 1-based index of the iteration presented as the result.
    pub selected: Option<u32>,
}

impl Session {
    pub fn iteration(&self, index: u32) -> Option<&Iteration> {
        self.iterations.iter().find(|it| it.index == index)
    }

    pub fn selected_iteration(&self) -> Option<&Iteration> {
        self.selected.and_then(|idx| self.iteration(idx))
    }
}

/// Mint a session identifier from the creation time, e.g.
/// `sess-20260807-142301`. `taken` disambiguates collisions (concurrent
/// sessions must never share an output directory).
pub fn mint_session_id(now: DateTime<Utc>, taken: impl Fn(&str) -> bool) -> Result<String> {
    let base = format!("sess-{}", now.format("%Y%m%d-%H%M%S"));
    if !taken(&base) {
        return Ok(base);
    }
    for suffix in 2..=999u32 {
        let id = format!("{base}-{suffix}");
        if !taken(&id) {
            return Ok(id);
        }
    }
    bail!("unable to mint unique session id from base '{base}'");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_follows_starting_scene() {
        let mut config = SessionConfig::new("a chair", "/tmp/out");
        assert_eq!(config.mode(), Mode::Create);
        config.starting_scene = Some(PathBuf::from("scene.blend"));
        assert_eq!(config.mode(), Mode::Edit);
    }

    #[test]
    fn validate_rejects_empty_prompt_and_zero_budget() {
        let mut config = SessionConfig::new("  ", "/tmp/out");
        assert!(config.validate().is_err());
        config.prompt = "a chair".to_string();
        config.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_edit_views_without_scene() {
        let mut config = SessionConfig::new("brighter lighting", "/tmp/out");
        config.edit_views = vec!["cam_main".to_string()];
        assert!(config.validate().is_err());
        config.starting_scene = Some(PathBuf::from("scene.blend"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn clarification_details_render_as_list() {
        let exchange = ClarificationExchange {
            entries: vec![ClarificationEntry {
                question: "What style?".to_string(),
                answer: "low-poly".to_string(),
            }],
        };
        let details = exchange.as_details().expect("details");
        assert!(details.contains("- What style?: low-poly"));
        assert!(ClarificationExchange::default().as_details().is_none());
    }

    #[test]
    fn session_id_disambiguates_collisions() {
        let now = DateTime::parse_from_rfc3339("2026-08-07T14:23:01Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let id = mint_session_id(now, |_| false).expect("id");
        assert_eq!(id, "sess-20260807-142301");

        let id = mint_session_id(now, |candidate| candidate == "sess-20260807-142301")
            .expect("id");
        assert_eq!(id, "sess-20260807-142301-2");
    }
}
