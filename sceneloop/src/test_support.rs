//! Test-only scripted fakes for the pipeline's collaborator seams.
//!
//! Each fake is queue-backed: tests enqueue the exact sequence of results a
//! collaborator should produce, and an exhausted queue is an error — so a
//! test that over-drives the loop fails loudly instead of looping forever.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Result, anyhow};
use chrono::Utc;

use crate::clarify::AnswerSource;
use crate::core::rubric::{CritiqueResult, Rubric};
use crate::core::types::{ExecutionOutcome, Mode, SessionStatus};
use crate::critic::{Critic, CritiqueRequest};
use crate::generator::{GenContext, ScriptGenerator};
use crate::io::engine::{ExecRequest, ScriptRunner};
use crate::io::render::{RenderRequest, Renderer, collect_render_set};
use crate::llm::{CompletionRequest, TextModel};
use crate::pipeline::ClarifyGate;
use crate::session::{ClarificationExchange, Iteration, Session};

/// Model double that replays canned responses and records every request.
pub struct CannedModel {
    responses: RefCell<VecDeque<String>>,
    last: String,
    requests: Rc<RefCell<Vec<CompletionRequest>>>,
}

impl CannedModel {
    /// Repeat `response` for every call.
    pub fn new(response: &str) -> Self {
        Self::with_responses(vec![response.to_string()])
    }

    /// Replay `responses` in order, repeating the final one afterwards.
    pub fn with_responses(responses: Vec<String>) -> Self {
        let last = responses.last().cloned().unwrap_or_default();
        Self {
            responses: RefCell::new(responses.into()),
            last,
            requests: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Shared handle to the requests this model has received.
    pub fn requests(&self) -> Rc<RefCell<Vec<CompletionRequest>>> {
        Rc::clone(&self.requests)
    }
}

impl TextModel for CannedModel {
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.requests.borrow_mut().push(request.clone());
        Ok(self
            .responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| self.last.clone()))
    }
}

/// Answer source that returns a fixed answer list (or declines).
pub struct ScriptedAnswers {
    answers: Vec<String>,
}

impl ScriptedAnswers {
    pub fn new(answers: Vec<String>) -> Self {
        Self { answers }
    }

    /// Returns no answers, which the gate treats as the user declining.
    pub fn declining() -> Self {
        Self::new(Vec::new())
    }
}

impl AnswerSource for ScriptedAnswers {
    fn answer(&mut self, _questions: &[String]) -> Result<Vec<String>> {
        Ok(self.answers.clone())
    }
}

/// Clarification gate that returns a fixed exchange.
pub struct ScriptedGate(pub ClarificationExchange);

impl ClarifyGate for ScriptedGate {
    fn run(&mut self, _prompt: &str) -> Result<ClarificationExchange> {
        Ok(self.0.clone())
    }
}

/// Generator double: replays queued scripts (or errors) and records every
/// context it was handed, so tests can observe feedback threading.
pub struct ScriptedGenerator {
    queue: RefCell<VecDeque<Result<String, String>>>,
    contexts: Rc<RefCell<Vec<GenContext>>>,
}

impl ScriptedGenerator {
    pub fn returning(queue: Vec<Result<String, String>>) -> Self {
        Self {
            queue: RefCell::new(queue.into()),
            contexts: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn contexts(&self) -> Rc<RefCell<Vec<GenContext>>> {
        Rc::clone(&self.contexts)
    }
}

impl ScriptGenerator for ScriptedGenerator {
    fn generate(&self, ctx: &GenContext) -> Result<String> {
        self.contexts.borrow_mut().push(ctx.clone());
        match self.queue.borrow_mut().pop_front() {
            Some(Ok(script)) => Ok(script),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted generator exhausted")),
        }
    }
}

/// Queued outcome for [`ScriptedSandbox`].
pub enum ScriptedOutcome {
    /// Write the requested output scene file and succeed.
    Succeed,
    ScriptError(String),
    TimedOut(u64),
    EngineCrashed(String),
}

/// Sandbox double that classifies attempts from a queue without spawning
/// anything. `Succeed` writes the output scene so downstream stages see a
/// real file.
pub struct ScriptedSandbox {
    queue: RefCell<VecDeque<ScriptedOutcome>>,
}

impl ScriptedSandbox {
    pub fn new(queue: Vec<ScriptedOutcome>) -> Self {
        Self {
            queue: RefCell::new(queue.into()),
        }
    }
}

impl ScriptRunner for ScriptedSandbox {
    fn execute(&self, request: &ExecRequest) -> Result<ExecutionOutcome> {
        match self.queue.borrow_mut().pop_front() {
            Some(ScriptedOutcome::Succeed) => {
                if let Some(parent) = request.output_scene.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&request.output_scene, b"scripted scene")?;
                Ok(ExecutionOutcome::Succeeded {
                    scene_file: request.output_scene.clone(),
                })
            }
            Some(ScriptedOutcome::ScriptError(message)) => {
                Ok(ExecutionOutcome::ScriptError { message })
            }
            Some(ScriptedOutcome::TimedOut(elapsed_secs)) => {
                Ok(ExecutionOutcome::TimedOut { elapsed_secs })
            }
            Some(ScriptedOutcome::EngineCrashed(message)) => {
                Ok(ExecutionOutcome::EngineCrashed { message })
            }
            None => Err(anyhow!("scripted sandbox exhausted")),
        }
    }
}

/// Queued result for [`ScriptedRenderer`].
pub enum ScriptedRender {
    /// Touch every requested view file and return the collected set.
    Succeed,
    Fail(String),
}

/// Renderer double that materializes the requested views as empty files.
pub struct ScriptedRenderer {
    queue: RefCell<VecDeque<ScriptedRender>>,
}

impl ScriptedRenderer {
    pub fn new(queue: Vec<ScriptedRender>) -> Self {
        Self {
            queue: RefCell::new(queue.into()),
        }
    }
}

impl Renderer for ScriptedRenderer {
    fn render(&self, request: &RenderRequest) -> Result<crate::core::types::RenderSet> {
        match self.queue.borrow_mut().pop_front() {
            Some(ScriptedRender::Succeed) => {
                fs::create_dir_all(&request.render_dir)?;
                for name in request.view_spec.view_names() {
                    fs::write(request.render_dir.join(format!("view_{name}.png")), b"img")?;
                }
                collect_render_set(&request.render_dir, &request.view_spec)
            }
            Some(ScriptedRender::Fail(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted renderer exhausted")),
        }
    }
}

/// Critic double that replays queued critique records.
pub struct ScriptedCritic {
    queue: RefCell<VecDeque<CritiqueResult>>,
    requests: Rc<RefCell<Vec<CritiqueRequest>>>,
}

impl ScriptedCritic {
    pub fn new(queue: Vec<CritiqueResult>) -> Self {
        Self {
            queue: RefCell::new(queue.into()),
            requests: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Rc<RefCell<Vec<CritiqueRequest>>> {
        Rc::clone(&self.requests)
    }
}

impl Critic for ScriptedCritic {
    fn critique(&self, request: &CritiqueRequest) -> Result<CritiqueResult> {
        self.requests.borrow_mut().push(request.clone());
        self.queue
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted critic exhausted"))
    }
}

/// Critique with the given total under the default rubric, distributing the
/// points across dimensions. Non-accepting totals carry a difference
/// statement so the record satisfies the rubric contract.
pub fn critique_with_total(total: u32) -> CritiqueResult {
    let rubric = Rubric::default();
    let mut remaining = total.min(rubric.max_total());
    let scores: Vec<u32> = rubric
        .dimensions
        .iter()
        .map(|_| {
            let score = remaining.min(rubric.scale_max);
            remaining -= score;
            score
        })
        .collect();
    rubric
        .score(
            scores,
            vec![format!("scripted difference at total {total}")],
            format!("scripted critique (total {total})"),
        )
        .expect("scripted critique should satisfy the rubric")
}

/// Iteration whose critique scored `total`, for selection and storage tests.
pub fn scored_iteration(index: u32, total: u32) -> Iteration {
    Iteration {
        index,
        script: format!("# scripted iteration {index}"),
        outcome: ExecutionOutcome::ScriptError {
            message: "scripted failure".to_string(),
        },
        renders: None,
        critique: critique_with_total(total),
        duration_ms: 1,
    }
}

/// Temporary output root for lifecycle tests, removed on drop.
pub struct TestOutputRoot {
    temp: tempfile::TempDir,
}

impl TestOutputRoot {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir()?,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}

/// Minimal running session rooted under `output_dir`, for storage tests.
pub fn sample_session(output_dir: &Path) -> Session {
    Session {
        id: "sess-test".to_string(),
        prompt: "a wooden chair".to_string(),
        mode: Mode::Create,
        created_at: Utc::now(),
        output_dir: output_dir.to_path_buf(),
        status: SessionStatus::Running,
        clarification: ClarificationExchange::default(),
        iterations: Vec::new(),
        selected: None,
    }
}
