//! Pipeline orchestrator: the session state machine.
//!
//! Drives generate→execute→render→critique iterations until a critique
//! accepts, the iteration budget runs out, or the session is cancelled.
//! Every per-iteration failure is absorbed into a sealed failed iteration
//! with a synthetic critique — failures consume an iteration slot rather
//! than being retried, bounding external-process invocations to the
//! configured maximum regardless of failure rate. Only setup faults reach
//! the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::rubric::Rubric;
use crate::core::select::best_iteration;
use crate::core::types::{ExecutionOutcome, Mode, SessionStatus, Target, ViewSpec};
use crate::critic::{Critic, CritiqueRequest};
use crate::generator::{GenContext, ScriptGenerator};
use crate::io::engine::{ExecRequest, ScriptRunner};
use crate::io::render::{RenderRequest, Renderer};
use crate::io::store::{self, IterationPaths, SessionPaths};
use crate::session::{ClarificationExchange, Iteration, Session, SessionConfig, mint_session_id};

/// Cooperative cancellation handle. Checked at the top of each iteration and
/// between stages; a cancelled session seals as `exhausted` with the best
/// completed iteration, never `passed`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Clarification seam for the orchestrator; the CLI wires the model-backed
/// gate, tests use scripted exchanges.
pub trait ClarifyGate {
    fn run(&mut self, prompt: &str) -> Result<ClarificationExchange>;
}

/// Gate used in non-interactive runs: never asks anything.
pub struct NoClarification;

impl ClarifyGate for NoClarification {
    fn run(&mut self, _prompt: &str) -> Result<ClarificationExchange> {
        Ok(ClarificationExchange::default())
    }
}

/// Engine-invocation limits shared by both adapters.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub engine_timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            engine_timeout: Duration::from_secs(120),
            output_limit_bytes: 100_000,
        }
    }
}

/// The orchestrator, generic over its four collaborators.
pub struct Pipeline<G, S, R, C> {
    generator: G,
    sandbox: S,
    renderer: R,
    critic: C,
    rubric: Rubric,
    options: PipelineOptions,
}

impl<G, S, R, C> Pipeline<G, S, R, C>
where
    G: ScriptGenerator,
    S: ScriptRunner,
    R: Renderer,
    C: Critic,
{
    pub fn new(
        generator: G,
        sandbox: S,
        renderer: R,
        critic: C,
        rubric: Rubric,
        options: PipelineOptions,
    ) -> Self {
        Self {
            generator,
            sandbox,
            renderer,
            critic,
            rubric,
            options,
        }
    }

    /// Run a session to a terminal state.
    pub fn run(&self, config: &SessionConfig, gate: &mut dyn ClarifyGate) -> Result<Session> {
        self.run_with_cancel(config, gate, &CancelToken::new())
    }

    #[instrument(skip_all, fields(mode = ?config.mode(), max_iterations = config.max_iterations))]
    pub fn run_with_cancel(
        &self,
        config: &SessionConfig,
        gate: &mut dyn ClarifyGate,
        cancel: &CancelToken,
    ) -> Result<Session> {
        config.validate()?;

        let created_at = Utc::now();
        let id = mint_session_id(created_at, |candidate| {
            config.output_root.join(candidate).exists()
        })?;
        let paths = SessionPaths::new(&config.output_root, &id);
        store::create_session_dir(&paths).context("create session directory")?;
        info!(session = %id, dir = %paths.dir.display(), "session started");

        let mut session = Session {
            id,
            prompt: config.prompt.clone(),
            mode: config.mode(),
            created_at,
            output_dir: paths.dir.clone(),
            status: SessionStatus::Running,
            clarification: ClarificationExchange::default(),
            iterations: Vec::new(),
            selected: None,
        };

        if let Err(err) = validate_inputs(config) {
            warn!(err = %err, "session setup failed");
            session.status = SessionStatus::Failed;
            store::write_manifest(&paths, &session)?;
            return Ok(session);
        }

        // Clarification is a one-shot gate, run at most once before
        // iteration 1 and never again. Gate errors fail open.
        if config.interactive {
            session.clarification = match gate.run(&config.prompt) {
                Ok(exchange) => exchange,
                Err(err) => {
                    warn!(err = %err, "clarification gate failed, proceeding without it");
                    ClarificationExchange::default()
                }
            };
        }

        let mut index: u32 = 1;
        loop {
            if cancel.is_cancelled() {
                info!(iterations = session.iterations.len(), "session cancelled");
                self.seal_exhausted(&mut session);
                break;
            }

            let iter_paths = paths.iteration(index);
            iter_paths.prepare()?;

            let ctx = build_context(config, &session, index);
            let iteration = self.run_iteration(config, &iter_paths, ctx, cancel, index)?;
            let accepted = iteration.critique.accept;
            let total = iteration.critique.total;

            store::write_iteration(&iter_paths, &iteration)?;
            session.iterations.push(iteration);
            info!(iteration = index, total, accepted, "iteration sealed");

            if accepted {
                session.status = SessionStatus::Passed;
                session.selected = Some(index);
                break;
            }
            if cancel.is_cancelled() || index >= config.max_iterations {
                self.seal_exhausted(&mut session);
                break;
            }
            index += 1;
        }

        if let Some(selected) = session.selected_iteration() {
            store::finalize(&paths, selected).context("copy final artifacts")?;
        }
        store::write_manifest(&paths, &session)?;
        info!(status = ?session.status, selected = ?session.selected, "session finished");
        Ok(session)
    }

    /// One full attempt. Every stage failure is absorbed into the returned
    /// sealed iteration; `Err` is reserved for faults in our own storage.
    fn run_iteration(
        &self,
        config: &SessionConfig,
        iter_paths: &IterationPaths,
        ctx: GenContext,
        cancel: &CancelToken,
        index: u32,
    ) -> Result<Iteration> {
        let started = Instant::now();

        // Generation fails closed: no retry, the slot is consumed.
        let script = match self.generator.generate(&ctx) {
            Ok(script) => script,
            Err(err) => {
                warn!(iteration = index, err = %format!("{err:#}"), "script generation failed");
                let outcome = ExecutionOutcome::ScriptError {
                    message: format!("script generation failed: {err:#}"),
                };
                return Ok(self.failed_iteration(index, String::new(), outcome, started, None));
            }
        };

        let exec_request = ExecRequest {
            script: script.clone(),
            input_scene: config.starting_scene.clone(),
            output_scene: iter_paths.scene_path.clone(),
            staged_script_path: iter_paths.dir.join("script_run.py"),
            log_path: iter_paths.engine_log_path.clone(),
            timeout: self.options.engine_timeout,
            output_limit_bytes: self.options.output_limit_bytes,
        };
        let outcome = match self.sandbox.execute(&exec_request) {
            Ok(outcome) => outcome,
            // An adapter-internal fault still only costs this slot.
            Err(err) => ExecutionOutcome::EngineCrashed {
                message: format!("{err:#}"),
            },
        };
        if !outcome.is_success() {
            warn!(iteration = index, ?outcome, "execution failed");
            return Ok(self.failed_iteration(index, script, outcome, started, None));
        }
        if cancel.is_cancelled() {
            // Skip render/critique; the loop seals the session as exhausted.
            return Ok(self.failed_iteration(
                index,
                script,
                outcome,
                started,
                Some("session cancelled before rendering"),
            ));
        }

        let render_request = RenderRequest {
            scene_file: iter_paths.scene_path.clone(),
            view_spec: view_spec(config),
            render_dir: iter_paths.render_dir.clone(),
            staged_script_path: iter_paths.dir.join("render_run.py"),
            log_path: iter_paths.render_log_path.clone(),
            timeout: self.options.engine_timeout,
            output_limit_bytes: self.options.output_limit_bytes,
        };
        let renders = match self.renderer.render(&render_request) {
            Ok(renders) => renders,
            Err(err) => {
                // A rendering failure is treated identically to an
                // execution failure.
                warn!(iteration = index, err = %format!("{err:#}"), "render failed");
                let reason = format!("render failed: {err:#}");
                return Ok(self.failed_iteration(index, script, outcome, started, Some(&reason)));
            }
        };

        let critique_request = CritiqueRequest {
            renders: renders.clone(),
            target: critique_target(config),
            style_reference: config.reference_image.clone(),
        };
        let critique = match self.critic.critique(&critique_request) {
            Ok(critique) => critique,
            Err(err) => {
                warn!(iteration = index, err = %format!("{err:#}"), "critique failed");
                self.rubric
                    .synthetic_failure(&format!("critique failed: {err:#}"))
            }
        };

        Ok(Iteration {
            index,
            script,
            outcome,
            renders: Some(renders),
            critique,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Seal a failed attempt with a synthetic zero-score critique. `reason`
    /// overrides the outcome's own failure summary (render failures and
    /// cancellation arrive on a `Succeeded` execution outcome).
    fn failed_iteration(
        &self,
        index: u32,
        script: String,
        outcome: ExecutionOutcome,
        started: Instant,
        reason: Option<&str>,
    ) -> Iteration {
        let reason = reason.map(str::to_string).or_else(|| outcome.failure_summary());
        let reason = reason.unwrap_or_else(|| "iteration failed".to_string());
        Iteration {
            index,
            script,
            outcome,
            renders: None,
            critique: self.rubric.synthetic_failure(&reason),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn seal_exhausted(&self, session: &mut Session) {
        session.status = SessionStatus::Exhausted;
        session.selected = best_iteration(&session.iterations);
    }
}

/// Context assembled for one generation attempt: the original prompt,
/// clarification answers, target images, and the previous sealed iteration's
/// script and feedback (synthetic failure critiques included, so execution
/// errors thread into the next attempt).
fn build_context(config: &SessionConfig, session: &Session, index: u32) -> GenContext {
    let last = session.iterations.last();
    GenContext {
        prompt: config.prompt.clone(),
        details: session.clarification.as_details(),
        mode: config.mode(),
        reference_image: config.reference_image.clone(),
        goal_images: config.goal_images.clone(),
        prior_script: last
            .map(|it| it.script.clone())
            .filter(|script| !script.is_empty()),
        prior_feedback: last.map(|it| it.critique.feedback()),
        iteration: index,
    }
}

fn view_spec(config: &SessionConfig) -> ViewSpec {
    match config.mode() {
        Mode::Create => ViewSpec::Canonical,
        Mode::Edit if !config.edit_views.is_empty() => ViewSpec::Named(config.edit_views.clone()),
        Mode::Edit => ViewSpec::Canonical,
    }
}

fn critique_target(config: &SessionConfig) -> Target {
    if config.mode() == Mode::Edit && !config.goal_images.is_empty() {
        Target::GoalImages {
            images: config.goal_images.clone(),
        }
    } else {
        Target::Description {
            text: config.prompt.clone(),
        }
    }
}

fn validate_inputs(config: &SessionConfig) -> Result<()> {
    let mut required = Vec::new();
    if let Some(scene) = &config.starting_scene {
        required.push(scene);
    }
    if let Some(reference) = &config.reference_image {
        required.push(reference);
    }
    required.extend(config.goal_images.iter());

    for path in required {
        if !path.exists() {
            bail!("input file {} does not exist", path.display());
        }
    }
    Ok(())
}
