//! Loop-level harness tests for full session lifecycle scenarios.
//!
//! These tests drive the pipeline through multiple iterations with scripted
//! collaborators to verify end-to-end behavior: iteration accounting, failure
//! absorption, feedback threading, exhaustion selection, clarification
//! folding, cancellation, and manifest persistence.

use anyhow::Result;

use sceneloop::core::rubric::Rubric;
use sceneloop::core::types::{ExecutionOutcome, SessionStatus};
use sceneloop::generator::{GenContext, ScriptGenerator};
use sceneloop::io::store::load_manifest;
use sceneloop::pipeline::{
    CancelToken, NoClarification, Pipeline, PipelineOptions,
};
use sceneloop::session::{ClarificationEntry, ClarificationExchange, SessionConfig};
use sceneloop::test_support::{
    ScriptedCritic, ScriptedGate, ScriptedGenerator, ScriptedOutcome, ScriptedRender,
    ScriptedRenderer, ScriptedSandbox, TestOutputRoot, critique_with_total,
};

fn pipeline(
    generator: ScriptedGenerator,
    sandbox: ScriptedSandbox,
    renderer: ScriptedRenderer,
    critic: ScriptedCritic,
) -> Pipeline<ScriptedGenerator, ScriptedSandbox, ScriptedRenderer, ScriptedCritic> {
    Pipeline::new(
        generator,
        sandbox,
        renderer,
        critic,
        Rubric::default(),
        PipelineOptions::default(),
    )
}

fn config(root: &TestOutputRoot) -> SessionConfig {
    SessionConfig {
        interactive: false,
        ..SessionConfig::new("a wooden chair", root.path())
    }
}

/// Full lifecycle: iteration 1 scores below threshold, iteration 2 passes.
///
/// Verifies: gapless 1-based indices, refinement context carrying the prior
/// script and the prior critique's differences, monotonic termination (no
/// third generation is attempted), and per-iteration artifacts on disk.
#[test]
fn failing_then_passing_critique_stops_at_second_iteration() {
    let root = TestOutputRoot::new().expect("root");
    let generator = ScriptedGenerator::returning(vec![
        Ok("# attempt one".to_string()),
        Ok("# attempt two".to_string()),
    ]);
    let contexts = generator.contexts();

    let pipeline = pipeline(
        generator,
        ScriptedSandbox::new(vec![ScriptedOutcome::Succeed, ScriptedOutcome::Succeed]),
        ScriptedRenderer::new(vec![ScriptedRender::Succeed, ScriptedRender::Succeed]),
        // A third critique is queued; monotonic termination means it is
        // never consumed.
        ScriptedCritic::new(vec![
            critique_with_total(5),
            critique_with_total(9),
            critique_with_total(9),
        ]),
    );

    let session = pipeline
        .run(&config(&root), &mut NoClarification)
        .expect("run");

    assert_eq!(session.status, SessionStatus::Passed);
    assert_eq!(session.selected, Some(2));
    let indices: Vec<u32> = session.iterations.iter().map(|it| it.index).collect();
    assert_eq!(indices, vec![1, 2]);

    let contexts = contexts.borrow();
    assert_eq!(contexts.len(), 2);
    assert!(contexts[0].prior_script.is_none());
    assert!(contexts[0].prior_feedback.is_none());
    assert_eq!(contexts[1].prior_script.as_deref(), Some("# attempt one"));
    assert!(
        contexts[1]
            .prior_feedback
            .as_deref()
            .expect("feedback")
            .contains("scripted difference at total 5")
    );

    for index in 1..=2u32 {
        let iter_dir = session
            .output_dir
            .join("iterations")
            .join(index.to_string());
        assert!(iter_dir.join("script.py").is_file());
        assert!(iter_dir.join("outcome.json").is_file());
        assert!(iter_dir.join("critique.json").is_file());
    }
    assert!(session.output_dir.join("final/model.blend").is_file());
    assert!(session.output_dir.join("final/primary.png").is_file());
}

/// Exhaustion selection: totals [4, 7, 6] with a budget of 3 end the session
/// `exhausted` and present iteration 2.
#[test]
fn exhausted_session_selects_highest_scoring_iteration() {
    let root = TestOutputRoot::new().expect("root");
    let pipeline = pipeline(
        ScriptedGenerator::returning(vec![
            Ok("# v1".to_string()),
            Ok("# v2".to_string()),
            Ok("# v3".to_string()),
        ]),
        ScriptedSandbox::new(vec![
            ScriptedOutcome::Succeed,
            ScriptedOutcome::Succeed,
            ScriptedOutcome::Succeed,
        ]),
        ScriptedRenderer::new(vec![
            ScriptedRender::Succeed,
            ScriptedRender::Succeed,
            ScriptedRender::Succeed,
        ]),
        ScriptedCritic::new(vec![
            critique_with_total(4),
            critique_with_total(7),
            critique_with_total(6),
        ]),
    );

    let session_config = SessionConfig {
        max_iterations: 3,
        ..config(&root)
    };
    let session = pipeline
        .run(&session_config, &mut NoClarification)
        .expect("run");

    assert_eq!(session.status, SessionStatus::Exhausted);
    assert_eq!(session.selected, Some(2));
    assert_eq!(session.iterations.len(), 3);
}

/// Failure feedback threading: a timeout in iteration 1 must be visible in
/// the context assembled for iteration 2.
#[test]
fn timeout_failure_feeds_into_next_generation_context() {
    let root = TestOutputRoot::new().expect("root");
    let generator = ScriptedGenerator::returning(vec![
        Ok("# slow script".to_string()),
        Ok("# fast script".to_string()),
    ]);
    let contexts = generator.contexts();

    let pipeline = pipeline(
        generator,
        ScriptedSandbox::new(vec![
            ScriptedOutcome::TimedOut(120),
            ScriptedOutcome::Succeed,
        ]),
        ScriptedRenderer::new(vec![ScriptedRender::Succeed]),
        ScriptedCritic::new(vec![critique_with_total(10)]),
    );

    let session = pipeline
        .run(&config(&root), &mut NoClarification)
        .expect("run");

    assert_eq!(session.status, SessionStatus::Passed);
    assert_eq!(session.selected, Some(2));

    let first = session.iteration(1).expect("iteration 1");
    assert_eq!(first.outcome, ExecutionOutcome::TimedOut { elapsed_secs: 120 });
    assert_eq!(first.critique.total, 0);
    assert!(!first.critique.differences.is_empty());

    let contexts = contexts.borrow();
    assert!(
        contexts[1]
            .prior_feedback
            .as_deref()
            .expect("feedback")
            .contains("timed out after 120s"),
        "timeout must thread into the next generation context"
    );
}

/// Every failure class consumes an iteration slot: the budget bounds total
/// engine invocations regardless of the failure rate.
#[test]
fn failures_consume_slots_and_never_retry_in_place() {
    let root = TestOutputRoot::new().expect("root");
    let pipeline = pipeline(
        ScriptedGenerator::returning(vec![
            Err("model offline".to_string()),
            Ok("# crash".to_string()),
            Ok("# bad".to_string()),
        ]),
        ScriptedSandbox::new(vec![
            ScriptedOutcome::EngineCrashed("signal 11".to_string()),
            ScriptedOutcome::ScriptError("NameError".to_string()),
        ]),
        ScriptedRenderer::new(Vec::new()),
        ScriptedCritic::new(Vec::new()),
    );

    let session_config = SessionConfig {
        max_iterations: 3,
        ..config(&root)
    };
    let session = pipeline
        .run(&session_config, &mut NoClarification)
        .expect("run");

    assert_eq!(session.status, SessionStatus::Exhausted);
    assert_eq!(session.iterations.len(), 3);
    let indices: Vec<u32> = session.iterations.iter().map(|it| it.index).collect();
    assert_eq!(indices, vec![1, 2, 3]);

    // Exactly one outcome variant per iteration, critique always present.
    assert!(matches!(
        session.iteration(1).expect("it1").outcome,
        ExecutionOutcome::ScriptError { .. }
    ));
    assert!(matches!(
        session.iteration(2).expect("it2").outcome,
        ExecutionOutcome::EngineCrashed { .. }
    ));
    assert!(matches!(
        session.iteration(3).expect("it3").outcome,
        ExecutionOutcome::ScriptError { .. }
    ));
    for iteration in &session.iterations {
        assert!(!iteration.critique.accept);
        assert!(!iteration.critique.differences.is_empty());
    }

    // Failed iterations remain on disk for postmortem inspection.
    for index in 1..=3u32 {
        let iter_dir = session
            .output_dir
            .join("iterations")
            .join(index.to_string());
        assert!(iter_dir.join("outcome.json").is_file());
    }
}

/// A render failure is treated identically to an execution failure.
#[test]
fn render_failure_is_a_non_passing_iteration() {
    let root = TestOutputRoot::new().expect("root");
    let generator = ScriptedGenerator::returning(vec![
        Ok("# v1".to_string()),
        Ok("# v2".to_string()),
    ]);
    let contexts = generator.contexts();

    let pipeline = pipeline(
        generator,
        ScriptedSandbox::new(vec![ScriptedOutcome::Succeed, ScriptedOutcome::Succeed]),
        ScriptedRenderer::new(vec![
            ScriptedRender::Fail("viewpoint 'cam_main' not found".to_string()),
            ScriptedRender::Succeed,
        ]),
        ScriptedCritic::new(vec![critique_with_total(10)]),
    );

    let session = pipeline
        .run(&config(&root), &mut NoClarification)
        .expect("run");

    assert_eq!(session.status, SessionStatus::Passed);
    assert_eq!(session.selected, Some(2));
    let first = session.iteration(1).expect("iteration 1");
    assert!(first.outcome.is_success());
    assert!(first.renders.is_none());
    assert_eq!(first.critique.total, 0);

    let contexts = contexts.borrow();
    assert!(
        contexts[1]
            .prior_feedback
            .as_deref()
            .expect("feedback")
            .contains("cam_main")
    );
}

/// Clarification answers are recorded on the session and folded into every
/// generation context.
#[test]
fn clarification_exchange_is_folded_into_generation_context() {
    let root = TestOutputRoot::new().expect("root");
    let generator = ScriptedGenerator::returning(vec![Ok("# v1".to_string())]);
    let contexts = generator.contexts();

    let pipeline = pipeline(
        generator,
        ScriptedSandbox::new(vec![ScriptedOutcome::Succeed]),
        ScriptedRenderer::new(vec![ScriptedRender::Succeed]),
        ScriptedCritic::new(vec![critique_with_total(10)]),
    );

    let mut gate = ScriptedGate(ClarificationExchange {
        entries: vec![ClarificationEntry {
            question: "What kind of table?".to_string(),
            answer: "dining table".to_string(),
        }],
    });
    let session_config = SessionConfig {
        interactive: true,
        ..config(&root)
    };
    let session = pipeline.run(&session_config, &mut gate).expect("run");

    assert_eq!(session.clarification.entries.len(), 1);
    let contexts = contexts.borrow();
    assert!(
        contexts[0]
            .details
            .as_deref()
            .expect("details")
            .contains("dining table")
    );
}

/// A generator that cancels the session after producing its first script.
struct CancellingGenerator {
    inner: ScriptedGenerator,
    cancel: CancelToken,
}

impl ScriptGenerator for CancellingGenerator {
    fn generate(&self, ctx: &GenContext) -> Result<String> {
        let script = self.inner.generate(ctx)?;
        self.cancel.cancel();
        Ok(script)
    }
}

/// Cancellation mid-session seals the session `exhausted` with the best
/// completed iteration, never `passed`.
#[test]
fn cancelled_session_seals_exhausted_with_best_effort() {
    let root = TestOutputRoot::new().expect("root");
    let cancel = CancelToken::new();
    let generator = CancellingGenerator {
        inner: ScriptedGenerator::returning(vec![Ok("# v1".to_string())]),
        cancel: cancel.clone(),
    };

    let pipeline = Pipeline::new(
        generator,
        ScriptedSandbox::new(vec![ScriptedOutcome::Succeed]),
        ScriptedRenderer::new(Vec::new()),
        ScriptedCritic::new(Vec::new()),
        Rubric::default(),
        PipelineOptions::default(),
    );

    let session = pipeline
        .run_with_cancel(&config(&root), &mut NoClarification, &cancel)
        .expect("run");

    assert_eq!(session.status, SessionStatus::Exhausted);
    assert_eq!(session.iterations.len(), 1);
    assert_eq!(session.selected, Some(1));
}

/// Round-trip: a written manifest reproduces the final status and selected
/// iteration index.
#[test]
fn manifest_round_trips_after_session_end() {
    let root = TestOutputRoot::new().expect("root");
    let pipeline = pipeline(
        ScriptedGenerator::returning(vec![Ok("# v1".to_string()), Ok("# v2".to_string())]),
        ScriptedSandbox::new(vec![ScriptedOutcome::Succeed, ScriptedOutcome::Succeed]),
        ScriptedRenderer::new(vec![ScriptedRender::Succeed, ScriptedRender::Succeed]),
        ScriptedCritic::new(vec![critique_with_total(7), critique_with_total(6)]),
    );

    let session_config = SessionConfig {
        max_iterations: 2,
        ..config(&root)
    };
    let session = pipeline
        .run(&session_config, &mut NoClarification)
        .expect("run");
    assert_eq!(session.status, SessionStatus::Exhausted);

    let loaded = load_manifest(&session.output_dir.join("manifest.json")).expect("reload");
    assert_eq!(loaded.status, session.status);
    assert_eq!(loaded.selected, session.selected);
    assert_eq!(loaded.selected, Some(1));
    assert_eq!(loaded.iterations.len(), 2);
    assert_eq!(loaded, session);
}
