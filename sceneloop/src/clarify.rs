//! One-shot clarification gate, run at most once before iteration 1.
//!
//! Abstractly a finite-state branch, implemented as a plain conditional
//! stage: ask the model whether the prompt is ambiguous, collect answers to
//! 2–3 targeted questions, fold them into the session context. Every failure
//! path — an unparseable model response, a declining user — fails open to an
//! empty exchange; clarification must never block a session.

use anyhow::Result;
use minijinja::{Environment, context};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::critic::extract_json;
use crate::llm::{CompletionRequest, TextModel};
use crate::session::{ClarificationEntry, ClarificationExchange};

const CLARIFY_TEMPLATE: &str = include_str!("prompts/clarify.md");

const MIN_QUESTIONS: usize = 2;
const MAX_QUESTIONS: usize = 3;

/// Where clarification answers come from (interactive stdin in the CLI,
/// scripted answers in tests).
pub trait AnswerSource {
    /// Answer the questions in order. Returning fewer answers than questions
    /// (or an error) declines the exchange.
    fn answer(&mut self, questions: &[String]) -> Result<Vec<String>>;
}

/// Decide whether `prompt` needs clarification and, if so, which questions
/// to ask. Returns an empty list when the prompt is judged clear.
#[instrument(skip_all)]
pub fn screen_prompt(model: &dyn TextModel, prompt: &str) -> Vec<String> {
    let mut env = Environment::new();
    env.add_template("clarify", CLARIFY_TEMPLATE)
        .expect("clarify template should be valid");
    let rendered = env
        .get_template("clarify")
        .expect("registered above")
        .render(context! { prompt => prompt.trim() })
        .expect("clarify template rendering should not fail");

    let response = match model.complete(&CompletionRequest::text(rendered)) {
        Ok(response) => response,
        Err(err) => {
            // Ambiguity screening is best-effort; proceed with the raw prompt.
            warn!(err = %err, "clarity check failed, proceeding without questions");
            return Vec::new();
        }
    };

    parse_questions(&response)
}

fn parse_questions(response: &str) -> Vec<String> {
    let Some(raw) = extract_json(response) else {
        warn!("clarity response had no JSON, proceeding without questions");
        return Vec::new();
    };
    let Ok(value) = serde_json::from_str::<Value>(&raw) else {
        warn!("clarity response JSON did not parse, proceeding without questions");
        return Vec::new();
    };

    if value["needs_clarification"].as_bool() != Some(true) {
        return Vec::new();
    }

    let questions: Vec<String> = value["questions"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if questions.len() < MIN_QUESTIONS {
        // A single vague question is not worth an interruption.
        debug!(count = questions.len(), "too few questions, treating prompt as clear");
        return Vec::new();
    }
    questions.into_iter().take(MAX_QUESTIONS).collect()
}

/// Run the full gate: screen, ask, fold. Produces the (possibly empty)
/// exchange recorded on the session.
pub fn run_clarification(
    model: &dyn TextModel,
    prompt: &str,
    source: &mut dyn AnswerSource,
) -> Result<ClarificationExchange> {
    let questions = screen_prompt(model, prompt);
    if questions.is_empty() {
        info!("prompt judged unambiguous");
        return Ok(ClarificationExchange::default());
    }

    info!(count = questions.len(), "asking clarification questions");
    let answers = match source.answer(&questions) {
        Ok(answers) => answers,
        Err(err) => {
            warn!(err = %err, "answer collection failed, proceeding without clarification");
            return Ok(ClarificationExchange::default());
        }
    };
    if answers.len() < questions.len() {
        info!("user declined clarification, proceeding with engine defaults");
        return Ok(ClarificationExchange::default());
    }

    let entries = questions
        .into_iter()
        .zip(answers)
        .map(|(question, answer)| ClarificationEntry { question, answer })
        .collect();
    Ok(ClarificationExchange { entries })
}
