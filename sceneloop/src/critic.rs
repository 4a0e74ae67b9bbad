//! Critique adapter: scores rendered views against the target.
//!
//! The model's JSON is extracted, validated against an embedded schema, and
//! then re-derived through the rubric — `total` and `accept` are never
//! trusted from the model. Transient network failures are retried inside the
//! model backend; an unparseable response is an error the orchestrator
//! records as a failed iteration.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use minijinja::{Environment, context};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::rubric::{CritiqueResult, Rubric};
use crate::core::types::{RenderSet, Target};
use crate::llm::{CompletionRequest, TextModel};

const CRITIC_TEMPLATE: &str = include_str!("prompts/critic.md");
const CRITIQUE_SCHEMA: &str = include_str!("../schemas/critique.schema.json");

/// One critique invocation.
#[derive(Debug, Clone)]
pub struct CritiqueRequest {
    pub renders: RenderSet,
    pub target: Target,
    /// Optional style-reference image, shown after the goal images.
    pub style_reference: Option<PathBuf>,
}

/// Abstraction over critique backends.
pub trait Critic {
    fn critique(&self, request: &CritiqueRequest) -> Result<CritiqueResult>;
}

/// Critic backed by the configured vision-capable model.
pub struct ModelCritic {
    model: Box<dyn TextModel>,
    rubric: Rubric,
}

impl ModelCritic {
    pub fn new(model: Box<dyn TextModel>, rubric: Rubric) -> Self {
        Self { model, rubric }
    }

    fn render_prompt(&self, request: &CritiqueRequest) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("critic", CRITIC_TEMPLATE)
            .expect("critic template should be valid");

        let target_text = match &request.target {
            Target::Description { text } => text.clone(),
            Target::GoalImages { images } => format!(
                "Match the attached goal images ({} image(s)).",
                images.len()
            ),
        };

        let template = env.get_template("critic")?;
        let rendered = template.render(context! {
            dimensions => &self.rubric.dimensions,
            scale_max => self.rubric.scale_max,
            target => target_text.trim(),
            has_goal_images => matches!(request.target, Target::GoalImages { .. }),
            has_reference => request.style_reference.is_some(),
        })?;
        Ok(rendered)
    }

    fn parse_response(&self, response: &str) -> Result<CritiqueResult> {
        let raw = extract_json(response)
            .ok_or_else(|| anyhow!("critique response contains no JSON object"))?;
        let value: Value =
            serde_json::from_str(&raw).context("parse critique response as JSON")?;
        validate_critique_json(&value)?;

        let scores_obj = value["scores"]
            .as_object()
            .ok_or_else(|| anyhow!("critique scores must be an object"))?;
        let scores: Vec<u32> = self
            .rubric
            .dimensions
            .iter()
            .map(|name| {
                scores_obj
                    .get(name)
                    .and_then(Value::as_u64)
                    .map(|s| s as u32)
                    .ok_or_else(|| anyhow!("critique is missing a score for '{name}'"))
            })
            .collect::<Result<_>>()?;

        let differences: Vec<String> = value["differences"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let summary = value["summary"].as_str().unwrap_or_default().to_string();

        self.rubric.score(scores, differences, summary)
    }
}

impl Critic for ModelCritic {
    #[instrument(skip_all, fields(views = request.renders.views().len()))]
    fn critique(&self, request: &CritiqueRequest) -> Result<CritiqueResult> {
        let prompt = self.render_prompt(request)?;

        // Rendered views first, then the goal images, then the style ref —
        // the prompt describes the images in this order.
        let mut images: Vec<PathBuf> = request
            .renders
            .views()
            .iter()
            .map(|v| v.image.clone())
            .collect();
        if let Target::GoalImages { images: goals } = &request.target {
            images.extend(goals.iter().cloned());
        }
        if let Some(reference) = &request.style_reference {
            images.push(reference.clone());
        }

        let response = self
            .model
            .complete(&CompletionRequest {
                system: None,
                prompt,
                images,
                max_tokens: Some(2000),
            })
            .context("critique renders")?;

        let critique = self.parse_response(&response)?;
        debug!(total = critique.total, accept = critique.accept, "critique parsed");
        Ok(critique)
    }
}

fn validate_critique_json(instance: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(CRITIQUE_SCHEMA).expect("embedded critique schema should parse");
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("embedded critique schema should compile");
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("critique schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

/// Extract a JSON object from a model response: fenced ```json block, any
/// fenced block, then brace matching.
pub fn extract_json(response: &str) -> Option<String> {
    use std::sync::LazyLock;
    static JSON_FENCE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?s)```json\s*\n(.*?)```").unwrap());
    static ANY_FENCE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?s)```\s*\n(.*?)```").unwrap());

    for pattern in [&*JSON_FENCE, &*ANY_FENCE] {
        if let Some(captures) = pattern.captures(response) {
            let body = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            if body.starts_with('{') {
                return Some(body.to_string());
            }
        }
    }
    balanced_object(response)
}

/// Find the first complete `{...}` object via brace counting, skipping
/// braces inside string literals.
fn balanced_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}
