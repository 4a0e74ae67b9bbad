//! Script generator: assembles the model context and extracts the script.
//!
//! Pure text production — all side effects happen downstream in the sandbox.
//! On repeated iterations the prior script and the prior critique's
//! remaining-difference statements are always part of the rendered prompt, so
//! refinement is incremental rather than a rewrite.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use tracing::{debug, instrument};

use crate::core::types::Mode;
use crate::llm::{CompletionRequest, TextModel};

const CREATE_TEMPLATE: &str = include_str!("prompts/create.md");
const EDIT_TEMPLATE: &str = include_str!("prompts/edit.md");

/// Everything the generator may draw on for one attempt.
///
/// Owned values so test doubles can capture the exact context they received.
#[derive(Debug, Clone)]
pub struct GenContext {
    /// The user's original prompt.
    pub prompt: String,
    /// Folded clarification answers, rendered as an additional-details block.
    pub details: Option<String>,
    pub mode: Mode,
    pub reference_image: Option<PathBuf>,
    pub goal_images: Vec<PathBuf>,
    /// Script from the previous sealed iteration, if any.
    pub prior_script: Option<String>,
    /// Feedback block from the previous iteration's critique (real or
    /// synthetic), if any.
    pub prior_feedback: Option<String>,
    /// 1-based iteration this context is assembled for.
    pub iteration: u32,
}

/// Abstraction over script generation backends.
pub trait ScriptGenerator {
    /// Produce the next mutation script as plain text.
    fn generate(&self, ctx: &GenContext) -> Result<String>;
}

/// Generator backed by the configured text/vision model.
pub struct ModelScriptGenerator {
    model: Box<dyn TextModel>,
}

impl ModelScriptGenerator {
    pub fn new(model: Box<dyn TextModel>) -> Self {
        Self { model }
    }

    fn render_prompt(&self, ctx: &GenContext) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("create", CREATE_TEMPLATE)
            .expect("create template should be valid");
        env.add_template("edit", EDIT_TEMPLATE)
            .expect("edit template should be valid");

        let name = match ctx.mode {
            Mode::Create => "create",
            Mode::Edit => "edit",
        };
        let template = env.get_template(name)?;
        let rendered = template.render(context! {
            prompt => ctx.prompt.trim(),
            details => ctx.details.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            has_reference => ctx.reference_image.is_some(),
            has_goal_images => !ctx.goal_images.is_empty(),
            prior_script => ctx.prior_script.as_deref().map(str::trim).filter(|s| !s.is_empty()),
            feedback => ctx.prior_feedback.as_deref().map(str::trim).unwrap_or("None recorded."),
            iteration => ctx.iteration,
        })?;
        Ok(rendered)
    }
}

impl ScriptGenerator for ModelScriptGenerator {
    #[instrument(skip_all, fields(iteration = ctx.iteration, mode = ?ctx.mode))]
    fn generate(&self, ctx: &GenContext) -> Result<String> {
        let prompt = self.render_prompt(ctx)?;

        // Reference and goal images ride along so the model can aim at them.
        let mut images: Vec<PathBuf> = Vec::new();
        if let Some(reference) = &ctx.reference_image {
            images.push(reference.clone());
        }
        images.extend(ctx.goal_images.iter().cloned());

        let response = self
            .model
            .complete(&CompletionRequest {
                system: None,
                prompt,
                images,
                max_tokens: Some(4000),
            })
            .context("generate scene script")?;

        let script = extract_code(&response)?;
        debug!(chars = script.len(), "script extracted");
        Ok(script)
    }
}

/// Pull the script out of a model response: fenced ```python block first,
/// then any fenced block, then a bare-code heuristic.
pub fn extract_code(response: &str) -> Result<String> {
    use std::sync::LazyLock;
    static PYTHON_FENCE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"(?s)```python\s*\n(.*?)```").unwrap()
    });
    static ANY_FENCE: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?s)```\s*\n(.*?)```").unwrap());

    for pattern in [&*PYTHON_FENCE, &*ANY_FENCE] {
        if let Some(captures) = pattern.captures(response) {
            let code = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            if !code.is_empty() {
                return Ok(code.to_string());
            }
        }
    }

    let trimmed = response.trim();
    if trimmed.starts_with("import") || trimmed.starts_with('#') || trimmed.starts_with("bpy.") {
        return Ok(trimmed.to_string());
    }

    bail!("model response contains no script");
}
