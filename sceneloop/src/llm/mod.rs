//! Text/vision model capability behind a single object-safe trait.
//!
//! The pipeline treats the model as "given a prompt and context, produce
//! text"; which wire protocol serves it is a configuration detail. Transient
//! network failures are retried here with bounded linear backoff — those
//! retries are invisible to the iteration count.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

use crate::io::config::{Config, LlmBackend};

pub mod hosted;
pub mod local;

/// One request to the model: optional system framing, the user prompt, and
/// any images the model should look at.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub images: Vec<PathBuf>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

/// Capability used by the generator, critic, and clarification stage.
pub trait TextModel {
    fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Build the configured backend. The hosted backend requires a credential
/// (config field or environment override).
pub fn create_model(config: &Config) -> Result<Box<dyn TextModel>> {
    match config.llm.backend {
        LlmBackend::Hosted => {
            let api_key = config.api_key().ok_or_else(|| {
                anyhow!(
                    "llm.api_key is not configured and {} is unset",
                    crate::io::config::API_KEY_ENV
                )
            })?;
            Ok(Box::new(hosted::HostedModel::new(
                config.llm.model_name.clone(),
                api_key,
            )?))
        }
        LlmBackend::Local => Ok(Box::new(local::LocalModel::new(
            config.llm.base_url.clone(),
            config.llm.model_name.clone(),
        )?)),
    }
}

/// Error classification for [`with_retries`].
pub(crate) enum CallError {
    /// Network hiccup, timeout, or a retryable HTTP status.
    Transient(anyhow::Error),
    /// Anything that will not improve by retrying (bad request, auth).
    Fatal(anyhow::Error),
}

/// Run `call` up to `attempts` times, sleeping `backoff * attempt` between
/// transient failures.
pub(crate) fn with_retries<T>(
    label: &str,
    attempts: u32,
    backoff: Duration,
    mut call: impl FnMut() -> Result<T, CallError>,
) -> Result<T> {
    let mut last_err = None;
    for attempt in 1..=attempts {
        match call() {
            Ok(value) => return Ok(value),
            Err(CallError::Fatal(err)) => return Err(err),
            Err(CallError::Transient(err)) => {
                warn!(label, attempt, err = %err, "transient model failure");
                last_err = Some(err);
                if attempt < attempts {
                    std::thread::sleep(backoff * attempt);
                }
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow!("no attempts made"))
        .context(format!("{label} failed after {attempts} attempts")))
}

/// Encode an image file as a `data:` URL for vision-capable chat APIs.
pub(crate) fn image_data_url(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read image {}", path.display()))?;
    let media_type = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    Ok(format!("data:{media_type};base64,{}", BASE64.encode(bytes)))
}

/// Encode an image file as bare base64 (Ollama-style payloads).
pub(crate) fn image_base64(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("read image {}", path.display()))?;
    Ok(BASE64.encode(bytes))
}
