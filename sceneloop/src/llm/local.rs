//! Local Ollama-compatible chat backend.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{CallError, CompletionRequest, TextModel, image_base64, with_retries};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Chat client for a local Ollama-compatible server.
pub struct LocalModel {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
}

impl LocalModel {
    pub fn new(base_url: String, model: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    fn build_body(&self, request: &CompletionRequest) -> Result<Value> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }

        let mut user = json!({ "role": "user", "content": request.prompt });
        if !request.images.is_empty() {
            let images: Result<Vec<String>> =
                request.images.iter().map(|p| image_base64(p)).collect();
            user["images"] = json!(images?);
        }
        messages.push(user);

        Ok(json!({ "model": self.model, "messages": messages, "stream": false }))
    }

    fn call_once(&self, body: &Value) -> Result<String, CallError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(body)
            .send()
            .map_err(|err| {
                CallError::Transient(anyhow!("local model request failed: {err}"))
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CallError::Transient(anyhow!("local model returned {status}")));
        }
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(CallError::Fatal(anyhow!(
                "local model returned {status}: {}",
                detail.chars().take(500).collect::<String>()
            )));
        }

        let payload: Value = response
            .json()
            .map_err(|e| CallError::Fatal(anyhow!("parse local model response: {e}")))?;
        payload["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CallError::Fatal(anyhow!("local model response has no content")))
    }

    /// Reachability check used by `doctor`: lists installed models.
    pub fn probe(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .with_context(|| format!("reach local model server at {}", self.base_url))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "local model server at {} returned {}",
                self.base_url,
                response.status()
            ));
        }
        Ok(())
    }
}

impl TextModel for LocalModel {
    #[instrument(skip_all, fields(model = %self.model, images = request.images.len()))]
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = self.build_body(request)?;
        let content = with_retries("local completion", RETRY_ATTEMPTS, RETRY_BACKOFF, || {
            self.call_once(&body)
        })?;
        debug!(chars = content.len(), "model responded");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_images_as_bare_base64() {
        let temp = tempfile::tempdir().expect("tempdir");
        let image = temp.path().join("view_front.png");
        std::fs::write(&image, b"png").expect("write");

        let model = LocalModel::new(
            "http://localhost:11434/".to_string(),
            "llava".to_string(),
        )
        .expect("model");
        let request = CompletionRequest {
            system: None,
            prompt: "score this".to_string(),
            images: vec![image],
            max_tokens: None,
        };
        let body = model.build_body(&request).expect("body");

        assert_eq!(body["model"], "llava");
        assert_eq!(body["stream"], false);
        let images = body["messages"][0]["images"].as_array().expect("images");
        assert_eq!(images.len(), 1);
        // bare base64, not a data URL
        assert!(!images[0].as_str().expect("b64").contains("data:"));
        assert_eq!(model.base_url, "http://localhost:11434");
    }
}
