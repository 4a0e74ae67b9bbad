//! Hosted OpenAI-compatible chat backend.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{CallError, CompletionRequest, TextModel, image_data_url, with_retries};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Chat-completions client for hosted OpenAI-compatible APIs.
pub struct HostedModel {
    client: reqwest::blocking::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HostedModel {
    pub fn new(model: String, api_key: String) -> Result<Self> {
        Self::with_base_url(DEFAULT_BASE_URL.to_string(), model, api_key)
    }

    pub fn with_base_url(base_url: String, model: String, api_key: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        })
    }

    fn build_body(&self, request: &CompletionRequest) -> Result<Value> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }

        if request.images.is_empty() {
            messages.push(json!({ "role": "user", "content": request.prompt }));
        } else {
            let mut content = Vec::new();
            for image in &request.images {
                content.push(json!({
                    "type": "image_url",
                    "image_url": { "url": image_data_url(image)?, "detail": "high" },
                }));
            }
            content.push(json!({ "type": "text", "text": request.prompt }));
            messages.push(json!({ "role": "user", "content": content }));
        }

        let mut body = json!({ "model": self.model, "messages": messages });
        if let Some(max_tokens) = request.max_tokens {
            body["max_completion_tokens"] = json!(max_tokens);
        }
        Ok(body)
    }

    fn call_once(&self, body: &Value) -> Result<String, CallError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .map_err(classify_send_error)?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CallError::Transient(anyhow!(
                "chat completion returned {status}"
            )));
        }
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(CallError::Fatal(anyhow!(
                "chat completion returned {status}: {}",
                detail.chars().take(500).collect::<String>()
            )));
        }

        let payload: Value = response
            .json()
            .map_err(|e| CallError::Fatal(anyhow!("parse chat response: {e}")))?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CallError::Fatal(anyhow!("chat response has no message content")))
    }
}

impl TextModel for HostedModel {
    #[instrument(skip_all, fields(model = %self.model, images = request.images.len()))]
    fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = self.build_body(request)?;
        let content = with_retries("chat completion", RETRY_ATTEMPTS, RETRY_BACKOFF, || {
            self.call_once(&body)
        })?;
        debug!(chars = content.len(), "model responded");
        Ok(content)
    }
}

fn classify_send_error(err: reqwest::Error) -> CallError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        CallError::Transient(anyhow!("chat completion request failed: {err}"))
    } else {
        CallError::Fatal(anyhow!("chat completion request failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> HostedModel {
        HostedModel::new("gpt-4o".to_string(), "sk-test".to_string()).expect("model")
    }

    #[test]
    fn text_only_request_uses_plain_content() {
        let body = model()
            .build_body(&CompletionRequest::text("describe a chair"))
            .expect("body");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "describe a chair");
    }

    #[test]
    fn image_request_builds_content_parts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let image = temp.path().join("view_front.png");
        std::fs::write(&image, b"png").expect("write");

        let request = CompletionRequest {
            system: Some("you are a critic".to_string()),
            prompt: "score this".to_string(),
            images: vec![image],
            max_tokens: Some(2000),
        };
        let body = model().build_body(&request).expect("body");

        assert_eq!(body["messages"][0]["role"], "system");
        let content = &body["messages"][1]["content"];
        assert_eq!(content[0]["type"], "image_url");
        assert!(
            content[0]["image_url"]["url"]
                .as_str()
                .expect("url")
                .starts_with("data:image/png;base64,")
        );
        assert_eq!(content[1]["type"], "text");
        assert_eq!(body["max_completion_tokens"], 2000);
    }
}
