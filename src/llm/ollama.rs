use std::sync::RwLock;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Completer, CompletionError};
use crate::config::LlmConfig;

const TEMPERATURE: f32 = 0.1;

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

/// Ollama `/api/generate` client. The model can be switched at runtime.
pub struct OllamaCompleter {
    client: reqwest::blocking::Client,
    base_url: String,
    model: RwLock<String>,
}

impl OllamaCompleter {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: RwLock::new(config.model.clone()),
        })
    }

    fn generate(&self, prompt: &str, format: Option<&str>) -> Result<String, CompletionError> {
        let model = self.model_name();
        let request = GenerateRequest {
            model: &model,
            prompt,
            stream: false,
            format,
            options: GenerateOptions {
                temperature: TEMPERATURE,
            },
        };

        log::debug!("model={model} prompt_chars={} requesting completion", prompt.chars().count());
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, resp.text().unwrap_or_default()));
        }

        let body: GenerateResponse = resp
            .json()
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;
        Ok(body.response)
    }
}

impl Completer for OllamaCompleter {
    fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.generate(prompt, None)
    }

    fn complete_json(&self, prompt: &str) -> Result<String, CompletionError> {
        self.generate(prompt, Some("json"))
    }

    fn set_model(&self, model: &str) -> Result<(), CompletionError> {
        let mut current = self
            .model
            .write()
            .map_err(|e| CompletionError::InvalidResponse(format!("model lock poisoned: {e}")))?;
        log::info!("LLM model updated from {} to {model}", *current);
        *current = model.to_string();
        Ok(())
    }

    /// Names of the models installed on the Ollama host.
    fn list_models(&self) -> Result<Vec<String>, CompletionError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .map_err(classify)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, resp.text().unwrap_or_default()));
        }

        let body: Value = resp.json().map_err(classify)?;
        let models = body
            .get("models")
            .and_then(|v| v.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }

    fn model_name(&self) -> String {
        self.model.read().map(|m| m.clone()).unwrap_or_default()
    }
}

fn classify(err: reqwest::Error) -> CompletionError {
    if err.is_timeout() {
        CompletionError::Timeout
    } else if err.is_connect() || err.is_request() {
        CompletionError::Connection(err.to_string())
    } else {
        CompletionError::InvalidResponse(err.to_string())
    }
}

fn status_error(status: StatusCode, message: String) -> CompletionError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        CompletionError::RateLimited
    } else {
        CompletionError::Upstream {
            status: status.as_u16(),
            message,
        }
    }
}
