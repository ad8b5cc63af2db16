use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::types::{GenerateRequest, LlmClient};
use super::DiagnosisError;

/// Ollama HTTP client for local LLM inference.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaClient {
    /// Create a new OllamaClient. `timeout_secs` is the per-call deadline; a call
    /// that exceeds it fails like any other transport error.
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, DiagnosisError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| DiagnosisError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        })
    }

    /// Client for the endpoint and timeout from the environment (see `config`).
    pub fn from_env() -> Result<Self, DiagnosisError> {
        Self::new(&crate::config::ollama_url(), crate::config::timeout_secs())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Names of the models installed on the Ollama instance.
    pub fn list_models(&self) -> Result<Vec<String>, DiagnosisError> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DiagnosisError::OllamaError {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaTagsResponse = response
            .json()
            .map_err(|e| DiagnosisError::ResponseParsing(e.to_string()))?;

        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    /// Whether the Ollama endpoint answers at all.
    pub fn is_available(&self) -> bool {
        match self.list_models() {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(url = %self.base_url, error = %e, "Ollama not available");
                false
            }
        }
    }

    /// Check whether a model (or a tag of it) is installed.
    pub fn is_model_available(&self, model: &str) -> Result<bool, DiagnosisError> {
        let models = self.list_models()?;
        Ok(models.iter().any(|m| m.starts_with(model)))
    }

    fn map_transport_error(&self, e: reqwest::Error) -> DiagnosisError {
        if e.is_connect() {
            DiagnosisError::OllamaConnection(self.base_url.clone())
        } else if e.is_timeout() {
            DiagnosisError::HttpClient(format!(
                "Request timed out after {}s",
                self.timeout_secs
            ))
        } else {
            DiagnosisError::HttpClient(e.to_string())
        }
    }
}

/// Read an image from disk and base64-encode it for the Ollama API.
fn encode_image(path: &Path) -> Result<String, DiagnosisError> {
    let bytes = std::fs::read(path).map_err(|source| DiagnosisError::ImageRead {
        path: path.display().to_string(),
        source,
    })?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Request body for Ollama /api/generate
#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
    top_p: f32,
}

/// Response body from Ollama /api/generate
#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

/// Response body from Ollama /api/tags
#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModel>,
}

#[derive(Deserialize)]
struct OllamaModel {
    name: String,
}

fn build_request_body(request: &GenerateRequest) -> Result<OllamaGenerateRequest<'_>, DiagnosisError> {
    let images = request
        .images
        .iter()
        .map(|path| encode_image(path))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(OllamaGenerateRequest {
        model: &request.model,
        prompt: &request.prompt,
        system: request.system.as_deref(),
        images,
        stream: false,
        options: OllamaOptions {
            temperature: request.sampling.temperature,
            num_predict: request.sampling.max_output_tokens,
            top_p: request.sampling.top_p,
        },
    })
}

impl LlmClient for OllamaClient {
    fn generate(&self, request: &GenerateRequest) -> Result<String, DiagnosisError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = build_request_body(request)?;

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DiagnosisError::OllamaError {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: OllamaGenerateResponse = response
            .json()
            .map_err(|e| DiagnosisError::ResponseParsing(e.to_string()))?;

        Ok(parsed.response)
    }
}

/// One scripted answer from `MockLlmClient`.
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    /// The call fails as if Ollama were unreachable.
    Fail(String),
}

/// Mock LLM client for testing: replays scripted replies in order and
/// records every request it receives.
#[derive(Debug, Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<MockReply>>,
    calls: Mutex<Vec<GenerateRequest>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful text reply.
    pub fn reply(self, text: &str) -> Self {
        self.push(MockReply::Text(text.to_string()))
    }

    /// Queue a failed call.
    pub fn fail(self, message: &str) -> Self {
        self.push(MockReply::Fail(message.to_string()))
    }

    fn push(self, reply: MockReply) -> Self {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
        self
    }

    /// Requests received so far, in order.
    pub fn calls(&self) -> Vec<GenerateRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl LlmClient for MockLlmClient {
    fn generate(&self, request: &GenerateRequest) -> Result<String, DiagnosisError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let next = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match next {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Fail(message)) => Err(DiagnosisError::OllamaConnection(message)),
            None => Err(DiagnosisError::HttpClient("no scripted reply left".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_config::Sampling;

    fn request(images: Vec<std::path::PathBuf>) -> GenerateRequest {
        GenerateRequest {
            model: "gemma3:27b".into(),
            prompt: "prompt".into(),
            system: Some("system".into()),
            images,
            sampling: Sampling {
                temperature: 0.2,
                max_output_tokens: 400,
                top_p: 0.9,
            },
        }
    }

    #[test]
    fn mock_replays_in_order() {
        let client = MockLlmClient::new().reply("first").fail("down").reply("third");
        assert_eq!(client.generate(&request(vec![])).unwrap(), "first");
        assert!(matches!(
            client.generate(&request(vec![])),
            Err(DiagnosisError::OllamaConnection(_))
        ));
        assert_eq!(client.generate(&request(vec![])).unwrap(), "third");
        assert_eq!(client.call_count(), 3);
    }

    #[test]
    fn mock_fails_when_script_exhausted() {
        let client = MockLlmClient::new();
        assert!(client.generate(&request(vec![])).is_err());
        assert_eq!(client.calls().len(), 1);
    }

    #[test]
    fn ollama_client_constructor() {
        let client = OllamaClient::new("http://localhost:11434", 120).unwrap();
        assert_eq!(client.base_url(), "http://localhost:11434");
        assert_eq!(client.timeout_secs, 120);
    }

    #[test]
    fn ollama_client_trims_trailing_slash() {
        let client = OllamaClient::new("http://localhost:11434/", 60).unwrap();
        assert_eq!(client.base_url(), "http://localhost:11434");
    }

    #[test]
    fn request_body_maps_sampling_to_ollama_options() {
        let req = request(vec![]);
        let body = build_request_body(&req).unwrap();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gemma3:27b");
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 400);
        assert!(json.get("images").is_none());
        assert_eq!(json["system"], "system");
    }

    #[test]
    fn request_body_encodes_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf.jpg");
        std::fs::write(&path, b"abc").unwrap();

        let req = request(vec![path]);
        let body = build_request_body(&req).unwrap();
        assert_eq!(body.images, vec!["YWJj".to_string()]);
    }

    #[test]
    fn missing_image_is_reported() {
        let req = request(vec!["/definitely/not/here.png".into()]);
        let err = build_request_body(&req).err().unwrap();
        assert!(matches!(err, DiagnosisError::ImageRead { .. }));
        assert!(err.to_string().contains("/definitely/not/here.png"));
    }
}
