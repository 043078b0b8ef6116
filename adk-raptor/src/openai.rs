//! Capabilities backed by OpenAI-compatible HTTP APIs.
//!
//! [`OpenAIEmbeddingProvider`] calls `/v1/embeddings` and
//! [`OpenAICompatibleGenerator`] calls `/v1/completions`. Both take a base
//! URL, so they work against OpenAI itself and against local servers
//! exposing the same API (LM Studio, llama.cpp, vLLM).
//!
//! This module is only available when the `openai` feature is enabled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::embedding::EmbeddingProvider;
use crate::error::{RaptorError, Result};
use crate::generation::TextGenerator;

/// The OpenAI API base URL.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Base URL of a local LM Studio server.
pub const LM_STUDIO_BASE_URL: &str = "http://localhost:1234/v1";

/// The default model for OpenAI embeddings.
const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// The default dimensionality for `text-embedding-3-small`.
const DEFAULT_DIMENSIONS: usize = 1536;

/// Sampling temperature for summaries and paraphrases.
const DEFAULT_TEMPERATURE: f32 = 0.2;

/// An [`EmbeddingProvider`] backed by an OpenAI-compatible embeddings API.
///
/// # Example
///
/// ```rust,ignore
/// use adk_raptor::openai::OpenAIEmbeddingProvider;
///
/// let provider = OpenAIEmbeddingProvider::new("sk-...")?;
/// let embedding = provider.embed("hello world").await?;
/// ```
pub struct OpenAIEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    /// If set, passed to the API for Matryoshka dimension truncation.
    request_dimensions: Option<usize>,
}

impl OpenAIEmbeddingProvider {
    /// Create a provider for the OpenAI API with the given key.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(RaptorError::ConfigError("OpenAI API key must not be empty".into()));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: OPENAI_BASE_URL.into(),
            api_key: Some(api_key),
            model: DEFAULT_EMBEDDING_MODEL.into(),
            dimensions: DEFAULT_DIMENSIONS,
            request_dimensions: None,
        })
    }

    /// Create a provider using the `OPENAI_API_KEY` environment variable.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            RaptorError::ConfigError("OPENAI_API_KEY environment variable not set".into())
        })?;
        Self::new(api_key)
    }

    /// Create a provider for a local server that needs no key.
    pub fn local(base_url: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: None,
            model: model.into(),
            dimensions,
            request_dimensions: None,
        }
    }

    /// Set the API base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the model name (e.g. `text-embedding-3-large`).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the output dimensions (Matryoshka support).
    pub fn with_dimensions(mut self, dims: usize) -> Self {
        self.dimensions = dims;
        self.request_dimensions = Some(dims);
        self
    }

    fn failure(&self, texts: &[&str], message: String) -> RaptorError {
        RaptorError::EmbeddingError {
            provider: "OpenAI".into(),
            text: texts.first().map(|t| t.to_string()).unwrap_or_default(),
            message,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    text: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Error detail from a failed response body, or the body itself.
async fn error_detail(response: reqwest::Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail =
        serde_json::from_str::<ErrorResponse>(&body).map(|e| e.error.message).unwrap_or(body);
    format!("API returned {status}: {detail}")
}

fn authorize(request: reqwest::RequestBuilder, api_key: Option<&str>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!(provider = "OpenAI", text_len = text.len(), "embedding single text");

        let results = self.embed_batch(&[text]).await?;
        results
            .into_iter()
            .next()
            .ok_or_else(|| self.failure(&[text], "API returned empty response".into()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(
            provider = "OpenAI",
            batch_size = texts.len(),
            model = %self.model,
            "embedding batch"
        );

        let request_body = EmbeddingRequest {
            model: &self.model,
            input: texts.to_vec(),
            dimensions: self.request_dimensions,
        };
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));

        let response = authorize(self.client.post(&url), self.api_key.as_deref())
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                error!(provider = "OpenAI", error = %e, "request failed");
                self.failure(texts, format!("request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let message = error_detail(response).await;
            error!(provider = "OpenAI", %message, "API error");
            return Err(self.failure(texts, message));
        }

        let embedding_response: EmbeddingResponse = response.json().await.map_err(|e| {
            error!(provider = "OpenAI", error = %e, "failed to parse response");
            self.failure(texts, format!("failed to parse response: {e}"))
        })?;

        Ok(embedding_response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// A [`TextGenerator`] backed by an OpenAI-compatible completions API.
///
/// Defaults to a local LM Studio server.
///
/// # Example
///
/// ```rust,ignore
/// use adk_raptor::openai::OpenAICompatibleGenerator;
///
/// let generator = OpenAICompatibleGenerator::new("llama-3.2-3b-instruct");
/// let summary = generator.complete("Summarize: ...", 256).await?;
/// ```
pub struct OpenAICompatibleGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
}

impl OpenAICompatibleGenerator {
    /// Create a generator for `model` on a local LM Studio server.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: LM_STUDIO_BASE_URL.into(),
            api_key: None,
            model: model.into(),
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    /// Set the API base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Authenticate with a bearer key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn failure(&self, message: String) -> RaptorError {
        RaptorError::GenerationError {
            provider: format!("OpenAI-compatible ({})", self.model),
            message,
        }
    }
}

#[async_trait]
impl TextGenerator for OpenAICompatibleGenerator {
    async fn complete(&self, prompt: &str, max_tokens: usize) -> Result<String> {
        debug!(model = %self.model, prompt_len = prompt.len(), max_tokens, "requesting completion");

        let request_body = CompletionRequest {
            model: &self.model,
            prompt,
            max_tokens,
            temperature: self.temperature,
        };
        let url = format!("{}/completions", self.base_url.trim_end_matches('/'));

        let response = authorize(self.client.post(&url), self.api_key.as_deref())
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                error!(model = %self.model, error = %e, "completion request failed");
                self.failure(format!("request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let message = error_detail(response).await;
            error!(model = %self.model, %message, "completion API error");
            return Err(self.failure(message));
        }

        let completion: CompletionResponse = response.json().await.map_err(|e| {
            error!(model = %self.model, error = %e, "failed to parse completion");
            self.failure(format!("failed to parse response: {e}"))
        })?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.text.trim().to_string())
            .ok_or_else(|| self.failure("API returned no choices".into()))
    }
}
