use crate::core::config::{Config, LlmConfig};
use crate::core::error::PipelineError;
use crate::core::schema::{parse_structured, Schema, Structured};
use crate::utils::retry::{with_timeout, RetryPolicy};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;
use url::Url;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/";

#[async_trait]
pub trait StructuredClient: Send + Sync + Debug {
    /// `model` overrides the provider's configured model when set.
    async fn generate(
        &self,
        prompt: &str,
        schema: &Schema,
        model: Option<&str>,
        max_output_tokens: u32,
    ) -> Result<Value, PipelineError>;
}

pub fn create_structured_client(config: &Config) -> Result<Box<dyn StructuredClient>, PipelineError> {
    let missing = |name: &str| PipelineError::Config(format!("{} config missing", name));
    match config.llm.provider.as_str() {
        "gemini" => {
            let cfg = config.llm.gemini.as_ref().ok_or_else(|| missing("Gemini"))?;
            Ok(Box::new(GeminiClient::new(&cfg.api_key, &cfg.model)))
        }
        "ollama" => {
            let cfg = config.llm.ollama.as_ref().ok_or_else(|| missing("Ollama"))?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &cfg.model)))
        }
        "openai" => {
            let cfg = config.llm.openai.as_ref().ok_or_else(|| missing("OpenAI"))?;
            Ok(Box::new(OpenAIClient::new(
                &cfg.api_key,
                &cfg.model,
                cfg.base_url.as_deref(),
            )))
        }
        other => Err(PipelineError::Config(format!("Unknown LLM provider: {}", other))),
    }
}

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub max_output_tokens: u32,
    pub max_output_tokens_cap: u32,
}

impl GenerationOptions {
    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.timeout_seconds),
            retry: RetryPolicy::from_config(cfg),
            max_output_tokens: cfg.max_output_tokens,
            max_output_tokens_cap: cfg.max_output_tokens_cap.max(cfg.max_output_tokens),
        }
    }
}

// Transient failures are retried per `opts.retry`; a truncated answer gets
// a doubled budget up to the cap. Schema violations return immediately.
pub async fn generate_typed<T: Structured>(
    client: &dyn StructuredClient,
    prompt: &str,
    model: Option<&str>,
    opts: &GenerationOptions,
) -> Result<T, PipelineError> {
    let schema = T::schema();
    let mut budget = opts.max_output_tokens;
    let mut attempt = 0;

    loop {
        let result = with_timeout(
            opts.timeout,
            client.generate(prompt, &schema, model, budget),
        )
        .await
        .and_then(parse_structured::<T>);

        match result {
            Ok(value) => return Ok(value),
            Err(PipelineError::TruncatedOutput { .. }) if budget < opts.max_output_tokens_cap => {
                let next = budget.saturating_mul(2).min(opts.max_output_tokens_cap);
                warn!(
                    "{} output truncated at {} tokens, retrying with {}",
                    T::NAME, budget, next
                );
                budget = next;
            }
            Err(e) if e.is_transient() && attempt < opts.retry.max_retries => {
                let delay = opts.retry.delay_for(attempt);
                attempt += 1;
                warn!(
                    "{} generation failed ({}), retry {}/{} in {:?}",
                    T::NAME, e, attempt, opts.retry.max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

fn parse_json_text(text: &str) -> Result<Value, PipelineError> {
    let clean = strip_code_blocks(text);
    serde_json::from_str(&clean)
        .map_err(|e| PipelineError::schema("model response", format!("not valid JSON: {}", e)))
}

async fn provider_error(resp: reqwest::Response) -> PipelineError {
    let status = resp.status().as_u16();
    let message = resp.text().await.unwrap_or_default();
    PipelineError::Provider {
        status: Some(status),
        message,
    }
}

// {base}models/{model}:{method}?key={api_key}
pub(crate) fn gemini_endpoint(model: &str, method: &str, api_key: &str) -> Result<Url, PipelineError> {
    let mut url = Url::parse(GEMINI_API_BASE)
        .and_then(|base| base.join(&format!("models/{}:{}", model, method)))
        .map_err(|e| PipelineError::Config(format!("Invalid Gemini endpoint: {}", e)))?;
    url.query_pairs_mut().append_pair("key", api_key);
    Ok(url)
}

// --- Gemini ---
#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    response_mime_type: String,
    response_schema: Value,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    code: Option<u16>,
    message: String,
}

fn parse_gemini_response(body: &str, max_output_tokens: u32) -> Result<Value, PipelineError> {
    let result: GeminiResponse = serde_json::from_str(body).map_err(|e| PipelineError::Provider {
        status: None,
        message: format!("Failed to parse Gemini response: {}. Body: {}", e, body),
    })?;

    if let Some(err) = result.error {
        return Err(PipelineError::Provider {
            status: err.code,
            message: err.message,
        });
    }

    let candidate = result
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| PipelineError::Provider {
            status: None,
            message: format!("Gemini response has no candidates. Body: {}", body),
        })?;

    if candidate.finish_reason.as_deref() == Some("MAX_TOKENS") {
        return Err(PipelineError::TruncatedOutput { max_output_tokens });
    }

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        let reason = candidate.finish_reason.as_deref().unwrap_or("UNKNOWN");
        return Err(PipelineError::Provider {
            status: None,
            message: format!("Gemini response empty. Finish reason: {}", reason),
        });
    }
    parse_json_text(&text)
}

#[async_trait]
impl StructuredClient for GeminiClient {
    async fn generate(
        &self,
        prompt: &str,
        schema: &Schema,
        model: Option<&str>,
        max_output_tokens: u32,
    ) -> Result<Value, PipelineError> {
        let model = model.unwrap_or(&self.model);
        let url = gemini_endpoint(model, "generateContent", &self.api_key)?;

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GeminiGenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema: schema.to_gemini_schema(),
                max_output_tokens,
            },
        };

        debug!("Gemini structured request to {} ({} tokens)", model, max_output_tokens);
        let resp = self.client.post(url).json(&request_body).send().await?;
        if !resp.status().is_success() {
            return Err(provider_error(resp).await);
        }

        let body = resp.text().await?;
        parse_gemini_response(&body, max_output_tokens)
    }
}

// --- Ollama ---
#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    format: Value,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: u32,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
    #[serde(default)]
    done_reason: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

fn parse_ollama_response(result: OllamaResponse, max_output_tokens: u32) -> Result<Value, PipelineError> {
    if result.done_reason.as_deref() == Some("length") {
        return Err(PipelineError::TruncatedOutput { max_output_tokens });
    }
    parse_json_text(&result.message.content)
}

#[async_trait]
impl StructuredClient for OllamaClient {
    async fn generate(
        &self,
        prompt: &str,
        schema: &Schema,
        model: Option<&str>,
        max_output_tokens: u32,
    ) -> Result<Value, PipelineError> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: model.unwrap_or(&self.model).to_string(),
            messages: vec![OllamaMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: false,
            format: schema.to_json_schema(),
            options: OllamaOptions {
                num_predict: max_output_tokens,
            },
        };

        let resp = self.client.post(&url).json(&request_body).send().await?;
        if !resp.status().is_success() {
            return Err(provider_error(resp).await);
        }

        let result: OllamaResponse = resp.json().await?;
        parse_ollama_response(result, max_output_tokens)
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    response_format: Value,
    max_completion_tokens: u32,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

fn parse_openai_response(result: OpenAIResponse, max_output_tokens: u32) -> Result<Value, PipelineError> {
    let choice = result
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::Provider {
            status: None,
            message: "OpenAI response has no choices".to_string(),
        })?;

    if choice.finish_reason.as_deref() == Some("length") {
        return Err(PipelineError::TruncatedOutput { max_output_tokens });
    }
    match choice.message.content {
        Some(content) => parse_json_text(&content),
        None => Err(PipelineError::Provider {
            status: None,
            message: "OpenAI response empty or missing content".to_string(),
        }),
    }
}

#[async_trait]
impl StructuredClient for OpenAIClient {
    async fn generate(
        &self,
        prompt: &str,
        schema: &Schema,
        model: Option<&str>,
        max_output_tokens: u32,
    ) -> Result<Value, PipelineError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: model.unwrap_or(&self.model).to_string(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            response_format: serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "structured_output",
                    "strict": true,
                    "schema": schema.to_json_schema(),
                }
            }),
            max_completion_tokens: max_output_tokens,
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(provider_error(resp).await);
        }

        let result: OpenAIResponse = resp.json().await?;
        parse_openai_response(result, max_output_tokens)
    }
}
