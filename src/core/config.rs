use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_project_root")]
    pub project_root: String,

    /// File name of the persisted project state, relative to `project_root`.
    #[serde(default = "default_state_file")]
    pub state_file: String,

    pub llm: LlmConfig,

    #[serde(default)]
    pub image: ImageConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_max_output_tokens_cap")]
    pub max_output_tokens_cap: u32,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_image_provider")]
    pub provider: String,
    /// Falls back to `llm.gemini.api_key` when unset.
    pub api_key: Option<String>,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_image_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_image_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_image_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            state_file: default_state_file(),
            llm: LlmConfig::default(),
            image: ImageConfig::default(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay(),
            timeout_seconds: default_llm_timeout(),
            max_output_tokens: default_max_output_tokens(),
            max_output_tokens_cap: default_max_output_tokens_cap(),
            gemini: None,
            ollama: None,
            openai: None,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_image_provider(),
            api_key: None,
            model: default_image_model(),
            timeout_seconds: default_image_timeout(),
            concurrency: default_image_concurrency(),
            retry_count: default_image_retry_count(),
            retry_delay_seconds: default_retry_delay(),
        }
    }
}

fn default_project_root() -> String {
    "manga_data".to_string()
}
fn default_state_file() -> String {
    "state.json".to_string()
}
fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    10
}
fn default_llm_timeout() -> u64 {
    300
}
fn default_max_output_tokens() -> u32 {
    60000
}
fn default_max_output_tokens_cap() -> u32 {
    120000
}
fn default_gemini_model() -> String {
    "gemini-2.5-pro".to_string()
}
fn default_image_provider() -> String {
    "gemini".to_string()
}
fn default_image_model() -> String {
    "gemini-2.5-flash-image-preview".to_string()
}
fn default_image_timeout() -> u64 {
    180
}
fn default_image_concurrency() -> usize {
    2
}
fn default_image_retry_count() -> usize {
    2
}

impl LlmConfig {
    /// Model name of the configured provider.
    pub fn model(&self) -> Option<&str> {
        match self.provider.as_str() {
            "gemini" => self.gemini.as_ref().map(|c| c.model.as_str()),
            "ollama" => self.ollama.as_ref().map(|c| c.model.as_str()),
            "openai" => self.openai.as_ref().map(|c| c.model.as_str()),
            _ => None,
        }
    }
}

impl ImageConfig {
    pub fn resolve_api_key<'a>(&'a self, llm: &'a LlmConfig) -> Option<&'a str> {
        self.api_key
            .as_deref()
            .or_else(|| llm.gemini.as_ref().map(|g| g.api_key.as_str()))
            .filter(|k| !k.is_empty())
    }
}

impl Config {
    pub fn load_from(path: &str) -> Result<Self> {
        let p = Path::new(path);
        if !p.exists() {
            anyhow::bail!("{} not found. Run `prompt2manga setup` to create one.", path);
        }

        let content = fs::read_to_string(p).with_context(|| format!("Failed to read {}", path))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &str) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path))?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.project_root)?;
        Ok(())
    }

    pub fn state_path(&self) -> String {
        Path::new(&self.project_root)
            .join(&self.state_file)
            .to_string_lossy()
            .to_string()
    }
}
