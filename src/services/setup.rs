use crate::core::config::{Config, GeminiConfig, OllamaConfig, OpenAIConfig};
use anyhow::Result;
use inquire::{Password, Select, Text};
use std::path::Path;

const PROVIDERS: &[&str] = &["gemini", "openai", "ollama"];

/// Walks the operator through provider selection and writes `path`. An
/// existing file is loaded first so unrelated settings survive.
pub fn run_setup(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        Config::load_from(path)?
    } else {
        Config::default()
    };

    let provider = Select::new("Structured-generation provider:", PROVIDERS.to_vec()).prompt()?;
    config.llm.provider = provider.to_string();

    match provider {
        "gemini" => {
            let current = config.llm.gemini.take();
            let api_key = Password::new("Gemini API key:")
                .without_confirmation()
                .prompt()?;
            let model = Text::new("Text model:")
                .with_default(current.as_ref().map(|c| c.model.as_str()).unwrap_or("gemini-2.5-pro"))
                .prompt()?;
            config.llm.gemini = Some(GeminiConfig { api_key, model });
        }
        "openai" => {
            let current = config.llm.openai.take();
            let api_key = Password::new("OpenAI API key:")
                .without_confirmation()
                .prompt()?;
            let model = Text::new("Model:")
                .with_default(current.as_ref().map(|c| c.model.as_str()).unwrap_or("gpt-4o"))
                .prompt()?;
            let base_url = Text::new("Base URL (empty for api.openai.com):")
                .with_default(current.as_ref().and_then(|c| c.base_url.as_deref()).unwrap_or(""))
                .prompt()?;
            config.llm.openai = Some(OpenAIConfig {
                api_key,
                model,
                base_url: Some(base_url).filter(|u| !u.trim().is_empty()),
            });
        }
        _ => {
            let current = config.llm.ollama.take();
            let base_url = Text::new("Ollama URL:")
                .with_default(current.as_ref().map(|c| c.base_url.as_str()).unwrap_or("http://localhost:11434"))
                .prompt()?;
            let model = Text::new("Model:")
                .with_default(current.as_ref().map(|c| c.model.as_str()).unwrap_or("llama3.1"))
                .prompt()?;
            config.llm.ollama = Some(OllamaConfig { base_url, model });
        }
    }

    // Images always go through Gemini; reuse the text key when there is one.
    if config.image.resolve_api_key(&config.llm).is_none() {
        let key = Password::new("Gemini API key for image generation:")
            .without_confirmation()
            .prompt()?;
        config.image.api_key = Some(key);
    }
    config.image.model = Text::new("Image model:")
        .with_default(&config.image.model)
        .prompt()?;

    config.save_to(path)?;
    log::info!("Saved configuration to {}", path);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml").to_string_lossy().to_string();

        Config::default().save_to(&path)?;
        let loaded = Config::load_from(&path)?;
        assert_eq!(loaded.llm.provider, "gemini");
        assert_eq!(loaded.llm.max_output_tokens_cap, 120000);
        assert_eq!(loaded.image.model, "gemini-2.5-flash-image-preview");
        assert_eq!(loaded.image.retry_count, 2);
        assert!(loaded.image.resolve_api_key(&loaded.llm).is_none());
        Ok(())
    }
}
