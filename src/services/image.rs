use crate::core::config::Config;
use crate::core::error::PipelineError;
use crate::core::io::Storage;
use crate::services::llm::gemini_endpoint;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::ImageFormat;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait ImageClient: Send + Sync + Debug {
    /// Writes a PNG to `output_path` and returns that path.
    async fn generate(
        &self,
        prompt: &str,
        output_path: &str,
        reference_images: &[String],
    ) -> Result<String, PipelineError>;
}

pub fn create_image_client(
    config: &Config,
    storage: Arc<dyn Storage>,
) -> Result<Box<dyn ImageClient>, PipelineError> {
    match config.image.provider.as_str() {
        "gemini" => {
            let api_key = config.image.resolve_api_key(&config.llm).ok_or_else(|| {
                PipelineError::Config(
                    "image.api_key or llm.gemini.api_key is required for image generation".to_string(),
                )
            })?;
            Ok(Box::new(GeminiImageClient::new(
                api_key,
                &config.image.model,
                storage,
            )))
        }
        other => Err(PipelineError::Config(format!("Unknown image provider: {}", other))),
    }
}

#[derive(Debug)]
struct GeminiImageClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
    storage: Arc<dyn Storage>,
}

impl GeminiImageClient {
    fn new(api_key: &str, model: &str, storage: Arc<dyn Storage>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
            storage,
        }
    }

    // Unreadable files are skipped.
    async fn reference_parts(&self, reference_images: &[String]) -> Vec<ImagePart> {
        let mut parts = Vec::new();
        for path in reference_images {
            match self.storage.read(path).await {
                Ok(bytes) => parts.push(ImagePart::InlineData {
                    inline_data: InlineData {
                        mime_type: mime_for_path(path).to_string(),
                        data: STANDARD.encode(bytes),
                    },
                }),
                Err(e) => warn!("Skipping reference image {}: {}", path, e),
            }
        }
        parts
    }
}

#[derive(Serialize)]
struct ImageRequest {
    contents: Vec<ImageContent>,
}

#[derive(Serialize)]
struct ImageContent {
    role: String,
    parts: Vec<ImagePart>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ImagePart {
    InlineData { inline_data: InlineData },
    Text { text: String },
}

#[derive(Serialize, Deserialize)]
struct InlineData {
    #[serde(alias = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    candidates: Option<Vec<ImageCandidate>>,
    error: Option<ImageApiError>,
}

#[derive(Deserialize)]
struct ImageCandidate {
    content: Option<ImageContentResponse>,
}

#[derive(Deserialize)]
struct ImageContentResponse {
    #[serde(default)]
    parts: Vec<ImagePartResponse>,
}

#[derive(Deserialize)]
struct ImagePartResponse {
    text: Option<String>,
    #[serde(alias = "inlineData")]
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
struct ImageApiError {
    code: Option<u16>,
    message: String,
}

/// Returns the first inline image payload, logging any text commentary.
fn extract_image(body: &str, artifact: &str) -> Result<Vec<u8>, PipelineError> {
    let response: ImageResponse = serde_json::from_str(body).map_err(|e| PipelineError::Provider {
        status: None,
        message: format!("Failed to parse image response: {}", e),
    })?;
    if let Some(err) = response.error {
        return Err(PipelineError::Provider {
            status: err.code,
            message: err.message,
        });
    }

    let parts = response
        .candidates
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.content)
        .map(|c| c.parts)
        .unwrap_or_default();

    for part in parts {
        if let Some(text) = part.text {
            debug!("Image model note for {}: {}", artifact, text);
        }
        if let Some(inline) = part.inline_data {
            return STANDARD.decode(inline.data.as_bytes()).map_err(|e| PipelineError::Provider {
                status: None,
                message: format!("Invalid image payload for {}: {}", artifact, e),
            });
        }
    }
    Err(PipelineError::ImageGenerationEmpty {
        artifact: artifact.to_string(),
    })
}

/// Re-encodes non-PNG payloads so every artifact on disk is a PNG.
fn ensure_png(bytes: Vec<u8>) -> Result<Vec<u8>, PipelineError> {
    if image::guess_format(&bytes).ok() == Some(ImageFormat::Png) {
        return Ok(bytes);
    }
    let decoded = image::load_from_memory(&bytes)?;
    let mut out = Cursor::new(Vec::new());
    decoded.write_to(&mut out, ImageFormat::Png)?;
    Ok(out.into_inner())
}

fn mime_for_path(path: &str) -> &'static str {
    ImageFormat::from_path(path)
        .map(|f| f.to_mime_type())
        .unwrap_or("image/png")
}

fn artifact_name(output_path: &str) -> String {
    Path::new(output_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| output_path.to_string())
}

#[async_trait]
impl ImageClient for GeminiImageClient {
    async fn generate(
        &self,
        prompt: &str,
        output_path: &str,
        reference_images: &[String],
    ) -> Result<String, PipelineError> {
        let artifact = artifact_name(output_path);
        let url = gemini_endpoint(&self.model, "generateContent", &self.api_key)?;

        let mut parts = self.reference_parts(reference_images).await;
        parts.push(ImagePart::Text {
            text: prompt.to_string(),
        });
        let request_body = ImageRequest {
            contents: vec![ImageContent {
                role: "user".to_string(),
                parts,
            }],
        };

        let resp = self.client.post(url).json(&request_body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            return Err(PipelineError::Provider {
                status: Some(status),
                message: resp.text().await.unwrap_or_default(),
            });
        }

        let body = resp.text().await?;
        let png = ensure_png(extract_image(&body, &artifact)?)?;
        self.storage.write(output_path, &png).await?;
        debug!("Wrote {} ({} bytes)", output_path, png.len());
        Ok(output_path.to_string())
    }
}
