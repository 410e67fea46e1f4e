use thiserror::Error;

/// Errors raised at collaborator boundaries and stage functions.
///
/// Callers match on the variant to decide whether to retry, continue with a
/// gap in the output, or abort the unit of work.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{target} does not match its schema: {details}")]
    SchemaViolation { target: String, details: String },

    #[error("model output was truncated at the {max_output_tokens}-token budget")]
    TruncatedOutput { max_output_tokens: u32 },

    #[error("image model returned no image for {artifact}")]
    ImageGenerationEmpty { artifact: String },

    #[error("panel {panel_id} references character {character_id} which has no generated image")]
    MissingReference {
        panel_id: String,
        character_id: String,
    },

    #[error("state file {path} is unreadable: {reason}")]
    PersistenceCorruption { path: String, reason: String },

    #[error("namespace {namespace} is already in use")]
    Collision { namespace: String },

    #[error("outline returned {actual} chapters, {expected} were requested")]
    ChapterCountMismatch { expected: usize, actual: usize },

    #[error("call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("generation cancelled")]
    Cancelled,

    #[error("provider error{}: {message}", fmt_status(.status))]
    Provider { status: Option<u16>, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("pdf assembly failed: {0}")]
    Pdf(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

impl PipelineError {
    /// Whether repeating the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Http(_) | PipelineError::Timeout { .. } => true,
            PipelineError::Provider { status, .. } => match status {
                Some(code) => *code == 429 || *code >= 500,
                None => true,
            },
            _ => false,
        }
    }

    pub fn schema(target: impl Into<String>, details: impl Into<String>) -> Self {
        PipelineError::SchemaViolation {
            target: target.into(),
            details: details.into(),
        }
    }
}
