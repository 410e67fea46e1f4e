//! Outline -> Character -> Chapter-Script -> Panel. Panels take a
//! [`CharacterManifest`], which only the character stage or a checkpoint
//! restore can produce.

use crate::core::config::Config;
use crate::core::error::PipelineError;
use crate::core::io::Storage;
use crate::core::model::{GlobalStyle, Chapter, Manga, MangaChapterScript, MangaRequest, PromptComponents};
use crate::core::schema::Structured;
use crate::core::state::ArtifactFailure;
use crate::services::image::ImageClient;
use crate::services::llm::{generate_typed, GenerationOptions, StructuredClient};
use crate::services::progress::{interpolate, ProgressTracker};
use crate::services::prompts;
use crate::utils::naming;
use crate::utils::retry::{with_timeout, RetryPolicy};
use futures_util::StreamExt;
use log::{info, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fan-out, timeout and retry settings for image calls.
#[derive(Debug, Clone)]
pub struct ImageSettings {
    pub concurrency: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl ImageSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.image.concurrency.max(1),
            timeout: Duration::from_secs(config.image.timeout_seconds),
            retry: RetryPolicy::new(config.image.retry_count, config.image.retry_delay_seconds),
        }
    }
}

/// Everything an image-producing stage needs besides its own input.
pub struct RenderContext<'a> {
    pub images: &'a dyn ImageClient,
    pub project_root: &'a str,
    pub namespace: &'a str,
    pub settings: &'a ImageSettings,
    pub cancel: &'a CancellationToken,
}

/// Confirmed character reference images, keyed by character id.
///
/// A `None` entry means the character stage attempted the character and
/// failed; panels referencing it proceed without that reference.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacterManifest {
    images: BTreeMap<String, Option<String>>,
}

impl CharacterManifest {
    /// Rebuilds a manifest from a checkpoint, demoting entries whose file
    /// has since disappeared.
    pub async fn restore(
        entries: BTreeMap<String, Option<String>>,
        storage: &dyn Storage,
    ) -> Result<Self, PipelineError> {
        let mut images = BTreeMap::new();
        for (id, path) in entries {
            let confirmed = match path {
                Some(p) if storage.exists(&p).await? => Some(p),
                Some(p) => {
                    warn!("Reference image for {} is gone ({})", id, p);
                    None
                }
                None => None,
            };
            images.insert(id, confirmed);
        }
        Ok(Self { images })
    }

    pub fn image_for(&self, character_id: &str) -> Option<&str> {
        self.images.get(character_id).and_then(|p| p.as_deref())
    }

    pub fn entries(&self) -> &BTreeMap<String, Option<String>> {
        &self.images
    }

    pub fn rendered(&self) -> usize {
        self.images.values().filter(|p| p.is_some()).count()
    }

    /// Reference paths for a panel's `character_ids`, in order and without
    /// duplicates, plus the ids that have no image.
    pub fn references(&self, panel_id: &str, character_ids: &[String]) -> (Vec<String>, Vec<String>) {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();
        let mut missing = Vec::new();
        for id in character_ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.image_for(id) {
                Some(path) => paths.push(path.to_string()),
                None => {
                    let err = PipelineError::MissingReference {
                        panel_id: panel_id.to_string(),
                        character_id: id.clone(),
                    };
                    warn!("{}; rendering without it", err);
                    missing.push(id.clone());
                }
            }
        }
        (paths, missing)
    }
}

pub struct CharacterStageOutput {
    pub manifest: CharacterManifest,
    pub failures: Vec<ArtifactFailure>,
}

/// One image call under the configured timeout, retrying transient errors.
pub async fn render_image(
    images: &dyn ImageClient,
    prompt: &str,
    output_path: &str,
    references: &[String],
    settings: &ImageSettings,
) -> Result<String, PipelineError> {
    let mut attempt = 0;
    loop {
        match with_timeout(settings.timeout, images.generate(prompt, output_path, references)).await {
            Ok(path) => return Ok(path),
            Err(e) if e.is_transient() && attempt < settings.retry.max_retries => {
                let delay = settings.retry.delay_for(attempt);
                attempt += 1;
                warn!(
                    "Image {} failed ({}), retry {}/{} in {:?}",
                    output_path, e, attempt, settings.retry.max_retries, delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Requests the outline. A chapter count other than the requested one is
/// regenerated up to the retry budget before failing.
pub async fn outline_stage(
    llm: &dyn StructuredClient,
    opts: &GenerationOptions,
    request: &MangaRequest,
) -> Result<Manga, PipelineError> {
    let prompt = prompts::outline_prompt(request);
    let mut attempt = 0;
    loop {
        let mut manga: Manga = generate_typed(llm, &prompt, request.model.as_deref(), opts).await?;
        if manga.chapters.len() == request.num_chapters {
            manga.normalize();
            info!(
                "Outline '{}': {} chapters, {} characters",
                manga.title,
                manga.chapters.len(),
                manga.global_style.character_sheets.len()
            );
            return Ok(manga);
        }

        let err = PipelineError::ChapterCountMismatch {
            expected: request.num_chapters,
            actual: manga.chapters.len(),
        };
        if attempt >= opts.retry.max_retries {
            return Err(err);
        }
        attempt += 1;
        warn!("{}, regenerating ({}/{})", err, attempt, opts.retry.max_retries);
    }
}

/// Renders one reference image per character sheet. A failed character is
/// recorded and does not stop the others.
pub async fn character_stage(
    ctx: &RenderContext<'_>,
    style: &GlobalStyle,
    progress: &ProgressTracker<'_>,
    span: (u8, u8),
) -> Result<CharacterStageOutput, PipelineError> {
    let total = style.character_sheets.len();
    let done = AtomicUsize::new(0);

    let results: Vec<(String, Result<String, PipelineError>)> =
        futures_util::stream::iter(style.character_sheets.iter())
            .map(|sheet| {
                let done = &done;
                async move {
                    let id = sheet.character_id.clone();
                    if ctx.cancel.is_cancelled() {
                        return (id, Err(PipelineError::Cancelled));
                    }
                    let path = naming::character_image_path(ctx.project_root, ctx.namespace, &id);
                    let prompt = prompts::character_prompt(sheet, &style.art_style_description);
                    let result = render_image(ctx.images, &prompt, &path, &[], ctx.settings).await;

                    let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                    progress.report(
                        &format!("Character {} ({}/{})", id, n, total),
                        interpolate(span.0, span.1, n, total),
                    );
                    (id, result)
                }
            })
            .buffer_unordered(ctx.settings.concurrency)
            .collect()
            .await;

    if results
        .iter()
        .any(|(_, r)| matches!(r, Err(PipelineError::Cancelled)))
    {
        return Err(PipelineError::Cancelled);
    }

    let mut images = BTreeMap::new();
    let mut failures = Vec::new();
    for (id, result) in results {
        match result {
            Ok(path) => {
                images.insert(id, Some(path));
            }
            Err(e) => {
                warn!("Character {} failed: {}", id, e);
                failures.push(ArtifactFailure::new("character", &id, &e));
                images.insert(id, None);
            }
        }
    }

    let manifest = CharacterManifest { images };
    info!(
        "Character stage: {}/{} rendered",
        manifest.rendered(),
        total
    );
    Ok(CharacterStageOutput { manifest, failures })
}

/// Expands one chapter into pages and panels.
pub async fn chapter_script_stage(
    llm: &dyn StructuredClient,
    opts: &GenerationOptions,
    chapter: &Chapter,
    style: &GlobalStyle,
    lang: &str,
    model: Option<&str>,
) -> Result<MangaChapterScript, PipelineError> {
    let prompt = prompts::chapter_script_prompt(chapter, style, lang);
    let mut script: MangaChapterScript = generate_typed(llm, &prompt, model, opts).await?;

    if script.chapter_number != chapter.chapter_number {
        warn!(
            "Script echoed chapter {} for chapter {}, correcting",
            script.chapter_number, chapter.chapter_number
        );
        script.chapter_number = chapter.chapter_number;
    }
    if script.chapter_title.trim().is_empty() {
        script.chapter_title = chapter.chapter_title.clone();
    }
    script.normalize();

    if script.panel_count() == 0 {
        return Err(PipelineError::schema(
            MangaChapterScript::NAME,
            format!("chapter {} has no panels", chapter.chapter_number),
        ));
    }
    Ok(script)
}

/// Panel ids and scenes of a script in page/panel order.
pub fn script_panels(chapter_idx: usize, script: &MangaChapterScript) -> Vec<(String, &PromptComponents)> {
    script
        .pages
        .iter()
        .enumerate()
        .flat_map(|(page_idx, page)| {
            page.panels.iter().map(move |panel| {
                (
                    naming::panel_id(chapter_idx, page_idx, panel.panel_number),
                    &panel.scene_description,
                )
            })
        })
        .collect()
}

/// Renders one panel with the confirmed images of its characters as
/// references.
pub async fn panel_stage(
    ctx: &RenderContext<'_>,
    scene: &PromptComponents,
    art_style: &str,
    panel_id: &str,
    manifest: &CharacterManifest,
) -> Result<String, PipelineError> {
    let (references, _missing) = manifest.references(panel_id, &scene.character_ids);
    let prompt = prompts::panel_prompt(scene, art_style);
    let path = naming::panel_image_path(ctx.project_root, ctx.namespace, panel_id);
    render_image(ctx.images, &prompt, &path, &references, ctx.settings).await
}
