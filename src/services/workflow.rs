use crate::core::checkpoint::RunCheckpoint;
use crate::core::config::Config;
use crate::core::error::PipelineError;
use crate::core::io::{NativeStorage, ProjectLock, Storage};
use crate::core::model::MangaRequest;
use crate::core::state::{ArtifactFailure, GenerationRun, ProjectState, StateStore};
use crate::services::image::{create_image_client, ImageClient};
use crate::services::llm::{create_structured_client, GenerationOptions, StructuredClient};
use crate::services::pdf::assemble_pdf;
use crate::services::progress::{interpolate, ProgressSink, ProgressTracker};
use crate::services::stages::{self, CharacterManifest, ImageSettings, RenderContext};
use crate::utils::naming;
use anyhow::Result;
use futures_util::StreamExt;
use log::{info, warn};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct WorkflowManager {
    config: Config,
    llm: Box<dyn StructuredClient>,
    images: Box<dyn ImageClient>,
    storage: Arc<dyn Storage>,
    store: StateStore,
    state: ProjectState,
}

impl WorkflowManager {
    pub async fn new(
        config: Config,
        llm: Box<dyn StructuredClient>,
        images: Box<dyn ImageClient>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let store = StateStore::new(config.state_path(), storage.clone());
        let state = store.load().await?;
        if let Some(ns) = &state.active_run {
            info!("Unfinished run '{}' can be resumed", ns);
        }

        Ok(Self {
            config,
            llm,
            images,
            storage,
            store,
            state,
        })
    }

    pub async fn from_config(config: Config) -> Result<Self> {
        config.ensure_directories()?;
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
        let llm = create_structured_client(&config)?;
        let images = create_image_client(&config, storage.clone())?;
        log_providers(&config);
        Self::new(config, llm, images, storage).await
    }

    // On error the previous clients and configuration stay in place.
    pub async fn reconfigure(&mut self, config: Config) -> Result<()> {
        let llm = create_structured_client(&config)?;
        let images = create_image_client(&config, self.storage.clone())?;

        if config.state_path() != self.config.state_path() {
            config.ensure_directories()?;
            let store = StateStore::new(config.state_path(), self.storage.clone());
            self.state = store.load().await?;
            self.store = store;
        }
        self.llm = llm;
        self.images = images;
        self.config = config;
        log_providers(&self.config);
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &ProjectState {
        &self.state
    }

    pub async fn run(
        &mut self,
        request: MangaRequest,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<GenerationRun, PipelineError> {
        request.validate()?;
        let progress = ProgressTracker::new(sink);

        progress.report("Planning outline", 10);
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let opts = GenerationOptions::from_config(&self.config.llm);
        let manga = stages::outline_stage(self.llm.as_ref(), &opts, &request).await?;
        progress.report(&format!("Outline ready: {}", manga.title), 30);

        let (namespace, _lock) = self.claim_namespace(&manga.title).await?;
        info!("Generating '{}' into {}", manga.title, namespace);

        let checkpoint = RunCheckpoint::new(&namespace, request, manga);
        checkpoint
            .save(self.storage.as_ref(), &self.config.project_root)
            .await?;
        self.state.active_run = Some(namespace);
        self.store.save(&self.state).await?;

        self.continue_run(checkpoint, &progress, cancel).await
    }

    /// Without a namespace the run recorded as active is resumed. `force`
    /// removes a lock left behind by a process that did not exit cleanly.
    pub async fn resume(
        &mut self,
        namespace: Option<&str>,
        force: bool,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<GenerationRun, PipelineError> {
        let namespace = namespace
            .map(str::to_string)
            .or_else(|| self.state.active_run.clone())
            .ok_or_else(|| PipelineError::Config("there is no unfinished run to resume".to_string()))?;

        let root = self.config.project_root.clone();
        let Some(checkpoint) = RunCheckpoint::load(self.storage.as_ref(), &root, &namespace).await? else {
            // Finished, but the process died before the checkpoint was removed.
            if self.state.active_run.as_deref() == Some(namespace.as_str())
                && self.state.history.iter().any(|r| r.namespace == namespace)
            {
                self.state.active_run = None;
                self.store.save(&self.state).await?;
                info!("Run {} already finished; cleared it as active", namespace);
            }
            return Err(PipelineError::Config(format!("no checkpoint found for '{}'", namespace)));
        };

        let lock_path = naming::lock_path(&root, &namespace);
        if force {
            self.storage.delete(&lock_path).await?;
        }
        let _lock = ProjectLock::try_acquire(&lock_path)?.ok_or_else(|| PipelineError::Collision {
            namespace: namespace.clone(),
        })?;

        let progress = ProgressTracker::new(sink);
        progress.report(&format!("Resuming {}", namespace), 30);
        self.state.active_run = Some(namespace);
        self.store.save(&self.state).await?;

        self.continue_run(checkpoint, &progress, cancel).await
    }

    /// With `purge` the namespace directory goes too.
    pub async fn delete_run(&mut self, index: usize, purge: bool) -> Result<Option<GenerationRun>> {
        let removed = self.state.delete_run(index);
        if let Some(run) = &removed {
            if purge && !run.namespace.is_empty() {
                let dir = naming::namespace_dir(&self.config.project_root, &run.namespace);
                self.storage.delete(&dir).await?;
                info!("Purged {}", dir);
            }
            self.store.save(&self.state).await?;
        }
        Ok(removed)
    }

    pub async fn view(&mut self, index: usize, panel: usize) -> Result<Option<String>> {
        if !self.state.select_run(index) {
            return Ok(None);
        }
        self.state.set_panel_index(panel);
        self.store.save(&self.state).await?;
        Ok(self.state.current_panel_path().map(str::to_string))
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.store.clear().await?;
        self.state = ProjectState::default();
        Ok(())
    }

    // Sanitized title, then `_2`, `_3`, ... The lock is held on return.
    async fn claim_namespace(&self, title: &str) -> Result<(String, ProjectLock), PipelineError> {
        let mut base = naming::sanitize(title.trim());
        if base.is_empty() {
            base = "untitled".to_string();
        }

        let root = &self.config.project_root;
        let mut n = 1;
        loop {
            let candidate = if n == 1 {
                base.clone()
            } else {
                format!("{}_{}", base, n)
            };
            n += 1;

            let taken = self.state.namespace_in_use(&candidate)
                || self.storage.exists(&naming::namespace_dir(root, &candidate)).await?;
            if !taken {
                if let Some(lock) = ProjectLock::try_acquire(&naming::lock_path(root, &candidate))? {
                    return Ok((candidate, lock));
                }
            }
            warn!("{}, trying the next suffix", PipelineError::Collision { namespace: candidate });
        }
    }

    async fn continue_run(
        &mut self,
        mut checkpoint: RunCheckpoint,
        progress: &ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<GenerationRun, PipelineError> {
        let root = self.config.project_root.clone();
        let namespace = checkpoint.namespace.clone();
        let storage = self.storage.as_ref();
        let opts = GenerationOptions::from_config(&self.config.llm);
        let settings = ImageSettings::from_config(&self.config);
        let ctx = RenderContext {
            images: self.images.as_ref(),
            project_root: &root,
            namespace: &namespace,
            settings: &settings,
            cancel,
        };

        let manifest = match checkpoint.characters.take() {
            Some(entries) => {
                info!("Reusing character references from checkpoint");
                CharacterManifest::restore(entries, storage).await?
            }
            None => {
                let result =
                    stages::character_stage(&ctx, &checkpoint.manga.global_style, progress, (30, 50)).await;
                match result {
                    Ok(out) => {
                        for failure in out.failures {
                            checkpoint.record_failure(failure);
                        }
                        out.manifest
                    }
                    Err(PipelineError::Cancelled) => return stop(&checkpoint, storage, &root).await,
                    Err(e) => return Err(e),
                }
            }
        };
        checkpoint.characters = Some(manifest.entries().clone());
        checkpoint.save(storage, &root).await?;
        progress.report("Characters ready", 50);

        let chapters = checkpoint.manga.chapters.clone();
        let style = checkpoint.manga.global_style.clone();
        let lang = checkpoint.request.lang.clone();
        let model = checkpoint.request.model.clone();
        let total = chapters.len();

        for (idx, chapter) in chapters.iter().enumerate() {
            let (start, end) = (interpolate(50, 90, idx, total), interpolate(50, 90, idx + 1, total));
            let number = chapter.chapter_number;
            if cancel.is_cancelled() {
                return stop(&checkpoint, storage, &root).await;
            }

            let script = match checkpoint.scripts.get(&number) {
                Some(cached) => cached.clone(),
                None => {
                    progress.report(&format!("Scripting chapter {}", number), start);
                    let result = stages::chapter_script_stage(
                        self.llm.as_ref(),
                        &opts,
                        chapter,
                        &style,
                        &lang,
                        model.as_deref(),
                    )
                    .await;
                    match result {
                        Ok(script) => {
                            checkpoint.clear_failure("chapter", &number.to_string());
                            checkpoint.scripts.insert(number, script.clone());
                            checkpoint.save(storage, &root).await?;
                            script
                        }
                        Err(e) => {
                            warn!("Chapter {} script failed: {}", number, e);
                            checkpoint.record_failure(ArtifactFailure::new("chapter", &number.to_string(), &e));
                            checkpoint.save(storage, &root).await?;
                            progress.report(&format!("Chapter {} skipped", number), end);
                            continue;
                        }
                    }
                }
            };

            let panels = stages::script_panels(idx, &script);
            let panel_total = panels.len();
            let done = AtomicUsize::new(0);
            let completed = &checkpoint.completed_panels;

            let results: Vec<(String, Result<String, PipelineError>)> = futures_util::stream::iter(panels)
                .map(|(panel_id, scene)| {
                    let (ctx, done, manifest, style) = (&ctx, &done, &manifest, &style);
                    async move {
                        let cached = match completed.get(&panel_id) {
                            Some(path) => match storage.exists(path).await {
                                Ok(found) => found.then(|| path.clone()),
                                Err(e) => {
                                    warn!("Could not check {} ({}), rendering {} again", path, e, panel_id);
                                    None
                                }
                            },
                            None => None,
                        };
                        let result = match cached {
                            Some(path) => Ok(path),
                            None if ctx.cancel.is_cancelled() => return (panel_id, Err(PipelineError::Cancelled)),
                            None => {
                                stages::panel_stage(ctx, scene, &style.art_style_description, &panel_id, manifest)
                                    .await
                            }
                        };

                        let n = done.fetch_add(1, Ordering::SeqCst) + 1;
                        progress.report(
                            &format!("Chapter {} panel {} ({}/{})", number, panel_id, n, panel_total),
                            interpolate(start, end, n, panel_total),
                        );
                        (panel_id, result)
                    }
                })
                .buffer_unordered(settings.concurrency)
                .collect()
                .await;

            let mut cancelled = false;
            for (panel_id, result) in results {
                match result {
                    Ok(path) => {
                        checkpoint.clear_failure("panel", &panel_id);
                        checkpoint.completed_panels.insert(panel_id, path);
                    }
                    Err(PipelineError::Cancelled) => cancelled = true,
                    Err(e) => {
                        warn!("Panel {} failed: {}", panel_id, e);
                        checkpoint.record_failure(ArtifactFailure::new("panel", &panel_id, &e));
                    }
                }
            }
            if cancelled {
                return stop(&checkpoint, storage, &root).await;
            }
            checkpoint.save(storage, &root).await?;
            progress.report(&format!("Chapter {} done", number), end);
        }

        let mut image_paths = Vec::new();
        let mut panel_count = 0;
        for (idx, chapter) in chapters.iter().enumerate() {
            let Some(script) = checkpoint.scripts.get(&chapter.chapter_number) else {
                continue;
            };
            for (panel_id, _) in stages::script_panels(idx, script) {
                panel_count += 1;
                if let Some(path) = checkpoint.completed_panels.get(&panel_id) {
                    image_paths.push(path.clone());
                }
            }
        }

        progress.report("Compiling PDF", 90);
        let pdf_path = match assemble_pdf(storage, &image_paths, &naming::pdf_path(&root, &namespace)).await {
            Ok(report) => {
                for (path, reason) in report.skipped {
                    checkpoint.record_failure(ArtifactFailure {
                        stage: "pdf".to_string(),
                        artifact: path,
                        error: reason,
                    });
                }
                info!("PDF has {} of {} panels", report.pages, image_paths.len());
                Some(report.path)
            }
            Err(e) => {
                warn!("PDF assembly failed: {}", e);
                checkpoint.record_failure(ArtifactFailure::new("pdf", naming::PDF_FILE_NAME, &e));
                None
            }
        };

        let run = GenerationRun {
            title: checkpoint.manga.title.clone(),
            chapter_count: chapters.len(),
            panel_count,
            image_paths,
            pdf_path,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            manga_snapshot: Some(checkpoint.manga.clone()),
            namespace: namespace.clone(),
            failures: checkpoint.failures.clone(),
        };

        // The checkpoint can outlive the history save if the process dies
        // in between; resuming it then replaces the entry.
        match self.state.history.iter_mut().find(|r| r.namespace == namespace) {
            Some(existing) => *existing = run.clone(),
            None => self.state.push_run(run.clone()),
        }
        self.state.active_run = None;
        self.store.save(&self.state).await?;
        RunCheckpoint::delete(storage, &root, &namespace).await?;

        progress.report("Done", 100);
        info!(
            "Finished '{}': {}/{} panels rendered, {} failures",
            run.title,
            run.image_paths.len(),
            run.panel_count,
            run.failures.len()
        );
        Ok(run)
    }
}

fn log_providers(config: &Config) {
    info!(
        "Text: {} ({}), images: {} ({})",
        config.llm.provider,
        config.llm.model().unwrap_or("unset"),
        config.image.provider,
        config.image.model
    );
}

async fn stop(
    checkpoint: &RunCheckpoint,
    storage: &dyn Storage,
    project_root: &str,
) -> Result<GenerationRun, PipelineError> {
    checkpoint.save(storage, project_root).await?;
    warn!("Run {} cancelled; resume it later", checkpoint.namespace);
    Err(PipelineError::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::tests::{sample_manga, sample_script};
    use crate::services::progress::tests::RecordingProgress;
    use crate::services::stages::tests::{MockImageClient, MockLlm};
    use async_trait::async_trait;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::path::Path;
    use std::sync::Mutex;

    fn test_config(root: &Path) -> Config {
        let mut config: Config = serde_yaml_ng::from_str(
            "llm:\n  provider: mock\n  retry_count: 0\n  retry_delay_seconds: 0\nimage:\n  retry_count: 0\n",
        )
        .unwrap();
        config.project_root = root.to_string_lossy().to_string();
        config
    }

    fn request() -> MangaRequest {
        MangaRequest {
            num_chapters: 1,
            ..MangaRequest::new("A ninja who controls shadows")
        }
    }

    async fn manager(
        root: &Path,
        llm: MockLlm,
        images: impl ImageClient + 'static,
    ) -> Result<WorkflowManager> {
        WorkflowManager::new(
            test_config(root),
            Box::new(llm),
            Box::new(images),
            Arc::new(NativeStorage::new()),
        )
        .await
    }

    fn stems(calls: &Arc<Mutex<Vec<(String, Vec<String>)>>>) -> Vec<String> {
        calls.lock().unwrap().iter().map(|c| c.0.clone()).collect()
    }

    #[tokio::test]
    async fn test_end_to_end_single_chapter() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let llm = MockLlm::new(vec![sample_manga()], sample_script(1, &[2, 1]));
        let llm_calls = llm.calls.clone();
        let images = MockImageClient::default();
        let image_calls = images.calls.clone();
        let mut wf = manager(dir.path(), llm, images).await?;

        let sink = RecordingProgress::default();
        let run = wf.run(request(), &sink, &CancellationToken::new()).await?;

        assert_eq!(*llm_calls.lock().unwrap(), vec!["outline", "script"]);
        assert_eq!(run.namespace, "Shadow_Walker");
        assert_eq!(run.chapter_count, 1);
        assert_eq!(run.panel_count, 3);
        let root = dir.path().to_string_lossy().to_string();
        let expected: Vec<String> = ["0_0_1", "0_0_2", "0_1_1"]
            .iter()
            .map(|id| naming::panel_image_path(&root, "Shadow_Walker", id))
            .collect();
        assert_eq!(run.image_paths, expected);
        assert!(run.failures.is_empty());

        let pdf = run.pdf_path.clone().unwrap();
        let doc = lopdf::Document::load(&pdf)?;
        assert_eq!(doc.get_pages().len(), 3);

        // Every character call resolves before the first panel call.
        let order = stems(&image_calls);
        assert_eq!(order.len(), 5);
        let mut characters: Vec<String> = order[..2].to_vec();
        characters.sort();
        assert_eq!(characters, vec!["elder", "kage"]);
        let kage = naming::character_image_path(&root, "Shadow_Walker", "kage");
        assert!(image_calls.lock().unwrap()[2..].iter().all(|(_, refs)| refs == &vec![kage.clone()]));

        let percents: Vec<u8> = sink.updates.lock().unwrap().iter().map(|u| u.1).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        for mark in [10, 30, 50, 90, 100] {
            assert!(percents.contains(&mark), "missing {}%", mark);
        }

        assert!(wf.state().active_run.is_none());
        assert!(!Path::new(&naming::checkpoint_path(&root, "Shadow_Walker")).exists());
        assert!(!Path::new(&naming::lock_path(&root, "Shadow_Walker")).exists());

        let reloaded = StateStore::new(wf.config().state_path(), Arc::new(NativeStorage::new()))
            .load()
            .await?;
        assert_eq!(reloaded.history.len(), 1);
        assert_eq!(reloaded.history[0].image_paths, expected);
        assert_eq!(reloaded.history[0].manga_snapshot, Some(sample_manga()));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_panel_leaves_a_gap() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let llm = MockLlm::new(vec![sample_manga()], sample_script(1, &[3]));
        let mut wf = manager(dir.path(), llm, MockImageClient::failing(&["0_0_2", "elder"])).await?;

        let run = wf
            .run(request(), &RecordingProgress::default(), &CancellationToken::new())
            .await?;
        assert_eq!(run.panel_count, 3);
        assert_eq!(run.image_paths.len(), 2);
        assert!(!run.image_paths.iter().any(|p| p.ends_with("0_0_2.png")));
        let failed: Vec<(&str, &str)> = run
            .failures
            .iter()
            .map(|f| (f.stage.as_str(), f.artifact.as_str()))
            .collect();
        assert_eq!(failed, vec![("character", "elder"), ("panel", "0_0_2")]);

        let doc = lopdf::Document::load(run.pdf_path.as_ref().unwrap())?;
        assert_eq!(doc.get_pages().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_same_title_gets_versioned_namespace() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let llm = MockLlm::new(vec![sample_manga()], sample_script(1, &[1]));
        let mut wf = manager(dir.path(), llm, MockImageClient::default()).await?;

        let token = CancellationToken::new();
        let first = wf.run(request(), &RecordingProgress::default(), &token).await?;
        let second = wf.run(request(), &RecordingProgress::default(), &token).await?;
        assert_eq!(first.namespace, "Shadow_Walker");
        assert_eq!(second.namespace, "Shadow_Walker_2");
        assert_ne!(first.pdf_path, second.pdf_path);
        assert_eq!(wf.state().history.len(), 2);
        Ok(())
    }

    /// Cancels the token once the first panel has been rendered.
    #[derive(Debug)]
    struct CancelAfterFirstPanel {
        inner: MockImageClient,
        token: CancellationToken,
    }

    #[async_trait]
    impl ImageClient for CancelAfterFirstPanel {
        async fn generate(
            &self,
            prompt: &str,
            output_path: &str,
            reference_images: &[String],
        ) -> Result<String, PipelineError> {
            let path = self.inner.generate(prompt, output_path, reference_images).await?;
            if !reference_images.is_empty() {
                self.token.cancel();
            }
            Ok(path)
        }
    }

    #[tokio::test]
    async fn test_cancel_then_resume_skips_finished_work() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let token = CancellationToken::new();

        let mut config = test_config(dir.path());
        config.image.concurrency = 1;
        let llm = MockLlm::new(vec![sample_manga()], sample_script(1, &[3]));
        let images = CancelAfterFirstPanel {
            inner: MockImageClient::default(),
            token: token.clone(),
        };
        let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
        let mut wf = WorkflowManager::new(config.clone(), Box::new(llm), Box::new(images), storage.clone()).await?;

        let err = wf.run(request(), &RecordingProgress::default(), &token).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(wf.state().active_run.as_deref(), Some("Shadow_Walker"));
        assert!(wf.state().history.is_empty());
        let saved = RunCheckpoint::load(storage.as_ref(), &root, "Shadow_Walker").await?.unwrap();
        assert_eq!(saved.completed_panels.len(), 1);
        assert!(saved.characters.is_some());
        drop(wf);

        // A fresh process picks the run up from the checkpoint.
        let llm = MockLlm::new(vec![], sample_script(1, &[3]));
        let llm_calls = llm.calls.clone();
        let images = MockImageClient::default();
        let image_calls = images.calls.clone();
        let mut wf = WorkflowManager::new(config, Box::new(llm), Box::new(images), storage).await?;

        let run = wf
            .resume(None, false, &RecordingProgress::default(), &CancellationToken::new())
            .await?;
        assert!(llm_calls.lock().unwrap().is_empty());
        assert_eq!(stems(&image_calls), vec!["0_0_2", "0_0_3"]);
        assert_eq!(run.image_paths.len(), 3);
        assert!(wf.state().active_run.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_refuses_a_held_lock() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let storage = NativeStorage::new();
        RunCheckpoint::new("busy", request(), sample_manga())
            .save(&storage, &root)
            .await?;
        let _held = ProjectLock::try_acquire(&naming::lock_path(&root, "busy"))?.unwrap();

        let llm = MockLlm::new(vec![], sample_script(1, &[1]));
        let mut wf = manager(dir.path(), llm, MockImageClient::default()).await?;
        let err = wf
            .resume(Some("busy"), false, &RecordingProgress::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Collision { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_forced_resume_replaces_a_stale_lock() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let storage = NativeStorage::new();
        RunCheckpoint::new("busy", request(), sample_manga())
            .save(&storage, &root)
            .await?;
        // Left behind by a process that never released it.
        std::fs::write(naming::lock_path(&root, "busy"), b"")?;

        let llm = MockLlm::new(vec![], sample_script(1, &[1]));
        let mut wf = manager(dir.path(), llm, MockImageClient::default()).await?;
        let run = wf
            .resume(Some("busy"), true, &RecordingProgress::default(), &CancellationToken::new())
            .await?;
        assert_eq!(run.namespace, "busy");
        assert_eq!(run.image_paths.len(), 1);
        assert!(!Path::new(&naming::lock_path(&root, "busy")).exists());
        assert_eq!(wf.state().history.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_after_crash_before_checkpoint_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let llm = MockLlm::new(vec![sample_manga()], sample_script(1, &[2]));
        let mut wf = manager(dir.path(), llm, MockImageClient::default()).await?;
        let token = CancellationToken::new();
        let first = wf.run(request(), &RecordingProgress::default(), &token).await?;

        // History was saved but the checkpoint survived.
        RunCheckpoint::new(&first.namespace, request(), sample_manga())
            .save(&NativeStorage::new(), &root)
            .await?;
        wf.state.active_run = Some(first.namespace.clone());
        wf.store.save(&wf.state).await?;

        let again = wf.resume(None, false, &RecordingProgress::default(), &token).await?;
        assert_eq!(again.namespace, first.namespace);
        assert_eq!(wf.state().history.len(), 1);
        assert!(wf.state().active_run.is_none());
        let reloaded = StateStore::new(wf.config().state_path(), Arc::new(NativeStorage::new()))
            .load()
            .await?;
        assert_eq!(reloaded.history.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_of_finished_run_clears_active() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let llm = MockLlm::new(vec![sample_manga()], sample_script(1, &[1]));
        let mut wf = manager(dir.path(), llm, MockImageClient::default()).await?;
        let token = CancellationToken::new();
        let first = wf.run(request(), &RecordingProgress::default(), &token).await?;

        wf.state.active_run = Some(first.namespace.clone());
        wf.store.save(&wf.state).await?;

        let err = wf
            .resume(None, false, &RecordingProgress::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(wf.state().active_run.is_none());
        assert!(wf.store.load().await?.active_run.is_none());
        assert_eq!(wf.state().history.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_undecodable_panel_is_reported_as_pdf_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let llm = MockLlm::new(vec![sample_manga()], sample_script(1, &[2]));
        let images = MockImageClient {
            garbage: ["0_0_2".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let mut wf = manager(dir.path(), llm, images).await?;

        let run = wf
            .run(request(), &RecordingProgress::default(), &CancellationToken::new())
            .await?;
        let broken = naming::panel_image_path(&root, "Shadow_Walker", "0_0_2");
        assert_eq!(run.image_paths.len(), 2);
        let pdf_failures: Vec<&str> = run
            .failures
            .iter()
            .filter(|f| f.stage == "pdf")
            .map(|f| f.artifact.as_str())
            .collect();
        assert_eq!(pdf_failures, vec![broken.as_str()]);

        let doc = lopdf::Document::load(run.pdf_path.as_ref().unwrap())?;
        assert_eq!(doc.get_pages().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconfigure_swaps_clients_or_keeps_old_ones() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let llm = MockLlm::new(vec![sample_manga()], sample_script(1, &[1]));
        let mut wf = manager(dir.path(), llm, MockImageClient::default()).await?;

        let mut broken = test_config(dir.path());
        broken.llm.provider = "carrier-pigeon".to_string();
        assert!(wf.reconfigure(broken).await.is_err());
        assert_eq!(wf.config().llm.provider, "mock");
        // The mock clients are still in place.
        let run = wf
            .run(request(), &RecordingProgress::default(), &CancellationToken::new())
            .await?;
        assert_eq!(wf.state().history.len(), 1);

        let other_root = dir.path().join("elsewhere");
        let mut gemini: Config = serde_yaml_ng::from_str(
            "llm:\n  provider: gemini\n  gemini:\n    api_key: k\n",
        )?;
        gemini.project_root = other_root.to_string_lossy().to_string();
        wf.reconfigure(gemini).await?;
        assert_eq!(wf.config().llm.provider, "gemini");
        assert_eq!(wf.config().llm.model(), Some("gemini-2.5-pro"));
        assert!(other_root.is_dir());
        // State now comes from the new project root.
        assert!(wf.state().history.is_empty());
        assert!(Path::new(run.pdf_path.as_ref().unwrap()).exists());
        Ok(())
    }

    /// Native storage whose `exists` fails for paths ending in `suffix`.
    #[derive(Debug)]
    struct FlakyExists {
        inner: NativeStorage,
        suffix: &'static str,
    }

    #[async_trait]
    impl Storage for FlakyExists {
        async fn read(&self, path: &str) -> Result<Vec<u8>> {
            self.inner.read(path).await
        }
        async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
            self.inner.write(path, content).await
        }
        async fn delete(&self, path: &str) -> Result<()> {
            self.inner.delete(path).await
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            if path.ends_with(self.suffix) {
                anyhow::bail!("permission denied: {}", path);
            }
            self.inner.exists(path).await
        }
        async fn rename(&self, from: &str, to: &str) -> Result<()> {
            self.inner.rename(from, to).await
        }
    }

    #[tokio::test]
    async fn test_unverifiable_cached_panel_is_rendered_again() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let storage: Arc<dyn Storage> = Arc::new(FlakyExists {
            inner: NativeStorage::new(),
            suffix: "unreachable.png",
        });

        let mut checkpoint = RunCheckpoint::new("cached", request(), sample_manga());
        checkpoint.characters = Some(Default::default());
        checkpoint.scripts.insert(1, sample_script(1, &[2]));
        checkpoint
            .completed_panels
            .insert("0_0_1".to_string(), format!("{}/unreachable.png", root));
        checkpoint.save(storage.as_ref(), &root).await?;

        let images = MockImageClient::default();
        let image_calls = images.calls.clone();
        let llm = MockLlm::new(vec![], sample_script(1, &[2]));
        let mut wf = WorkflowManager::new(test_config(dir.path()), Box::new(llm), Box::new(images), storage).await?;
        let run = wf
            .resume(Some("cached"), false, &RecordingProgress::default(), &CancellationToken::new())
            .await?;

        let mut rendered = stems(&image_calls);
        rendered.sort();
        assert_eq!(rendered, vec!["0_0_1", "0_0_2"]);
        assert_eq!(run.image_paths[0], naming::panel_image_path(&root, "cached", "0_0_1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_view_delete_and_clear_persist() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let llm = MockLlm::new(vec![sample_manga()], sample_script(1, &[2]));
        let mut wf = manager(dir.path(), llm, MockImageClient::default()).await?;
        let run = wf
            .run(request(), &RecordingProgress::default(), &CancellationToken::new())
            .await?;

        let shown = wf.view(0, 99).await?;
        assert_eq!(shown.as_deref(), run.image_paths.last().map(String::as_str));
        assert_eq!(wf.view(5, 0).await?, None);
        let store = StateStore::new(wf.config().state_path(), Arc::new(NativeStorage::new()));
        assert_eq!(store.load().await?.cursor.panel_index, 1);

        let removed = wf.delete_run(0, true).await?.unwrap();
        assert_eq!(removed.title, "Shadow/Walker");
        assert!(!Path::new(&naming::namespace_dir(&root, "Shadow_Walker")).exists());
        assert!(store.load().await?.history.is_empty());

        wf.clear().await?;
        assert!(!Path::new(store.path()).exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_existing_directory_counts_as_collision() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stale = dir.path().join("Shadow_Walker");
        std::fs::create_dir_all(&stale)?;
        RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])).save_with_format(stale.join("kage.png"), ImageFormat::Png)?;

        let llm = MockLlm::new(vec![sample_manga()], sample_script(1, &[1]));
        let mut wf = manager(dir.path(), llm, MockImageClient::default()).await?;
        let run = wf
            .run(request(), &RecordingProgress::default(), &CancellationToken::new())
            .await?;
        assert_eq!(run.namespace, "Shadow_Walker_2");
        Ok(())
    }
}
