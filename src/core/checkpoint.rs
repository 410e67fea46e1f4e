use crate::core::io::Storage;
use crate::core::model::{Manga, MangaChapterScript, MangaRequest};
use crate::core::state::ArtifactFailure;
use crate::utils::naming;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Working state of an unfinished run, stored next to its artifacts.
///
/// Chapter scripts are cached here only; they never reach the history.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunCheckpoint {
    pub namespace: String,
    pub request: MangaRequest,
    pub manga: Manga,
    /// `None` until the character stage has resolved. Each entry maps a
    /// character id to its confirmed image, or `None` if rendering failed.
    #[serde(default)]
    pub characters: Option<BTreeMap<String, Option<String>>>,
    #[serde(default)]
    pub scripts: BTreeMap<u32, MangaChapterScript>,
    /// Panel id to rendered image path.
    #[serde(default)]
    pub completed_panels: BTreeMap<String, String>,
    #[serde(default)]
    pub failures: Vec<ArtifactFailure>,
}

impl RunCheckpoint {
    pub fn new(namespace: &str, request: MangaRequest, manga: Manga) -> Self {
        Self {
            namespace: namespace.to_string(),
            request,
            manga,
            characters: None,
            scripts: BTreeMap::new(),
            completed_panels: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    pub async fn load(
        storage: &dyn Storage,
        project_root: &str,
        namespace: &str,
    ) -> Result<Option<Self>> {
        let path = naming::checkpoint_path(project_root, namespace);
        if !storage.exists(&path).await? {
            return Ok(None);
        }
        let bytes = storage.read(&path).await?;
        let checkpoint = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse checkpoint {}", path))?;
        Ok(Some(checkpoint))
    }

    pub async fn save(&self, storage: &dyn Storage, project_root: &str) -> Result<()> {
        let path = naming::checkpoint_path(project_root, &self.namespace);
        let tmp = format!("{}.tmp", path);
        let content = serde_json::to_string_pretty(self)?;
        storage.write(&tmp, content.as_bytes()).await?;
        storage.rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn delete(storage: &dyn Storage, project_root: &str, namespace: &str) -> Result<()> {
        storage
            .delete(&naming::checkpoint_path(project_root, namespace))
            .await
    }

    pub fn record_failure(&mut self, failure: ArtifactFailure) {
        self.failures
            .retain(|f| !(f.stage == failure.stage && f.artifact == failure.artifact));
        self.failures.push(failure);
    }

    pub fn clear_failure(&mut self, stage: &str, artifact: &str) {
        self.failures
            .retain(|f| !(f.stage == stage && f.artifact == artifact));
    }
}
