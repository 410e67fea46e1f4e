//! `{ history: [GenerationRun], cursor, lastSaved, activeRun }`, loaded
//! tolerantly: bad entries are skipped and bad snapshots become `null`.

use crate::core::error::PipelineError;
use crate::core::io::Storage;
use crate::core::model::Manga;
use anyhow::Result;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A character or panel that could not be rendered.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactFailure {
    /// `character`, `chapter`, `panel` or `pdf`.
    pub stage: String,
    /// Character id, chapter number, panel id or image path.
    pub artifact: String,
    pub error: String,
}

impl ArtifactFailure {
    pub fn new(stage: &str, artifact: &str, error: &PipelineError) -> Self {
        Self {
            stage: stage.to_string(),
            artifact: artifact.to_string(),
            error: error.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRun {
    pub title: String,
    pub chapter_count: usize,
    /// Panels scripted across all chapters, rendered or not.
    pub panel_count: usize,
    /// Rendered panel images in chapter/page/panel order.
    pub image_paths: Vec<String>,
    pub pdf_path: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    #[serde(default)]
    pub manga_snapshot: Option<Manga>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub failures: Vec<ArtifactFailure>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub selected_run_index: usize,
    pub panel_index: usize,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    #[serde(default)]
    pub history: Vec<GenerationRun>,
    #[serde(default)]
    pub cursor: Cursor,
    #[serde(default)]
    pub last_saved: Option<String>,
    /// Namespace of a run that started but has not completed.
    #[serde(default)]
    pub active_run: Option<String>,
}

impl ProjectState {
    pub fn push_run(&mut self, run: GenerationRun) {
        self.history.push(run);
        self.cursor = Cursor {
            selected_run_index: self.history.len() - 1,
            panel_index: 0,
        };
    }

    /// Removes the entry at `index`, keeping the cursor on the same run
    /// where possible.
    pub fn delete_run(&mut self, index: usize) -> Option<GenerationRun> {
        if index >= self.history.len() {
            return None;
        }
        let removed = self.history.remove(index);

        let selected = self.cursor.selected_run_index;
        if self.history.is_empty() {
            self.cursor = Cursor::default();
        } else if selected > index {
            self.cursor.selected_run_index = selected - 1;
        } else if selected == index {
            self.cursor.selected_run_index = selected.min(self.history.len() - 1);
            self.cursor.panel_index = 0;
        }
        Some(removed)
    }

    pub fn select_run(&mut self, index: usize) -> bool {
        if index >= self.history.len() {
            return false;
        }
        self.cursor = Cursor {
            selected_run_index: index,
            panel_index: 0,
        };
        true
    }

    /// Moves the panel cursor, clamped to the selected run's images.
    pub fn set_panel_index(&mut self, index: usize) -> usize {
        let max = self
            .selected_run()
            .map(|r| r.image_paths.len().saturating_sub(1))
            .unwrap_or(0);
        self.cursor.panel_index = index.min(max);
        self.cursor.panel_index
    }

    pub fn selected_run(&self) -> Option<&GenerationRun> {
        self.history.get(self.cursor.selected_run_index)
    }

    pub fn current_panel_path(&self) -> Option<&str> {
        self.selected_run()
            .and_then(|r| r.image_paths.get(self.cursor.panel_index))
            .map(String::as_str)
    }

    pub fn namespace_in_use(&self, namespace: &str) -> bool {
        self.active_run.as_deref() == Some(namespace)
            || self.history.iter().any(|r| r.namespace == namespace)
    }
}

pub struct StateStore {
    path: String,
    storage: Arc<dyn Storage>,
}

impl StateStore {
    pub fn new(path: impl Into<String>, storage: Arc<dyn Storage>) -> Self {
        Self {
            path: path.into(),
            storage,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Absent or unreadable files load as the default. A file that only
    /// partly decodes is first copied to `<path>.partial-<ts>`.
    pub async fn load(&self) -> Result<ProjectState> {
        if !self.storage.exists(&self.path).await? {
            return Ok(ProjectState::default());
        }

        let bytes = self.storage.read(&self.path).await?;
        let value: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                self.quarantine(&e.to_string()).await?;
                return Ok(ProjectState::default());
            }
        };

        match decode_state(value) {
            Ok((state, 0)) => Ok(state),
            Ok((state, dropped)) => {
                self.keep_partial(&bytes, dropped).await?;
                Ok(state)
            }
            Err(reason) => {
                self.quarantine(&reason).await?;
                Ok(ProjectState::default())
            }
        }
    }

    // Temp file, then rename over the previous one.
    pub async fn save(&self, state: &ProjectState) -> Result<()> {
        let mut stamped = state.clone();
        stamped.last_saved = Some(chrono::Utc::now().to_rfc3339());

        let tmp = format!("{}.tmp", self.path);
        let content = serde_json::to_string_pretty(&stamped)?;
        self.storage.write(&tmp, content.as_bytes()).await?;
        self.storage.rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.storage.delete(&self.path).await?;
        info!("Cleared project state at {}", self.path);
        Ok(())
    }

    async fn quarantine(&self, reason: &str) -> Result<()> {
        let err = PipelineError::PersistenceCorruption {
            path: self.path.clone(),
            reason: reason.to_string(),
        };
        let aside = format!("{}.corrupt-{}", self.path, chrono::Utc::now().timestamp());
        warn!("{}; moving it to {} and starting fresh", err, aside);
        self.storage.rename(&self.path, &aside).await
    }

    async fn keep_partial(&self, original: &[u8], dropped: usize) -> Result<()> {
        let copy = format!("{}.partial-{}", self.path, chrono::Utc::now().timestamp());
        self.storage.write(&copy, original).await?;
        warn!("{} unreadable item(s) left out of {}; original kept at {}", dropped, self.path, copy);
        Ok(())
    }
}

// Returns the state and how many entries or snapshots were dropped.
fn decode_state(value: Value) -> std::result::Result<(ProjectState, usize), String> {
    let Value::Object(mut root) = value else {
        return Err("top-level value is not an object".to_string());
    };

    let mut dropped = 0;
    let history = match root.remove("history") {
        Some(Value::Array(entries)) => entries
            .into_iter()
            .enumerate()
            .filter_map(|(i, entry)| match decode_run(entry) {
                Ok((run, snapshot_lost)) => {
                    dropped += usize::from(snapshot_lost);
                    Some(run)
                }
                Err(e) => {
                    warn!("Skipping unreadable history entry {}: {}", i, e);
                    dropped += 1;
                    None
                }
            })
            .collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(_) => return Err("history is not an array".to_string()),
    };

    let cursor = root
        .remove("cursor")
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let last_saved = root
        .remove("lastSaved")
        .and_then(|v| v.as_str().map(str::to_string));
    let active_run = root
        .remove("activeRun")
        .and_then(|v| v.as_str().map(str::to_string));

    let mut state = ProjectState {
        history,
        cursor,
        last_saved,
        active_run,
    };
    if state.cursor.selected_run_index >= state.history.len() {
        state.cursor = Cursor::default();
    }
    Ok((state, dropped))
}

// The flag is set when the entry had a snapshot that could not be decoded.
fn decode_run(entry: Value) -> std::result::Result<(GenerationRun, bool), serde_json::Error> {
    let mut entry = entry;
    let snapshot = entry
        .as_object_mut()
        .and_then(|obj| obj.remove("mangaSnapshot"));

    let mut run: GenerationRun = serde_json::from_value(entry)?;
    let mut lost = false;
    run.manga_snapshot = match snapshot {
        Some(Value::Null) | None => None,
        Some(v) => match serde_json::from_value::<Manga>(v) {
            Ok(manga) => Some(manga),
            Err(e) => {
                warn!("Snapshot of '{}' could not be restored: {}", run.title, e);
                lost = true;
                None
            }
        },
    };
    Ok((run, lost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::model::tests::sample_manga;
    use serde_json::json;

    fn run(title: &str, images: usize, snapshot: Option<Manga>) -> GenerationRun {
        GenerationRun {
            title: title.to_string(),
            chapter_count: 1,
            panel_count: images,
            image_paths: (0..images).map(|i| format!("{}/0_0_{}.png", title, i + 1)).collect(),
            pdf_path: Some(format!("{}/generated_manga.pdf", title)),
            timestamp: 1_700_000_000.5,
            manga_snapshot: snapshot,
            namespace: title.to_string(),
            failures: vec![],
        }
    }

    fn store(dir: &tempfile::TempDir) -> StateStore {
        let path = dir.path().join("state.json").to_string_lossy().to_string();
        StateStore::new(path, Arc::new(NativeStorage::new()))
    }

    #[tokio::test]
    async fn test_missing_file_loads_default() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(store(&dir).load().await?, ProjectState::default());
        Ok(())
    }

    #[tokio::test]
    async fn test_round_trip_with_and_without_snapshot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(&dir);

        let mut state = ProjectState::default();
        state.push_run(run("alpha", 3, Some(sample_manga())));
        state.push_run(run("beta", 2, None));
        store.save(&state).await?;

        let loaded = store.load().await?;
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.history[0].image_paths, state.history[0].image_paths);
        assert_eq!(loaded.history[1].image_paths, state.history[1].image_paths);
        assert_eq!(loaded.history[0].pdf_path, state.history[0].pdf_path);
        assert_eq!(loaded.history[1].pdf_path, state.history[1].pdf_path);
        assert_eq!(loaded.history[0].manga_snapshot, Some(sample_manga()));
        assert_eq!(loaded.history[1].manga_snapshot, None);
        assert!(loaded.last_saved.is_some());
        assert!(!dir.path().join("state.json.tmp").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_snapshot_and_entry_do_not_abort_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(&dir);
        let doc = json!({
            "history": [
                {
                    "title": "damaged", "chapterCount": 2, "panelCount": 7,
                    "imagePaths": ["d/0_0_1.png", "d/0_0_2.png"], "pdfPath": null,
                    "timestamp": 1.0, "mangaSnapshot": {"title": 42}
                },
                { "title": "no counts at all" },
                {
                    "title": "legacy", "chapterCount": 1, "panelCount": 1,
                    "imagePaths": ["l/0_0_1.png"], "pdfPath": "l/generated_manga.pdf",
                    "timestamp": 2.0,
                    "mangaSnapshot": {
                        "title": "legacy",
                        "global_style": {
                            "art_style_description": "ink",
                            "character_sheets": [
                                {"character_id": "a", "personality": "b", "detailed_appearence": "c"}
                            ]
                        },
                        "chapters": []
                    }
                }
            ],
            "cursor": {"selectedRunIndex": 1, "panelIndex": 0},
            "lastSaved": "2024-01-01T00:00:00Z"
        });
        std::fs::write(store.path(), serde_json::to_vec(&doc)?)?;

        let loaded = store.load().await?;
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.history[0].title, "damaged");
        assert_eq!(loaded.history[0].panel_count, 7);
        assert_eq!(loaded.history[0].image_paths.len(), 2);
        assert!(loaded.history[0].manga_snapshot.is_none());

        let legacy = loaded.history[1].manga_snapshot.as_ref().unwrap();
        assert_eq!(legacy.global_style.character_sheets[0].detailed_appearance, "c");
        assert_eq!(partial_copies(&dir)?.len(), 1);
        Ok(())
    }

    fn partial_copies(dir: &tempfile::TempDir) -> Result<Vec<std::path::PathBuf>> {
        Ok(std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("state.json.partial-"))
            .map(|e| e.path())
            .collect())
    }

    #[tokio::test]
    async fn test_dropped_items_survive_the_next_save() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(&dir);
        let doc = json!({
            "history": [
                {
                    "title": "good", "chapterCount": 1, "panelCount": 1,
                    "imagePaths": ["g/0_0_1.png"], "pdfPath": null, "timestamp": 1.0,
                    "mangaSnapshot": {"chapters": "nope"}
                },
                {
                    "title": "negative", "chapterCount": -1, "panelCount": 1,
                    "imagePaths": [], "pdfPath": null, "timestamp": 2.0
                }
            ]
        });
        let original = serde_json::to_vec(&doc)?;
        std::fs::write(store.path(), &original)?;

        let mut state = store.load().await?;
        assert_eq!(state.history.len(), 1);
        assert!(state.select_run(0));
        store.save(&state).await?;

        let copies = partial_copies(&dir)?;
        assert_eq!(copies.len(), 1);
        assert_eq!(std::fs::read(&copies[0])?, original);

        // A clean reload makes no further copies.
        store.load().await?;
        assert_eq!(partial_copies(&dir)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_clean_load_makes_no_partial_copy() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(&dir);
        let mut state = ProjectState::default();
        state.push_run(run("alpha", 1, Some(sample_manga())));
        store.save(&state).await?;

        store.load().await?;
        assert!(partial_copies(&dir)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_file_is_preserved_aside() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(&dir);
        std::fs::write(store.path(), b"{ not json")?;

        let loaded = store.load().await?;
        assert!(loaded.history.is_empty());
        assert!(!dir.path().join("state.json").exists());

        let aside: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("state.json.corrupt-"))
            .collect();
        assert_eq!(aside.len(), 1);
        assert_eq!(std::fs::read(aside[0].path())?, b"{ not json");
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_persists_and_preserves_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(&dir);

        let mut state = ProjectState::default();
        for title in ["a", "b", "c", "d"] {
            state.push_run(run(title, 1, None));
        }
        store.save(&state).await?;

        let mut state = store.load().await?;
        let removed = state.delete_run(1).unwrap();
        assert_eq!(removed.title, "b");
        store.save(&state).await?;

        let reloaded = store.load().await?;
        let titles: Vec<&str> = reloaded.history.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "c", "d"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_removes_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = store(&dir);
        store.save(&ProjectState::default()).await?;
        store.clear().await?;
        assert!(!dir.path().join("state.json").exists());
        Ok(())
    }

    #[test]
    fn test_cursor_follows_deletions_and_clamps() {
        let mut state = ProjectState::default();
        state.push_run(run("a", 2, None));
        state.push_run(run("b", 4, None));
        state.push_run(run("c", 1, None));

        assert!(state.select_run(2));
        state.delete_run(0);
        assert_eq!(state.cursor.selected_run_index, 1);
        assert_eq!(state.selected_run().unwrap().title, "c");

        state.delete_run(1);
        assert_eq!(state.cursor.selected_run_index, 0);
        assert_eq!(state.selected_run().unwrap().title, "b");

        assert_eq!(state.set_panel_index(99), 3);
        assert_eq!(state.current_panel_path(), Some("b/0_0_4.png"));

        assert!(!state.select_run(5));
        state.delete_run(0);
        assert_eq!(state.cursor, Cursor::default());
        assert_eq!(state.current_panel_path(), None);
        assert!(state.delete_run(0).is_none());
    }

    #[test]
    fn test_namespace_in_use() {
        let mut state = ProjectState::default();
        state.push_run(run("taken", 1, None));
        state.active_run = Some("running".to_string());
        assert!(state.namespace_in_use("taken"));
        assert!(state.namespace_in_use("running"));
        assert!(!state.namespace_in_use("free"));
    }
}
