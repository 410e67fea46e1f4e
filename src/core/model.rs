use crate::core::error::PipelineError;
use crate::core::schema::{Field, Schema, Structured};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Aspect ratios the image model accepts.
pub const ASPECT_RATIOS: &[&str] = &[
    "1:1", "2:3", "3:2", "3:4", "4:3", "4:5", "5:4", "9:16", "16:9", "21:9",
];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CharacterSheet {
    pub character_id: String,
    pub personality: String,
    #[serde(alias = "detailed_appearence")]
    pub detailed_appearance: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GlobalStyle {
    pub art_style_description: String,
    pub character_sheets: Vec<CharacterSheet>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Chapter {
    pub chapter_number: u32,
    pub chapter_title: String,
    pub story: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Manga {
    pub title: String,
    pub global_style: GlobalStyle,
    pub chapters: Vec<Chapter>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PromptComponents {
    pub camera_shot: String,
    pub subject: String,
    pub emotion: String,
    pub action_description: String,
    pub environment_description: String,
    pub style_tags: Vec<String>,
    pub aspect_ratio: String,
    pub character_ids: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Panel {
    pub panel_number: u32,
    pub scene_description: PromptComponents,
}

/// Layout metadata only; generation ignores it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PanelPlacement {
    pub panel_number: u32,
    pub grid_row: u32,
    pub grid_col: u32,
    pub row_span: u32,
    pub col_span: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PageLayout {
    pub grid_rows: u32,
    pub grid_columns: u32,
    pub placements: Vec<PanelPlacement>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Page {
    pub page_number: u32,
    pub layout: PageLayout,
    pub panels: Vec<Panel>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MangaChapterScript {
    pub chapter_number: u32,
    pub chapter_title: String,
    pub pages: Vec<Page>,
}

/// User input for one pipeline run.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MangaRequest {
    pub prompt: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default = "default_num_chapters")]
    pub num_chapters: usize,
    #[serde(default = "default_lang")]
    pub lang: String,
    /// Overrides the provider's configured model when set.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub art_style: Option<String>,
}

fn default_num_chapters() -> usize {
    5
}

fn default_lang() -> String {
    "english".to_string()
}

impl MangaRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: String::new(),
            instructions: String::new(),
            num_chapters: default_num_chapters(),
            lang: default_lang(),
            model: None,
            art_style: None,
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.prompt.trim().is_empty() {
            return Err(PipelineError::Config("prompt must not be empty".to_string()));
        }
        if self.num_chapters == 0 {
            return Err(PipelineError::Config(
                "at least one chapter must be requested".to_string(),
            ));
        }
        Ok(())
    }

    /// The prompt with the optional art style appended.
    pub fn full_prompt(&self) -> String {
        match self.art_style.as_deref().map(str::trim) {
            Some(style) if !style.is_empty() => format!("{}\n\n{}", self.prompt, style),
            _ => self.prompt.clone(),
        }
    }
}

impl Manga {
    /// Enforces the outline invariants in place.
    ///
    /// Chapters are renumbered `1..=N` by position and duplicate character ids
    /// are dropped (first occurrence wins).
    pub fn normalize(&mut self) {
        for (i, chapter) in self.chapters.iter_mut().enumerate() {
            let expected = i as u32 + 1;
            if chapter.chapter_number != expected {
                warn!(
                    "Renumbering chapter '{}' from {} to {}",
                    chapter.chapter_title, chapter.chapter_number, expected
                );
                chapter.chapter_number = expected;
            }
        }

        let mut seen = HashSet::new();
        self.global_style.character_sheets.retain(|sheet| {
            let fresh = seen.insert(sheet.character_id.clone());
            if !fresh {
                warn!("Dropping duplicate character sheet '{}'", sheet.character_id);
            }
            fresh
        });
    }
}

impl MangaChapterScript {
    pub fn panel_count(&self) -> usize {
        self.pages.iter().map(|p| p.panels.len()).sum()
    }

    /// Makes panel numbers unique within every page by renumbering
    /// duplicates by position.
    pub fn normalize(&mut self) {
        for page in &mut self.pages {
            let mut seen = HashSet::new();
            let unique = page.panels.iter().all(|p| seen.insert(p.panel_number));
            if !unique {
                warn!(
                    "Chapter {} page {} has duplicate panel numbers, renumbering",
                    self.chapter_number, page.page_number
                );
                for (i, panel) in page.panels.iter_mut().enumerate() {
                    panel.panel_number = i as u32 + 1;
                }
            }
        }
    }
}

fn character_sheet_schema() -> Schema {
    Schema::Object(vec![
        Field::required("character_id", Schema::String)
            .describe("Unique, stable identifier for the character"),
        Field::required("personality", Schema::String),
        Field::required("detailed_appearance", Schema::String).describe(
            "Exhaustive visual description: height, build, hair, eyes, clothing, posture",
        ),
    ])
}

fn global_style_schema() -> Schema {
    Schema::Object(vec![
        Field::required("art_style_description", Schema::String),
        Field::required("character_sheets", Schema::array(character_sheet_schema())),
    ])
}

fn chapter_schema() -> Schema {
    Schema::Object(vec![
        Field::required("chapter_number", Schema::Integer),
        Field::required("chapter_title", Schema::String),
        Field::required("story", Schema::String),
    ])
}

fn prompt_components_schema() -> Schema {
    Schema::Object(vec![
        Field::required("camera_shot", Schema::String),
        Field::required("subject", Schema::String),
        Field::required("emotion", Schema::String),
        Field::required("action_description", Schema::String),
        Field::required("environment_description", Schema::String),
        Field::required("style_tags", Schema::array(Schema::String)),
        Field::required("aspect_ratio", Schema::Enum(ASPECT_RATIOS.to_vec())),
        Field::required("character_ids", Schema::array(Schema::String))
            .describe("character_id values of every character visible in the panel"),
    ])
}

fn page_schema() -> Schema {
    let placement = Schema::Object(vec![
        Field::required("panel_number", Schema::Integer),
        Field::required("grid_row", Schema::Integer),
        Field::required("grid_col", Schema::Integer),
        Field::required("row_span", Schema::Integer),
        Field::required("col_span", Schema::Integer),
    ]);
    let layout = Schema::Object(vec![
        Field::required("grid_rows", Schema::Integer),
        Field::required("grid_columns", Schema::Integer),
        Field::required("placements", Schema::array(placement)),
    ]);
    let panel = Schema::Object(vec![
        Field::required("panel_number", Schema::Integer),
        Field::required("scene_description", prompt_components_schema()),
    ]);
    Schema::Object(vec![
        Field::required("page_number", Schema::Integer),
        Field::required("layout", layout),
        Field::required("panels", Schema::array(panel)),
    ])
}

impl Structured for Manga {
    const NAME: &'static str = "Manga";

    fn schema() -> Schema {
        Schema::Object(vec![
            Field::required("title", Schema::String),
            Field::required("global_style", global_style_schema()),
            Field::required("chapters", Schema::array(chapter_schema())),
        ])
    }
}

impl Structured for MangaChapterScript {
    const NAME: &'static str = "MangaChapterScript";

    fn schema() -> Schema {
        Schema::Object(vec![
            Field::required("chapter_number", Schema::Integer),
            Field::required("chapter_title", Schema::String),
            Field::required("pages", Schema::array(page_schema())),
        ])
    }
}
