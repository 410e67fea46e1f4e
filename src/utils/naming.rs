//! Filesystem names for a project's artifacts.
//!
//! Every artifact lives directly under `{project_root}/{namespace}/`:
//! - character art: `{sanitized character_id}.png`
//! - panels: `{chapter_idx}_{page_idx}_{panel_number}.png`
//! - the compiled document: `generated_manga.pdf`
//! - the resume checkpoint: `checkpoint.json`

use std::path::Path;

pub const PDF_FILE_NAME: &str = "generated_manga.pdf";
pub const CHECKPOINT_FILE_NAME: &str = "checkpoint.json";
pub const LOCK_FILE_NAME: &str = ".lock";

/// Replaces path separators so `s` is usable as a single path component.
pub fn sanitize(s: &str) -> String {
    s.replace(['/', '\\'], "_")
}

/// Globally unique panel identifier. Chapter and page indices are 0-based,
/// the panel number is the one the script assigned.
pub fn panel_id(chapter_idx: usize, page_idx: usize, panel_number: u32) -> String {
    format!("{}_{}_{}", chapter_idx, page_idx, panel_number)
}

pub fn namespace_dir(project_root: &str, namespace: &str) -> String {
    join(project_root, &sanitize(namespace))
}

pub fn character_image_path(project_root: &str, namespace: &str, character_id: &str) -> String {
    join(
        &namespace_dir(project_root, namespace),
        &format!("{}.png", sanitize(character_id)),
    )
}

pub fn panel_image_path(project_root: &str, namespace: &str, panel_id: &str) -> String {
    join(
        &namespace_dir(project_root, namespace),
        &format!("{}.png", sanitize(panel_id)),
    )
}

pub fn pdf_path(project_root: &str, namespace: &str) -> String {
    join(&namespace_dir(project_root, namespace), PDF_FILE_NAME)
}

pub fn checkpoint_path(project_root: &str, namespace: &str) -> String {
    join(&namespace_dir(project_root, namespace), CHECKPOINT_FILE_NAME)
}

pub fn lock_path(project_root: &str, namespace: &str) -> String {
    join(&namespace_dir(project_root, namespace), LOCK_FILE_NAME)
}

fn join(base: &str, child: &str) -> String {
    Path::new(base).join(child).to_string_lossy().to_string()
}
