use crate::core::model::{CharacterSheet, Chapter, GlobalStyle, MangaRequest, PromptComponents};

fn or_none(s: &str) -> &str {
    if s.trim().is_empty() {
        "(none)"
    } else {
        s
    }
}

/// Outline request: title, global style, full cast and exactly
/// `num_chapters` chapter synopses.
pub fn outline_prompt(request: &MangaRequest) -> String {
    format!(
        "You are planning a manga from a story idea. Reply with one JSON object matching the \
         supplied schema and nothing else.\n\
         \n\
         Requirements:\n\
         - Produce exactly {n} chapters, numbered 1 to {n} in reading order. Each chapter needs a \
         title and a prose synopsis rich enough to storyboard from later.\n\
         - art_style_description sets the look of every image: name influences, line weight, \
         shading and screentone use, and the overall mood.\n\
         - character_sheets must list every character who appears anywhere in the story, even \
         for a single panel. Give each a short, unique character_id and describe their appearance \
         exhaustively (height, build, hair, eyes, signature clothing, usual posture) so they can be \
         drawn the same way every time.\n\
         - Only dialogue and narration may use {lang}. Titles, ids, personalities, appearances and \
         style text stay in English.\n\
         \n\
         Story idea:\n{prompt}\n\
         \n\
         Instructions:\n{instructions}\n\
         \n\
         Context:\n{context}\n",
        n = request.num_chapters,
        lang = request.lang,
        prompt = request.full_prompt(),
        instructions = or_none(&request.instructions),
        context = or_none(&request.context),
    )
}

/// Reference-sheet request for one character. No reference images are
/// attached; this call establishes the character's look.
pub fn character_prompt(sheet: &CharacterSheet, art_style: &str) -> String {
    format!(
        "Draw a full-body character reference sheet for '{id}'.\n\
         Art style: {style}\n\
         Personality, shown through pose and expression: {personality}\n\
         Appearance, follow exactly: {appearance}\n\
         Stand the character in a neutral pose on a plain grey background under even studio \
         lighting so every detail of the design is visible. Portrait orientation, no text.",
        id = sheet.character_id,
        style = art_style,
        personality = sheet.personality,
        appearance = sheet.detailed_appearance,
    )
}

/// Page and panel breakdown for one chapter.
pub fn chapter_script_prompt(chapter: &Chapter, style: &GlobalStyle, lang: &str) -> String {
    let cast = style
        .character_sheets
        .iter()
        .map(|c| format!("- {}: {} | {}", c.character_id, c.personality, c.detailed_appearance))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are storyboarding chapter {number} of a manga. Reply with one JSON object matching \
         the supplied schema and nothing else. Set chapter_number to {number} and chapter_title to \
         \"{title}\".\n\
         \n\
         Structure the chapter in four movements: set up the situation, develop it, turn it with \
         an unexpected complication, then resolve. Let panel count follow the pace: many small \
         panels for action and tension, few large ones for emotional beats. End pages on a \
         question or reveal where it helps the page turn.\n\
         \n\
         For every panel fill scene_description like a director's shot list: a precise \
         camera_shot, the subject, a nuanced emotion, the physical action, the environment, \
         style_tags such as 'dutch angle' or 'motion blur', an aspect_ratio from the allowed list, \
         and character_ids naming every visible character using only the ids listed below. \
         Panel numbers start at 1 on each page and never repeat within a page. Describe speech \
         bubbles and sound effects inside action_description.\n\
         \n\
         Dialogue and narration are in {lang}, written in Latin letters. Everything else is in \
         English.\n\
         \n\
         Chapter synopsis:\n{story}\n\
         \n\
         Art style: {art}\n\
         \n\
         Characters:\n{cast}\n",
        number = chapter.chapter_number,
        title = chapter.chapter_title,
        lang = lang,
        story = chapter.story,
        art = style.art_style_description,
        cast = cast,
    )
}

/// Single panel render, to be sent after the character reference images.
pub fn panel_prompt(scene: &PromptComponents, art_style: &str) -> String {
    format!(
        "Draw one manga panel that keeps the attached characters looking exactly like their \
         reference images.\n\
         Shot: {shot}. Subject: {subject}.\n\
         Emotion: {emotion}.\n\
         Action: {action}.\n\
         Setting: {environment}, lit to support the mood.\n\
         Art style: {style}. Style cues: {tags}.\n\
         Include speech bubbles or captions only where the action calls for them. \
         Aspect ratio {ratio}.",
        shot = scene.camera_shot,
        subject = scene.subject,
        emotion = scene.emotion,
        action = scene.action_description,
        environment = scene.environment_description,
        style = art_style,
        tags = scene.style_tags.join(", "),
        ratio = scene.aspect_ratio,
    )
}
