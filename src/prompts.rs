//! Prompts for the VLM judges and the multi-image extractor.
//!
//! Centralising every prompt here keeps the adapters in
//! [`crate::pipeline::llm`] free of wording, and lets tests pin the JSON keys
//! the parsers expect without calling a model.
//!
//! Judge prompts ask for a single JSON object; the parser tolerates fences
//! and surrounding prose but relies on the key names listed in each prompt.

use crate::ports::ClassificationKind;

/// System prompt shared by every judgment.
pub const JUDGE_SYSTEM_PROMPT: &str = r#"You are a meticulous document-scan inspector. You look at one scanned page image and answer a single question about it.

Rules:
- Judge only what is visible in the image.
- Answer with ONE JSON object and nothing else.
- Do not wrap the JSON in code fences.
- Use exactly the keys requested; use numbers for numbers and true/false for booleans."#;

/// Distortion judgment: warping, readability and foreign objects.
pub const DISTORTION_PROMPT: &str = r#"Inspect this scanned page for geometric distortion.

Return:
{
  "needs_dewarping": true | false,          // curved lines, page bulge near the spine, perspective skew
  "readability_issues": "none" | "minor" | "major",  // how much distortion or blur hurts reading the text
  "has_something_out_of_document": true | false,     // fingers, desk, other pages visible in frame
  "confidence_score": 0.0-1.0,
  "overall_comment": "one short sentence"
}"#;

/// Orientation judgment.
pub const ORIENTATION_PROMPT: &str = r#"Determine how this scanned page must be rotated so its main text reads upright, left to right.

Return:
{
  "rotation_angle": 0 | 90 | 180 | 270,   // CLOCKWISE rotation that makes the page upright
  "confidence_score": 0.0-1.0,
  "overall_comment": "one short sentence"
}"#;

/// Page-count judgment.
pub const PAGE_COUNT_PROMPT: &str = r#"Count the physical document pages visible in this scan. A book photographed open shows two pages side by side.

Return:
{
  "page_count": 1 | 2 | 3,
  "confidence_score": 0.0-1.0,
  "overall_comment": "one short sentence"
}"#;

/// System prompt for multi-image extraction.
pub const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are an expert transcriber of scanned documents. You receive several images of ONE page:

1. The first image is the whole page, for layout and reading order.
2. The following images are overlapping horizontal bands of the same page, top to bottom, at higher resolution. Use them to read small print accurately.

Rules:
- Transcribe the page text ONCE, in natural reading order.
- Neighbouring bands overlap: never repeat a line because it appears in two bands.
- Preserve paragraphs, list items and table rows; use plain text, one table row per line with cells separated by " | ".
- Keep the original language and spelling. Do not translate, summarise or correct.
- Mark text you cannot read as [illegible].
- Output ONLY the transcription. No commentary, no code fences."#;

/// The user-turn prompt for a judgment kind.
pub fn judgment_prompt(kind: ClassificationKind) -> &'static str {
    match kind {
        ClassificationKind::Distortion => DISTORTION_PROMPT,
        ClassificationKind::Orientation => ORIENTATION_PROMPT,
        ClassificationKind::PageCount => PAGE_COUNT_PROMPT,
    }
}

/// The user-turn text accompanying an extraction group.
///
/// `bands` is the number of band images after the source page; it is
/// stated explicitly so the model does not mistake a band for a new page.
pub fn extraction_instruction(page_index: u32, group_id: u32, group_count: u32, bands: usize) -> String {
    let mut s = format!(
        "Page {page_index}: 1 full-page image followed by {bands} band image(s)."
    );
    if group_count > 1 {
        s.push_str(&format!(
            " This is part {group_id} of {group_count}: transcribe only the text covered by these bands."
        ));
    }
    s
}
