//! Extraction results, the document aggregate and run statistics.

use crate::error::GroupError;
use crate::model::ExtractionGroup;
use crate::pipeline::postprocess::clean_text;
use crate::ports::ExtractionOutput;
use crate::stage::StageRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ── ExtractionResult ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractionStatus {
    Succeeded,
    Failed { error: GroupError },
}

impl ExtractionStatus {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, ExtractionStatus::Succeeded)
    }
}

/// Outcome of one extraction group. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub session_id: String,
    pub document_id: String,
    pub page_index: u32,
    pub group_id: u32,
    /// Normalised text; empty on failure.
    pub text: String,
    pub status: ExtractionStatus,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractionResult {
    pub fn succeeded(session_id: &str, group: &ExtractionGroup, output: ExtractionOutput, attempts: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            document_id: group.document_id.clone(),
            page_index: group.page_index,
            group_id: group.group_id,
            text: clean_text(&output.text),
            status: ExtractionStatus::Succeeded,
            attempts,
            input_tokens: output.input_tokens,
            output_tokens: output.output_tokens,
            extracted_at: Utc::now(),
        }
    }

    pub fn failed(session_id: &str, group: &ExtractionGroup, error: GroupError, attempts: u32) -> Self {
        Self {
            session_id: session_id.to_string(),
            document_id: group.document_id.clone(),
            page_index: group.page_index,
            group_id: group.group_id,
            text: String::new(),
            status: ExtractionStatus::Failed { error },
            attempts,
            input_tokens: 0,
            output_tokens: 0,
            extracted_at: Utc::now(),
        }
    }

    /// `page_003_group_01.json`, or `page_003_group_01.failed.json` for a
    /// failure record.
    pub fn key(&self) -> String {
        let stem = format!("page_{:03}_group_{:02}", self.page_index, self.group_id);
        if self.status.is_succeeded() {
            format!("{stem}.json")
        } else {
            format!("{stem}.failed.json")
        }
    }
}

// ── Aggregate ────────────────────────────────────────────────────────────

/// Everything Stage 7 produced for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub session_id: String,
    pub document_id: String,
    pub total_groups: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_input_tokens: usize,
    pub total_output_tokens: usize,
    /// Sorted by `(page_index, group_id)`.
    pub results: Vec<ExtractionResult>,
    /// Successful texts joined in reading order.
    pub text: String,
}

impl Aggregate {
    /// Sort `results` into reading order and assemble the document text.
    pub fn from_results(session_id: &str, document_id: &str, mut results: Vec<ExtractionResult>) -> Self {
        results.sort_by_key(|r| (r.page_index, r.group_id));

        let succeeded = results.iter().filter(|r| r.status.is_succeeded()).count();
        let text = results
            .iter()
            .filter(|r| r.status.is_succeeded() && !r.text.trim().is_empty())
            .map(|r| format!("{}\n\n{}", separator(r.page_index, r.group_id), r.text.trim_end()))
            .collect::<Vec<_>>()
            .join("\n\n");

        Self {
            session_id: session_id.to_string(),
            document_id: document_id.to_string(),
            total_groups: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            total_input_tokens: results.iter().map(|r| r.input_tokens).sum(),
            total_output_tokens: results.iter().map(|r| r.output_tokens).sum(),
            results,
            text: if text.is_empty() { text } else { format!("{text}\n") },
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExtractionResult> {
        self.results.iter().filter(|r| !r.status.is_succeeded())
    }
}

/// `--- page 3 · group 1 ---`
fn separator(page_index: u32, group_id: u32) -> String {
    format!("--- page {page_index} · group {group_id} ---")
}

// ── DocumentReport ───────────────────────────────────────────────────────

/// What a full pipeline run returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReport {
    pub session_id: String,
    pub document_id: String,
    /// `<output_root>/<session_id>`
    pub session_root: PathBuf,
    /// Pages after Stage 4.
    pub pages: usize,
    pub stages: Vec<StageRecord>,
    pub aggregate: Aggregate,
    pub duration_ms: u64,
}
