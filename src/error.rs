//! Error types for the edgequake-scanprep library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`]: **Fatal**: the stage cannot produce its artifacts
//!   (missing upstream artifact, classifier unreachable, correction failed,
//!   session already open). The orchestrator wraps it in
//!   [`PipelineError::StageFailed`], marks the session `failed` and stops.
//!
//! * [`GroupError`]: **Non-fatal**: one extraction group failed after its
//!   retry budget while its siblings are fine. Stored inside
//!   [`crate::output::ExtractionResult`] so callers can inspect partial
//!   success rather than losing the whole document to one bad band.

use crate::stage::StageId;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-scanprep library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// No input was given and the input directory holds no PDF.
    #[error("No PDF found in '{dir}'\nPass an INPUT path or set --input-dir.")]
    NoInput { dir: PathBuf },

    /// The input string is neither a readable path nor an HTTP/HTTPS URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but the download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// pdfium could not open the document.
    #[error("PDF '{path}' could not be opened: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    Rasterization { page: u32, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
PDFium is normally downloaded automatically on first run.\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Session store errors ──────────────────────────────────────────────
    /// A stage asked for an artifact no upstream stage produced.
    #[error("Artifact '{stage}/{key}' not found in session '{session_id}'")]
    ArtifactNotFound {
        session_id: String,
        stage: String,
        key: String,
    },

    /// A session with this id is already open.
    #[error("Session '{session_id}' is already open\nPick another --session-id or close the running session.")]
    SessionConflict { session_id: String },

    /// Filesystem failure inside the session store or input resolution.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON artifact could not be encoded or decoded.
    #[error("Failed to (de)serialise '{what}': {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    // ── Capability errors ─────────────────────────────────────────────────
    /// The classifier could not produce a verdict.
    #[error("Classification '{kind}' unavailable for page {page}: {detail}")]
    ClassificationUnavailable {
        kind: String,
        page: u32,
        detail: String,
    },

    /// A correction could not be applied.
    #[error("Correction '{kind}' failed for page {page}: {detail}")]
    CorrectionFailed {
        kind: String,
        page: u32,
        detail: String,
    },

    /// One extraction attempt failed. Retried by the controller.
    #[error("Extraction failed for page {page} group {group}: {detail}")]
    ExtractionFailed { page: u32, group: u32, detail: String },

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Pipeline control ──────────────────────────────────────────────────
    /// A stage failed; the session is marked failed and later stages never run.
    #[error("{stage} failed: {source}")]
    StageFailed {
        stage: StageId,
        #[source]
        source: Box<PipelineError>,
    },

    /// The run was cancelled through its cancellation token.
    #[error("Pipeline cancelled")]
    Cancelled,

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder or TOML validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the concurrency controller may retry this error.
    ///
    /// Only transient extraction failures qualify; a missing artifact or a
    /// cancelled run will fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::ExtractionFailed { .. })
    }

    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap a serde_json error with a description of what was being handled.
    pub fn serialization(what: impl Into<String>, source: serde_json::Error) -> Self {
        PipelineError::Serialization {
            what: what.into(),
            source,
        }
    }

    /// The innermost error, unwrapping any `StageFailed` layers.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// A non-fatal error for a single extraction group.
///
/// Stored in [`crate::output::ExtractionStatus::Failed`]. The document
/// completes unless the caller decides otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum GroupError {
    /// Every attempt failed with a retryable error.
    #[error("page {page} group {group}: extraction failed after {attempts} attempt(s): {detail}")]
    Exhausted {
        page: u32,
        group: u32,
        attempts: u32,
        detail: String,
    },

    /// The first failure was not retryable.
    #[error("page {page} group {group}: {detail}")]
    Permanent { page: u32, group: u32, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_not_found_display() {
        let e = PipelineError::ArtifactNotFound {
            session_id: "scan_20240101_120000".into(),
            stage: "rotated_images".into(),
            key: "page_001.png".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("rotated_images/page_001.png"), "got: {msg}");
        assert!(msg.contains("scan_20240101_120000"));
    }

    #[test]
    fn only_extraction_failures_are_retryable() {
        let transient = PipelineError::ExtractionFailed {
            page: 1,
            group: 2,
            detail: "HTTP 503".into(),
        };
        assert!(transient.is_retryable());

        let missing = PipelineError::ArtifactNotFound {
            session_id: "s".into(),
            stage: "split_bands".into(),
            key: "groups.json".into(),
        };
        assert!(!missing.is_retryable());
        assert!(!PipelineError::Cancelled.is_retryable());
    }

    #[test]
    fn stage_failed_wraps_source() {
        let e = PipelineError::StageFailed {
            stage: StageId::Orientation,
            source: Box::new(PipelineError::ClassificationUnavailable {
                kind: "orientation".into(),
                page: 4,
                detail: "timeout".into(),
            }),
        };
        let msg = e.to_string();
        assert!(msg.starts_with("Step3"), "got: {msg}");
        assert!(msg.contains("page 4"));
        assert!(matches!(
            e.root_cause(),
            PipelineError::ClassificationUnavailable { page: 4, .. }
        ));
    }

    #[test]
    fn group_error_display() {
        let e = GroupError::Exhausted {
            page: 2,
            group: 1,
            attempts: 3,
            detail: "rate limited".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("3 attempt(s)"), "got: {msg}");
        assert!(msg.contains("page 2 group 1"));
    }

    #[test]
    fn group_error_serialises() {
        let e = GroupError::Permanent {
            page: 1,
            group: 1,
            detail: "bad request".into(),
        };
        let json = serde_json::to_string(&e).unwrap();
        let back: GroupError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
