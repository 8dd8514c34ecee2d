//! Capability ports: the external collaborators the pipeline drives.
//!
//! Each port is an async trait object so the orchestrator can be wired to
//! pdfium and a live VLM in production and to in-memory stubs in tests.
//! Ports make exactly one attempt per call; retry policy belongs to the
//! caller (the Stage-7 controller) and timeouts to the implementation.

use crate::config::RasterSettings;
use crate::error::PipelineError;
use crate::model::{Angle, ExtractionGroup, PageImage, Verdict};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Which judgment to ask the classifier for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationKind {
    Distortion,
    Orientation,
    PageCount,
}

impl fmt::Display for ClassificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClassificationKind::Distortion => "distortion",
            ClassificationKind::Orientation => "orientation",
            ClassificationKind::PageCount => "page_count",
        })
    }
}

/// Which correction to apply.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CorrectionKind {
    /// Render the page again from the source PDF at `dpi`.
    Rerasterize { dpi: u32 },
    Dewarp,
    Rotate { angle: Angle },
    /// Upscale by `scale`, never past `max_dimension` on the longest side.
    SuperResolve { scale: f32, max_dimension: u32 },
}

impl fmt::Display for CorrectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrectionKind::Rerasterize { dpi } => write!(f, "rerasterize@{dpi}dpi"),
            CorrectionKind::Dewarp => f.write_str("dewarp"),
            CorrectionKind::Rotate { angle } => write!(f, "rotate {angle}"),
            CorrectionKind::SuperResolve { scale, .. } => write!(f, "super_resolve x{scale}"),
        }
    }
}

/// What an extraction call returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub text: String,
    #[serde(default)]
    pub input_tokens: usize,
    #[serde(default)]
    pub output_tokens: usize,
}

/// Renders PDF pages to images.
#[async_trait]
pub trait RasterPort: Send + Sync {
    /// Render every page, choosing each page's DPI from `raster`.
    async fn rasterize_document(
        &self,
        document: &Path,
        document_id: &str,
        raster: &RasterSettings,
    ) -> Result<Vec<PageImage>, PipelineError>;

    /// Render one page (1-based) at a fixed DPI.
    async fn rasterize_page(
        &self,
        document: &Path,
        document_id: &str,
        page: u32,
        dpi: u32,
    ) -> Result<PageImage, PipelineError>;
}

/// Judges an image. Failures are [`PipelineError::ClassificationUnavailable`].
#[async_trait]
pub trait ClassificationPort: Send + Sync {
    async fn classify(&self, image: &PageImage, kind: ClassificationKind) -> Result<Verdict, PipelineError>;
}

/// Applies a correction. Failures are [`PipelineError::CorrectionFailed`].
///
/// The returned page keeps `page_index` and `source_page` and appends the
/// correction to its lineage.
#[async_trait]
pub trait CorrectionPort: Send + Sync {
    async fn correct(&self, image: &PageImage, kind: CorrectionKind) -> Result<PageImage, PipelineError>;
}

/// Reads text from an extraction group.
///
/// Transient failures must be [`PipelineError::ExtractionFailed`] so the
/// controller retries them.
#[async_trait]
pub trait ExtractionPort: Send + Sync {
    async fn extract(&self, group: &ExtractionGroup) -> Result<ExtractionOutput, PipelineError>;
}
