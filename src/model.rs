//! Core data model shared by every stage: page images, verdicts, bands and
//! extraction groups.
//!
//! Images travel between stages as PNG bytes rather than decoded pixels.
//! A stage that decides not to touch a page hands the exact same bytes to
//! the next stage, so pass-through is byte-identical and the session store
//! never re-encodes what nobody changed.

use crate::pipeline::encode::{decode_png, encode_png};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

// ── Page images ──────────────────────────────────────────────────────────

/// One correction applied to a page, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Correction {
    Rasterized { dpi: u32 },
    Rerasterized { dpi: u32 },
    Dewarped,
    Rotated { angle: Angle },
    SplitPage { part: u32, of: u32 },
    SuperResolved { scale: f32 },
}

/// A rasterised page at some point of the pipeline.
///
/// The metadata half is what stages persist in their `pages.json` index;
/// `png` holds the payload and is stored as its own artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageImage {
    /// Document identifier (file stem of the input PDF).
    pub document_id: String,
    /// Path of the source PDF, used when a page must be re-rasterised.
    pub document_path: PathBuf,
    /// 1-based page index, contiguous across the document at a given stage.
    pub page_index: u32,
    /// The Stage-1 page this image descends from (1-based).
    pub source_page: u32,
    pub width: u32,
    pub height: u32,
    /// DPI the page was rasterised at.
    pub dpi: u32,
    /// Corrections applied so far.
    pub lineage: Vec<Correction>,
    #[serde(skip)]
    pub png: Vec<u8>,
}

impl PageImage {
    /// Encode a freshly rasterised page.
    pub fn rasterized(
        document_id: impl Into<String>,
        document_path: impl Into<PathBuf>,
        page: u32,
        dpi: u32,
        image: &DynamicImage,
    ) -> Result<Self, image::ImageError> {
        Ok(Self {
            document_id: document_id.into(),
            document_path: document_path.into(),
            page_index: page,
            source_page: page,
            width: image.width(),
            height: image.height(),
            dpi,
            lineage: vec![Correction::Rasterized { dpi }],
            png: encode_png(image)?,
        })
    }

    /// Derive a new page from this one with different pixels.
    ///
    /// Metadata is carried over and `step` is appended to the lineage.
    pub fn derive(&self, image: &DynamicImage, step: Correction) -> Result<Self, image::ImageError> {
        let mut lineage = self.lineage.clone();
        lineage.push(step);
        Ok(Self {
            document_id: self.document_id.clone(),
            document_path: self.document_path.clone(),
            page_index: self.page_index,
            source_page: self.source_page,
            width: image.width(),
            height: image.height(),
            dpi: self.dpi,
            lineage,
            png: encode_png(image)?,
        })
    }

    /// Decode the PNG payload.
    pub fn decode(&self) -> Result<DynamicImage, image::ImageError> {
        decode_png(&self.png)
    }

    /// Artifact key of the PNG payload.
    pub fn key(&self) -> String {
        page_key(self.page_index)
    }
}

/// `page_007.png`
pub fn page_key(page_index: u32) -> String {
    format!("page_{page_index:03}.png")
}

/// `page_007_source.png`: the whole page as carried by its groups.
pub fn source_key(page_index: u32) -> String {
    format!("page_{page_index:03}_source.png")
}

/// `page_007_band_02.png`
pub fn band_key(page_index: u32, band_index: u32) -> String {
    format!("page_{page_index:03}_band_{band_index:02}.png")
}

// ── Verdicts ─────────────────────────────────────────────────────────────

/// A clockwise rotation restricted to quarter turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum Angle {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Angle {
    /// Snap an arbitrary angle in degrees to the nearest quarter turn.
    ///
    /// Negative angles are counter-clockwise: `-90` snaps to `Deg270`.
    pub fn nearest(degrees: f64) -> Self {
        let normalised = degrees.rem_euclid(360.0);
        match ((normalised + 45.0) / 90.0).floor() as i64 % 4 {
            1 => Angle::Deg90,
            2 => Angle::Deg180,
            3 => Angle::Deg270,
            _ => Angle::Deg0,
        }
    }

    pub fn degrees(self) -> u16 {
        match self {
            Angle::Deg0 => 0,
            Angle::Deg90 => 90,
            Angle::Deg180 => 180,
            Angle::Deg270 => 270,
        }
    }

    /// The rotation that undoes this one.
    pub fn inverse(self) -> Self {
        match self {
            Angle::Deg0 => Angle::Deg0,
            Angle::Deg90 => Angle::Deg270,
            Angle::Deg180 => Angle::Deg180,
            Angle::Deg270 => Angle::Deg90,
        }
    }
}

impl From<Angle> for u16 {
    fn from(a: Angle) -> u16 {
        a.degrees()
    }
}

impl TryFrom<u16> for Angle {
    type Error = String;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Angle::Deg0),
            90 => Ok(Angle::Deg90),
            180 => Ok(Angle::Deg180),
            270 => Ok(Angle::Deg270),
            other => Err(format!("angle must be 0, 90, 180 or 270, got {other}")),
        }
    }
}

impl fmt::Display for Angle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

/// How badly distortion hurts legibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Readability {
    #[default]
    None,
    Minor,
    Major,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DistortionVerdict {
    pub needs_dewarping: bool,
    pub readability: Readability,
    /// Something outside the document (fingers, desk) is in frame.
    pub out_of_frame: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrientationVerdict {
    /// Clockwise rotation that makes the page upright.
    pub angle: Angle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCountVerdict {
    /// Physical pages visible in the image, at least 1.
    pub page_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// The closed set of judgments a classifier can return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verdict {
    Distortion(DistortionVerdict),
    Orientation(OrientationVerdict),
    PageCount(PageCountVerdict),
}

/// `page_007_verdict.json`
pub fn verdict_key(page_index: u32) -> String {
    format!("page_{page_index:03}_verdict.json")
}

// ── Bands and groups ─────────────────────────────────────────────────────

/// A horizontal slice of a page, in source pixel rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageBand {
    /// 0-based band index, top to bottom.
    pub index: u32,
    pub top: u32,
    /// Exclusive bottom row.
    pub bottom: u32,
    /// Overlap fraction used when cutting.
    pub overlap: f32,
}

impl ImageBand {
    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }
}

/// One image inside an extraction group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupImage {
    /// Artifact key of the PNG in the producing stage.
    pub key: String,
    /// `None` for the unmodified source page.
    pub band: Option<ImageBand>,
    pub width: u32,
    pub height: u32,
    #[serde(skip)]
    pub png: Vec<u8>,
}

/// The unit of extraction: a page plus some of its bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionGroup {
    pub document_id: String,
    pub page_index: u32,
    /// 1-based group number within the page.
    pub group_id: u32,
    /// Groups the page was chunked into.
    pub group_count: u32,
    pub source: GroupImage,
    pub bands: Vec<GroupImage>,
}

impl ExtractionGroup {
    /// Source first, then bands top to bottom.
    pub fn images(&self) -> impl Iterator<Item = &GroupImage> {
        std::iter::once(&self.source).chain(self.bands.iter())
    }

    pub fn image_count(&self) -> usize {
        1 + self.bands.len()
    }

    /// `page_003_group_02`
    pub fn label(&self) -> String {
        format!("page_{:03}_group_{:02}", self.page_index, self.group_id)
    }
}
