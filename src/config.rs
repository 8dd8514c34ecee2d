//! Configuration types for the scan-preprocessing pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], grouped
//! into one section per concern so it maps 1:1 onto a TOML file:
//!
//! ```toml
//! [raster]
//! target_width = 2048
//!
//! [bands]
//! count = 6
//!
//! [extraction]
//! concurrency = 4
//! ```
//!
//! Every field has a default, so a partial file (or none at all) is valid.
//! Programmatic callers use [`PipelineConfig::builder()`], whose setters clamp
//! values into range and whose `build()` rejects combinations that cannot
//! work.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// ── Sections ─────────────────────────────────────────────────────────────

/// Stage-1 rasterisation and Stage-2 re-rasterisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterSettings {
    /// Target pixel width a page should reach. Default: 2048.
    ///
    /// The DPI for each page is the largest that keeps the render inside
    /// `target_width × target_height`, so an A4 page and a US-letter page
    /// land at roughly the same pixel size.
    pub target_width: u32,
    /// Target pixel height. Default: 2560.
    pub target_height: u32,
    /// Lower DPI bound. Default: 50.
    pub min_dpi: u32,
    /// Upper DPI bound. Default: 600.
    ///
    /// Re-rasterisation multiplies the DPI; this cap keeps a 400-DPI page from
    /// becoming an 800-DPI, 200-megapixel bitmap.
    pub max_dpi: u32,
    /// DPI used when the page reports a degenerate size. Default: 300.
    pub default_dpi: u32,
    /// DPI multiplier applied when the distortion judge reports major
    /// readability problems. Default: 2.0.
    pub rerasterize_scale: f32,
}

impl Default for RasterSettings {
    fn default() -> Self {
        Self {
            target_width: 2048,
            target_height: 2560,
            min_dpi: 50,
            max_dpi: 600,
            default_dpi: 300,
            rerasterize_scale: 2.0,
        }
    }
}

impl RasterSettings {
    /// DPI that fits a page of `width_pt × height_pt` points into the target box.
    pub fn dpi_for_page(&self, width_pt: f32, height_pt: f32) -> u32 {
        if !(width_pt.is_finite() && height_pt.is_finite()) || width_pt <= 0.0 || height_pt <= 0.0 {
            return self.clamp_dpi(self.default_dpi as f32);
        }
        let by_width = self.target_width as f32 * 72.0 / width_pt;
        let by_height = self.target_height as f32 * 72.0 / height_pt;
        self.clamp_dpi(by_width.min(by_height))
    }

    /// DPI for a re-rasterisation of a page first rendered at `dpi`.
    pub fn rerasterize_dpi(&self, dpi: u32) -> u32 {
        self.clamp_dpi(dpi as f32 * self.rerasterize_scale)
    }

    fn clamp_dpi(&self, dpi: f32) -> u32 {
        (dpi.round() as u32).clamp(self.min_dpi, self.max_dpi)
    }
}

/// Stage-2 dewarping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DewarpSettings {
    /// When false, dewarp verdicts are recorded but never acted on. Default: true.
    pub enabled: bool,
    /// Luma below which a pixel counts as content when trimming. Default: 200.
    pub content_threshold: u8,
}

impl Default for DewarpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            content_threshold: 200,
        }
    }
}

/// Stage-4 multi-page split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageSplitSettings {
    /// Horizontal overlap between neighbouring sub-pages. Default: 0.10.
    pub overlap_ratio: f32,
    /// Judged page counts are clamped to `1..=max_pages`. Default: 3.
    pub max_pages: u32,
}

impl Default for PageSplitSettings {
    fn default() -> Self {
        Self {
            overlap_ratio: 0.10,
            max_pages: 3,
        }
    }
}

/// Stage-5 band split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandSettings {
    /// Target number of horizontal bands. Default: 5.
    pub count: u32,
    /// Overlap fraction between adjacent bands. Default: 0.10.
    ///
    /// Lines cut by a band edge appear whole in the neighbouring band.
    pub overlap: f32,
    /// Minimum band height in pixels. Default: 100.
    ///
    /// Short pages get fewer bands instead of slivers too thin to read.
    pub min_height: u32,
    /// Images per extraction group, counting the source page. Default: 6.
    ///
    /// Pages with more bands than fit are extracted as several groups.
    pub max_images_per_group: u32,
}

impl Default for BandSettings {
    fn default() -> Self {
        Self {
            count: 5,
            overlap: 0.10,
            min_height: 100,
            max_images_per_group: 6,
        }
    }
}

/// Stage-6 super-resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuperResolutionSettings {
    /// Default: true. When false Stage 6 is skipped and Stage 7 reads Stage 5.
    pub enabled: bool,
    /// Upscale factor. Default: 2.0.
    pub scale: f32,
    /// Longest side after upscaling, in pixels. Default: 4096.
    pub max_dimension: u32,
}

impl Default for SuperResolutionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            scale: 2.0,
            max_dimension: 4096,
        }
    }
}

/// Stage-7 concurrency and retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Extraction calls in flight at once. Default: 3.
    ///
    /// VLM endpoints rate-limit per key; three concurrent multi-image calls
    /// stay under typical tier-1 limits.
    pub concurrency: usize,
    /// Attempts per group, including the first. Default: 3.
    pub max_attempts: u32,
    /// Backoff before the second attempt. Default: 500 ms.
    pub base_delay_ms: u64,
    /// Backoff growth per attempt. Default: 2.0.
    pub multiplier: f64,
    /// Backoff ceiling. Default: 30 s.
    pub max_delay_ms: u64,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// VLM provider selection and sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Provider name ("openai", "anthropic", "gemini", "ollama", …).
    /// If None, auto-detected from the environment.
    pub provider: Option<String>,
    /// Model identifier. If None, uses the provider default.
    pub model: Option<String>,
    /// Sampling temperature. Default: 0.1.
    ///
    /// Judgments and transcription both want the model to report what it
    /// sees, not to be creative.
    pub temperature: f32,
    /// Maximum tokens per extraction call. Default: 8192.
    pub max_tokens: usize,
    /// Per-call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            temperature: 0.1,
            max_tokens: 8192,
            api_timeout_secs: 60,
        }
    }
}

impl LlmSettings {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

/// Input discovery and session output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Directory scanned for the first PDF when no input is given. Default: `pdf`.
    pub input_dir: PathBuf,
    /// Root under which session directories are created. Default: `data/output`.
    pub output_dir: PathBuf,
    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("pdf"),
            output_dir: PathBuf::from("data/output"),
            download_timeout_secs: 120,
        }
    }
}

// ── PipelineConfig ───────────────────────────────────────────────────────

/// Configuration for one pipeline run.
///
/// Built via [`PipelineConfig::builder()`], loaded with
/// [`PipelineConfig::load`], or taken from [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_scanprep::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .band_count(6)
///     .concurrency(4)
///     .dewarping(false)
///     .build()
///     .unwrap();
/// assert_eq!(config.bands.count, 6);
/// ```
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub raster: RasterSettings,
    pub dewarping: DewarpSettings,
    pub page_split: PageSplitSettings,
    pub bands: BandSettings,
    pub super_resolution: SuperResolutionSettings,
    pub extraction: ExtractionSettings,
    pub llm: LlmSettings,
    pub paths: PathSettings,

    /// Optional progress callback for stage and group events.
    #[serde(skip)]
    pub progress_callback: Option<ProgressCallback>,
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("raster", &self.raster)
            .field("dewarping", &self.dewarping)
            .field("page_split", &self.page_split)
            .field("bands", &self.bands)
            .field("super_resolution", &self.super_resolution)
            .field("extraction", &self.extraction)
            .field("llm", &self.llm)
            .field("paths", &self.paths)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder starting from defaults.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Start a builder from this configuration (e.g. one loaded from TOML).
    pub fn to_builder(self) -> PipelineConfigBuilder {
        PipelineConfigBuilder { config: self }
    }

    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| PipelineError::io(path, e))?;
        let config = Self::from_toml_str(&raw)?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = toml::from_str(raw)
            .map_err(|e| PipelineError::InvalidConfig(format!("parsing TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: String| Err(PipelineError::InvalidConfig(msg));

        let r = &self.raster;
        if r.min_dpi == 0 || r.min_dpi > r.max_dpi {
            return invalid(format!(
                "raster.min_dpi must be ≥ 1 and ≤ max_dpi, got {}..{}",
                r.min_dpi, r.max_dpi
            ));
        }
        if r.target_width == 0 || r.target_height == 0 {
            return invalid("raster target size must be non-zero".into());
        }
        if r.rerasterize_scale < 1.0 {
            return invalid(format!(
                "raster.rerasterize_scale must be ≥ 1.0, got {}",
                r.rerasterize_scale
            ));
        }
        if !(0.0..0.5).contains(&self.page_split.overlap_ratio) {
            return invalid(format!(
                "page_split.overlap_ratio must be in [0, 0.5), got {}",
                self.page_split.overlap_ratio
            ));
        }
        if self.page_split.max_pages == 0 {
            return invalid("page_split.max_pages must be ≥ 1".into());
        }
        let b = &self.bands;
        if b.count == 0 {
            return invalid("bands.count must be ≥ 1".into());
        }
        if !(0.0..0.5).contains(&b.overlap) {
            return invalid(format!("bands.overlap must be in [0, 0.5), got {}", b.overlap));
        }
        if b.max_images_per_group < 2 {
            return invalid(format!(
                "bands.max_images_per_group must be ≥ 2 (source + one band), got {}",
                b.max_images_per_group
            ));
        }
        if self.super_resolution.scale < 1.0 {
            return invalid(format!(
                "super_resolution.scale must be ≥ 1.0, got {}",
                self.super_resolution.scale
            ));
        }
        let e = &self.extraction;
        if e.concurrency == 0 {
            return invalid("extraction.concurrency must be ≥ 1".into());
        }
        if e.max_attempts == 0 {
            return invalid("extraction.max_attempts must be ≥ 1".into());
        }
        if e.multiplier < 1.0 {
            return invalid(format!(
                "extraction.multiplier must be ≥ 1.0, got {}",
                e.multiplier
            ));
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn target_size(mut self, width: u32, height: u32) -> Self {
        self.config.raster.target_width = width.max(64);
        self.config.raster.target_height = height.max(64);
        self
    }

    pub fn dpi_range(mut self, min: u32, max: u32) -> Self {
        self.config.raster.min_dpi = min.max(1);
        self.config.raster.max_dpi = max.max(1);
        self
    }

    pub fn rerasterize_scale(mut self, scale: f32) -> Self {
        self.config.raster.rerasterize_scale = scale.clamp(1.0, 4.0);
        self
    }

    pub fn dewarping(mut self, enabled: bool) -> Self {
        self.config.dewarping.enabled = enabled;
        self
    }

    pub fn page_split_overlap(mut self, ratio: f32) -> Self {
        self.config.page_split.overlap_ratio = ratio.clamp(0.0, 0.45);
        self
    }

    pub fn max_pages(mut self, n: u32) -> Self {
        self.config.page_split.max_pages = n.max(1);
        self
    }

    pub fn band_count(mut self, n: u32) -> Self {
        self.config.bands.count = n.max(1);
        self
    }

    pub fn band_overlap(mut self, f: f32) -> Self {
        self.config.bands.overlap = f.clamp(0.0, 0.45);
        self
    }

    pub fn min_band_height(mut self, px: u32) -> Self {
        self.config.bands.min_height = px;
        self
    }

    pub fn max_images_per_group(mut self, n: u32) -> Self {
        self.config.bands.max_images_per_group = n.max(2);
        self
    }

    pub fn super_resolution(mut self, enabled: bool) -> Self {
        self.config.super_resolution.enabled = enabled;
        self
    }

    pub fn super_resolution_scale(mut self, scale: f32) -> Self {
        self.config.super_resolution.scale = scale.clamp(1.0, 4.0);
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.extraction.concurrency = n.max(1);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.extraction.max_attempts = n.max(1);
        self
    }

    pub fn backoff(mut self, base_delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        self.config.extraction.base_delay_ms = base_delay_ms;
        self.config.extraction.multiplier = multiplier.max(1.0);
        self.config.extraction.max_delay_ms = max_delay_ms.max(base_delay_ms);
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.llm.provider = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.llm.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.llm.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.llm.api_timeout_secs = secs.max(1);
        self
    }

    pub fn input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.paths.input_dir = dir.into();
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.paths.output_dir = dir.into();
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.bands.count, 5);
        assert_eq!(c.bands.min_height, 100);
        assert_eq!(c.bands.max_images_per_group, 6);
        assert_eq!(c.extraction.concurrency, 3);
        assert_eq!(c.extraction.max_attempts, 3);
        assert_eq!(c.extraction.base_delay_ms, 500);
        assert_eq!(c.page_split.max_pages, 3);
        assert_eq!(c.llm.api_timeout_secs, 60);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let c = PipelineConfig::from_toml_str(
            r#"
            [bands]
            count = 7

            [llm]
            provider = "ollama"
            "#,
        )
        .unwrap();
        assert_eq!(c.bands.count, 7);
        assert_eq!(c.bands.overlap, 0.10);
        assert_eq!(c.llm.provider.as_deref(), Some("ollama"));
        assert_eq!(c.llm.temperature, 0.1);
        assert_eq!(c.raster, RasterSettings::default());
    }

    #[test]
    fn empty_toml_is_default() {
        let c = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(c.extraction, ExtractionSettings::default());
    }

    #[test]
    fn invalid_toml_values_are_rejected() {
        let err = PipelineConfig::from_toml_str("[extraction]\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));

        let err = PipelineConfig::from_toml_str("[bands]\ncount = \"five\"\n").unwrap_err();
        assert!(err.to_string().contains("parsing TOML"));
    }

    #[test]
    fn builder_clamps_values() {
        let c = PipelineConfig::builder()
            .concurrency(0)
            .max_attempts(0)
            .band_overlap(0.9)
            .max_images_per_group(1)
            .build()
            .unwrap();
        assert_eq!(c.extraction.concurrency, 1);
        assert_eq!(c.extraction.max_attempts, 1);
        assert_eq!(c.bands.overlap, 0.45);
        assert_eq!(c.bands.max_images_per_group, 2);
    }

    #[test]
    fn builder_rejects_inverted_dpi_range() {
        let err = PipelineConfig::builder().dpi_range(300, 100).build().unwrap_err();
        assert!(err.to_string().contains("min_dpi"));
    }

    #[test]
    fn dpi_fits_page_into_target_box() {
        let r = RasterSettings::default();
        // A4 portrait: 595 × 842 pt. Height is the binding constraint.
        let dpi = r.dpi_for_page(595.0, 842.0);
        assert_eq!(dpi, (2560.0f32 * 72.0 / 842.0).round() as u32);
        // Tiny page hits the upper bound.
        assert_eq!(r.dpi_for_page(10.0, 10.0), 600);
        // Degenerate size falls back to the default DPI.
        assert_eq!(r.dpi_for_page(0.0, 842.0), 300);
    }

    #[test]
    fn rerasterize_dpi_is_clamped() {
        let r = RasterSettings::default();
        assert_eq!(r.rerasterize_dpi(200), 400);
        assert_eq!(r.rerasterize_dpi(400), 600);
    }

    #[test]
    fn debug_hides_callback() {
        let s = format!("{:?}", PipelineConfig::default());
        assert!(s.contains("progress_callback: None"));
    }
}
