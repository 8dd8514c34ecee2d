//! # edgequake-scanprep
//!
//! Turn scanned PDFs into clean text with a staged, inspectable pipeline of
//! vision-model judgments and image corrections.
//!
//! ## Why this crate?
//!
//! Phone and flatbed scans arrive rotated, warped, two pages to a frame and
//! at whatever resolution the scanner felt like. Sending such a page straight
//! to a VLM gives garbled or out-of-order text. This crate first asks a
//! vision model what is wrong with each page, fixes only what it flags, then
//! cuts every page into overlapping high-resolution bands so small print
//! survives extraction.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ Step0  open a session directory
//!  ├─ Step1  rasterise pages via pdfium (per-page DPI, spawn_blocking)
//!  ├─ Step2  judge distortion → re-rasterise and/or dewarp
//!  ├─ Step3  judge orientation → rotate
//!  ├─ Step4  judge page count → split side-by-side pages
//!  ├─ Step5  overlapping horizontal bands, chunked into groups
//!  ├─ Step6  super-resolve every group image (optional)
//!  └─ Step7  concurrent multi-image extraction → aggregate
//! ```
//!
//! Every stage writes its artifacts under
//! `<output_dir>/<session_id>/<stage_dir>/`, and the next stage reads them
//! back from there.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_scanprep::{PipelineConfig, PipelineOrchestrator, Ports};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::default();
//!     let ports = Ports::from_config(&config)?;
//!     let pipeline = PipelineOrchestrator::new(config, ports);
//!
//!     let report = pipeline.process_document(Path::new("scan.pdf")).await?;
//!     println!("{}", report.aggregate.text);
//!     eprintln!("{} of {} groups extracted",
//!         report.aggregate.succeeded,
//!         report.aggregate.total_groups);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `scanprep` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! edgequake-scanprep = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod controller;
pub mod error;
pub mod gating;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod ports;
pub mod progress;
pub mod prompts;
pub mod session;
pub mod splitter;
pub mod stage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use controller::{ConcurrencyController, RetryPolicy};
pub use error::{GroupError, PipelineError};
pub use model::{Angle, ExtractionGroup, ImageBand, PageImage, Readability, Verdict};
pub use orchestrator::{PipelineOrchestrator, Ports};
pub use output::{Aggregate, DocumentReport, ExtractionResult, ExtractionStatus};
pub use ports::{ClassificationKind, ClassificationPort, CorrectionKind, CorrectionPort, ExtractionPort, RasterPort};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use session::{Session, SessionState, SessionStore};
pub use stage::{StageId, StageOutcome, StageRecord};
