//! Adapters behind the capability ports, plus the helpers they share.
//!
//! Each submodule implements exactly one concern. The orchestrator only sees
//! the traits in [`crate::ports`]; these are the default implementations
//! wired up by the CLI.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ correct ──▶ encode ──▶ llm ──▶ postprocess
//! (URL/path)  (pdfium)  (image ops)  (base64)   (VLM)   (cleanup)
//! ```
//!
//! 1. [`input`]: canonicalise the user-supplied path or URL to a local file
//! 2. [`render`]: [`crate::ports::RasterPort`] on pdfium; runs in
//!    `spawn_blocking` because pdfium is not async-safe
//! 3. [`correct`]: [`crate::ports::CorrectionPort`] with rotation, margin-trim
//!    dewarp and Lanczos upscale; re-rasterisation goes back to the raster port
//! 4. [`encode`]: PNG-encode and base64-wrap images for the multimodal
//!    API request body
//! 5. [`llm`]: the classification and extraction ports on a VLM; the
//!    only adapters with network I/O
//! 6. [`postprocess`]: deterministic cleanup of extracted text and JSON
//!    recovery from judge replies

pub mod correct;
pub mod encode;
pub mod input;
pub mod llm;
pub mod postprocess;
pub mod render;
