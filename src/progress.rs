//! Progress-callback trait for stage and extraction events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::PipelineConfigBuilder::progress_callback`] to receive
//! events as the orchestrator walks the stages and as Stage 7 finishes
//! groups. The CLI renders them with indicatif; a service could forward
//! them to a channel or a job table instead.
//!
//! # Example
//!
//! ```rust
//! use edgequake_scanprep::{PipelineConfig, PipelineProgressCallback, StageId};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     groups: Arc<AtomicUsize>,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_group_complete(&self, page_index: u32, group_id: u32, attempts: u32) {
//!         self.groups.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page_index} group {group_id} done after {attempts} attempt(s)");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback {
//!     groups: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = PipelineConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::stage::{StageId, StageOutcomeKind};
use std::sync::Arc;

/// Called by the orchestrator as a document moves through the stages.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
///
/// # Thread safety
///
/// Stage events arrive sequentially. `on_group_start`, `on_group_complete`
/// and `on_group_error` may be called concurrently from the Stage-7 worker
/// futures; protect shared state accordingly.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once after the session is open.
    fn on_document_start(&self, document_id: &str, session_id: &str) {
        let _ = (document_id, session_id);
    }

    /// Called before a stage's work begins.
    fn on_stage_start(&self, stage: StageId) {
        let _ = stage;
    }

    /// Called after a stage finished, whatever its outcome.
    fn on_stage_complete(&self, stage: StageId, outcome: StageOutcomeKind) {
        let _ = (stage, outcome);
    }

    /// Called once before Stage 7 dispatches its groups.
    fn on_extraction_start(&self, total_groups: usize) {
        let _ = total_groups;
    }

    /// Called just before the first attempt for a group.
    fn on_group_start(&self, page_index: u32, group_id: u32) {
        let _ = (page_index, group_id);
    }

    /// Called when a group was extracted.
    fn on_group_complete(&self, page_index: u32, group_id: u32, attempts: u32) {
        let _ = (page_index, group_id, attempts);
    }

    /// Called when a group failed after its retry budget.
    fn on_group_error(&self, page_index: u32, group_id: u32, error: &str) {
        let _ = (page_index, group_id, error);
    }

    /// Called once after the aggregate was written.
    fn on_document_complete(&self, succeeded: usize, failed: usize) {
        let _ = (succeeded, failed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
