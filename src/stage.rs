//! Stage registry and the executor that runs one stage.
//!
//! Stage ordering is data, not control flow: [`STAGES`] lists every stage
//! with its label, artifact directory and sub-step names. The orchestrator
//! walks the registry; the executor times each stage, writes its
//! `stage_record.json` and reports the outcome without ever recovering.

use crate::error::PipelineError;
use crate::progress::ProgressCallback;
use crate::session::{Session, SessionStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tracing::{error, info, warn};

/// Tracing target for `StepN-NN: complete` lines.
///
/// The CLI always enables it at INFO so sub-step completion is visible even
/// with `--quiet`.
pub const PROGRESS_TARGET: &str = "scanprep::progress";

/// Key of the per-stage record.
pub const STAGE_RECORD: &str = "stage_record.json";

// ── Registry ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Session,
    Rasterize,
    Distortion,
    Orientation,
    PageSplit,
    Bands,
    SuperResolve,
    Extraction,
}

/// Static description of a stage.
#[derive(Debug, Clone, Copy)]
pub struct StageDescriptor {
    pub id: StageId,
    /// `Step0` … `Step7`
    pub label: &'static str,
    /// Artifact directory inside the session.
    pub dir: &'static str,
    /// Sub-step names; `StepN-01` is the first.
    pub substages: &'static [&'static str],
}

/// Every stage, in execution order.
pub const STAGES: [StageDescriptor; 8] = [
    StageDescriptor {
        id: StageId::Session,
        label: "Step0",
        dir: "session",
        substages: &["open session"],
    },
    StageDescriptor {
        id: StageId::Rasterize,
        label: "Step1",
        dir: "converted_images",
        substages: &["rasterize"],
    },
    StageDescriptor {
        id: StageId::Distortion,
        label: "Step2",
        dir: "corrected_images",
        substages: &["judge distortion", "re-rasterize", "dewarp"],
    },
    StageDescriptor {
        id: StageId::Orientation,
        label: "Step3",
        dir: "rotated_images",
        substages: &["judge orientation", "rotate"],
    },
    StageDescriptor {
        id: StageId::PageSplit,
        label: "Step4",
        dir: "page_split",
        substages: &["judge page count", "split pages"],
    },
    StageDescriptor {
        id: StageId::Bands,
        label: "Step5",
        dir: "split_bands",
        substages: &["band split"],
    },
    StageDescriptor {
        id: StageId::SuperResolve,
        label: "Step6",
        dir: "super_resolved",
        substages: &["super-resolve"],
    },
    StageDescriptor {
        id: StageId::Extraction,
        label: "Step7",
        dir: "extraction",
        substages: &["extract", "aggregate"],
    },
];

impl StageId {
    pub fn descriptor(self) -> &'static StageDescriptor {
        &STAGES[self.index()]
    }

    /// Position in [`STAGES`], equal to the `N` of `StepN`.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        self.descriptor().label
    }

    pub fn dir(self) -> &'static str {
        self.descriptor().dir
    }

    /// `Step2-03`
    pub fn substep_label(self, substage: usize) -> String {
        format!("{}-{:02}", self.label(), substage)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.descriptor();
        write!(f, "{} ({})", d.label, d.dir)
    }
}

/// Log one unit of sub-step work as complete.
///
/// `substage` is 1-based, matching the `NN` in `StepN-NN`.
pub fn substep_complete(stage: StageId, substage: usize, page: Option<u32>) {
    let label = stage.substep_label(substage);
    let name = stage
        .descriptor()
        .substages
        .get(substage.saturating_sub(1))
        .copied()
        .unwrap_or("");
    match page {
        Some(page) => info!(target: PROGRESS_TARGET, page, step = name, "{label}: complete"),
        None => info!(target: PROGRESS_TARGET, step = name, "{label}: complete"),
    }
}

// ── Outcomes ─────────────────────────────────────────────────────────────

/// Result of running one stage.
#[derive(Debug)]
pub enum StageOutcome<T> {
    /// The stage wrote `artifacts` and produced `value`.
    Completed { value: T, artifacts: Vec<String> },
    /// The stage chose not to run; downstream reads from an earlier stage.
    Skipped { reason: String },
    /// The stage could not produce its artifacts.
    Failed(PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcomeKind {
    Completed,
    Skipped,
    Failed,
}

impl<T> StageOutcome<T> {
    pub fn completed(value: T, artifacts: Vec<String>) -> Self {
        StageOutcome::Completed { value, artifacts }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        StageOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> StageOutcomeKind {
        match self {
            StageOutcome::Completed { .. } => StageOutcomeKind::Completed,
            StageOutcome::Skipped { .. } => StageOutcomeKind::Skipped,
            StageOutcome::Failed(_) => StageOutcomeKind::Failed,
        }
    }

    /// `Some(value)` when completed, `None` when skipped, and the failure
    /// wrapped in [`PipelineError::StageFailed`] otherwise.
    pub fn into_result(self, stage: StageId) -> Result<Option<T>, PipelineError> {
        match self {
            StageOutcome::Completed { value, .. } => Ok(Some(value)),
            StageOutcome::Skipped { .. } => Ok(None),
            StageOutcome::Failed(PipelineError::Cancelled) => Err(PipelineError::Cancelled),
            StageOutcome::Failed(source) => Err(PipelineError::StageFailed {
                stage,
                source: Box::new(source),
            }),
        }
    }
}

/// Contents of `stage_record.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageId,
    pub label: String,
    pub outcome: StageOutcomeKind,
    /// Skip reason or error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub artifacts: Vec<String>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

// ── Executor ─────────────────────────────────────────────────────────────

/// Runs stages of one session.
pub struct StageExecutor<'a> {
    store: &'a SessionStore,
    session: &'a Session,
    progress: Option<&'a ProgressCallback>,
}

impl<'a> StageExecutor<'a> {
    pub fn new(store: &'a SessionStore, session: &'a Session, progress: Option<&'a ProgressCallback>) -> Self {
        Self {
            store,
            session,
            progress,
        }
    }

    /// Run `work` as `stage` and record how it went.
    ///
    /// An `Err` from `work` becomes [`StageOutcome::Failed`]. The executor
    /// never retries and never decides fatality; it returns the record it
    /// wrote alongside the outcome.
    pub async fn run<T, Fut>(&self, stage: StageId, work: Fut) -> (StageOutcome<T>, StageRecord)
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        info!("{} started", stage);
        if let Some(cb) = self.progress {
            cb.on_stage_start(stage);
        }
        let start = Instant::now();

        let outcome = match work.await {
            Ok(outcome) => outcome,
            Err(e) => StageOutcome::Failed(e),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let (detail, artifacts) = match &outcome {
            StageOutcome::Completed { artifacts, .. } => {
                info!("{} completed: {} artifacts in {}ms", stage, artifacts.len(), duration_ms);
                (None, artifacts.clone())
            }
            StageOutcome::Skipped { reason } => {
                info!("{} skipped: {}", stage, reason);
                (Some(reason.clone()), Vec::new())
            }
            StageOutcome::Failed(e) => {
                error!("{} failed after {}ms: {}", stage, duration_ms, e);
                (Some(e.to_string()), Vec::new())
            }
        };

        let record = StageRecord {
            stage,
            label: stage.label().to_string(),
            outcome: outcome.kind(),
            detail,
            artifacts,
            duration_ms,
            finished_at: Utc::now(),
        };
        if let Err(e) = self.store.put_json(self.session, stage, STAGE_RECORD, &record) {
            warn!("Could not write {} for {}: {}", STAGE_RECORD, stage, e);
        }
        if let Some(cb) = self.progress {
            cb.on_stage_complete(stage, outcome.kind());
        }

        (outcome, record)
    }
}
