//! Orchestrator integration tests with stub ports.
//!
//! Rasterisation, judging and extraction are scripted; corrections go
//! through the real `LocalCorrector`, so every artifact on disk is a real
//! PNG the next stage decodes. No pdfium, no network.

use async_trait::async_trait;
use edgequake_scanprep::config::RasterSettings;
use edgequake_scanprep::model::{Correction, DistortionVerdict, OrientationVerdict, PageCountVerdict};
use edgequake_scanprep::orchestrator::{PageJudgment, AGGREGATE, DOCUMENT_TEXT, GROUPS_INDEX, PAGES_INDEX};
use edgequake_scanprep::pipeline::correct::LocalCorrector;
use edgequake_scanprep::ports::ExtractionOutput;
use edgequake_scanprep::session::SessionManifest;
use edgequake_scanprep::stage::{StageOutcomeKind, PROGRESS_TARGET, STAGE_RECORD};
use edgequake_scanprep::{
    Aggregate, Angle, ClassificationKind, ClassificationPort, ExtractionGroup, ExtractionPort, PageImage,
    PipelineConfig, PipelineError, PipelineOrchestrator, Ports, RasterPort, Readability, SessionState,
    StageId, StageRecord, Verdict,
};
use image::{DynamicImage, Rgb, RgbImage};
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use tempfile::TempDir;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

// ── Stub ports ───────────────────────────────────────────────────────────────

/// White page, `dpi·2 × dpi·3` px, with a dark block in the middle.
fn scan(dpi: u32) -> DynamicImage {
    let (w, h) = (dpi * 2, dpi * 3);
    let mut img = RgbImage::from_pixel(w, h, Rgb([250, 250, 250]));
    for y in h / 4..h * 3 / 4 {
        for x in w / 4..w * 3 / 4 {
            img.put_pixel(x, y, Rgb([10, 10, 10]));
        }
    }
    DynamicImage::ImageRgb8(img)
}

struct StubRaster {
    pages: u32,
    dpi: u32,
}

#[async_trait]
impl RasterPort for StubRaster {
    async fn rasterize_document(
        &self,
        document: &Path,
        document_id: &str,
        _raster: &RasterSettings,
    ) -> Result<Vec<PageImage>, PipelineError> {
        (1..=self.pages)
            .map(|p| self.render(document, document_id, p, self.dpi))
            .collect()
    }

    async fn rasterize_page(
        &self,
        document: &Path,
        document_id: &str,
        page: u32,
        dpi: u32,
    ) -> Result<PageImage, PipelineError> {
        self.render(document, document_id, page, dpi)
    }
}

impl StubRaster {
    fn render(&self, document: &Path, document_id: &str, page: u32, dpi: u32) -> Result<PageImage, PipelineError> {
        PageImage::rasterized(document_id, document, page, dpi, &scan(dpi)).map_err(|e| {
            PipelineError::Rasterization {
                page,
                detail: e.to_string(),
            }
        })
    }
}

/// Returns the same verdicts for every page, or fails one judgment kind.
struct ScriptedJudge {
    distortion: DistortionVerdict,
    angle: Angle,
    page_count: u32,
    fail_on: Option<ClassificationKind>,
}

impl Default for ScriptedJudge {
    fn default() -> Self {
        Self {
            distortion: DistortionVerdict::default(),
            angle: Angle::Deg0,
            page_count: 1,
            fail_on: None,
        }
    }
}

#[async_trait]
impl ClassificationPort for ScriptedJudge {
    async fn classify(&self, image: &PageImage, kind: ClassificationKind) -> Result<Verdict, PipelineError> {
        if self.fail_on == Some(kind) {
            return Err(PipelineError::ClassificationUnavailable {
                kind: kind.to_string(),
                page: image.page_index,
                detail: "judge offline".into(),
            });
        }
        Ok(match kind {
            ClassificationKind::Distortion => Verdict::Distortion(self.distortion.clone()),
            ClassificationKind::Orientation => Verdict::Orientation(OrientationVerdict {
                angle: self.angle,
                confidence: Some(0.9),
                comment: None,
            }),
            ClassificationKind::PageCount => Verdict::PageCount(PageCountVerdict {
                page_count: self.page_count,
                confidence: None,
                comment: None,
            }),
        })
    }
}

/// Echoes the group label; fails chosen groups a set number of times first.
#[derive(Default)]
struct StubExtractor {
    failures_left: Mutex<HashMap<(u32, u32), u32>>,
}

impl StubExtractor {
    fn failing(page: u32, group: u32, times: u32) -> Self {
        let mut map = HashMap::new();
        map.insert((page, group), times);
        Self {
            failures_left: Mutex::new(map),
        }
    }
}

#[async_trait]
impl ExtractionPort for StubExtractor {
    async fn extract(&self, group: &ExtractionGroup) -> Result<ExtractionOutput, PipelineError> {
        assert!(group.source.png.starts_with(b"\x89PNG"), "source image not loaded");
        {
            let mut left = self.failures_left.lock().unwrap();
            if let Some(n) = left.get_mut(&(group.page_index, group.group_id)) {
                if *n > 0 {
                    *n -= 1;
                    return Err(PipelineError::ExtractionFailed {
                        page: group.page_index,
                        group: group.group_id,
                        detail: "rate limited".into(),
                    });
                }
            }
        }
        Ok(ExtractionOutput {
            text: format!("text of {}", group.label()),
            input_tokens: 100,
            output_tokens: 10,
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

struct Fixture {
    _dir: TempDir,
    output: PathBuf,
    document: PathBuf,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out");
    let document = dir.path().join("ledger.pdf");
    std::fs::write(&document, b"%PDF-1.4\n").unwrap();
    Fixture {
        _dir: dir,
        output,
        document,
    }
}

fn config(output: &Path, super_resolution: bool) -> PipelineConfig {
    PipelineConfig::builder()
        .output_dir(output)
        .super_resolution(super_resolution)
        .min_band_height(20)
        .backoff(1, 1.0, 1)
        .build()
        .unwrap()
}

fn orchestrator(
    output: &Path,
    pages: u32,
    judge: ScriptedJudge,
    extractor: StubExtractor,
    super_resolution: bool,
) -> PipelineOrchestrator {
    let raster: Arc<dyn RasterPort> = Arc::new(StubRaster { pages, dpi: 100 });
    let ports = Ports {
        corrector: Arc::new(LocalCorrector::new(Arc::clone(&raster), 200)),
        raster,
        classifier: Arc::new(judge),
        extractor: Arc::new(extractor),
    };
    PipelineOrchestrator::new(config(output, super_resolution), ports)
}

fn read(root: &Path, stage: StageId, key: &str) -> Vec<u8> {
    let path = root.join(stage.dir()).join(key);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

fn read_json<T: DeserializeOwned>(root: &Path, stage: StageId, key: &str) -> T {
    serde_json::from_slice(&read(root, stage, key)).unwrap()
}

fn manifest(root: &Path) -> SessionManifest {
    serde_json::from_slice(&std::fs::read(root.join("session.json")).unwrap()).unwrap()
}

/// `StepN-NN: complete` lines as `(label, page)`.
#[derive(Clone, Default)]
struct ProgressLines(Arc<Mutex<Vec<(String, Option<u64>)>>>);

thread_local! {
    static CAPTURE: RefCell<Option<ProgressLines>> = const { RefCell::new(None) };
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    page: Option<u64>,
}

impl Visit for LineVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "page" {
            self.page = Some(value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

/// Routes progress events to the capture of the thread that logged them.
struct ThreadCapture;

impl<S: tracing::Subscriber> Layer<S> for ThreadCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != PROGRESS_TARGET {
            return;
        }
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let Some(label) = visitor.message.strip_suffix(": complete") else {
            return;
        };
        CAPTURE.with(|capture| {
            if let Some(lines) = capture.borrow().as_ref() {
                lines.0.lock().unwrap().push((label.to_string(), visitor.page));
            }
        });
    }
}

/// Capture progress lines logged on this thread from now on.
///
/// `#[tokio::test]` runs the orchestrator on the test thread, which is
/// where every progress line is logged.
fn capture_progress() -> ProgressLines {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        tracing::subscriber::set_global_default(tracing_subscriber::registry().with(ThreadCapture))
            .expect("no other global subscriber in this test binary");
    });
    let lines = ProgressLines::default();
    CAPTURE.with(|capture| *capture.borrow_mut() = Some(lines.clone()));
    lines
}

impl ProgressLines {
    fn count(&self, label: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|(l, _)| l == label).count()
    }

    fn pages(&self, label: &str) -> Vec<u64> {
        let mut pages: Vec<u64> = self
            .0
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| l == label)
            .filter_map(|(_, p)| *p)
            .collect();
        pages.sort();
        pages
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn clean_scan_passes_through_every_gate_unchanged() {
    let fx = fixture();
    let pipeline = orchestrator(&fx.output, 2, ScriptedJudge::default(), StubExtractor::default(), false);

    let report = pipeline
        .process_document_with_session(&fx.document, Some("clean"))
        .await
        .unwrap();
    let root = fx.output.join("clean");
    assert_eq!(report.session_root, root);
    assert_eq!(report.document_id, "ledger");
    assert_eq!(report.pages, 2);

    for page in ["page_001.png", "page_002.png"] {
        let raster = read(&root, StageId::Rasterize, page);
        assert_eq!(read(&root, StageId::Distortion, page), raster);
        assert_eq!(read(&root, StageId::Orientation, page), raster);
        assert_eq!(read(&root, StageId::PageSplit, page), raster);
    }

    let judgment: PageJudgment<serde_json::Value> =
        read_json(&root, StageId::Distortion, "page_001_verdict.json");
    assert_eq!(judgment.action, "skip");
    assert!(matches!(
        judgment.verdict,
        Verdict::Distortion(DistortionVerdict {
            readability: Readability::None,
            ..
        })
    ));

    // Step6 skipped: only its record exists and Step7 read the Step5 groups.
    let skipped: StageRecord = read_json(&root, StageId::SuperResolve, STAGE_RECORD);
    assert_eq!(skipped.outcome, StageOutcomeKind::Skipped);
    assert!(!root.join(StageId::SuperResolve.dir()).join(GROUPS_INDEX).exists());

    let groups: Vec<ExtractionGroup> = read_json(&root, StageId::Bands, GROUPS_INDEX);
    assert_eq!(report.aggregate.total_groups, groups.len());
    assert_eq!(report.aggregate.failed, 0);
    assert_eq!(report.stages.len(), 8);
    assert_eq!(manifest(&root).state, SessionState::Completed);

    let text = String::from_utf8(read(&root, StageId::Extraction, DOCUMENT_TEXT)).unwrap();
    assert!(text.find("text of page_001_group_01").unwrap() < text.find("text of page_002_group_01").unwrap());
    let aggregate: Aggregate = read_json(&root, StageId::Extraction, AGGREGATE);
    assert_eq!(aggregate, report.aggregate);
}

#[tokio::test]
async fn two_page_verdict_splits_into_contiguous_pages() {
    let fx = fixture();
    let judge = ScriptedJudge {
        page_count: 2,
        ..Default::default()
    };
    let pipeline = orchestrator(&fx.output, 1, judge, StubExtractor::default(), false);

    let report = pipeline
        .process_document_with_session(&fx.document, Some("spread"))
        .await
        .unwrap();
    let root = fx.output.join("spread");

    let pages: Vec<PageImage> = read_json(&root, StageId::PageSplit, PAGES_INDEX);
    let indices: Vec<u32> = pages.iter().map(|p| p.page_index).collect();
    assert_eq!(indices, [1, 2]);
    assert!(pages.iter().all(|p| p.source_page == 1));
    assert_eq!(
        pages[1].lineage.last(),
        Some(&Correction::SplitPage { part: 2, of: 2 })
    );
    // 200 px wide, 10% overlap → two 110 px columns.
    assert_eq!((pages[0].width, pages[1].width), (110, 110));
    assert_eq!(report.pages, 2);

    let extracted: Vec<u32> = report.aggregate.results.iter().map(|r| r.page_index).collect();
    assert!(extracted.contains(&1) && extracted.contains(&2));
}

#[tokio::test]
async fn classifier_failure_is_fatal_and_keeps_earlier_artifacts() {
    let fx = fixture();
    let judge = ScriptedJudge {
        fail_on: Some(ClassificationKind::Distortion),
        ..Default::default()
    };
    let pipeline = orchestrator(&fx.output, 1, judge, StubExtractor::default(), false);

    let err = pipeline
        .process_document_with_session(&fx.document, Some("broken"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::StageFailed {
            stage: StageId::Distortion,
            ..
        }
    ));
    assert!(matches!(
        err.root_cause(),
        PipelineError::ClassificationUnavailable { .. }
    ));

    let root = fx.output.join("broken");
    assert!(root.join("converted_images/page_001.png").exists());
    assert!(!root.join("corrected_images").join(PAGES_INDEX).exists());
    assert!(!root.join("rotated_images").exists());
    let record: StageRecord = read_json(&root, StageId::Distortion, STAGE_RECORD);
    assert_eq!(record.outcome, StageOutcomeKind::Failed);
    assert_eq!(manifest(&root).state, SessionState::Failed);
}

#[tokio::test]
async fn open_session_id_conflicts() {
    let fx = fixture();
    let pipeline = orchestrator(&fx.output, 1, ScriptedJudge::default(), StubExtractor::default(), false);

    let held = pipeline.open_session(&fx.document, Some("busy")).unwrap();
    let err = pipeline
        .process_document_with_session(&fx.document, Some("busy"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SessionConflict { ref session_id } if session_id == "busy"));
    assert_eq!(manifest(&held.root).state, SessionState::Open);

    // Once the holder finishes, the id can be reused.
    pipeline.run_session(&held, &fx.document).await.unwrap();
    pipeline
        .process_document_with_session(&fx.document, Some("busy"))
        .await
        .unwrap();
}

#[tokio::test]
async fn flaky_group_is_retried_without_affecting_siblings() {
    let fx = fixture();
    let pipeline = orchestrator(
        &fx.output,
        4,
        ScriptedJudge::default(),
        StubExtractor::failing(2, 1, 2),
        false,
    );

    let report = pipeline.process_document(&fx.document).await.unwrap();
    let agg = &report.aggregate;
    assert_eq!(agg.failed, 0);
    assert_eq!(agg.succeeded, agg.total_groups);

    let attempts: HashMap<(u32, u32), u32> = agg
        .results
        .iter()
        .map(|r| ((r.page_index, r.group_id), r.attempts))
        .collect();
    assert_eq!(attempts[&(2, 1)], 3);
    assert!(attempts.iter().filter(|(k, _)| **k != (2, 1)).all(|(_, a)| *a == 1));
}

#[tokio::test]
async fn exhausted_group_is_recorded_and_run_completes() {
    let fx = fixture();
    let pipeline = orchestrator(
        &fx.output,
        2,
        ScriptedJudge::default(),
        StubExtractor::failing(1, 1, 10),
        false,
    );

    let report = pipeline
        .process_document_with_session(&fx.document, Some("partial"))
        .await
        .unwrap();
    let root = fx.output.join("partial");
    assert_eq!(report.aggregate.failed, 1);
    assert!(root.join("extraction/page_001_group_01.failed.json").exists());
    assert!(!root.join("extraction/page_001_group_01.txt").exists());
    assert!(!report.aggregate.text.contains("page_001_group_01"));
    assert_eq!(manifest(&root).state, SessionState::Completed);
}

#[tokio::test]
async fn rotation_and_rerasterize_are_applied_in_order() {
    let fx = fixture();
    let judge = ScriptedJudge {
        distortion: DistortionVerdict {
            needs_dewarping: true,
            readability: Readability::Major,
            ..Default::default()
        },
        angle: Angle::Deg90,
        ..Default::default()
    };
    let pipeline = orchestrator(&fx.output, 1, judge, StubExtractor::default(), false);

    pipeline
        .process_document_with_session(&fx.document, Some("fixups"))
        .await
        .unwrap();
    let root = fx.output.join("fixups");

    let corrected: Vec<PageImage> = read_json(&root, StageId::Distortion, PAGES_INDEX);
    // 100 dpi × 2.0 → 200 dpi re-render (400×600), then trimmed to the block.
    assert_eq!(corrected[0].dpi, 200);
    assert_eq!(
        corrected[0].lineage,
        vec![
            Correction::Rasterized { dpi: 100 },
            Correction::Rerasterized { dpi: 200 },
            Correction::Dewarped,
        ]
    );
    assert!(corrected[0].width < 400 && corrected[0].height < 600);

    let rotated: Vec<PageImage> = read_json(&root, StageId::Orientation, PAGES_INDEX);
    assert_eq!((rotated[0].width, rotated[0].height), (corrected[0].height, corrected[0].width));
    assert_eq!(
        rotated[0].lineage.last(),
        Some(&Correction::Rotated { angle: Angle::Deg90 })
    );
}

#[tokio::test]
async fn super_resolution_feeds_extraction() {
    let fx = fixture();
    let pipeline = orchestrator(&fx.output, 1, ScriptedJudge::default(), StubExtractor::default(), true);

    let report = pipeline
        .process_document_with_session(&fx.document, Some("upscaled"))
        .await
        .unwrap();
    let root = fx.output.join("upscaled");

    let before: Vec<ExtractionGroup> = read_json(&root, StageId::Bands, GROUPS_INDEX);
    let after: Vec<ExtractionGroup> = read_json(&root, StageId::SuperResolve, GROUPS_INDEX);
    assert_eq!(before.len(), after.len());
    assert_eq!(after[0].source.width, before[0].source.width * 2);
    assert_eq!(after[0].bands[0].height, before[0].bands[0].height * 2);

    let record: StageRecord = read_json(&root, StageId::SuperResolve, STAGE_RECORD);
    assert_eq!(record.outcome, StageOutcomeKind::Completed);
    assert_eq!(report.aggregate.failed, 0);
}

#[tokio::test]
async fn cancelled_run_stops_and_marks_session_failed() {
    let fx = fixture();
    let pipeline = orchestrator(&fx.output, 1, ScriptedJudge::default(), StubExtractor::default(), false);
    pipeline.cancellation_token().cancel();

    let err = pipeline
        .process_document_with_session(&fx.document, Some("stopped"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));
    let root = fx.output.join("stopped");
    assert_eq!(manifest(&root).state, SessionState::Failed);
    assert!(!root.join("converted_images").exists());
}

#[tokio::test]
async fn progress_lines_are_logged_once_per_unit_of_work() {
    let fx = fixture();
    let judge = ScriptedJudge {
        distortion: DistortionVerdict {
            needs_dewarping: true,
            readability: Readability::Major,
            ..Default::default()
        },
        angle: Angle::Deg90,
        ..Default::default()
    };
    let pipeline = orchestrator(&fx.output, 2, judge, StubExtractor::default(), true);

    let lines = capture_progress();
    let report = pipeline
        .process_document_with_session(&fx.document, Some("counted"))
        .await
        .unwrap();

    assert_eq!(lines.count("Step0-01"), 1);
    for label in [
        "Step1-01", "Step2-01", "Step2-02", "Step2-03", "Step3-01", "Step3-02", "Step4-01", "Step5-01", "Step6-01",
    ] {
        assert_eq!(lines.pages(label), [1, 2], "{label}");
    }
    assert_eq!(lines.count("Step4-02"), 0);
    assert_eq!(lines.count("Step7-01"), report.aggregate.total_groups);
    assert_eq!(lines.count("Step7-02"), 1);
}

#[tokio::test]
async fn failed_group_logs_no_extraction_line() {
    let fx = fixture();
    let pipeline = orchestrator(
        &fx.output,
        2,
        ScriptedJudge::default(),
        StubExtractor::failing(1, 1, 10),
        false,
    );

    let lines = capture_progress();
    let report = pipeline
        .process_document_with_session(&fx.document, Some("gap"))
        .await
        .unwrap();

    let agg = &report.aggregate;
    assert_eq!(agg.failed, 1);
    assert_eq!(lines.count("Step7-01"), agg.succeeded);
    let page_one_ok = agg
        .results
        .iter()
        .filter(|r| r.page_index == 1 && r.status.is_succeeded())
        .count();
    assert_eq!(lines.pages("Step7-01").iter().filter(|p| **p == 1).count(), page_one_ok);
    // clean pages skip the correction sub-steps
    assert_eq!(lines.count("Step2-02") + lines.count("Step2-03") + lines.count("Step3-02"), 0);
    assert_eq!(lines.count("Step6-01"), 0);
    assert_eq!(lines.count("Step7-02"), 1);
}

#[tokio::test]
async fn rerun_under_the_same_id_starts_from_empty_stages() {
    let fx = fixture();
    let first = orchestrator(
        &fx.output,
        2,
        ScriptedJudge::default(),
        StubExtractor::failing(1, 1, 10),
        false,
    );
    let report = first
        .process_document_with_session(&fx.document, Some("again"))
        .await
        .unwrap();
    assert_eq!(report.aggregate.failed, 1);
    let root = fx.output.join("again");
    assert!(root.join("extraction/page_001_group_01.failed.json").exists());

    let second = orchestrator(&fx.output, 1, ScriptedJudge::default(), StubExtractor::default(), false);
    let report = second
        .process_document_with_session(&fx.document, Some("again"))
        .await
        .unwrap();
    assert_eq!(report.aggregate.failed, 0);
    assert_eq!(report.pages, 1);

    assert!(!root.join("converted_images/page_002.png").exists());
    assert!(!root.join("extraction/page_001_group_01.failed.json").exists());
    assert!(!root.join("extraction/page_002_group_01.json").exists());
    assert!(root.join("extraction/page_001_group_01.json").exists());
    let results = std::fs::read_dir(root.join("extraction"))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("page_") && name.ends_with(".json"))
        .count();
    assert_eq!(results, report.aggregate.total_groups);
    assert_eq!(manifest(&root).state, SessionState::Completed);
}
