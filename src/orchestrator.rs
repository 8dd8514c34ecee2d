//! Top-level driver: one document through Stages 0–7.
//!
//! ## Stage hand-off
//!
//! Stages never pass pages to each other in memory. Each one reads its
//! input from the session store (the `pages.json` or `groups.json` index of
//! the last stage that produced artifacts, plus the PNGs it names) and
//! writes its own output the same way. Any stage can therefore be inspected
//! or replayed from disk, and a failed run leaves everything up to the
//! failure in place.
//!
//! ## Fatality
//!
//! Classification and correction failures end the run: the session is
//! marked `failed` and the error is returned wrapped in
//! [`PipelineError::StageFailed`]. Extraction failures are per group and
//! surface in the [`Aggregate`]; the run still completes.

use crate::config::{BandSettings, PipelineConfig};
use crate::controller::ConcurrencyController;
use crate::error::PipelineError;
use crate::gating::{plan_distortion, plan_page_split, plan_rotation};
use crate::model::{
    band_key, source_key, verdict_key, Correction, DistortionVerdict, ExtractionGroup, GroupImage,
    OrientationVerdict, PageCountVerdict, PageImage, Verdict,
};
use crate::output::{Aggregate, DocumentReport, ExtractionStatus};
use crate::pipeline::correct::LocalCorrector;
use crate::pipeline::encode::encode_png;
use crate::pipeline::input::document_id;
use crate::pipeline::llm::{resolve_provider, VlmClassifier, VlmExtractor};
use crate::pipeline::render::PdfiumRasterizer;
use crate::ports::{
    ClassificationKind, ClassificationPort, CorrectionKind, CorrectionPort, ExtractionPort, RasterPort,
};
use crate::session::{Session, SessionState, SessionStore};
use crate::splitter::{band_bounds, chunk_bands, column_bounds, cut_bands, cut_columns};
use crate::stage::{substep_complete, StageExecutor, StageId, StageOutcome, StageRecord};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Index of a page stage: page metadata in order.
pub const PAGES_INDEX: &str = "pages.json";
/// Index of a band stage: extraction groups in order.
pub const GROUPS_INDEX: &str = "groups.json";
/// Stage-7 aggregate.
pub const AGGREGATE: &str = "aggregate.json";
/// Stage-7 plain-text document.
pub const DOCUMENT_TEXT: &str = "document.txt";

/// What a judging stage stores per page: the verdict and the action taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageJudgment<A> {
    pub page_index: u32,
    pub verdict: Verdict,
    pub action: A,
}

/// The capabilities the pipeline runs on.
#[derive(Clone)]
pub struct Ports {
    pub raster: Arc<dyn RasterPort>,
    pub classifier: Arc<dyn ClassificationPort>,
    pub corrector: Arc<dyn CorrectionPort>,
    pub extractor: Arc<dyn ExtractionPort>,
}

impl Ports {
    /// pdfium rasterisation, local corrections, and one VLM provider for both
    /// judging and extraction.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let provider = resolve_provider(&config.llm)?;
        let raster: Arc<dyn RasterPort> = Arc::new(PdfiumRasterizer::new());
        Ok(Self {
            corrector: Arc::new(LocalCorrector::new(
                Arc::clone(&raster),
                config.dewarping.content_threshold,
            )),
            classifier: Arc::new(VlmClassifier::new(Arc::clone(&provider), config.llm.clone())),
            extractor: Arc::new(VlmExtractor::new(provider, config.llm.clone())),
            raster,
        })
    }
}

/// Sequences the stages for one document at a time.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    store: SessionStore,
    ports: Ports,
    cancel: CancellationToken,
}

impl PipelineOrchestrator {
    /// Sessions are created under `config.paths.output_dir`.
    pub fn new(config: PipelineConfig, ports: Ports) -> Self {
        let store = SessionStore::new(&config.paths.output_dir);
        Self {
            config,
            store,
            ports,
            cancel: CancellationToken::new(),
        }
    }

    /// Share a cancellation token with the caller (e.g. a Ctrl-C handler).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Run every stage on `document` in a fresh session.
    pub async fn process_document(&self, document: &Path) -> Result<DocumentReport, PipelineError> {
        self.process_document_with_session(document, None).await
    }

    /// Run every stage on `document`, optionally under an explicit session id.
    pub async fn process_document_with_session(
        &self,
        document: &Path,
        session_id: Option<&str>,
    ) -> Result<DocumentReport, PipelineError> {
        let session = self.open_session(document, session_id)?;
        self.run_session(&session, document).await
    }

    /// Stage 0 alone: open the session a run will write into.
    ///
    /// Callers that want to act on the session after a failure (clean it
    /// up, point the user at it) open it first and then call
    /// [`run_session`](Self::run_session).
    pub fn open_session(&self, document: &Path, session_id: Option<&str>) -> Result<Session, PipelineError> {
        let document_id = document_id(document);
        match session_id {
            Some(id) => self.store.open_with_id(&document_id, id),
            None => self.store.open(&document_id),
        }
    }

    /// Run Stages 0–7 inside an open session and close it.
    ///
    /// The manifest ends `completed` on success and `failed` otherwise; no
    /// artifact is removed either way.
    pub async fn run_session(&self, session: &Session, document: &Path) -> Result<DocumentReport, PipelineError> {
        let start = Instant::now();
        let progress = self.config.progress_callback.as_ref();
        info!(
            "Processing '{}' in session {} ({})",
            session.document_id,
            session.session_id,
            session.root.display()
        );
        if let Some(cb) = progress {
            cb.on_document_start(&session.document_id, &session.session_id);
        }

        let mut records = Vec::with_capacity(8);
        match self.run_stages(session, document, &mut records).await {
            Ok((pages, aggregate)) => {
                self.store.close(session, SessionState::Completed)?;
                if let Some(cb) = progress {
                    cb.on_document_complete(aggregate.succeeded, aggregate.failed);
                }
                let duration_ms = start.elapsed().as_millis() as u64;
                info!(
                    "Session {} completed: {}/{} groups extracted in {}ms",
                    session.session_id, aggregate.succeeded, aggregate.total_groups, duration_ms
                );
                Ok(DocumentReport {
                    session_id: session.session_id.clone(),
                    document_id: session.document_id.clone(),
                    session_root: session.root.clone(),
                    pages,
                    stages: records,
                    aggregate,
                    duration_ms,
                })
            }
            Err(e) => {
                if let Err(close_err) = self.store.close(session, SessionState::Failed) {
                    warn!("Could not mark session {} failed: {}", session.session_id, close_err);
                }
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        session: &Session,
        document: &Path,
        records: &mut Vec<StageRecord>,
    ) -> Result<(usize, Aggregate), PipelineError> {
        let exec = StageExecutor::new(&self.store, session, self.config.progress_callback.as_ref());

        self.stage(&exec, records, StageId::Session, async {
            substep_complete(StageId::Session, 1, None);
            Ok(StageOutcome::completed((), Vec::new()))
        })
        .await?;

        self.stage(&exec, records, StageId::Rasterize, self.rasterize(session, document))
            .await?;
        self.stage(&exec, records, StageId::Distortion, self.correct_distortion(session))
            .await?;
        self.stage(&exec, records, StageId::Orientation, self.correct_orientation(session))
            .await?;
        let pages = self
            .stage(&exec, records, StageId::PageSplit, self.split_pages(session))
            .await?
            .unwrap_or_default();
        self.stage(&exec, records, StageId::Bands, self.split_bands(session))
            .await?;
        let upscaled = self
            .stage(&exec, records, StageId::SuperResolve, self.super_resolve(session))
            .await?;

        let group_source = if upscaled.is_some() {
            StageId::SuperResolve
        } else {
            StageId::Bands
        };
        let aggregate = self
            .stage(&exec, records, StageId::Extraction, self.extract(session, group_source))
            .await?
            .ok_or_else(|| PipelineError::Internal("extraction stage produced no aggregate".into()))?;

        Ok((pages, aggregate))
    }

    /// Run one stage unless cancelled, keep its record, and decide fatality.
    async fn stage<T, Fut>(
        &self,
        exec: &StageExecutor<'_>,
        records: &mut Vec<StageRecord>,
        stage: StageId,
        work: Fut,
    ) -> Result<Option<T>, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        if self.cancel.is_cancelled() {
            info!("Cancelled before {}", stage);
            return Err(PipelineError::Cancelled);
        }
        let (outcome, record) = exec.run(stage, work).await;
        records.push(record);
        outcome.into_result(stage)
    }

    // ── Stage 1 ──────────────────────────────────────────────────────────

    async fn rasterize(&self, session: &Session, document: &Path) -> Result<StageOutcome<usize>, PipelineError> {
        let pages = self
            .ports
            .raster
            .rasterize_document(document, &session.document_id, &self.config.raster)
            .await?;
        if pages.is_empty() {
            return Err(PipelineError::CorruptPdf {
                path: document.to_path_buf(),
                detail: "document has no pages".to_string(),
            });
        }

        let artifacts = self.save_pages(session, StageId::Rasterize, &pages)?;
        for page in &pages {
            substep_complete(StageId::Rasterize, 1, Some(page.page_index));
        }
        Ok(StageOutcome::completed(pages.len(), artifacts))
    }

    // ── Stage 2 ──────────────────────────────────────────────────────────

    async fn correct_distortion(&self, session: &Session) -> Result<StageOutcome<usize>, PipelineError> {
        const STAGE: StageId = StageId::Distortion;
        let pages = self.load_pages(session, StageId::Rasterize)?;
        let mut out = Vec::with_capacity(pages.len());
        let mut artifacts = Vec::new();

        for page in pages {
            let verdict = self.judge_distortion(&page).await?;
            substep_complete(STAGE, 1, Some(page.page_index));

            let plan = plan_distortion(&verdict, &self.config.dewarping);
            if verdict.needs_dewarping && !plan.dewarp() {
                info!("Page {}: dewarping disabled, verdict recorded only", page.page_index);
            }
            artifacts.push(self.save_judgment(session, STAGE, page.page_index, Verdict::Distortion(verdict), plan)?);

            let mut current = page;
            for step in plan.corrections(current.dpi, &self.config.raster) {
                let substage = match step {
                    CorrectionKind::Rerasterize { .. } => 2,
                    _ => 3,
                };
                debug!("Page {}: {}", current.page_index, step);
                current = self.ports.corrector.correct(&current, step).await?;
                substep_complete(STAGE, substage, Some(current.page_index));
            }
            out.push(current);
        }

        artifacts.extend(self.save_pages(session, STAGE, &out)?);
        Ok(StageOutcome::completed(out.len(), artifacts))
    }

    async fn judge_distortion(&self, page: &PageImage) -> Result<DistortionVerdict, PipelineError> {
        match self.judge(page, ClassificationKind::Distortion).await? {
            Verdict::Distortion(v) => Ok(v),
            other => Err(mismatch(ClassificationKind::Distortion, page, &other)),
        }
    }

    // ── Stage 3 ──────────────────────────────────────────────────────────

    async fn correct_orientation(&self, session: &Session) -> Result<StageOutcome<usize>, PipelineError> {
        const STAGE: StageId = StageId::Orientation;
        let pages = self.load_pages(session, StageId::Distortion)?;
        let mut out = Vec::with_capacity(pages.len());
        let mut artifacts = Vec::new();

        for page in pages {
            let verdict = self.judge_orientation(&page).await?;
            substep_complete(STAGE, 1, Some(page.page_index));

            let rotation = plan_rotation(&verdict);
            artifacts.push(self.save_judgment(
                session,
                STAGE,
                page.page_index,
                Verdict::Orientation(verdict),
                rotation,
            )?);

            let page = match rotation {
                Some(angle) => {
                    debug!("Page {}: rotating {}", page.page_index, angle);
                    let rotated = self
                        .ports
                        .corrector
                        .correct(&page, CorrectionKind::Rotate { angle })
                        .await?;
                    substep_complete(STAGE, 2, Some(rotated.page_index));
                    rotated
                }
                None => page,
            };
            out.push(page);
        }

        artifacts.extend(self.save_pages(session, STAGE, &out)?);
        Ok(StageOutcome::completed(out.len(), artifacts))
    }

    async fn judge_orientation(&self, page: &PageImage) -> Result<OrientationVerdict, PipelineError> {
        match self.judge(page, ClassificationKind::Orientation).await? {
            Verdict::Orientation(v) => Ok(v),
            other => Err(mismatch(ClassificationKind::Orientation, page, &other)),
        }
    }

    // ── Stage 4 ──────────────────────────────────────────────────────────

    async fn split_pages(&self, session: &Session) -> Result<StageOutcome<usize>, PipelineError> {
        const STAGE: StageId = StageId::PageSplit;
        let pages = self.load_pages(session, StageId::Orientation)?;
        let mut out = Vec::with_capacity(pages.len());
        let mut artifacts = Vec::new();

        for page in pages {
            let verdict = self.judge_page_count(&page).await?;
            substep_complete(STAGE, 1, Some(page.page_index));

            let parts = plan_page_split(&verdict, &self.config.page_split);
            artifacts.push(self.save_judgment(
                session,
                STAGE,
                page.page_index,
                Verdict::PageCount(verdict),
                parts,
            )?);

            if parts > 1 {
                let index = page.page_index;
                let split = split_page(page, parts, self.config.page_split.overlap_ratio).await?;
                info!("Page {}: split into {} pages", index, split.len());
                substep_complete(STAGE, 2, Some(index));
                out.extend(split);
            } else {
                out.push(page);
            }
        }

        for (i, page) in out.iter_mut().enumerate() {
            page.page_index = i as u32 + 1;
        }

        artifacts.extend(self.save_pages(session, STAGE, &out)?);
        Ok(StageOutcome::completed(out.len(), artifacts))
    }

    async fn judge_page_count(&self, page: &PageImage) -> Result<PageCountVerdict, PipelineError> {
        match self.judge(page, ClassificationKind::PageCount).await? {
            Verdict::PageCount(v) => Ok(v),
            other => Err(mismatch(ClassificationKind::PageCount, page, &other)),
        }
    }

    // ── Stage 5 ──────────────────────────────────────────────────────────

    async fn split_bands(&self, session: &Session) -> Result<StageOutcome<usize>, PipelineError> {
        const STAGE: StageId = StageId::Bands;
        let pages = self.load_pages(session, StageId::PageSplit)?;
        let settings = self.config.bands.clone();
        let mut groups = Vec::new();

        for page in pages {
            let index = page.page_index;
            let settings = settings.clone();
            let page_groups = tokio::task::spawn_blocking(move || group_page_blocking(&page, &settings))
                .await
                .map_err(|e| PipelineError::Internal(format!("Band task panicked: {}", e)))?
                .map_err(|e| PipelineError::CorrectionFailed {
                    kind: "band_split".to_string(),
                    page: index,
                    detail: e.to_string(),
                })?;
            debug!(
                "Page {}: {} bands in {} group(s)",
                index,
                page_groups.iter().map(|g| g.bands.len()).sum::<usize>(),
                page_groups.len()
            );
            groups.extend(page_groups);
            substep_complete(STAGE, 1, Some(index));
        }

        let artifacts = self.save_groups(session, STAGE, &groups)?;
        Ok(StageOutcome::completed(groups.len(), artifacts))
    }

    // ── Stage 6 ──────────────────────────────────────────────────────────

    async fn super_resolve(&self, session: &Session) -> Result<StageOutcome<usize>, PipelineError> {
        const STAGE: StageId = StageId::SuperResolve;
        let settings = &self.config.super_resolution;
        if !settings.enabled {
            return Ok(StageOutcome::skipped("super-resolution disabled"));
        }

        let mut groups = self.load_groups(session, StageId::Bands)?;
        let kind = CorrectionKind::SuperResolve {
            scale: settings.scale,
            max_dimension: settings.max_dimension,
        };
        let mut done: HashMap<String, GroupImage> = HashMap::new();

        for group in &mut groups {
            let document_id = group.document_id.clone();
            let page_index = group.page_index;
            for image in std::iter::once(&mut group.source).chain(group.bands.iter_mut()) {
                if let Some(up) = done.get(&image.key) {
                    *image = up.clone();
                    continue;
                }
                let page = as_page(&document_id, page_index, image);
                let upscaled = self.ports.corrector.correct(&page, kind).await?;
                *image = GroupImage {
                    key: image.key.clone(),
                    band: image.band,
                    width: upscaled.width,
                    height: upscaled.height,
                    png: upscaled.png,
                };
                done.insert(image.key.clone(), image.clone());
            }
            if group.group_id == group.group_count {
                substep_complete(STAGE, 1, Some(page_index));
            }
        }

        let artifacts = self.save_groups(session, STAGE, &groups)?;
        Ok(StageOutcome::completed(groups.len(), artifacts))
    }

    // ── Stage 7 ──────────────────────────────────────────────────────────

    async fn extract(&self, session: &Session, source: StageId) -> Result<StageOutcome<Aggregate>, PipelineError> {
        const STAGE: StageId = StageId::Extraction;
        let groups = self.load_groups(session, source)?;
        let progress = self.config.progress_callback.as_ref();
        info!("Extracting {} groups from {}", groups.len(), source);
        if let Some(cb) = progress {
            cb.on_extraction_start(groups.len());
        }

        let controller = ConcurrencyController::from_settings(&self.config.extraction);
        let results = controller
            .run(
                &session.session_id,
                groups,
                Arc::clone(&self.ports.extractor),
                &self.cancel,
                progress,
            )
            .await;
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut artifacts = Vec::with_capacity(results.len() * 2 + 2);
        for result in &results {
            let key = result.key();
            self.store.put_json(session, STAGE, &key, result)?;
            artifacts.push(key);
            if result.status.is_succeeded() {
                let txt = format!("page_{:03}_group_{:02}.txt", result.page_index, result.group_id);
                self.store.put(session, STAGE, &txt, result.text.as_bytes())?;
                artifacts.push(txt);
                substep_complete(STAGE, 1, Some(result.page_index));
            }
        }

        let aggregate = Aggregate::from_results(&session.session_id, &session.document_id, results);
        for failed in aggregate.failures() {
            if let ExtractionStatus::Failed { ref error } = failed.status {
                warn!("{}", error);
            }
        }
        self.store.put_json(session, STAGE, AGGREGATE, &aggregate)?;
        self.store.put(session, STAGE, DOCUMENT_TEXT, aggregate.text.as_bytes())?;
        artifacts.push(AGGREGATE.to_string());
        artifacts.push(DOCUMENT_TEXT.to_string());
        substep_complete(STAGE, 2, None);

        Ok(StageOutcome::completed(aggregate, artifacts))
    }

    // ── Store helpers ────────────────────────────────────────────────────

    async fn judge(&self, page: &PageImage, kind: ClassificationKind) -> Result<Verdict, PipelineError> {
        let verdict = self.ports.classifier.classify(page, kind).await?;
        debug!("Page {}: {} verdict {:?}", page.page_index, kind, verdict);
        Ok(verdict)
    }

    fn save_judgment<A: Serialize>(
        &self,
        session: &Session,
        stage: StageId,
        page_index: u32,
        verdict: Verdict,
        action: A,
    ) -> Result<String, PipelineError> {
        let key = verdict_key(page_index);
        let judgment = PageJudgment {
            page_index,
            verdict,
            action,
        };
        self.store.put_json(session, stage, &key, &judgment)?;
        Ok(key)
    }

    fn save_pages(&self, session: &Session, stage: StageId, pages: &[PageImage]) -> Result<Vec<String>, PipelineError> {
        let mut keys = Vec::with_capacity(pages.len() + 1);
        for page in pages {
            let key = page.key();
            self.store.put(session, stage, &key, &page.png)?;
            keys.push(key);
        }
        self.store.put_json(session, stage, PAGES_INDEX, &pages)?;
        keys.push(PAGES_INDEX.to_string());
        Ok(keys)
    }

    fn load_pages(&self, session: &Session, stage: StageId) -> Result<Vec<PageImage>, PipelineError> {
        let mut pages: Vec<PageImage> = self.store.get_json(session, stage, PAGES_INDEX)?;
        for page in &mut pages {
            page.png = self.store.get(session, stage, &page.key())?;
        }
        debug!("Loaded {} pages from {}", pages.len(), stage);
        Ok(pages)
    }

    /// Writes each distinct image once; groups of one page share its source.
    fn save_groups(
        &self,
        session: &Session,
        stage: StageId,
        groups: &[ExtractionGroup],
    ) -> Result<Vec<String>, PipelineError> {
        let mut written = HashSet::new();
        let mut keys = Vec::new();
        for image in groups.iter().flat_map(|g| g.images()) {
            if written.insert(image.key.clone()) {
                self.store.put(session, stage, &image.key, &image.png)?;
                keys.push(image.key.clone());
            }
        }
        self.store.put_json(session, stage, GROUPS_INDEX, &groups)?;
        keys.push(GROUPS_INDEX.to_string());
        Ok(keys)
    }

    fn load_groups(&self, session: &Session, stage: StageId) -> Result<Vec<ExtractionGroup>, PipelineError> {
        let mut groups: Vec<ExtractionGroup> = self.store.get_json(session, stage, GROUPS_INDEX)?;
        let mut cache: HashMap<String, Vec<u8>> = HashMap::new();
        for group in &mut groups {
            for image in std::iter::once(&mut group.source).chain(group.bands.iter_mut()) {
                let png = match cache.get(&image.key) {
                    Some(png) => png.clone(),
                    None => {
                        let png = self.store.get(session, stage, &image.key)?;
                        cache.insert(image.key.clone(), png.clone());
                        png
                    }
                };
                image.png = png;
            }
        }
        debug!("Loaded {} groups from {}", groups.len(), stage);
        Ok(groups)
    }
}

fn mismatch(expected: ClassificationKind, page: &PageImage, got: &Verdict) -> PipelineError {
    PipelineError::ClassificationUnavailable {
        kind: expected.to_string(),
        page: page.page_index,
        detail: format!("classifier returned the wrong verdict kind: {got:?}"),
    }
}

/// Cut a side-by-side scan into `parts` pages, left to right.
async fn split_page(page: PageImage, parts: u32, overlap: f32) -> Result<Vec<PageImage>, PipelineError> {
    let index = page.page_index;
    tokio::task::spawn_blocking(move || {
        let img = page.decode()?;
        let columns = column_bounds(img.width(), parts, overlap);
        cut_columns(&img, &columns)
            .iter()
            .enumerate()
            .map(|(k, part)| {
                page.derive(
                    part,
                    Correction::SplitPage {
                        part: k as u32 + 1,
                        of: parts,
                    },
                )
            })
            .collect::<Result<Vec<_>, image::ImageError>>()
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Split task panicked: {}", e)))?
    .map_err(|e| PipelineError::CorrectionFailed {
        kind: "split_page".to_string(),
        page: index,
        detail: e.to_string(),
    })
}

/// Bands for one page, chunked into extraction groups.
fn group_page_blocking(page: &PageImage, settings: &BandSettings) -> Result<Vec<ExtractionGroup>, image::ImageError> {
    let img = page.decode()?;
    let bounds = band_bounds(img.height(), settings.count, settings.overlap, settings.min_height);

    let source = GroupImage {
        key: source_key(page.page_index),
        band: None,
        width: img.width(),
        height: img.height(),
        png: page.png.clone(),
    };
    let bands = cut_bands(&img, &bounds)
        .iter()
        .zip(&bounds)
        .map(|(cut, band)| {
            Ok(GroupImage {
                key: band_key(page.page_index, band.index),
                band: Some(*band),
                width: cut.width(),
                height: cut.height(),
                png: encode_png(cut)?,
            })
        })
        .collect::<Result<Vec<_>, image::ImageError>>()?;

    let chunks = chunk_bands(bands.len(), settings.max_images_per_group as usize);
    let group_count = chunks.len() as u32;
    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(i, range)| ExtractionGroup {
            document_id: page.document_id.clone(),
            page_index: page.page_index,
            group_id: i as u32 + 1,
            group_count,
            source: source.clone(),
            bands: bands[range].to_vec(),
        })
        .collect())
}

/// Wrap a group image so it can go through the correction port.
fn as_page(document_id: &str, page_index: u32, image: &GroupImage) -> PageImage {
    PageImage {
        document_id: document_id.to_string(),
        document_path: Default::default(),
        page_index,
        source_page: page_index,
        width: image.width,
        height: image.height,
        dpi: 0,
        lineage: Vec::new(),
        png: image.png.clone(),
    }
}
