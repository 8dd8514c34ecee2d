//! VLM adapters: the classification and extraction ports on top of
//! `edgequake-llm`.
//!
//! Both adapters are thin. Prompt wording lives in [`crate::prompts`],
//! retry policy in [`crate::controller`]; this module builds the vision
//! messages, enforces the per-call timeout and turns replies into typed
//! verdicts or text.
//!
//! ## Message Layout
//!
//! 1. **System message**: judge or transcriber role
//! 2. **User message**: instruction text plus the image(s) as base64 PNG
//!
//! A classification call carries one image. An extraction call carries the
//! full page followed by its bands, in order.

use crate::config::LlmSettings;
use crate::error::PipelineError;
use crate::model::{
    Angle, DistortionVerdict, ExtractionGroup, OrientationVerdict, PageCountVerdict, PageImage,
    Readability, Verdict,
};
use crate::pipeline::encode::to_image_data;
use crate::pipeline::postprocess::extract_json_block;
use crate::ports::{ClassificationKind, ClassificationPort, ExtractionOutput, ExtractionPort};
use crate::prompts::{
    extraction_instruction, judgment_prompt, EXTRACTION_SYSTEM_PROMPT, JUDGE_SYSTEM_PROMPT,
};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default model when a provider is named without one.
const DEFAULT_MODEL: &str = "gpt-4.1-nano";

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Named provider + model** (`llm.provider`): reads the matching API key
///    (`OPENAI_API_KEY`, …) from the environment.
/// 2. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 3. **OpenAI** when `OPENAI_API_KEY` is set, so users holding several keys
///    get a predictable default.
/// 4. **Auto-detection** via [`ProviderFactory::from_env`].
pub fn resolve_provider(settings: &LlmSettings) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref name) = settings.provider {
        let model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = settings.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

/// Build `CompletionOptions` from the LLM settings.
fn build_options(settings: &LlmSettings, max_tokens: usize) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(settings.temperature),
        max_tokens: Some(max_tokens),
        ..Default::default()
    }
}

/// Judgments are one small JSON object.
const JUDGMENT_MAX_TOKENS: usize = 512;

// ── Classifier ───────────────────────────────────────────────────────────

/// [`ClassificationPort`] backed by a vision LLM.
pub struct VlmClassifier {
    provider: Arc<dyn LLMProvider>,
    settings: LlmSettings,
}

impl VlmClassifier {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: LlmSettings) -> Self {
        Self { provider, settings }
    }
}

#[async_trait]
impl ClassificationPort for VlmClassifier {
    async fn classify(&self, image: &PageImage, kind: ClassificationKind) -> Result<Verdict, PipelineError> {
        let unavailable = |detail: String| PipelineError::ClassificationUnavailable {
            kind: kind.to_string(),
            page: image.page_index,
            detail,
        };

        let messages = vec![
            ChatMessage::system(JUDGE_SYSTEM_PROMPT),
            ChatMessage::user_with_images(judgment_prompt(kind), vec![to_image_data(&image.png)]),
        ];
        let options = build_options(&self.settings, JUDGMENT_MAX_TOKENS);
        let start = Instant::now();

        let response = timeout(self.settings.api_timeout(), self.provider.chat(&messages, Some(&options)))
            .await
            .map_err(|_| unavailable(timed_out(self.settings.api_timeout())))?
            .map_err(|e| unavailable(e.to_string()))?;

        debug!(
            "Page {}: {} judgment in {:?} ({} in / {} out tokens)",
            image.page_index,
            kind,
            start.elapsed(),
            response.prompt_tokens,
            response.completion_tokens
        );

        parse_verdict(kind, &response.content).map_err(unavailable)
    }
}

fn timed_out(after: Duration) -> String {
    format!("timed out after {}s", after.as_secs())
}

// ── Verdict parsing ──────────────────────────────────────────────────────

/// Parse a judge reply into a verdict of the requested kind.
///
/// Tolerant of fences, prose around the object, booleans sent as strings
/// and angles that are not exact quarter turns.
pub fn parse_verdict(kind: ClassificationKind, reply: &str) -> Result<Verdict, String> {
    let json = extract_json_block(reply).ok_or_else(|| format!("no JSON object in reply: {}", preview(reply)))?;
    let v: Value = serde_json::from_str(json).map_err(|e| format!("malformed JSON ({e}): {}", preview(json)))?;

    let confidence = field(&v, &["confidence_score", "confidence"]).and_then(as_f64).map(|c| c as f32);
    let comment = field(&v, &["overall_comment", "comment"])
        .and_then(Value::as_str)
        .map(str::to_string);

    match kind {
        ClassificationKind::Distortion => {
            let needs_dewarping = field(&v, &["needs_dewarping"])
                .and_then(as_bool)
                .ok_or("missing or invalid 'needs_dewarping'")?;
            let readability = match field(&v, &["readability_issues", "readability"]) {
                None => Readability::None,
                Some(r) => parse_readability(r)?,
            };
            let out_of_frame = field(&v, &["has_something_out_of_document", "out_of_frame"])
                .and_then(as_bool)
                .unwrap_or(false);
            Ok(Verdict::Distortion(DistortionVerdict {
                needs_dewarping,
                readability,
                out_of_frame,
                confidence,
                comment,
            }))
        }
        ClassificationKind::Orientation => {
            let degrees = field(&v, &["rotation_angle", "recommended_angle", "angle"])
                .and_then(as_f64)
                .ok_or("missing or invalid 'rotation_angle'")?;
            Ok(Verdict::Orientation(OrientationVerdict {
                angle: Angle::nearest(degrees),
                confidence,
                comment,
            }))
        }
        ClassificationKind::PageCount => {
            let count = field(&v, &["page_count"])
                .and_then(as_f64)
                .ok_or("missing or invalid 'page_count'")?;
            Ok(Verdict::PageCount(PageCountVerdict {
                page_count: count.round().max(1.0) as u32,
                confidence,
                comment,
            }))
        }
    }
}

fn field<'a>(v: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| v.get(*n)).filter(|x| !x.is_null())
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|x| x != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('°').parse().ok(),
        _ => None,
    }
}

fn parse_readability(v: &Value) -> Result<Readability, String> {
    let s = v.as_str().ok_or("'readability_issues' must be a string")?;
    match s.trim().to_ascii_lowercase().as_str() {
        "none" | "no" | "" => Ok(Readability::None),
        "minor" | "low" | "moderate" => Ok(Readability::Minor),
        "major" | "high" | "severe" => Ok(Readability::Major),
        other => Err(format!("unknown readability level '{other}'")),
    }
}

fn preview(s: &str) -> String {
    let mut p: String = s.chars().take(120).collect();
    if p.len() < s.len() {
        p.push('…');
    }
    p
}

// ── Extractor ────────────────────────────────────────────────────────────

/// [`ExtractionPort`] backed by a vision LLM.
///
/// One call per group; every failure is reported as retryable
/// [`PipelineError::ExtractionFailed`] and left to the controller.
pub struct VlmExtractor {
    provider: Arc<dyn LLMProvider>,
    settings: LlmSettings,
}

impl VlmExtractor {
    pub fn new(provider: Arc<dyn LLMProvider>, settings: LlmSettings) -> Self {
        Self { provider, settings }
    }
}

#[async_trait]
impl ExtractionPort for VlmExtractor {
    async fn extract(&self, group: &ExtractionGroup) -> Result<ExtractionOutput, PipelineError> {
        let failed = |detail: String| PipelineError::ExtractionFailed {
            page: group.page_index,
            group: group.group_id,
            detail,
        };

        let images = group.images().map(|img| to_image_data(&img.png)).collect();
        let instruction = extraction_instruction(
            group.page_index,
            group.group_id,
            group.group_count,
            group.bands.len(),
        );
        let messages = vec![
            ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
            ChatMessage::user_with_images(&instruction, images),
        ];
        let options = build_options(&self.settings, self.settings.max_tokens);
        let start = Instant::now();

        let response = timeout(self.settings.api_timeout(), self.provider.chat(&messages, Some(&options)))
            .await
            .map_err(|_| failed(timed_out(self.settings.api_timeout())))?
            .map_err(|e| failed(e.to_string()))?;

        if response.content.trim().is_empty() {
            warn!("{}: empty transcription", group.label());
            return Err(failed("empty response".to_string()));
        }

        debug!(
            "{}: {} images, {} input tokens, {} output tokens, {:?}",
            group.label(),
            group.image_count(),
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(ExtractionOutput {
            text: response.content,
            input_tokens: response.prompt_tokens,
            output_tokens: response.completion_tokens,
        })
    }
}
