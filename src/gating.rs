//! Verdict → action plan.
//!
//! Gates are pure: a verdict and the relevant settings go in, an enumerated
//! plan comes out. The orchestrator executes the plan; nothing here touches
//! pixels or the store, which keeps every branch testable without images.

use crate::config::{DewarpSettings, PageSplitSettings, RasterSettings};
use crate::model::{Angle, DistortionVerdict, OrientationVerdict, PageCountVerdict, Readability};
use crate::ports::CorrectionKind;
use serde::{Deserialize, Serialize};

/// Stage-2 plan for one page.
///
/// Re-rasterisation always precedes dewarping when both apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistortionPlan {
    Skip,
    Rerasterize,
    Dewarp,
    RerasterizeThenDewarp,
}

impl DistortionPlan {
    pub fn rerasterize(self) -> bool {
        matches!(self, DistortionPlan::Rerasterize | DistortionPlan::RerasterizeThenDewarp)
    }

    pub fn dewarp(self) -> bool {
        matches!(self, DistortionPlan::Dewarp | DistortionPlan::RerasterizeThenDewarp)
    }

    /// The corrections to apply, in order, for a page rendered at `dpi`.
    pub fn corrections(self, dpi: u32, raster: &RasterSettings) -> Vec<CorrectionKind> {
        let mut steps = Vec::with_capacity(2);
        if self.rerasterize() {
            steps.push(CorrectionKind::Rerasterize {
                dpi: raster.rerasterize_dpi(dpi),
            });
        }
        if self.dewarp() {
            steps.push(CorrectionKind::Dewarp);
        }
        steps
    }
}

/// Decide Stage-2 corrections.
///
/// Major readability problems trigger a higher-DPI re-render; a dewarp
/// verdict triggers dewarping unless dewarping is disabled. The two gates are
/// independent: poor readability alone never implies dewarping.
pub fn plan_distortion(verdict: &DistortionVerdict, dewarping: &DewarpSettings) -> DistortionPlan {
    let rerasterize = verdict.readability == Readability::Major;
    let dewarp = verdict.needs_dewarping && dewarping.enabled;
    match (rerasterize, dewarp) {
        (false, false) => DistortionPlan::Skip,
        (true, false) => DistortionPlan::Rerasterize,
        (false, true) => DistortionPlan::Dewarp,
        (true, true) => DistortionPlan::RerasterizeThenDewarp,
    }
}

/// Decide the Stage-3 rotation, `None` when the page is upright.
pub fn plan_rotation(verdict: &OrientationVerdict) -> Option<Angle> {
    match verdict.angle {
        Angle::Deg0 => None,
        angle => Some(angle),
    }
}

/// Decide how many sub-pages Stage 4 cuts an image into.
///
/// The judged count is clamped to `1..=max_pages`; `1` means keep as is.
pub fn plan_page_split(verdict: &PageCountVerdict, settings: &PageSplitSettings) -> u32 {
    verdict.page_count.clamp(1, settings.max_pages.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn distortion(needs_dewarping: bool, readability: Readability) -> DistortionVerdict {
        DistortionVerdict {
            needs_dewarping,
            readability,
            ..Default::default()
        }
    }

    #[test]
    fn distortion_gates_are_independent() {
        let on = DewarpSettings::default();
        assert_eq!(plan_distortion(&distortion(false, Readability::None), &on), DistortionPlan::Skip);
        assert_eq!(plan_distortion(&distortion(false, Readability::Minor), &on), DistortionPlan::Skip);
        assert_eq!(
            plan_distortion(&distortion(false, Readability::Major), &on),
            DistortionPlan::Rerasterize
        );
        assert_eq!(plan_distortion(&distortion(true, Readability::None), &on), DistortionPlan::Dewarp);
        assert_eq!(
            plan_distortion(&distortion(true, Readability::Major), &on),
            DistortionPlan::RerasterizeThenDewarp
        );
    }

    #[test]
    fn disabled_dewarping_suppresses_dewarp_only() {
        let off = DewarpSettings {
            enabled: false,
            ..Default::default()
        };
        assert_eq!(plan_distortion(&distortion(true, Readability::None), &off), DistortionPlan::Skip);
        assert_eq!(
            plan_distortion(&distortion(true, Readability::Major), &off),
            DistortionPlan::Rerasterize
        );
    }

    #[test]
    fn corrections_are_ordered_and_dpi_clamped() {
        let raster = RasterSettings::default();
        let steps = DistortionPlan::RerasterizeThenDewarp.corrections(350, &raster);
        assert_eq!(
            steps,
            vec![CorrectionKind::Rerasterize { dpi: 600 }, CorrectionKind::Dewarp]
        );
        assert!(DistortionPlan::Skip.corrections(300, &raster).is_empty());
    }

    #[test]
    fn upright_pages_are_not_rotated() {
        let v = |angle| OrientationVerdict {
            angle,
            confidence: None,
            comment: None,
        };
        assert_eq!(plan_rotation(&v(Angle::Deg0)), None);
        assert_eq!(plan_rotation(&v(Angle::Deg270)), Some(Angle::Deg270));
    }

    #[test]
    fn page_count_is_clamped() {
        let settings = PageSplitSettings::default();
        let v = |page_count| PageCountVerdict {
            page_count,
            confidence: None,
            comment: None,
        };
        assert_eq!(plan_page_split(&v(0), &settings), 1);
        assert_eq!(plan_page_split(&v(2), &settings), 2);
        assert_eq!(plan_page_split(&v(9), &settings), 3);
    }
}
