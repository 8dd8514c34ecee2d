//! Geometry for Stage 4 (side-by-side page split) and Stage 5 (horizontal
//! overlapping bands).
//!
//! Bounds are computed as plain numbers first and only then applied to
//! pixels, so the arithmetic is tested without decoding a single image.
//!
//! ## Band formula
//!
//! For an image of height `H`, `N` bands and overlap fraction `f`:
//!
//! ```text
//! h      = round(H / (N − (N−1)·f))
//! top_i  = round(i · h · (1 − f))
//! band_i = [top_i, min(top_i + h, H))
//! ```
//!
//! Consecutive bands overlap by about `f·h` rows, so a text line cut by one
//! band edge is whole in the neighbour. While `H < N·m` for the minimum
//! height `m`, `N` shrinks (down to one unsplit band).

use crate::model::ImageBand;
use image::DynamicImage;
use std::ops::Range;

/// Horizontal bands covering `[0, height)`.
///
/// The last band always ends at `height`; when rounding would leave it
/// shorter than the others it is anchored to the bottom edge instead.
/// A single band has `top == 0`. `N` is reduced while `height < N·min_height`
/// or while two bands would start or end on the same row.
pub fn band_bounds(height: u32, count: u32, overlap: f32, min_height: u32) -> Vec<ImageBand> {
    if height == 0 {
        return Vec::new();
    }
    let f = overlap.clamp(0.0, 0.95) as f64;
    let total = height as f64;

    let mut n = count.max(1);
    while n > 1 {
        let h = (total / (n as f64 - (n as f64 - 1.0) * f)).round() as u32;
        if n as u64 * min_height as u64 <= height as u64 && h >= min_height {
            let bands = layout(height, n, h.min(height), f, overlap);
            if strictly_ordered(&bands) {
                return bands;
            }
        }
        n -= 1;
    }
    layout(height, 1, height, f, overlap)
}

fn layout(height: u32, n: u32, band_height: u32, f: f64, overlap: f32) -> Vec<ImageBand> {
    let stride = band_height as f64 * (1.0 - f);
    let mut bands: Vec<ImageBand> = Vec::with_capacity(n as usize);
    for i in 0..n {
        let (top, bottom) = if i + 1 == n {
            // anchored to the bottom edge, never leaving a gap above it
            let prev_bottom = bands.last().map_or(0, |b| b.bottom);
            (height.saturating_sub(band_height).min(prev_bottom), height)
        } else {
            let top = (i as f64 * stride).round() as u32;
            (top, (top + band_height).min(height))
        };
        bands.push(ImageBand {
            index: i,
            top,
            bottom,
            overlap,
        });
    }
    bands
}

fn strictly_ordered(bands: &[ImageBand]) -> bool {
    bands
        .windows(2)
        .all(|pair| pair[0].top < pair[1].top && pair[0].bottom < pair[1].bottom)
}

/// Column ranges `[left, right)` for splitting side-by-side pages.
///
/// Every interior boundary is widened by `overlap · width / 2` on each side,
/// so the gutter appears in both neighbouring columns.
pub fn column_bounds(width: u32, count: u32, overlap: f32) -> Vec<Range<u32>> {
    let n = count.max(1);
    if n == 1 || width == 0 {
        return vec![0..width];
    }
    let half_overlap = (width as f64 * overlap.clamp(0.0, 0.5) as f64 / 2.0).floor() as u32;
    let edge = |k: u32| ((width as u64 * k as u64) / n as u64) as u32;
    (0..n)
        .map(|k| {
            let left = if k == 0 { 0 } else { edge(k).saturating_sub(half_overlap) };
            let right = if k + 1 == n {
                width
            } else {
                (edge(k + 1) + half_overlap).min(width)
            };
            left..right
        })
        .collect()
}

/// Cut horizontal bands out of an image.
pub fn cut_bands(image: &DynamicImage, bands: &[ImageBand]) -> Vec<DynamicImage> {
    bands
        .iter()
        .map(|b| image.crop_imm(0, b.top, image.width(), b.height()))
        .collect()
}

/// Cut vertical columns out of an image.
pub fn cut_columns(image: &DynamicImage, columns: &[Range<u32>]) -> Vec<DynamicImage> {
    columns
        .iter()
        .map(|c| image.crop_imm(c.start, 0, c.end - c.start, image.height()))
        .collect()
}

/// Partition `band_count` bands into groups that fit `max_images` images
/// each, counting the source page that rides along with every group.
pub fn chunk_bands(band_count: usize, max_images: usize) -> Vec<Range<usize>> {
    let per_group = max_images.saturating_sub(1).max(1);
    if band_count == 0 {
        return vec![0..0];
    }
    (0..band_count)
        .step_by(per_group)
        .map(|start| start..(start + per_group).min(band_count))
        .collect()
}
