//! Screenshot comparison for visual verification
//!
//! Two screenshots are compared pixel by pixel using a perceptual colour
//! distance (YIQ, alpha blended over white). Changed pixels are grouped into
//! 4-connected regions so callers can tell a moved button from page-wide noise.

use crate::error::{ResilienceError, Result};
use image::{ImageOutputFormat, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Cursor;

/// Largest possible YIQ delta between two pixels
const MAX_YIQ_DELTA: f64 = 35215.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelDiffConfig {
    /// Colour distance tolerance in 0..=1, smaller is stricter
    pub threshold: f64,
    /// Regions with fewer changed pixels are treated as noise
    pub min_region_size: usize,
    /// Change percentage above which a diff counts as significant
    pub significant_change_pct: f64,
}

impl Default for PixelDiffConfig {
    fn default() -> Self {
        Self { threshold: 0.1, min_region_size: 10, significant_change_pct: 5.0 }
    }
}

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }
}

/// Contiguous block of changed pixels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRegion {
    pub bounds: PixelRect,
    pub pixel_count: usize,
    /// Share of the bounding box that actually changed, in percent
    pub change_intensity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PixelDiff {
    pub changed: bool,
    pub change_percentage: f64,
    pub diff_pixels: usize,
    pub total_pixels: usize,
    pub width: u32,
    pub height: u32,
    /// Largest first
    pub regions: Vec<ChangeRegion>,
    #[serde(skip)]
    mask: Vec<bool>,
}

impl PixelDiff {
    pub fn largest_region(&self) -> Option<&ChangeRegion> {
        self.regions.first()
    }

    pub fn is_changed_at(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.mask[(y * self.width + x) as usize]
    }
}

pub struct PixelDiffEngine {
    config: PixelDiffConfig,
}

impl Default for PixelDiffEngine {
    fn default() -> Self {
        Self::new(PixelDiffConfig::default())
    }
}

impl PixelDiffEngine {
    pub fn new(config: PixelDiffConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PixelDiffConfig {
        &self.config
    }

    /// Compare two encoded screenshots (PNG or anything `image` can decode)
    pub fn compare(&self, before: &[u8], after: &[u8]) -> Result<PixelDiff> {
        self.compare_with(before, after, &[], None)
    }

    /// Compare with masked-out regions and an optional threshold override
    pub fn compare_with(
        &self,
        before: &[u8],
        after: &[u8],
        ignore: &[PixelRect],
        threshold: Option<f64>,
    ) -> Result<PixelDiff> {
        let before = decode(before)?;
        let after = decode(after)?;
        self.compare_images(&before, &after, ignore, threshold)
    }

    pub fn compare_images(
        &self,
        before: &RgbaImage,
        after: &RgbaImage,
        ignore: &[PixelRect],
        threshold: Option<f64>,
    ) -> Result<PixelDiff> {
        if before.dimensions() != after.dimensions() {
            return Err(ResilienceError::DimensionMismatch { left: before.dimensions(), right: after.dimensions() });
        }

        let (width, height) = before.dimensions();
        let threshold = threshold.unwrap_or(self.config.threshold).clamp(0.0, 1.0);
        let max_delta = MAX_YIQ_DELTA * threshold * threshold;

        let mut mask = vec![false; (width as usize) * (height as usize)];
        let mut diff_pixels = 0;
        for (x, y, left) in before.enumerate_pixels() {
            if ignore.iter().any(|r| contains(r, x, y)) {
                continue;
            }
            if color_delta(left, after.get_pixel(x, y)) > max_delta {
                mask[(y * width + x) as usize] = true;
                diff_pixels += 1;
            }
        }

        let total_pixels = mask.len();
        let change_percentage =
            if total_pixels == 0 { 0.0 } else { diff_pixels as f64 / total_pixels as f64 * 100.0 };
        let regions = find_regions(&mask, width, height, self.config.min_region_size);

        log::debug!(
            "Pixel diff {}x{}: {} changed ({:.2}%), {} regions",
            width,
            height,
            diff_pixels,
            change_percentage,
            regions.len()
        );

        Ok(PixelDiff {
            changed: diff_pixels > 0,
            change_percentage,
            diff_pixels,
            total_pixels,
            width,
            height,
            regions,
            mask,
        })
    }

    pub fn has_significant_change(&self, diff: &PixelDiff) -> bool {
        diff.change_percentage > self.config.significant_change_pct
    }

    /// Similarity in percent, 100 for identical images
    pub fn similarity(&self, before: &[u8], after: &[u8]) -> Result<f64> {
        Ok((100.0 - self.compare(before, after)?.change_percentage).max(0.0))
    }

    /// Original screenshot with changed pixels tinted red, PNG encoded
    pub fn highlight(&self, original: &[u8], diff: &PixelDiff) -> Result<Vec<u8>> {
        let mut image = decode(original)?;
        if image.dimensions() != (diff.width, diff.height) {
            return Err(ResilienceError::DimensionMismatch {
                left: image.dimensions(),
                right: (diff.width, diff.height),
            });
        }
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            if diff.is_changed_at(x, y) {
                let [r, g, b, a] = pixel.0;
                *pixel = Rgba([r.saturating_add(100), g.saturating_sub(50), b.saturating_sub(50), a]);
            }
        }
        encode_png(&image)
    }
}

pub fn decode(bytes: &[u8]) -> Result<RgbaImage> {
    image::load_from_memory(bytes)
        .map(|image| image.to_rgba8())
        .map_err(|e| ResilienceError::ImageDecode(e.to_string()))
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageOutputFormat::Png)
        .map_err(|e| ResilienceError::ImageDecode(format!("Failed to encode image: {}", e)))?;
    Ok(buffer.into_inner())
}

fn contains(rect: &PixelRect, x: u32, y: u32) -> bool {
    x >= rect.x && y >= rect.y && x - rect.x < rect.width && y - rect.y < rect.height
}

fn blend(channel: u8, alpha: f64) -> f64 {
    255.0 + (channel as f64 - 255.0) * alpha
}

fn color_delta(left: &Rgba<u8>, right: &Rgba<u8>) -> f64 {
    if left == right {
        return 0.0;
    }
    let yiq = |p: &Rgba<u8>| {
        let a = p[3] as f64 / 255.0;
        let (r, g, b) = (blend(p[0], a), blend(p[1], a), blend(p[2], a));
        (
            r * 0.29889531 + g * 0.58662247 + b * 0.11448223,
            r * 0.59597799 - g * 0.27417610 - b * 0.32180189,
            r * 0.21147017 - g * 0.52261711 + b * 0.31114694,
        )
    };
    let (y1, i1, q1) = yiq(left);
    let (y2, i2, q2) = yiq(right);
    let (y, i, q) = (y1 - y2, i1 - i2, q1 - q2);
    0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q
}

fn find_regions(mask: &[bool], width: u32, height: u32, min_size: usize) -> Vec<ChangeRegion> {
    let mut visited = vec![false; mask.len()];
    let mut regions = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        let mut queue = VecDeque::from([start]);
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0, 0);
        let mut pixel_count = 0;

        while let Some(index) = queue.pop_front() {
            let (x, y) = ((index as u32) % width, (index as u32) / width);
            pixel_count += 1;
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);

            let neighbours = [
                (x > 0).then(|| index - 1),
                (x + 1 < width).then(|| index + 1),
                (y > 0).then(|| index - width as usize),
                (y + 1 < height).then(|| index + width as usize),
            ];
            for next in neighbours.into_iter().flatten() {
                if mask[next] && !visited[next] {
                    visited[next] = true;
                    queue.push_back(next);
                }
            }
        }

        if pixel_count >= min_size {
            let bounds = PixelRect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1);
            let area = (bounds.width as f64) * (bounds.height as f64);
            regions.push(ChangeRegion { bounds, pixel_count, change_intensity: pixel_count as f64 / area * 100.0 });
        }
    }

    regions.sort_by(|a, b| b.pixel_count.cmp(&a.pixel_count));
    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);

    fn png(image: &RgbaImage) -> Vec<u8> {
        encode_png(image).unwrap()
    }

    fn paint(image: &mut RgbaImage, rect: PixelRect, color: Rgba<u8>) {
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                image.put_pixel(x, y, color);
            }
        }
    }

    #[test]
    fn test_identical_images() {
        let image = RgbaImage::from_pixel(20, 20, WHITE);
        let engine = PixelDiffEngine::default();
        let diff = engine.compare(&png(&image), &png(&image)).unwrap();

        assert!(!diff.changed);
        assert_eq!(diff.change_percentage, 0.0);
        assert!(diff.regions.is_empty());
        assert_eq!(engine.similarity(&png(&image), &png(&image)).unwrap(), 100.0);
    }

    #[test]
    fn test_regions_sorted_and_small_ones_dropped() {
        let before = RgbaImage::from_pixel(50, 50, WHITE);
        let mut after = before.clone();
        paint(&mut after, PixelRect::new(0, 0, 10, 10), BLACK);
        paint(&mut after, PixelRect::new(30, 30, 5, 4), BLACK);
        paint(&mut after, PixelRect::new(45, 0, 2, 2), BLACK);

        let diff = PixelDiffEngine::default().compare(&png(&before), &png(&after)).unwrap();

        assert_eq!(diff.diff_pixels, 100 + 20 + 4);
        assert_eq!(diff.regions.len(), 2);
        assert_eq!(diff.largest_region().unwrap().bounds, PixelRect::new(0, 0, 10, 10));
        assert_eq!(diff.regions[1].pixel_count, 20);
        assert_eq!(diff.regions[1].change_intensity, 100.0);
    }

    #[test]
    fn test_threshold_tolerates_small_shifts() {
        let before = RgbaImage::from_pixel(10, 10, Rgba([200, 200, 200, 255]));
        let after = RgbaImage::from_pixel(10, 10, Rgba([203, 203, 203, 255]));
        let engine = PixelDiffEngine::default();

        assert!(!engine.compare(&png(&before), &png(&after)).unwrap().changed);
        let strict = engine.compare_with(&png(&before), &png(&after), &[], Some(0.0)).unwrap();
        assert_eq!(strict.change_percentage, 100.0);
    }

    #[test]
    fn test_ignore_regions_and_significance() {
        let before = RgbaImage::from_pixel(10, 10, WHITE);
        let mut after = before.clone();
        paint(&mut after, PixelRect::new(0, 0, 10, 1), BLACK);
        let engine = PixelDiffEngine::default();

        let diff = engine.compare(&png(&before), &png(&after)).unwrap();
        assert_eq!(diff.change_percentage, 10.0);
        assert!(engine.has_significant_change(&diff));

        let masked = engine.compare_with(&png(&before), &png(&after), &[PixelRect::new(0, 0, 10, 1)], None).unwrap();
        assert!(!masked.changed);
        assert!(!engine.has_significant_change(&masked));
    }

    #[test]
    fn test_dimension_mismatch_and_bad_bytes() {
        let engine = PixelDiffEngine::default();
        let small = png(&RgbaImage::from_pixel(4, 4, WHITE));
        let large = png(&RgbaImage::from_pixel(5, 4, WHITE));

        assert!(matches!(
            engine.compare(&small, &large),
            Err(ResilienceError::DimensionMismatch { left: (4, 4), right: (5, 4) })
        ));
        assert!(matches!(engine.compare(b"not a png", &small), Err(ResilienceError::ImageDecode(_))));
    }

    #[test]
    fn test_highlight_tints_changed_pixels() {
        let before = RgbaImage::from_pixel(4, 4, Rgba([100, 100, 100, 255]));
        let mut after = before.clone();
        after.put_pixel(1, 1, BLACK);
        let engine = PixelDiffEngine::default();
        let diff = engine.compare(&png(&before), &png(&after)).unwrap();

        let highlighted = decode(&engine.highlight(&png(&before), &diff).unwrap()).unwrap();
        assert_eq!(highlighted.get_pixel(1, 1), &Rgba([200, 50, 50, 255]));
        assert_eq!(highlighted.get_pixel(0, 0), &Rgba([100, 100, 100, 255]));
    }
}
