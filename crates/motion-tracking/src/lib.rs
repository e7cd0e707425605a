//! Per-camera motion detection via adaptive background subtraction.
//!
//! Each camera owns one [`MotionDetector`]: a running background estimate
//! that is fed every frame, gated output during warmup and during sudden
//! illumination changes, and a morphological-opening + contour-area pass
//! that turns the raw foreground mask into a handful of bounding boxes.

use camwatch_common::BoundingBox;
use image::{GrayImage, Luma};
use imageproc::contours::BorderType;
use imageproc::distance_transform::Norm;
use imageproc::morphology::{dilate, erode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MotionError {
    #[error("invalid motion configuration: {0}")]
    InvalidConfig(String),
}

/// Tunable background-subtraction parameters for a single camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    /// Number of frames the background estimate's learning rate is derived from.
    pub history: u32,
    /// Side length of the square structuring element used for morphological opening.
    pub kernel_size: u8,
    /// Minimum contour area (in pixels) to keep a bounding box.
    pub min_area: i64,
    /// Foreground map values strictly greater than this become 255 after binarization.
    pub binarize_threshold: u8,
    /// Total surviving contour area must reach this for motion to be declared.
    pub area_threshold: i64,
    /// Frames before warmup completes; output is suppressed during warmup.
    pub warmup_frames: u32,
    /// If the foreground ratio strictly exceeds this, output is suppressed (saturation guard).
    pub max_foreground_ratio: f32,
}

impl Default for MotionConfig {
    /// Reads `MOTION_*` overrides from the environment, falling back to
    /// defaults tuned for a typical indoor camera. Any override that fails
    /// to parse is ignored in favor of the default for that field.
    fn default() -> Self {
        fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        Self {
            history: env_or("MOTION_HISTORY", 200),
            kernel_size: env_or("MOTION_KERNEL_SIZE", 5),
            min_area: env_or("MOTION_MIN_AREA", 1500),
            binarize_threshold: env_or("MOTION_BINARIZE_THRESHOLD", 200),
            area_threshold: env_or("MOTION_AREA_THRESHOLD", 5000),
            warmup_frames: env_or("MOTION_WARMUP_FRAMES", 5),
            max_foreground_ratio: env_or("MOTION_MAX_FOREGROUND_RATIO", 0.1),
        }
    }
}

impl MotionConfig {
    pub fn validate(&self) -> Result<(), MotionError> {
        if self.history < 2 {
            return Err(MotionError::InvalidConfig("history must be >= 2".into()));
        }
        if self.kernel_size == 0 || self.kernel_size % 2 == 0 {
            return Err(MotionError::InvalidConfig(
                "kernel_size must be odd and positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.max_foreground_ratio) {
            return Err(MotionError::InvalidConfig(
                "max_foreground_ratio must be in (0,1)".into(),
            ));
        }
        Ok(())
    }
}

/// A running per-pixel background estimate, updated every frame regardless
/// of whether the gate suppresses this frame's output.
struct BackgroundModel {
    width: u32,
    background: Vec<f32>,
    alpha: f32,
}

impl BackgroundModel {
    fn new(gray: &GrayImage, history: u32) -> Self {
        let background = gray.pixels().map(|p| f32::from(p.0[0])).collect();
        Self {
            width: gray.width(),
            background,
            alpha: 1.0 / history.max(1) as f32,
        }
    }

    /// Feed a new frame: returns the raw (non-binarized) foreground response
    /// and updates the background estimate in place.
    fn observe(&mut self, gray: &GrayImage) -> GrayImage {
        let mut fg = GrayImage::new(gray.width(), gray.height());
        for (idx, pixel) in gray.pixels().enumerate() {
            let value = f32::from(pixel.0[0]);
            let bg = self.background[idx];
            let diff = (value - bg).abs().clamp(0.0, 255.0);
            fg.put_pixel(
                (idx as u32) % self.width,
                (idx as u32) / self.width,
                Luma([diff as u8]),
            );
            self.background[idx] = bg + self.alpha * (value - bg);
        }
        fg
    }
}

/// Owns the per-camera background model and frame counter. Lives as long as
/// the Detection worker that created it; a worker crash/restart drops it and
/// a fresh warmup begins.
pub struct MotionDetector {
    config: MotionConfig,
    model: Option<BackgroundModel>,
    frame_index: u32,
}

impl MotionDetector {
    #[must_use]
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            model: None,
            frame_index: 0,
        }
    }

    /// Run one frame through the detector. Always advances `frame_index` and
    /// always updates the background model, even when the gate suppresses
    /// output — the model must keep learning during warmup and saturation.
    pub fn detect(&mut self, image: &image::DynamicImage) -> Vec<BoundingBox> {
        let gray = image::imageops::grayscale(image);
        let frame_index = self.frame_index;
        self.frame_index += 1;

        let model = self
            .model
            .get_or_insert_with(|| BackgroundModel::new(&gray, self.config.history));
        let fg_raw = model.observe(&gray);

        let total_pixels = (gray.width() * gray.height()).max(1) as f64;
        let binarized = binarize(&fg_raw, self.config.binarize_threshold);
        let opened = morphological_open(&binarized, self.config.kernel_size);

        let nonzero = opened.pixels().filter(|p| p.0[0] > 0).count();
        let fg_ratio = nonzero as f64 / total_pixels;

        if frame_index < self.config.warmup_frames
            || fg_ratio as f32 > self.config.max_foreground_ratio
        {
            debug!(
                frame_index,
                fg_ratio, "motion gate suppressed output (warmup or saturation)"
            );
            return Vec::new();
        }

        let (boxes, total_area) = contour_boxes(&opened, self.config.min_area);
        if total_area >= self.config.area_threshold && !boxes.is_empty() {
            boxes
        } else {
            Vec::new()
        }
    }
}

fn binarize(fg: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = GrayImage::new(fg.width(), fg.height());
    for (x, y, pixel) in fg.enumerate_pixels() {
        let value = if pixel.0[0] > threshold { 255 } else { 0 };
        out.put_pixel(x, y, Luma([value]));
    }
    out
}

/// Morphological opening: erode then dilate with a square structuring
/// element of side `kernel_size`, approximated by Chebyshev (L-infinity)
/// distance `kernel_size / 2`.
fn morphological_open(mask: &GrayImage, kernel_size: u8) -> GrayImage {
    let k = (kernel_size / 2).max(1);
    let eroded = erode(mask, Norm::LInf, k);
    dilate(&eroded, Norm::LInf, k)
}

/// Find external contours, discard any below `min_area`, and return the
/// surviving bounding boxes plus the accumulated kept area.
fn contour_boxes(mask: &GrayImage, min_area: i64) -> (Vec<BoundingBox>, i64) {
    let contours = imageproc::contours::find_contours::<i32>(mask);
    let mut boxes = Vec::new();
    let mut total_area = 0i64;

    for contour in contours {
        if contour.border_type != BorderType::Outer || contour.points.is_empty() {
            continue;
        }
        let area = polygon_area(&contour.points);
        if area < min_area {
            continue;
        }
        total_area += area;
        boxes.push(bounding_box(&contour.points));
    }

    (boxes, total_area)
}

fn polygon_area(points: &[imageproc::point::Point<i32>]) -> i64 {
    if points.len() < 3 {
        return 0;
    }
    let mut sum: i64 = 0;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        sum += i64::from(a.x) * i64::from(b.y) - i64::from(b.x) * i64::from(a.y);
    }
    (sum / 2).abs()
}

fn bounding_box(points: &[imageproc::point::Point<i32>]) -> BoundingBox {
    let min_x = points.iter().map(|p| p.x).min().unwrap_or(0);
    let min_y = points.iter().map(|p| p.y).min().unwrap_or(0);
    let max_x = points.iter().map(|p| p.x).max().unwrap_or(0);
    let max_y = points.iter().map(|p| p.y).max().unwrap_or(0);
    BoundingBox::new(min_x, min_y, (max_x - min_x).max(1), (max_y - min_y).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, RgbImage};

    fn solid_frame(width: u32, height: u32, value: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([value; 3])))
    }

    fn frame_with_square(width: u32, height: u32, base: u8, square: u8) -> DynamicImage {
        let mut img = RgbImage::from_pixel(width, height, image::Rgb([base; 3]));
        for y in 10..40 {
            for x in 10..40 {
                img.put_pixel(x, y, image::Rgb([square; 3]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_warmup_suppresses_output() {
        let config = MotionConfig {
            warmup_frames: 3,
            ..Default::default()
        };
        let mut detector = MotionDetector::new(config);
        let frame = solid_frame(64, 64, 100);
        for _ in 0..3 {
            assert!(detector.detect(&frame).is_empty());
        }
    }

    #[test]
    fn test_warmup_zero_still_empty_on_first_frame() {
        // Boundary: warmup_frames = 0 still yields empty on frame 0 because
        // the background model is only established from that same frame, so
        // the foreground response against it is uniformly zero.
        let config = MotionConfig {
            warmup_frames: 0,
            min_area: 10,
            area_threshold: 10,
            ..Default::default()
        };
        let mut detector = MotionDetector::new(config);
        let frame = solid_frame(64, 64, 100);
        assert!(detector.detect(&frame).is_empty());
    }

    #[test]
    fn test_saturation_guard_strict_greater_than() {
        let config = MotionConfig {
            warmup_frames: 0,
            max_foreground_ratio: 0.1,
            binarize_threshold: 10,
            ..Default::default()
        };
        let mut detector = MotionDetector::new(config);
        // First frame establishes the background.
        let base = solid_frame(32, 32, 50);
        detector.detect(&base);
        // Second frame is wildly different everywhere: fg_ratio should be ~1.0 > 0.1.
        let bright = solid_frame(32, 32, 250);
        assert!(detector.detect(&bright).is_empty());
    }

    #[test]
    fn test_frame_index_always_advances() {
        let config = MotionConfig {
            warmup_frames: 100,
            ..Default::default()
        };
        let mut detector = MotionDetector::new(config);
        let frame = solid_frame(16, 16, 10);
        for _ in 0..5 {
            detector.detect(&frame);
        }
        assert_eq!(detector.frame_index, 5);
    }

    #[test]
    fn test_moving_object_detected_after_warmup() {
        let config = MotionConfig {
            warmup_frames: 1,
            min_area: 100,
            area_threshold: 100,
            binarize_threshold: 30,
            kernel_size: 3,
            ..Default::default()
        };
        let mut detector = MotionDetector::new(config);
        let still = solid_frame(64, 64, 20);
        detector.detect(&still); // frame 0: establishes background, warmup
        let moved = frame_with_square(64, 64, 20, 220);
        let boxes = detector.detect(&moved);
        assert!(!boxes.is_empty(), "expected motion boxes for moving square");
    }

    #[test]
    fn test_polygon_area_and_bbox() {
        let pts = vec![
            imageproc::point::Point::new(0, 0),
            imageproc::point::Point::new(10, 0),
            imageproc::point::Point::new(10, 10),
            imageproc::point::Point::new(0, 10),
        ];
        assert_eq!(polygon_area(&pts), 100);
        let bbox = bounding_box(&pts);
        assert_eq!(bbox.width, 10);
        assert_eq!(bbox.height, 10);
    }
}
