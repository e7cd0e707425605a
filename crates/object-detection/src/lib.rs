//! Object classification using `YOLOv8` via ONNX Runtime.
//!
//! This crate wraps a single ONNX session behind a stateless
//! `predict(image) -> {persons, vehicles}` contract: it runs inference once
//! per frame and splits the surviving detections into the two COCO-class
//! groups the pipeline cares about. It does not gate on motion overlap and
//! does not know about cameras, queues, or storage — those concerns live in
//! the detection-stage crate that calls this one.
//!
//! # Example
//! ```no_run
//! use camwatch_object_detection::{ObjectClassifier, ObjectClassifierConfig};
//! use image::open;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ObjectClassifierConfig::default();
//! let mut classifier = ObjectClassifier::new("yolov8n.onnx", config)?;
//!
//! let img = open("frame.jpg")?.to_rgb8();
//! let result = classifier.predict(&img)?;
//! println!("{} persons, {} vehicles", result.persons.len(), result.vehicles.len());
//! # Ok(())
//! # }
//! ```

use camwatch_common::{BoundingBox, Detection};
use image::RgbImage;
use ndarray::Array;
use ort::{
    session::{Session, SessionOutputs},
    value::TensorRef,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// COCO class id for `person`.
pub const PERSON_CLASS_ID: u8 = 0;

/// COCO class ids that count as a vehicle: bicycle, car, motorcycle, bus,
/// train, truck. Class 4 (`airplane`) is a COCO vehicle-adjacent class but
/// is intentionally excluded — it is not a camera-relevant vehicle sighting.
pub const VEHICLE_CLASS_IDS: [u8; 6] = [1, 2, 3, 5, 6, 7];

fn is_vehicle_class(class_id: u8) -> bool {
    VEHICLE_CLASS_IDS.contains(&class_id)
}

/// Configuration for the YOLOv8 object classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectClassifierConfig {
    /// Minimum confidence for a person detection to survive.
    pub min_person_confidence: f32,
    /// Minimum confidence for a vehicle detection to survive. Kept stricter
    /// than the person gate: a falsely-flagged car triggers a heavier alert
    /// than a falsely-flagged person, so it needs more evidence.
    pub min_vehicle_confidence: f32,
    /// `IoU` threshold for non-maximum suppression (0.0-1.0).
    pub iou_threshold: f32,
    /// Maximum number of detections to return per image, after NMS.
    pub max_detections: usize,
    /// Input image size (`YOLOv8` default is 640x640).
    pub input_size: u32,
    /// JPEG quality (1-100) used to encode detection crops.
    pub jpeg_quality: u8,
}

impl Default for ObjectClassifierConfig {
    /// Reads `YOLO_CONF_THRESHOLD` / `YOLO_IOU_THRESHOLD` / `YOLO_VEHICLE_CONF`
    /// overrides from the environment, falling back to tuned defaults.
    fn default() -> Self {
        fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        Self {
            min_person_confidence: env_or("YOLO_CONF_THRESHOLD", 0.4),
            min_vehicle_confidence: env_or("YOLO_VEHICLE_CONF", 0.6),
            iou_threshold: env_or("YOLO_IOU_THRESHOLD", 0.45),
            max_detections: 100,
            input_size: 640,
            jpeg_quality: 85,
        }
    }
}

/// Detections split into the two groups the pipeline persists separately.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedDetections {
    pub persons: Vec<Detection>,
    pub vehicles: Vec<Detection>,
}

impl ClassifiedDetections {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.persons.is_empty() && self.vehicles.is_empty()
    }
}

/// A raw detection in the model's normalized (0-1) coordinate space, used
/// only internally for NMS before conversion to pixel-space.
#[derive(Debug, Clone, Copy)]
struct RawBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

impl RawBox {
    fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    fn iou(&self, other: &RawBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
struct RawDetection {
    class_id: u8,
    confidence: f32,
    bbox: RawBox,
}

/// Object classifier wrapping a single `YOLOv8` ONNX session.
pub struct ObjectClassifier {
    session: Session,
    config: ObjectClassifierConfig,
}

impl ObjectClassifier {
    /// Load the ONNX model from disk and build a classifier around it.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        config: ObjectClassifierConfig,
    ) -> Result<Self, ObjectDetectionError> {
        info!("loading YOLOv8 model from {:?}", model_path.as_ref());

        let session = Session::builder()
            .map_err(|e| ObjectDetectionError::ModelLoad(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| ObjectDetectionError::ModelLoad(e.to_string()))?;

        Ok(Self { session, config })
    }

    /// Run inference on one frame and split surviving detections into
    /// persons and vehicles. Bounding boxes are clipped to the image and
    /// crops are JPEG-encoded.
    pub fn predict(&mut self, image: &RgbImage) -> Result<ClassifiedDetections, ObjectDetectionError> {
        debug!(
            width = image.width(),
            height = image.height(),
            "running classifier inference"
        );

        let input_array = Self::preprocess(image, self.config.input_size)?;
        let outputs = Self::run_inference(&mut self.session, &input_array)?;
        let raw = Self::postprocess(outputs, &self.config)?;

        let mut persons = Vec::new();
        let mut vehicles = Vec::new();

        for det in raw {
            let bbox = BoundingBox::new(
                (det.bbox.x * image.width() as f32).round() as i32,
                (det.bbox.y * image.height() as f32).round() as i32,
                (det.bbox.width * image.width() as f32).round() as i32,
                (det.bbox.height * image.height() as f32).round() as i32,
            )
            .clip(image.width() as i32, image.height() as i32);

            let crop_bytes = match Self::encode_crop(image, &bbox, self.config.jpeg_quality) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!(error = %err, "skipping detection: failed to encode crop");
                    continue;
                }
            };
            let detection = Detection {
                bbox,
                score: det.confidence,
                crop_bytes: Arc::from(crop_bytes),
            };
            if det.class_id == PERSON_CLASS_ID {
                persons.push(detection);
            } else if is_vehicle_class(det.class_id) {
                vehicles.push(detection);
            }
        }

        info!(
            persons = persons.len(),
            vehicles = vehicles.len(),
            "classifier produced detections"
        );

        Ok(ClassifiedDetections { persons, vehicles })
    }

    fn preprocess(
        image: &RgbImage,
        input_size: u32,
    ) -> Result<Array<f32, ndarray::Dim<[usize; 4]>>, ObjectDetectionError> {
        let resized = image::imageops::resize(
            image,
            input_size,
            input_size,
            image::imageops::FilterType::Triangle,
        );

        let mut input_array = Array::zeros((1, 3, input_size as usize, input_size as usize));
        for y in 0..input_size as usize {
            for x in 0..input_size as usize {
                let pixel = resized.get_pixel(x as u32, y as u32);
                input_array[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
                input_array[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
                input_array[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
            }
        }
        Ok(input_array)
    }

    fn run_inference<'a>(
        session: &'a mut Session,
        input: &Array<f32, ndarray::Dim<[usize; 4]>>,
    ) -> Result<SessionOutputs<'a>, ObjectDetectionError> {
        let input_tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| ObjectDetectionError::Inference(e.to_string()))?;

        session
            .run(ort::inputs![input_tensor])
            .map_err(|e| ObjectDetectionError::Inference(e.to_string()))
    }

    /// Postprocess the raw (1, 84, 8400) YOLOv8 tensor into pixel-space
    /// detections, applying per-class-group confidence gates and NMS.
    fn postprocess(
        outputs: SessionOutputs,
        config: &ObjectClassifierConfig,
    ) -> Result<Vec<RawDetection>, ObjectDetectionError> {
        let output = &outputs[0];
        let (shape, data) = output.try_extract_tensor::<f32>().map_err(|e| {
            ObjectDetectionError::Inference(format!("failed to extract tensor: {e}"))
        })?;

        let dims = shape.as_ref();
        if dims.len() != 3 {
            return Err(ObjectDetectionError::Inference(format!(
                "expected 3D output tensor, got {}D",
                dims.len()
            )));
        }
        let num_anchors = dims[2] as usize;
        let input_size = config.input_size as f32;

        let mut raw_detections = Vec::with_capacity(num_anchors / 10);

        for anchor_idx in 0..num_anchors {
            let get_feature = |feature_idx: usize| data[feature_idx * num_anchors + anchor_idx];

            let x_center = get_feature(0);
            let y_center = get_feature(1);
            let width = get_feature(2);
            let height = get_feature(3);

            let mut max_prob = 0.0f32;
            let mut max_class_id = 0usize;
            for class_id in 0..80usize {
                let prob = get_feature(4 + class_id);
                if prob > max_prob {
                    max_prob = prob;
                    max_class_id = class_id;
                }
            }
            let class_id = max_class_id as u8;
            let confidence = max_prob;

            let is_person = class_id == PERSON_CLASS_ID;
            let is_vehicle = is_vehicle_class(class_id);
            if !is_person && !is_vehicle {
                continue;
            }
            let min_confidence = if is_vehicle {
                config.min_vehicle_confidence
            } else {
                config.min_person_confidence
            };
            if confidence < min_confidence {
                continue;
            }

            let x = (x_center - width / 2.0) / input_size;
            let y = (y_center - height / 2.0) / input_size;
            let w = width / input_size;
            let h = height / input_size;

            raw_detections.push(RawDetection {
                class_id,
                confidence,
                bbox: RawBox {
                    x,
                    y,
                    width: w,
                    height: h,
                },
            });
        }

        let kept = Self::apply_nms(raw_detections, config.iou_threshold);
        Ok(kept.into_iter().take(config.max_detections).collect())
    }

    fn apply_nms(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
        detections.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut keep = Vec::with_capacity(detections.len());
        while !detections.is_empty() {
            let current = detections.swap_remove(0);
            detections.retain(|det| {
                det.class_id != current.class_id || det.bbox.iou(&current.bbox) < iou_threshold
            });
            keep.push(current);
        }
        keep
    }

    fn encode_crop(
        image: &RgbImage,
        bbox: &BoundingBox,
        quality: u8,
    ) -> Result<Vec<u8>, ObjectDetectionError> {
        if bbox.width <= 0 || bbox.height <= 0 {
            return Err(ObjectDetectionError::ImageProcessing(
                "empty bounding box after clipping".into(),
            ));
        }
        let cropped = image::imageops::crop_imm(
            image,
            bbox.x as u32,
            bbox.y as u32,
            bbox.width as u32,
            bbox.height as u32,
        )
        .to_image();

        let mut buf = Vec::new();
        let mut encoder =
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
        encoder
            .encode_image(&cropped)
            .map_err(|e| ObjectDetectionError::ImageProcessing(e.to_string()))?;
        Ok(buf)
    }
}

#[derive(Debug, Error)]
pub enum ObjectDetectionError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("image processing error: {0}")]
    ImageProcessing(String),

    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(#[from] ort::Error),
}

impl From<ObjectDetectionError> for camwatch_common::PipelineError {
    fn from(err: ObjectDetectionError) -> Self {
        camwatch_common::PipelineError::ClassifierFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ObjectClassifierConfig::default();
        assert_eq!(config.min_person_confidence, 0.4);
        assert_eq!(config.min_vehicle_confidence, 0.6);
        assert!(config.min_vehicle_confidence > config.min_person_confidence);
    }

    #[test]
    fn test_person_class_id() {
        assert_eq!(PERSON_CLASS_ID, 0);
        assert!(!is_vehicle_class(PERSON_CLASS_ID));
    }

    #[test]
    fn test_vehicle_class_ids_exclude_reserved_four() {
        assert!(!VEHICLE_CLASS_IDS.contains(&4));
        for id in VEHICLE_CLASS_IDS {
            assert!(is_vehicle_class(id));
        }
    }

    #[test]
    fn test_raw_box_iou() {
        let a = RawBox {
            x: 0.0,
            y: 0.0,
            width: 0.5,
            height: 0.5,
        };
        let b = RawBox {
            x: 0.25,
            y: 0.25,
            width: 0.5,
            height: 0.5,
        };
        let iou = a.iou(&b);
        assert!(iou > 0.0 && iou < 1.0);

        let identical = a.iou(&a);
        assert!((identical - 1.0).abs() < 0.001);

        let disjoint = RawBox {
            x: 0.9,
            y: 0.9,
            width: 0.05,
            height: 0.05,
        };
        assert_eq!(a.iou(&disjoint), 0.0);
    }

    #[test]
    fn test_nms_keeps_highest_confidence_per_class() {
        let detections = vec![
            RawDetection {
                class_id: 0,
                confidence: 0.9,
                bbox: RawBox {
                    x: 0.1,
                    y: 0.1,
                    width: 0.2,
                    height: 0.2,
                },
            },
            RawDetection {
                class_id: 0,
                confidence: 0.5,
                bbox: RawBox {
                    x: 0.11,
                    y: 0.11,
                    width: 0.2,
                    height: 0.2,
                },
            },
        ];
        let kept = ObjectClassifier::apply_nms(detections, 0.3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.9);
    }
}
