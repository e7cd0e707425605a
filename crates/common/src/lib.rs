/// Common types and utilities shared across the camera pipeline
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported camera source: {0}")]
    UnsupportedSource(String),

    #[error("decode failure: {0}")]
    DecodeFailure(String),

    #[error("classifier failure: {0}")]
    ClassifierFailure(String),

    #[error("media store error: {0}")]
    MediaStore(String),

    #[error("event store error: {0}")]
    EventStore(String),

    #[error("notification delivery failure: {0}")]
    Delivery(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Bounding box in integer pixel coordinates, clipped to the image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl BoundingBox {
    #[must_use]
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[must_use]
    #[inline]
    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }

    /// Clip this box so it fits entirely within a `width x height` image.
    #[must_use]
    pub fn clip(&self, image_width: i32, image_height: i32) -> Self {
        let x1 = self.x.clamp(0, image_width);
        let y1 = self.y.clamp(0, image_height);
        let x2 = (self.x + self.width).clamp(0, image_width);
        let y2 = (self.y + self.height).clamp(0, image_height);
        Self::new(x1, y1, (x2 - x1).max(0), (y2 - y1).max(0))
    }

    /// Area of the intersection with another box.
    #[must_use]
    pub fn intersection_area(&self, other: &BoundingBox) -> i64 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let w = (x2 - x1).max(0);
        let h = (y2 - y1).max(0);
        i64::from(w) * i64::from(h)
    }
}

/// A frame pulled from a camera source, not yet analyzed.
#[derive(Debug, Clone)]
pub struct FrameJob {
    pub frame_id: Uuid,
    pub camera: String,
    pub captured_at: DateTime<Utc>,
    pub image_bytes: Arc<[u8]>,
}

/// A single classifier detection surviving the motion-overlap filter.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub crop_bytes: Arc<[u8]>,
}

/// Bundle of person detections for one frame, emitted only when non-empty.
#[derive(Debug, Clone)]
pub struct PersonDetections {
    pub frame_id: Uuid,
    pub camera: String,
    pub captured_at: DateTime<Utc>,
    pub frame_bytes: Arc<[u8]>,
    pub items: Vec<Detection>,
}

/// Bundle of vehicle detections for one frame, emitted only when non-empty.
#[derive(Debug, Clone)]
pub struct VehicleDetections {
    pub frame_id: Uuid,
    pub camera: String,
    pub captured_at: DateTime<Utc>,
    pub frame_bytes: Arc<[u8]>,
    pub items: Vec<Detection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Person,
    Vehicle,
}

/// A pending notification, queued in memory until the owning transaction commits.
#[derive(Debug, Clone)]
pub struct NotificationJob {
    pub event_type: EventType,
    pub camera: String,
    pub occurred_at: DateTime<Utc>,
    pub crop_path: String,
    pub event_id: Uuid,
}

/// Envelope carried on every bounded channel: either a real item, or the
/// cooperative shutdown sentinel. A worker that receives a `PoisonPill`
/// forwards one per output queue and terminates.
#[derive(Debug, Clone)]
pub enum QueueMessage<T> {
    Item(T),
    PoisonPill,
}

/// One configured camera source.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub name: String,
    pub source: String,
    pub poll_interval_seconds: f64,
}

/// Classify a camera source string for dispatch between stream mode and
/// directory/file mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Stream,
    Directory,
}

impl CameraConfig {
    #[must_use]
    pub fn source_kind(&self) -> SourceKind {
        let lower = self.source.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("http://") || lower.starts_with("https://")
        {
            SourceKind::Stream
        } else {
            SourceKind::Directory
        }
    }
}

/// Parse `CAMERA_SOURCES`-style input: comma-separated `name=uri` pairs, or a
/// bare `uri` (name then defaults to the uri itself).
#[must_use]
pub fn parse_camera_sources(raw: &str, default_poll_interval: f64) -> Vec<CameraConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, uri)) => CameraConfig {
                name: name.to_string(),
                source: uri.to_string(),
                poll_interval_seconds: default_poll_interval,
            },
            None => CameraConfig {
                name: entry.to_string(),
                source: entry.to_string(),
                poll_interval_seconds: default_poll_interval,
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camera_sources_named() {
        let cams = parse_camera_sources("front=rtsp://cam1/stream,back=/data/back", 1.0);
        assert_eq!(cams.len(), 2);
        assert_eq!(cams[0].name, "front");
        assert_eq!(cams[0].source, "rtsp://cam1/stream");
        assert_eq!(cams[1].name, "back");
    }

    #[test]
    fn test_parse_camera_sources_bare() {
        let cams = parse_camera_sources("/data/driveway", 2.0);
        assert_eq!(cams.len(), 1);
        assert_eq!(cams[0].name, "/data/driveway");
        assert_eq!(cams[0].source, "/data/driveway");
        assert_eq!(cams[0].poll_interval_seconds, 2.0);
    }

    #[test]
    fn test_parse_camera_sources_empty() {
        assert!(parse_camera_sources("", 1.0).is_empty());
    }

    #[test]
    fn test_source_kind_classification() {
        let stream = CameraConfig {
            name: "a".into(),
            source: "rtsp://x/y".into(),
            poll_interval_seconds: 1.0,
        };
        assert_eq!(stream.source_kind(), SourceKind::Stream);

        let http = CameraConfig {
            name: "b".into(),
            source: "HTTP://x/y.mjpg".into(),
            poll_interval_seconds: 1.0,
        };
        assert_eq!(http.source_kind(), SourceKind::Stream);

        let dir = CameraConfig {
            name: "c".into(),
            source: "/data/cam3".into(),
            poll_interval_seconds: 1.0,
        };
        assert_eq!(dir.source_kind(), SourceKind::Directory);
    }

    #[test]
    fn test_bbox_clip() {
        let bbox = BoundingBox::new(-10, -5, 50, 50);
        let clipped = bbox.clip(30, 30);
        assert_eq!(clipped.x, 0);
        assert_eq!(clipped.y, 0);
        assert_eq!(clipped.width, 30);
        assert_eq!(clipped.height, 30);
    }

    #[test]
    fn test_bbox_intersection_area() {
        let a = BoundingBox::new(0, 0, 10, 10);
        let b = BoundingBox::new(5, 5, 10, 10);
        assert_eq!(a.intersection_area(&b), 25);

        let c = BoundingBox::new(20, 20, 5, 5);
        assert_eq!(a.intersection_area(&c), 0);
    }
}
