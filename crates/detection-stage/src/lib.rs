//! Detection stage: decode -> motion gate -> classify -> motion-overlap
//! filter -> fan out to the person/vehicle queues.
//!
//! One worker instance owns every camera's [`camwatch_motion::MotionDetector`]
//! state (a motion detector is stateful per camera, so it cannot be shared
//! across worker restarts) and the single `ObjectClassifier` ONNX session.
//! A camera seen for the first time always runs the classifier once — motion
//! boxes are necessarily empty on that frame, so the overlap filter drops
//! every result, but the classifier still pays its warmup cost up front
//! rather than on whatever frame happens to first show motion.

use camwatch_common::{
    BoundingBox, Detection, FrameJob, PersonDetections, PipelineError, QueueMessage, Result,
    VehicleDetections,
};
use camwatch_motion::{MotionConfig, MotionDetector};
use camwatch_object_detection::{ClassifiedDetections, ObjectClassifier};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fraction of a classifier detection's area that must overlap a motion box
/// for the detection to survive.
const MOTION_OVERLAP_THRESHOLD: f64 = 0.2;

/// Minimum gap between repeated back-pressure warnings, so a sustained
/// episode logs once per interval instead of once per frame.
const BACKPRESSURE_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout for a single blocking put onto `personQ`/`vehicleQ`; on timeout
/// the put is retried until `stop` is observed.
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// `frameQ` is considered under back-pressure once it is at least this full.
const BACKPRESSURE_FRACTION: f64 = 0.7;

struct CameraState {
    detector: MotionDetector,
    seen_first_frame: bool,
}

/// Runs the Detection stage until `stop` is cancelled or the frame queue
/// closes. Sends one `PoisonPill` to each output queue on the way out.
pub async fn run(
    frame_rx: &mut Receiver<QueueMessage<FrameJob>>,
    person_tx: Sender<QueueMessage<PersonDetections>>,
    vehicle_tx: Sender<QueueMessage<VehicleDetections>>,
    mut classifier: ObjectClassifier,
    motion_config: MotionConfig,
    stop: CancellationToken,
) -> Result<()> {
    let mut cameras: HashMap<String, CameraState> = HashMap::new();
    let mut last_backpressure_warning: Option<Instant> = None;
    let frame_queue_capacity = frame_rx.max_capacity();

    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => break,
            message = frame_rx.recv() => message,
        };

        match message {
            Some(QueueMessage::Item(frame)) => {
                let camera = frame.camera.clone();
                warn_on_backpressure(
                    &camera,
                    frame_rx.len(),
                    frame_queue_capacity,
                    &mut last_backpressure_warning,
                );
                if let Err(err) = process_frame(
                    frame,
                    &mut cameras,
                    &mut classifier,
                    &motion_config,
                    &person_tx,
                    &vehicle_tx,
                    &stop,
                )
                .await
                {
                    warn!(camera = %camera, error = %err, "detection stage dropped a frame");
                }
            }
            Some(QueueMessage::PoisonPill) | None => break,
        }
    }

    let _ = person_tx.send(QueueMessage::PoisonPill).await;
    let _ = vehicle_tx.send(QueueMessage::PoisonPill).await;
    Ok(())
}

/// At most once every [`BACKPRESSURE_LOG_INTERVAL`], warn if `frameQ` is at
/// or above [`BACKPRESSURE_FRACTION`] of its capacity, naming `camera` — the
/// camera whose job triggered this check.
fn warn_on_backpressure(camera: &str, len: usize, capacity: usize, last_warning: &mut Option<Instant>) {
    if capacity == 0 || (len as f64) < BACKPRESSURE_FRACTION * capacity as f64 {
        return;
    }
    let now = Instant::now();
    let should_log = last_warning.map_or(true, |t| now.duration_since(t) >= BACKPRESSURE_LOG_INTERVAL);
    if should_log {
        warn!(camera = %camera, len, capacity, "frame queue under sustained back-pressure");
        *last_warning = Some(now);
    }
}

async fn process_frame(
    frame: FrameJob,
    cameras: &mut HashMap<String, CameraState>,
    classifier: &mut ObjectClassifier,
    motion_config: &MotionConfig,
    person_tx: &Sender<QueueMessage<PersonDetections>>,
    vehicle_tx: &Sender<QueueMessage<VehicleDetections>>,
    stop: &CancellationToken,
) -> Result<()> {
    let image = image::load_from_memory(&frame.image_bytes)
        .map_err(|e| PipelineError::DecodeFailure(e.to_string()))?;

    let state = cameras.entry(frame.camera.clone()).or_insert_with(|| CameraState {
        detector: MotionDetector::new(motion_config.clone()),
        seen_first_frame: false,
    });

    let is_first_frame = !state.seen_first_frame;
    state.seen_first_frame = true;

    // First-frame rule: a newly-seen camera has no usable background yet, so
    // motion detection does not run on this frame at all (not just "returns
    // empty") — the detector's first `detect()` call, which seeds the
    // background model and advances `frame_index`, is deferred to the next
    // frame from this camera.
    let motion_boxes = if is_first_frame {
        Vec::new()
    } else {
        let boxes = state.detector.detect(&image);
        if boxes.is_empty() {
            debug!(camera = %frame.camera, "no motion, skipping classifier");
            return Ok(());
        }
        boxes
    };

    let rgb = image.to_rgb8();
    let classified: ClassifiedDetections = classifier
        .predict(&rgb)
        .map_err(|e| PipelineError::ClassifierFailure(e.to_string()))?;

    let persons = filter_by_motion_overlap(classified.persons, &motion_boxes);
    let vehicles = filter_by_motion_overlap(classified.vehicles, &motion_boxes);

    if !persons.is_empty() {
        let bundle = PersonDetections {
            frame_id: frame.frame_id,
            camera: frame.camera.clone(),
            captured_at: frame.captured_at,
            frame_bytes: frame.image_bytes.clone(),
            items: persons,
        };
        enqueue(person_tx, bundle, stop).await;
    }

    if !vehicles.is_empty() {
        let bundle = VehicleDetections {
            frame_id: frame.frame_id,
            camera: frame.camera.clone(),
            captured_at: frame.captured_at,
            frame_bytes: frame.image_bytes,
            items: vehicles,
        };
        enqueue(vehicle_tx, bundle, stop).await;
    }

    Ok(())
}

/// Keep a classifier detection iff at least one motion box overlaps it by
/// at least [`MOTION_OVERLAP_THRESHOLD`] of the detection's own area. An
/// empty `motion_boxes` slice (the first-frame case) drops everything,
/// since `any()` over an empty iterator is `false`.
fn filter_by_motion_overlap(detections: Vec<Detection>, motion_boxes: &[BoundingBox]) -> Vec<Detection> {
    detections
        .into_iter()
        .filter(|detection| {
            let area = detection.bbox.area();
            area > 0
                && motion_boxes.iter().any(|motion_box| {
                    let overlap = detection.bbox.intersection_area(motion_box);
                    overlap as f64 >= MOTION_OVERLAP_THRESHOLD * area as f64
                })
        })
        .collect()
}

/// Blocking put with a 500 ms timeout, retried until `stop` is cancelled.
/// Reserves a slot before handing over `item` so a timed-out attempt never
/// consumes it.
async fn enqueue<T>(tx: &Sender<QueueMessage<T>>, item: T, stop: &CancellationToken) {
    loop {
        if stop.is_cancelled() {
            return;
        }
        match tokio::time::timeout(ENQUEUE_TIMEOUT, tx.reserve()).await {
            Ok(Ok(permit)) => {
                permit.send(QueueMessage::Item(item));
                return;
            }
            Ok(Err(_)) => return,
            Err(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camwatch_common::BoundingBox;
    use std::sync::Arc;

    fn detection(x: i32, y: i32, w: i32, h: i32) -> Detection {
        Detection {
            bbox: BoundingBox::new(x, y, w, h),
            score: 0.9,
            crop_bytes: Arc::from(Vec::new().into_boxed_slice()),
        }
    }

    #[test]
    fn test_empty_motion_boxes_drops_everything() {
        let detections = vec![detection(0, 0, 10, 10)];
        let kept = filter_by_motion_overlap(detections, &[]);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_overlap_at_exact_threshold_survives() {
        // Detection area 100, motion box intersection exactly 20 (0.2 * 100).
        let det = detection(0, 0, 10, 10);
        let motion = BoundingBox::new(0, 0, 10, 2);
        let kept = filter_by_motion_overlap(vec![det], &[motion]);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_overlap_below_threshold_is_dropped() {
        let det = detection(0, 0, 10, 10);
        let motion = BoundingBox::new(0, 0, 10, 1);
        let kept = filter_by_motion_overlap(vec![det], &[motion]);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_disjoint_boxes_dropped() {
        let det = detection(0, 0, 10, 10);
        let motion = BoundingBox::new(100, 100, 10, 10);
        let kept = filter_by_motion_overlap(vec![det], &[motion]);
        assert!(kept.is_empty());
    }
}
