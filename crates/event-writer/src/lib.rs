//! Event Writer stage: one worker per event type (Person, Vehicle), both
//! structurally identical — consume a detection bundle, write its frame and
//! crop JPEGs to the media store, persist the bundle transactionally, then
//! enqueue a notification per committed event.
//!
//! The frame asset is written under a tag-qualified deterministic path
//! (`_person`/`_vehicle`) so the same camera frame surviving both the person
//! and vehicle filters is written twice under different paths — no
//! cross-writer coordination is needed, and each writer's own
//! [`camwatch_storage::EventStore::write_bundle`] call deduplicates against
//! concurrent writes of its own tag via the media asset's `ON CONFLICT`
//! upsert.

use camwatch_common::{
    Detection, EventType, NotificationJob, PersonDetections, QueueMessage, Result,
    VehicleDetections,
};
use camwatch_storage::{EventStore, MediaStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Common shape shared by `PersonDetections` and `VehicleDetections`, so the
/// write/notify control flow is implemented exactly once.
trait Bundle {
    fn frame_id(&self) -> Uuid;
    fn camera(&self) -> &str;
    fn captured_at(&self) -> DateTime<Utc>;
    fn frame_bytes(&self) -> &Arc<[u8]>;
    fn items(&self) -> &[Detection];
}

impl Bundle for PersonDetections {
    fn frame_id(&self) -> Uuid {
        self.frame_id
    }
    fn camera(&self) -> &str {
        &self.camera
    }
    fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
    fn frame_bytes(&self) -> &Arc<[u8]> {
        &self.frame_bytes
    }
    fn items(&self) -> &[Detection] {
        &self.items
    }
}

impl Bundle for VehicleDetections {
    fn frame_id(&self) -> Uuid {
        self.frame_id
    }
    fn camera(&self) -> &str {
        &self.camera
    }
    fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
    fn frame_bytes(&self) -> &Arc<[u8]> {
        &self.frame_bytes
    }
    fn items(&self) -> &[Detection] {
        &self.items
    }
}

fn tag_for(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Person => "person",
        EventType::Vehicle => "vehicle",
    }
}

/// Run the Person Event Writer until `stop` is cancelled or its input queue
/// closes. Sends one `PoisonPill` to `notif_tx` on the way out.
pub async fn run_person_writer(
    rx: &mut Receiver<QueueMessage<PersonDetections>>,
    media: Arc<dyn MediaStore>,
    store: Arc<dyn EventStore>,
    notif_tx: Sender<QueueMessage<NotificationJob>>,
    stop: CancellationToken,
) -> Result<()> {
    run_writer(EventType::Person, rx, media, store, notif_tx, stop).await
}

/// Run the Vehicle Event Writer until `stop` is cancelled or its input queue
/// closes. Sends one `PoisonPill` to `notif_tx` on the way out.
pub async fn run_vehicle_writer(
    rx: &mut Receiver<QueueMessage<VehicleDetections>>,
    media: Arc<dyn MediaStore>,
    store: Arc<dyn EventStore>,
    notif_tx: Sender<QueueMessage<NotificationJob>>,
    stop: CancellationToken,
) -> Result<()> {
    run_writer(EventType::Vehicle, rx, media, store, notif_tx, stop).await
}

async fn run_writer<B: Bundle>(
    event_type: EventType,
    rx: &mut Receiver<QueueMessage<B>>,
    media: Arc<dyn MediaStore>,
    store: Arc<dyn EventStore>,
    notif_tx: Sender<QueueMessage<NotificationJob>>,
    stop: CancellationToken,
) -> Result<()> {
    info!(event_type = tag_for(event_type), "event writer starting");

    loop {
        let message = tokio::select! {
            _ = stop.cancelled() => break,
            message = rx.recv() => message,
        };

        match message {
            Some(QueueMessage::Item(bundle)) => {
                if let Err(err) =
                    write_bundle(event_type, &bundle, &*media, &*store, &notif_tx).await
                {
                    warn!(error = %err, "event writer dropped a bundle");
                }
            }
            Some(QueueMessage::PoisonPill) | None => break,
        }
    }

    let _ = notif_tx.send(QueueMessage::PoisonPill).await;
    info!(event_type = tag_for(event_type), "event writer stopped");
    Ok(())
}

async fn write_bundle<B: Bundle>(
    event_type: EventType,
    bundle: &B,
    media: &dyn MediaStore,
    store: &dyn EventStore,
    notif_tx: &Sender<QueueMessage<NotificationJob>>,
) -> Result<()> {
    if bundle.items().is_empty() {
        return Ok(());
    }

    let tag = tag_for(event_type);
    let crop_media_type = match event_type {
        EventType::Person => "person_crop",
        EventType::Vehicle => "vehicle_crop",
    };
    let frame_path = media.frame_path(bundle.frame_id(), tag);
    media.write(&frame_path, bundle.frame_bytes()).await?;

    let mut items = Vec::with_capacity(bundle.items().len());
    for detection in bundle.items() {
        let crop_path = media.crop_path(crop_media_type, bundle.frame_id());
        media.write(&crop_path, &detection.crop_bytes).await?;
        items.push((detection.clone(), crop_path));
    }

    let result = store
        .write_bundle(
            event_type,
            bundle.camera(),
            bundle.frame_id(),
            bundle.captured_at(),
            &frame_path,
            &items,
        )
        .await?;

    for written in result.events {
        let job = NotificationJob {
            event_type,
            camera: bundle.camera().to_string(),
            occurred_at: bundle.captured_at(),
            crop_path: written.crop_path,
            event_id: written.event_id,
        };
        // Non-blocking: a full notification queue means drop, never block
        // the Event Writer stage waiting on the Notifier.
        if notif_tx.try_send(QueueMessage::Item(job)).is_err() {
            warn!("notification queue full, dropping notification");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camwatch_common::BoundingBox;

    fn sample_detection() -> Detection {
        Detection {
            bbox: BoundingBox::new(0, 0, 10, 10),
            score: 0.8,
            crop_bytes: Arc::from(vec![1, 2, 3].into_boxed_slice()),
        }
    }

    #[test]
    fn test_tag_for() {
        assert_eq!(tag_for(EventType::Person), "person");
        assert_eq!(tag_for(EventType::Vehicle), "vehicle");
    }

    #[test]
    fn test_bundle_trait_person() {
        let bundle = PersonDetections {
            frame_id: Uuid::nil(),
            camera: "cam1".to_string(),
            captured_at: Utc::now(),
            frame_bytes: Arc::from(vec![0u8].into_boxed_slice()),
            items: vec![sample_detection()],
        };
        assert_eq!(Bundle::camera(&bundle), "cam1");
        assert_eq!(Bundle::items(&bundle).len(), 1);
    }
}
