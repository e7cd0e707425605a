//! Supervisor: owns the four bounded queues, builds a `name -> factory()`
//! map of worker tasks, starts them, and keeps them running.
//!
//! Workers are plain `tokio` tasks. A worker's factory closure captures
//! nothing but cloned channel handles and freshly constructed clients (a
//! new `ObjectClassifier` session, a new `PostgresEventStore` connection),
//! so calling the factory again after a crash produces a worker with no
//! memory of the dead one — the in-process equivalent of the original
//! design's process-spawn isolation. Queue receivers are held behind
//! `Arc<Mutex<_>>` so a restarted worker resumes draining the same channel
//! instead of orphaning whatever the crashed worker hadn't yet consumed.

use camwatch_common::{
    CameraConfig, FrameJob, NotificationJob, PersonDetections, PipelineError, QueueMessage,
    Result, VehicleDetections,
};
use camwatch_motion::MotionConfig;
use camwatch_notification::{NotificationConfig, TelegramNotifier};
use camwatch_object_detection::{ObjectClassifier, ObjectClassifierConfig};
use camwatch_storage::{
    EventStore, FilesystemConfig, FilesystemMediaStore, MediaStore, PostgresConfig,
    PostgresEventStore,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Default bound shared by all four queues unless `QUEUE_SIZE` overrides it.
const DEFAULT_QUEUE_SIZE: usize = 512;

/// Monitor loop cadence: check every worker's `JoinHandle` once per tick.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Per-worker join timeout during graceful shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

type BoxFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Factory = Arc<dyn Fn() -> BoxFuture + Send + Sync>;

/// Top-level configuration the Supervisor builds once at boot and threads
/// into every worker factory.
#[derive(Clone)]
pub struct PipelineConfig {
    pub cameras: Vec<CameraConfig>,
    pub queue_size: usize,
    pub motion: MotionConfig,
    pub model_path: String,
    pub classifier: ObjectClassifierConfig,
    pub filesystem: FilesystemConfig,
    pub postgres: PostgresConfig,
    pub notification: NotificationConfig,
}

impl PipelineConfig {
    /// Build configuration from the process environment, matching the
    /// `CAMERA_SOURCES` / `QUEUE_SIZE` / `MOTION_*` / `YOLO_*` /
    /// `MEDIA_ROOT` / `NOTIFICATION_*` / `POSTGRES_*` variables.
    pub fn from_env() -> std::result::Result<Self, PipelineError> {
        let poll_interval = std::env::var("FRAME_POLL_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1.0);

        let cameras = std::env::var("CAMERA_SOURCES")
            .ok()
            .map(|raw| camwatch_common::parse_camera_sources(&raw, poll_interval))
            .unwrap_or_default();

        let queue_size = std::env::var("QUEUE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_QUEUE_SIZE);

        let motion = MotionConfig::default();
        motion
            .validate()
            .map_err(|e| PipelineError::Other(format!("invalid motion configuration: {e}")))?;

        let model_path = std::env::var("YOLO_MODEL_PATH")
            .map_err(|_| PipelineError::Other("YOLO_MODEL_PATH is required".to_string()))?;

        Ok(Self {
            cameras,
            queue_size,
            motion,
            model_path,
            classifier: ObjectClassifierConfig::default(),
            filesystem: FilesystemConfig::default(),
            postgres: PostgresConfig::default(),
            notification: NotificationConfig::default(),
        })
    }
}

/// A single queue's sender half, plus its receiver wrapped so a restarted
/// consumer can pick the channel back up where the last one left off.
struct Queue<T> {
    tx: mpsc::Sender<QueueMessage<T>>,
    rx: Arc<Mutex<mpsc::Receiver<QueueMessage<T>>>>,
}

impl<T: Send + 'static> Queue<T> {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Non-blocking poison-pill push, used by the Supervisor's own shutdown
    /// path (in addition to whatever a worker forwards on its way out).
    fn push_poison_pill(&self) {
        let _ = self.tx.try_send(QueueMessage::PoisonPill);
    }
}

/// Owns the four inter-stage queues, the stop token, and the `name ->
/// factory()` map. Starts every worker, restarts any that crash, and
/// coordinates graceful shutdown on `SIGINT`/`SIGTERM`.
pub struct Supervisor {
    config: PipelineConfig,
    stop: CancellationToken,
    frame_q: Queue<FrameJob>,
    person_q: Queue<PersonDetections>,
    vehicle_q: Queue<VehicleDetections>,
    notif_q: Queue<NotificationJob>,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let queue_size = config.queue_size;
        Self {
            config,
            stop: CancellationToken::new(),
            frame_q: Queue::new(queue_size),
            person_q: Queue::new(queue_size),
            vehicle_q: Queue::new(queue_size),
            notif_q: Queue::new(queue_size),
        }
    }

    /// A clone of the token every worker polls to learn shutdown has begun.
    #[must_use]
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Build the `name -> factory()` map for every configured worker: one
    /// Ingestion task per camera, plus Detection, the two Event Writers,
    /// and the Notifier.
    fn build_factories(&self) -> Result<HashMap<String, Factory>> {
        let mut factories: HashMap<String, Factory> = HashMap::new();

        for camera in &self.config.cameras {
            let camera = camera.clone();
            let frame_tx = self.frame_q.tx.clone();
            let stop = self.stop.clone();
            let name = format!("ingestion:{}", camera.name);
            factories.insert(
                name,
                Arc::new(move || -> BoxFuture {
                    let camera = camera.clone();
                    let frame_tx = frame_tx.clone();
                    let stop = stop.clone();
                    Box::pin(async move { camwatch_ingestion::run_camera(camera, frame_tx, stop).await })
                }),
            );
        }

        {
            let frame_rx = self.frame_q.rx.clone();
            let person_tx = self.person_q.tx.clone();
            let vehicle_tx = self.vehicle_q.tx.clone();
            let stop = self.stop.clone();
            let motion_config = self.config.motion.clone();
            let model_path = self.config.model_path.clone();
            let classifier_config = self.config.classifier.clone();
            factories.insert(
                "detection".to_string(),
                Arc::new(move || -> BoxFuture {
                    let frame_rx = frame_rx.clone();
                    let person_tx = person_tx.clone();
                    let vehicle_tx = vehicle_tx.clone();
                    let stop = stop.clone();
                    let motion_config = motion_config.clone();
                    let model_path = model_path.clone();
                    let classifier_config = classifier_config.clone();
                    Box::pin(async move {
                        let classifier = ObjectClassifier::new(&model_path, classifier_config)
                            .map_err(|e| PipelineError::ClassifierFailure(e.to_string()))?;
                        let mut rx = frame_rx.lock().await;
                        camwatch_detection_stage::run(
                            &mut rx,
                            person_tx,
                            vehicle_tx,
                            classifier,
                            motion_config,
                            stop,
                        )
                        .await
                    })
                }),
            );
        }

        {
            let person_rx = self.person_q.rx.clone();
            let notif_tx = self.notif_q.tx.clone();
            let stop = self.stop.clone();
            let filesystem = self.config.filesystem.clone();
            let postgres = self.config.postgres.clone();
            factories.insert(
                "person_writer".to_string(),
                Arc::new(move || -> BoxFuture {
                    let person_rx = person_rx.clone();
                    let notif_tx = notif_tx.clone();
                    let stop = stop.clone();
                    let filesystem = filesystem.clone();
                    let postgres = postgres.clone();
                    Box::pin(async move {
                        let media: Arc<dyn MediaStore> =
                            Arc::new(FilesystemMediaStore::new(filesystem)?);
                        let store: Arc<dyn EventStore> =
                            Arc::new(PostgresEventStore::new(postgres).await?);
                        store.init_schema().await?;
                        let mut rx = person_rx.lock().await;
                        camwatch_event_writer::run_person_writer(&mut rx, media, store, notif_tx, stop)
                            .await
                    })
                }),
            );
        }

        {
            let vehicle_rx = self.vehicle_q.rx.clone();
            let notif_tx = self.notif_q.tx.clone();
            let stop = self.stop.clone();
            let filesystem = self.config.filesystem.clone();
            let postgres = self.config.postgres.clone();
            factories.insert(
                "vehicle_writer".to_string(),
                Arc::new(move || -> BoxFuture {
                    let vehicle_rx = vehicle_rx.clone();
                    let notif_tx = notif_tx.clone();
                    let stop = stop.clone();
                    let filesystem = filesystem.clone();
                    let postgres = postgres.clone();
                    Box::pin(async move {
                        let media: Arc<dyn MediaStore> =
                            Arc::new(FilesystemMediaStore::new(filesystem)?);
                        let store: Arc<dyn EventStore> =
                            Arc::new(PostgresEventStore::new(postgres).await?);
                        store.init_schema().await?;
                        let mut rx = vehicle_rx.lock().await;
                        camwatch_event_writer::run_vehicle_writer(&mut rx, media, store, notif_tx, stop)
                            .await
                    })
                }),
            );
        }

        {
            let notif_rx = self.notif_q.rx.clone();
            let stop = self.stop.clone();
            let postgres = self.config.postgres.clone();
            let notification = self.config.notification.clone();
            factories.insert(
                "notifier".to_string(),
                Arc::new(move || -> BoxFuture {
                    let notif_rx = notif_rx.clone();
                    let stop = stop.clone();
                    let postgres = postgres.clone();
                    let notification = notification.clone();
                    Box::pin(async move {
                        let store: Arc<dyn EventStore> =
                            Arc::new(PostgresEventStore::new(postgres).await?);
                        store.init_schema().await?;
                        let notifier = notification.is_active().then(|| {
                            Arc::new(TelegramNotifier::new(
                                notification.bot_token.as_deref().unwrap_or_default(),
                                notification.chat_id.clone().unwrap_or_default(),
                            ))
                        });
                        let debounce = Duration::from_secs(notification.debounce_seconds);
                        let mut rx = notif_rx.lock().await;
                        camwatch_notification::run(&mut rx, notifier, store, debounce, stop).await
                    })
                }),
            );
        }

        Ok(factories)
    }

    /// Start every worker, run the 1 Hz monitor loop, and block until a
    /// shutdown signal arrives or `stop_token()` is cancelled externally.
    /// Performs the full graceful-shutdown sequence before returning.
    pub async fn run(&self) -> Result<()> {
        let factories = self.build_factories()?;
        let mut handles: HashMap<String, JoinHandle<Result<()>>> = HashMap::new();

        for (name, factory) in &factories {
            info!(worker = %name, "starting worker");
            handles.insert(name.clone(), tokio::spawn(factory()));
        }

        loop {
            tokio::select! {
                () = self.stop.cancelled() => break,
                () = wait_for_shutdown_signal() => {
                    info!("shutdown signal received");
                    self.stop.cancel();
                    break;
                }
                () = tokio::time::sleep(MONITOR_INTERVAL) => {
                    self.restart_dead_workers(&factories, &mut handles);
                }
            }
        }

        self.shutdown(handles).await;
        Ok(())
    }

    /// Respawn any worker whose task has already finished (crashed or
    /// returned early) from its stored factory.
    fn restart_dead_workers(
        &self,
        factories: &HashMap<String, Factory>,
        handles: &mut HashMap<String, JoinHandle<Result<()>>>,
    ) {
        for (name, handle) in handles.iter_mut() {
            if handle.is_finished() {
                warn!(worker = %name, "worker exited unexpectedly, restarting");
                let factory = &factories[name];
                *handle = tokio::spawn(factory());
            }
        }
    }

    /// Push one `PoisonPill` into each of the four queues, then join every
    /// worker with a bounded timeout. Workers that forwarded their own
    /// poison pills on the way out will already be finishing; this push
    /// guarantees every queue gets one even if the worker that would have
    /// forwarded it already died.
    async fn shutdown(&self, handles: HashMap<String, JoinHandle<Result<()>>>) {
        info!("beginning graceful shutdown");
        self.frame_q.push_poison_pill();
        self.person_q.push_poison_pill();
        self.vehicle_q.push_poison_pill();
        self.notif_q.push_poison_pill();

        for (name, handle) in handles {
            match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => info!(worker = %name, "worker stopped cleanly"),
                Ok(Ok(Err(err))) => error!(worker = %name, error = %err, "worker returned an error"),
                Ok(Err(err)) => error!(worker = %name, error = %err, "worker task panicked"),
                Err(_) => warn!(worker = %name, "worker did not stop within shutdown timeout"),
            }
        }
        info!("shutdown complete");
    }
}

/// Resolve when either `SIGINT` or `SIGTERM` is observed. `SIGTERM` is the
/// signal a process supervisor sends; `SIGINT` is `Ctrl+C` in a terminal.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            cameras: vec![],
            queue_size: 4,
            motion: MotionConfig {
                history: 10,
                kernel_size: 3,
                min_area: 1,
                binarize_threshold: 10,
                area_threshold: 1,
                warmup_frames: 0,
                max_foreground_ratio: 0.5,
            },
            model_path: "unused.onnx".to_string(),
            classifier: ObjectClassifierConfig::default(),
            filesystem: FilesystemConfig {
                root: "./data/media".to_string(),
            },
            postgres: PostgresConfig::default(),
            notification: NotificationConfig {
                enabled: false,
                bot_token: None,
                chat_id: None,
                debounce_seconds: 60,
            },
        }
    }

    #[test]
    fn test_empty_camera_list_yields_four_stage_factories_only() {
        let supervisor = Supervisor::new(test_config());
        let factories = supervisor.build_factories().unwrap();
        assert_eq!(factories.len(), 4);
        assert!(factories.contains_key("detection"));
        assert!(factories.contains_key("person_writer"));
        assert!(factories.contains_key("vehicle_writer"));
        assert!(factories.contains_key("notifier"));
    }

    #[test]
    fn test_one_ingestion_factory_per_camera() {
        let mut config = test_config();
        config.cameras = vec![
            CameraConfig {
                name: "front".to_string(),
                source: "/tmp/front".to_string(),
                poll_interval_seconds: 1.0,
            },
            CameraConfig {
                name: "back".to_string(),
                source: "/tmp/back".to_string(),
                poll_interval_seconds: 1.0,
            },
        ];
        let supervisor = Supervisor::new(config);
        let factories = supervisor.build_factories().unwrap();
        assert_eq!(factories.len(), 6);
        assert!(factories.contains_key("ingestion:front"));
        assert!(factories.contains_key("ingestion:back"));
    }

    #[test]
    fn test_stop_token_starts_uncancelled() {
        let supervisor = Supervisor::new(test_config());
        assert!(!supervisor.stop_token().is_cancelled());
        supervisor.stop_token().cancel();
        assert!(supervisor.stop_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_queue_poison_pill_is_non_blocking_and_observable() {
        let queue: Queue<FrameJob> = Queue::new(1);
        queue.push_poison_pill();
        let mut rx = queue.rx.lock().await;
        match rx.recv().await {
            Some(QueueMessage::PoisonPill) => {}
            other => panic!("expected poison pill, got {other:?}"),
        }
    }
}
