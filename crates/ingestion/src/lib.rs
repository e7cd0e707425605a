//! Ingestion stage: one task per configured camera, polling its source and
//! enqueueing frames onto the shared frame queue.
//!
//! Two source kinds are supported, matching [`camwatch_common::SourceKind`]:
//! - `Stream` (`rtsp://`/`http(s)://`): decode a single frame via `FFmpeg` on
//!   every poll tick.
//! - `Directory`: watch a directory for new `.jpg`/`.png` files, replaying
//!   each at most once via an in-memory `last_mtime` cursor.

use camwatch_common::{CameraConfig, FrameJob, PipelineError, QueueMessage, Result, SourceKind};
use chrono::Utc;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::Sender;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long an enqueue attempt blocks before giving up and dropping the
/// frame; back-pressure on the Detection stage should not stall ingestion
/// indefinitely.
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Initialize `FFmpeg` (must be called once at process startup, before any
/// stream-mode camera is polled).
pub fn init() -> Result<()> {
    ffmpeg_next::init().map_err(|e| PipelineError::DecodeFailure(format!("ffmpeg init: {e}")))
}

/// Run the ingestion loop for one camera until `stop` is cancelled. Always
/// sends exactly one `PoisonPill` on the way out.
pub async fn run_camera(
    camera: CameraConfig,
    frame_tx: Sender<QueueMessage<FrameJob>>,
    stop: CancellationToken,
) -> Result<()> {
    info!(camera = %camera.name, source = %camera.source, "ingestion worker starting");

    let mut interval = tokio::time::interval(Duration::from_secs_f64(
        camera.poll_interval_seconds.max(0.01),
    ));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut cursor = DirectoryCursor::default();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                match poll_once(&camera, &mut cursor) {
                    Ok(jobs) => {
                        for job in jobs {
                            enqueue(&frame_tx, job).await;
                        }
                    }
                    Err(err) => warn!(camera = %camera.name, error = %err, "poll failed"),
                }
            }
        }
    }

    let _ = frame_tx.send(QueueMessage::PoisonPill).await;
    info!(camera = %camera.name, "ingestion worker stopped");
    Ok(())
}

async fn enqueue(tx: &Sender<QueueMessage<FrameJob>>, job: FrameJob) {
    match tokio::time::timeout(ENQUEUE_TIMEOUT, tx.send(QueueMessage::Item(job))).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => warn!("frame queue closed, dropping frame"),
        Err(_) => warn!("frame queue full after {:?}, dropping frame", ENQUEUE_TIMEOUT),
    }
}

/// Poll one tick for one camera. Stream-mode yields at most one frame (one
/// decode per tick); directory mode may yield several, since a single tick
/// can observe more than one file newer than the cursor.
fn poll_once(camera: &CameraConfig, cursor: &mut DirectoryCursor) -> Result<Vec<FrameJob>> {
    match camera.source_kind() {
        SourceKind::Stream => {
            let image_bytes = decode_one_frame(&camera.source)?;
            Ok(vec![FrameJob {
                frame_id: Uuid::new_v4(),
                camera: camera.name.clone(),
                captured_at: Utc::now(),
                image_bytes: image_bytes.into(),
            }])
        }
        SourceKind::Directory => Ok(poll_directory(&camera.source, cursor)?
            .into_iter()
            .map(|image_bytes| FrameJob {
                frame_id: Uuid::new_v4(),
                camera: camera.name.clone(),
                captured_at: Utc::now(),
                image_bytes: image_bytes.into(),
            })
            .collect()),
    }
}

/// Remembers the newest modification time already seen, so each file in a
/// replayed directory is ingested exactly once.
#[derive(Default)]
struct DirectoryCursor {
    last_mtime: Option<SystemTime>,
}

/// Enumerate `*.jpg`/`*.png` in `dir` sorted by name; read and return every
/// file whose mtime is strictly newer than the cursor, advancing the cursor
/// to the newest mtime seen. Files at or before the cursor are never
/// replayed (idempotent re-poll over an unchanged directory).
fn poll_directory(dir: &str, cursor: &mut DirectoryCursor) -> Result<Vec<Vec<u8>>> {
    let mut entries: Vec<(SystemTime, std::path::PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| is_image_file(&entry.path()))
        .filter_map(|entry| {
            let mtime = entry.metadata().ok()?.modified().ok()?;
            Some((mtime, entry.path()))
        })
        .filter(|(mtime, _)| cursor.last_mtime.map_or(true, |last| *mtime > last))
        .collect();

    entries.sort_by(|(_, a), (_, b)| a.cmp(b));

    let mut frames = Vec::with_capacity(entries.len());
    for (mtime, path) in entries {
        match std::fs::read(&path) {
            Ok(bytes) => {
                cursor.last_mtime = Some(cursor.last_mtime.map_or(mtime, |last| last.max(mtime)));
                debug!(?path, "ingested directory frame");
                frames.push(bytes);
            }
            Err(err) => warn!(?path, error = %err, "failed to read directory frame, skipping"),
        }
    }
    Ok(frames)
}

fn is_image_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase),
        Some(ref ext) if ext == "jpg" || ext == "jpeg" || ext == "png"
    )
}

/// Decode a single frame from an `rtsp://`/`http(s)://` source and
/// re-encode it as JPEG bytes.
fn decode_one_frame(source: &str) -> Result<Vec<u8>> {
    let mut input = ffmpeg_next::format::input(source)
        .map_err(|e| PipelineError::DecodeFailure(format!("open {source}: {e}")))?;

    let stream_index = input
        .streams()
        .best(ffmpeg_next::media::Type::Video)
        .ok_or_else(|| PipelineError::DecodeFailure(format!("no video stream in {source}")))?
        .index();

    let stream = input.stream(stream_index).ok_or_else(|| {
        PipelineError::DecodeFailure(format!("video stream {stream_index} vanished"))
    })?;
    let codec_params = stream.parameters();
    let context_decoder = ffmpeg_next::codec::context::Context::from_parameters(codec_params)
        .map_err(|e| PipelineError::DecodeFailure(format!("decoder context: {e}")))?;
    let mut decoder = context_decoder
        .decoder()
        .video()
        .map_err(|e| PipelineError::DecodeFailure(format!("video decoder: {e}")))?;

    let mut scaler = ffmpeg_next::software::scaling::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        ffmpeg_next::format::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        ffmpeg_next::software::scaling::Flags::BILINEAR,
    )
    .map_err(|e| PipelineError::DecodeFailure(format!("scaler setup: {e}")))?;

    let mut decoded = ffmpeg_next::util::frame::Video::empty();
    for (stream, packet) in input.packets() {
        if stream.index() != stream_index {
            continue;
        }
        decoder
            .send_packet(&packet)
            .map_err(|e| PipelineError::DecodeFailure(format!("send packet: {e}")))?;
        if decoder.receive_frame(&mut decoded).is_ok() {
            let mut rgb = ffmpeg_next::util::frame::Video::empty();
            scaler
                .run(&decoded, &mut rgb)
                .map_err(|e| PipelineError::DecodeFailure(format!("scale: {e}")))?;
            return encode_jpeg(&rgb);
        }
    }

    Err(PipelineError::DecodeFailure(format!(
        "no frame decoded from {source}"
    )))
}

fn encode_jpeg(frame: &ffmpeg_next::util::frame::Video) -> Result<Vec<u8>> {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut rgb_image = image::RgbImage::new(width, height);
    for y in 0..height as usize {
        let row = &data[y * stride..y * stride + width as usize * 3];
        for x in 0..width as usize {
            let px = &row[x * 3..x * 3 + 3];
            rgb_image.put_pixel(x as u32, y as u32, image::Rgb([px[0], px[1], px[2]]));
        }
    }

    let mut buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 90);
    encoder
        .encode_image(&rgb_image)
        .map_err(|e| PipelineError::DecodeFailure(format!("jpeg encode: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_is_image_file() {
        assert!(is_image_file(Path::new("/tmp/a.jpg")));
        assert!(is_image_file(Path::new("/tmp/a.PNG")));
        assert!(!is_image_file(Path::new("/tmp/a.txt")));
    }

    #[test]
    fn test_poll_directory_picks_oldest_unseen_file_and_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.jpg");
        std::fs::File::create(&a).unwrap().write_all(b"aaa").unwrap();

        let mut cursor = DirectoryCursor::default();
        let first = poll_directory(dir.path().to_str().unwrap(), &mut cursor).unwrap();
        assert_eq!(first, vec![b"aaa".to_vec()]);

        // Same file must not be replayed.
        let second = poll_directory(dir.path().to_str().unwrap(), &mut cursor).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_poll_directory_empty_dir_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut cursor = DirectoryCursor::default();
        let result = poll_directory(dir.path().to_str().unwrap(), &mut cursor).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_poll_directory_emits_all_new_files_in_one_tick_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        // Write in reverse-name order so the test actually exercises the sort.
        std::fs::File::create(dir.path().join("b.jpg"))
            .unwrap()
            .write_all(b"bbb")
            .unwrap();
        std::fs::File::create(dir.path().join("a.jpg"))
            .unwrap()
            .write_all(b"aaa")
            .unwrap();

        let mut cursor = DirectoryCursor::default();
        let frames = poll_directory(dir.path().to_str().unwrap(), &mut cursor).unwrap();
        assert_eq!(frames, vec![b"aaa".to_vec(), b"bbb".to_vec()]);

        let again = poll_directory(dir.path().to_str().unwrap(), &mut cursor).unwrap();
        assert!(again.is_empty());
    }
}
