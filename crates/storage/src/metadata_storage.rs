//! `PostgreSQL`-backed event store.
//!
//! Owns six tables: `media_assets` (deduplicated frame/crop file references),
//! `person_events`/`vehicle_events` (one row per surviving detection),
//! `notifications` (delivery attempts recorded by the Notification stage),
//! `jobs` (a ledger row per persisted event, supplementing the spec's data
//! model from the original offline-optimizer's job bookkeeping), and
//! `settings` (key/value camera tuning, also supplemented).
//!
//! [`PostgresEventStore::write_bundle`] is the Event Writer stage's
//! transaction boundary: one frame asset, N crop assets, N event rows, and N
//! job rows all commit together or not at all.

use crate::{StorageError, StorageResult};
use camwatch_common::{Detection, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};
use uuid::Uuid;

/// `PostgreSQL` configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("POSTGRES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: std::env::var("POSTGRES_DB").unwrap_or_else(|_| "camwatch".to_string()),
            user: std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or_default(),
        }
    }
}

impl PostgresConfig {
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

/// One committed event, returned so the caller can build a `NotificationJob`
/// without re-querying.
#[derive(Debug, Clone)]
pub struct WrittenEvent {
    pub event_id: Uuid,
    pub crop_path: String,
}

/// Result of one `write_bundle` call.
#[derive(Debug, Clone, Default)]
pub struct WriteBundleResult {
    pub events: Vec<WrittenEvent>,
}

#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    async fn init_schema(&self) -> StorageResult<()>;

    /// Transactionally persist a frame's detections of one event type:
    /// dedup the frame asset by path, insert a crop asset + event row + job
    /// row per detection, and commit atomically. `items` pairs each
    /// surviving detection with the path its crop was already written to.
    async fn write_bundle(
        &self,
        event_type: EventType,
        camera: &str,
        frame_id: Uuid,
        captured_at: DateTime<Utc>,
        frame_path: &str,
        items: &[(Detection, String)],
    ) -> StorageResult<WriteBundleResult>;

    async fn record_notification(
        &self,
        event_type: EventType,
        event_id: Uuid,
        camera: &str,
        occurred_at: DateTime<Utc>,
        sent_at: Option<DateTime<Utc>>,
        status: &str,
    ) -> StorageResult<()>;

    async fn get_setting(&self, key: &str) -> StorageResult<Option<String>>;
    async fn set_setting(&self, key: &str, value: &str) -> StorageResult<()>;
}

pub struct PostgresEventStore {
    client: Mutex<Client>,
}

impl PostgresEventStore {
    pub async fn new(config: PostgresConfig) -> StorageResult<Self> {
        let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
            .await
            .map_err(|e| StorageError::Postgres(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection error");
            }
        });

        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

#[async_trait::async_trait]
impl EventStore for PostgresEventStore {
    async fn init_schema(&self) -> StorageResult<()> {
        let client = self.client.lock().await;

        client
            .batch_execute(
                r"
                CREATE TABLE IF NOT EXISTS media_assets (
                    id UUID PRIMARY KEY,
                    media_type TEXT NOT NULL,
                    path TEXT NOT NULL UNIQUE,
                    attributes JSONB NOT NULL DEFAULT '{}',
                    created_at TIMESTAMPTZ NOT NULL
                );

                CREATE TABLE IF NOT EXISTS person_events (
                    id UUID PRIMARY KEY,
                    camera TEXT NOT NULL,
                    occurred_at TIMESTAMPTZ NOT NULL,
                    frame_asset_id UUID NOT NULL REFERENCES media_assets(id),
                    crop_asset_id UUID NOT NULL REFERENCES media_assets(id),
                    score INTEGER,
                    bbox_x INTEGER NOT NULL,
                    bbox_y INTEGER NOT NULL,
                    bbox_width INTEGER NOT NULL,
                    bbox_height INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                );

                CREATE TABLE IF NOT EXISTS vehicle_events (
                    id UUID PRIMARY KEY,
                    camera TEXT NOT NULL,
                    occurred_at TIMESTAMPTZ NOT NULL,
                    frame_asset_id UUID NOT NULL REFERENCES media_assets(id),
                    crop_asset_id UUID NOT NULL REFERENCES media_assets(id),
                    score INTEGER,
                    label TEXT NOT NULL DEFAULT 'vehicle',
                    bbox_x INTEGER NOT NULL,
                    bbox_y INTEGER NOT NULL,
                    bbox_width INTEGER NOT NULL,
                    bbox_height INTEGER NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL
                );

                CREATE TABLE IF NOT EXISTS notifications (
                    id UUID PRIMARY KEY,
                    event_type TEXT NOT NULL,
                    event_id UUID NOT NULL,
                    camera TEXT NOT NULL,
                    occurred_at TIMESTAMPTZ NOT NULL,
                    sent_at TIMESTAMPTZ,
                    status TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id UUID PRIMARY KEY,
                    job_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    payload JSONB NOT NULL DEFAULT '{}',
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL,
                    error TEXT
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_person_events_camera_time
                    ON person_events(camera, occurred_at);
                CREATE INDEX IF NOT EXISTS idx_vehicle_events_camera_time
                    ON vehicle_events(camera, occurred_at);
                ",
            )
            .await
            .map_err(|e| StorageError::Postgres(e.to_string()))?;

        tracing::info!("event store schema initialized");
        Ok(())
    }

    async fn write_bundle(
        &self,
        event_type: EventType,
        camera: &str,
        frame_id: Uuid,
        captured_at: DateTime<Utc>,
        frame_path: &str,
        items: &[(Detection, String)],
    ) -> StorageResult<WriteBundleResult> {
        if items.is_empty() {
            return Ok(WriteBundleResult::default());
        }

        let mut client = self.client.lock().await;
        let txn = client
            .transaction()
            .await
            .map_err(|e| StorageError::Postgres(e.to_string()))?;

        let now = Utc::now();
        let frame_media_type = "frame";
        let frame_asset_id =
            upsert_media_asset(&txn, frame_media_type, frame_path, now).await?;

        let mut events = Vec::with_capacity(items.len());
        let (events_table, crop_media_type) = match event_type {
            EventType::Person => ("person_events", "person_crop"),
            EventType::Vehicle => ("vehicle_events", "vehicle_crop"),
        };

        for (detection, crop_path) in items {
            let crop_asset_id =
                upsert_media_asset(&txn, crop_media_type, crop_path, now).await?;

            let event_id = Uuid::new_v4();
            let score = Some(detection.score.round() as i32);
            let insert_event = if matches!(event_type, EventType::Vehicle) {
                format!(
                    r"
                    INSERT INTO {events_table}
                    (id, camera, occurred_at, frame_asset_id, crop_asset_id, score,
                     label, bbox_x, bbox_y, bbox_width, bbox_height, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, 'vehicle', $7, $8, $9, $10, $11)
                    "
                )
            } else {
                format!(
                    r"
                    INSERT INTO {events_table}
                    (id, camera, occurred_at, frame_asset_id, crop_asset_id, score,
                     bbox_x, bbox_y, bbox_width, bbox_height, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                    "
                )
            };
            txn.execute(
                insert_event.as_str(),
                &[
                    &event_id,
                    &camera,
                    &captured_at,
                    &frame_asset_id,
                    &crop_asset_id,
                    &score,
                    &detection.bbox.x,
                    &detection.bbox.y,
                    &detection.bbox.width,
                    &detection.bbox.height,
                    &now,
                ],
            )
            .await
            .map_err(|e| StorageError::Postgres(e.to_string()))?;

            let job_id = Uuid::new_v4();
            let job_type = job_type_label(event_type);
            let payload = serde_json::json!({ "frame_id": frame_id, "camera": camera });
            txn.execute(
                r"
                INSERT INTO jobs (id, job_type, status, payload, created_at, updated_at)
                VALUES ($1, $2, 'finished', $3, $4, $4)
                ",
                &[&job_id, &job_type, &payload, &now],
            )
            .await
            .map_err(|e| StorageError::Postgres(e.to_string()))?;

            events.push(WrittenEvent {
                event_id,
                crop_path: crop_path.clone(),
            });
        }

        txn.commit()
            .await
            .map_err(|e| StorageError::Postgres(e.to_string()))?;

        Ok(WriteBundleResult { events })
    }

    async fn record_notification(
        &self,
        event_type: EventType,
        event_id: Uuid,
        camera: &str,
        occurred_at: DateTime<Utc>,
        sent_at: Option<DateTime<Utc>>,
        status: &str,
    ) -> StorageResult<()> {
        let client = self.client.lock().await;
        client
            .execute(
                r"
                INSERT INTO notifications (id, event_type, event_id, camera, occurred_at, sent_at, status)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ",
                &[
                    &Uuid::new_v4(),
                    &event_type_label(event_type),
                    &event_id,
                    &camera,
                    &occurred_at,
                    &sent_at,
                    &status,
                ],
            )
            .await
            .map_err(|e| StorageError::Postgres(e.to_string()))?;
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> StorageResult<Option<String>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt("SELECT value FROM settings WHERE key = $1", &[&key])
            .await
            .map_err(|e| StorageError::Postgres(e.to_string()))?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn set_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        let client = self.client.lock().await;
        client
            .execute(
                r"
                INSERT INTO settings (key, value, updated_at)
                VALUES ($1, $2, now())
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
                ",
                &[&key, &value],
            )
            .await
            .map_err(|e| StorageError::Postgres(e.to_string()))?;
        Ok(())
    }
}

fn event_type_label(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Person => "person",
        EventType::Vehicle => "vehicle",
    }
}

fn job_type_label(event_type: EventType) -> &'static str {
    match event_type {
        EventType::Person => "person_event",
        EventType::Vehicle => "vehicle_event",
    }
}

/// Insert a `media_assets` row for `path`, or — if another writer already
/// inserted the same path (the frame-dedup case, since both Event Writer
/// stages persist the same frame under the same deterministic path) — fold
/// into the existing row and return its id. Uses `ON CONFLICT ... DO UPDATE
/// ... RETURNING id` (the same upsert idiom `set_setting` already uses)
/// rather than catch-and-reread: a failed statement aborts the surrounding
/// transaction in Postgres, so a plain `INSERT` that errors on the unique
/// violation would leave every later statement on `txn` failing with
/// "current transaction is aborted" instead of recovering.
async fn upsert_media_asset(
    txn: &tokio_postgres::Transaction<'_>,
    media_type: &str,
    path: &str,
    created_at: DateTime<Utc>,
) -> StorageResult<Uuid> {
    let id = Uuid::new_v4();
    let attributes = Value::Object(serde_json::Map::new());
    let row = txn
        .query_one(
            r"
            INSERT INTO media_assets (id, media_type, path, attributes, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (path) DO UPDATE SET media_type = EXCLUDED.media_type
            RETURNING id
            ",
            &[&id, &media_type, &path, &attributes, &created_at],
        )
        .await;

    match row {
        Ok(row) => Ok(row.get(0)),
        Err(e) => Err(StorageError::Postgres(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_config_default() {
        let config = PostgresConfig::default();
        assert_eq!(config.port, 5432);
        assert_eq!(config.database, "camwatch");
    }

    #[test]
    fn test_postgres_connection_string() {
        let config = PostgresConfig {
            host: "db".to_string(),
            port: 5433,
            database: "testdb".to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
        };
        let conn = config.connection_string();
        assert!(conn.contains("host=db"));
        assert!(conn.contains("port=5433"));
        assert!(conn.contains("dbname=testdb"));
    }

    #[test]
    fn test_event_type_label() {
        assert_eq!(event_type_label(EventType::Person), "person");
        assert_eq!(event_type_label(EventType::Vehicle), "vehicle");
    }
}
