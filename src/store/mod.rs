//! Snapshot persistence: an ordered index of saved measurements plus a
//! separate blob table for the image payloads, both in one SQLite file.
//!
//! All access goes through a dedicated worker thread owning the connection;
//! callers await replies over oneshot channels. A `put` writes the blob
//! before the index row inside a single transaction, so an entry visible in
//! the index always has a readable image.

use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use image::GenericImageView;
use log::{error, info};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

mod migrations;

use crate::measure::Measurement;
use crate::pose::KneeTriple;
use crate::settings::CameraFacing;
use migrations::run_migrations;

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

/// A saved measurement as listed by the index. The image payload is fetched
/// separately via [`SnapshotStore::get_image`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub key: String,
    pub kneepoints: KneeTriple,
    pub width: u32,
    pub height: u32,
    pub confidence: f64,
    pub angle_deg: f64,
    pub display_angle: i32,
    pub recorded_at: DateTime<Utc>,
    pub camera: CameraFacing,
}

/// A measurement the user asked to save, with the frame it was taken from.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    /// PNG-encoded frame; the stored dimensions are read from it.
    pub image: Vec<u8>,
    pub measurement: Measurement,
    pub recorded_at: DateTime<Utc>,
    pub camera: CameraFacing,
}

/// Deterministic storage key for a snapshot.
pub fn snapshot_key(display_angle: i32, recorded_at: &DateTime<Utc>) -> String {
    format!("{display_angle}deg@{}", recorded_at.to_rfc3339())
}

fn camera_from_str(value: &str) -> Result<CameraFacing> {
    match value {
        "user" => Ok(CameraFacing::User),
        "environment" => Ok(CameraFacing::Environment),
        _ => Err(anyhow!("unknown camera facing '{value}'")),
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid datetime '{value}': {err}"))
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("column {column} holds invalid value {value}"))
}

struct StoreInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to snapshot store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join snapshot store thread: {join_err:?}");
            }
        }
    }
}

#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<StoreInner>,
    db_path: Arc<PathBuf>,
}

impl SnapshotStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("flexion-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Snapshot store thread shutting down");
            })
            .with_context(|| "failed to spawn snapshot store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        info!("Snapshot store initialized at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to store thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("snapshot store thread terminated unexpectedly"))?
    }

    /// Persist a snapshot and return its key.
    pub async fn put(&self, snapshot: NewSnapshot) -> Result<String> {
        let decoded = image::load_from_memory(&snapshot.image)
            .context("snapshot image payload is not a decodable image")?;
        let (width, height) = decoded.dimensions();

        let key = snapshot_key(snapshot.measurement.display_angle, &snapshot.recorded_at);
        let kneepoints = serde_json::to_string(&snapshot.measurement.points)
            .context("failed to serialize kneepoints")?;
        let stored_key = key.clone();

        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open snapshot transaction")?;

            // Blob first, index row last: once the index write lands, the
            // image is guaranteed readable.
            tx.execute(
                "INSERT INTO snapshot_images (key, image) VALUES (?1, ?2)",
                params![stored_key, snapshot.image],
            )
            .with_context(|| "failed to insert snapshot image")?;

            tx.execute(
                "INSERT INTO snapshots (key, kneepoints, width, height, confidence, angle_deg, display_angle, recorded_at, camera)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    stored_key,
                    kneepoints,
                    width,
                    height,
                    snapshot.measurement.confidence,
                    snapshot.measurement.angle_deg,
                    snapshot.measurement.display_angle,
                    snapshot.recorded_at.to_rfc3339(),
                    snapshot.camera.as_str(),
                ],
            )
            .with_context(|| "failed to insert snapshot entry")?;

            tx.commit().context("failed to commit snapshot")?;
            Ok(())
        })
        .await?;

        Ok(key)
    }

    /// All saved entries in insertion order, oldest first. Reversing for
    /// most-recent-first display is the consumer's concern.
    pub async fn get_entries(&self) -> Result<Vec<SnapshotEntry>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, kneepoints, width, height, confidence, angle_deg, display_angle, recorded_at, camera
                 FROM snapshots
                 ORDER BY id ASC",
            )?;

            let mut rows = stmt.query([])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                let kneepoints: String = row.get(1)?;
                entries.push(SnapshotEntry {
                    key: row.get(0)?,
                    kneepoints: serde_json::from_str(&kneepoints)
                        .context("failed to parse stored kneepoints")?,
                    width: to_u32(row.get::<_, i64>(2)?, "width")?,
                    height: to_u32(row.get::<_, i64>(3)?, "height")?,
                    confidence: row.get(4)?,
                    angle_deg: row.get(5)?,
                    display_angle: row.get(6)?,
                    recorded_at: parse_datetime(&row.get::<_, String>(7)?)?,
                    camera: camera_from_str(&row.get::<_, String>(8)?)?,
                });
            }

            Ok(entries)
        })
        .await
    }

    /// The image payload stored under `key`. A missing key is an error, not
    /// an empty result.
    pub async fn get_image(&self, key: &str) -> Result<Vec<u8>> {
        let key = key.to_string();
        self.execute(move |conn| {
            let mut stmt =
                conn.prepare("SELECT image FROM snapshot_images WHERE key = ?1")?;
            let mut rows = stmt.query(params![key])?;

            match rows.next()? {
                Some(row) => Ok(row.get::<_, Vec<u8>>(0)?),
                None => bail!("no snapshot image stored under key '{key}'"),
            }
        })
        .await
    }

    pub async fn get_image_for(&self, entry: &SnapshotEntry) -> Result<Vec<u8>> {
        self.get_image(&entry.key).await
    }

    /// Remove an entry and its image in one transaction. Deleting an absent
    /// key is an error surfaced to the caller.
    pub async fn delete_entry(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open delete transaction")?;

            let removed = tx.execute("DELETE FROM snapshots WHERE key = ?1", params![key])?;
            if removed == 0 {
                bail!("no snapshot entry stored under key '{key}'");
            }
            tx.execute(
                "DELETE FROM snapshot_images WHERE key = ?1",
                params![key],
            )?;

            tx.commit().context("failed to commit snapshot deletion")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::PixelPoint;
    use chrono::TimeZone;
    use image::{ImageFormat, RgbaImage};
    use std::io::Cursor;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("flexion-store-{}", uuid::Uuid::new_v4()))
            .join("snapshots.sqlite")
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, image::Rgba([0, 128, 255, 255]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn sample_snapshot(display_angle: i32, seconds: u32) -> NewSnapshot {
        NewSnapshot {
            image: png_bytes(4, 3),
            measurement: Measurement {
                points: KneeTriple {
                    hip: PixelPoint { x: 100, y: 50 },
                    knee: PixelPoint { x: 100, y: 150 },
                    ankle: PixelPoint { x: 170, y: 220 },
                },
                angle_deg: 180.0 - display_angle as f64,
                display_angle,
                confidence: 2.61,
            },
            recorded_at: Utc
                .with_ymd_and_hms(2024, 5, 14, 9, 30, seconds)
                .unwrap(),
            camera: CameraFacing::User,
        }
    }

    #[tokio::test]
    async fn put_then_list_includes_the_key() {
        let store = SnapshotStore::new(temp_db_path()).unwrap();
        let snap = sample_snapshot(45, 0);
        let expected_key = snapshot_key(45, &snap.recorded_at);

        let key = store.put(snap).await.unwrap();
        assert_eq!(key, expected_key);

        let entries = store.get_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, key);
        assert_eq!(entries[0].display_angle, 45);
        assert_eq!(entries[0].camera, CameraFacing::User);
    }

    #[tokio::test]
    async fn dimensions_come_from_the_image_payload() {
        let store = SnapshotStore::new(temp_db_path()).unwrap();
        let mut snap = sample_snapshot(30, 0);
        snap.image = png_bytes(640, 480);

        let key = store.put(snap).await.unwrap();
        let entries = store.get_entries().await.unwrap();
        assert_eq!(entries[0].key, key);
        assert_eq!((entries[0].width, entries[0].height), (640, 480));
    }

    #[tokio::test]
    async fn image_round_trips_byte_identical() {
        let store = SnapshotStore::new(temp_db_path()).unwrap();
        let snap = sample_snapshot(90, 0);
        let payload = snap.image.clone();

        let key = store.put(snap).await.unwrap();
        assert_eq!(store.get_image(&key).await.unwrap(), payload);

        let entries = store.get_entries().await.unwrap();
        assert_eq!(store.get_image_for(&entries[0]).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn entries_list_oldest_first() {
        let store = SnapshotStore::new(temp_db_path()).unwrap();
        store.put(sample_snapshot(20, 0)).await.unwrap();
        store.put(sample_snapshot(60, 1)).await.unwrap();
        store.put(sample_snapshot(40, 2)).await.unwrap();

        let angles: Vec<i32> = store
            .get_entries()
            .await
            .unwrap()
            .iter()
            .map(|e| e.display_angle)
            .collect();
        assert_eq!(angles, vec![20, 60, 40]);
    }

    #[tokio::test]
    async fn delete_removes_entry_and_image() {
        let store = SnapshotStore::new(temp_db_path()).unwrap();
        let key = store.put(sample_snapshot(75, 0)).await.unwrap();

        store.delete_entry(&key).await.unwrap();

        assert!(store.get_entries().await.unwrap().is_empty());
        assert!(store.get_image(&key).await.is_err());
    }

    #[tokio::test]
    async fn deleting_an_absent_key_is_an_error() {
        let store = SnapshotStore::new(temp_db_path()).unwrap();
        assert!(store.delete_entry("45deg@nowhere").await.is_err());
    }

    #[tokio::test]
    async fn undecodable_payload_is_rejected() {
        let store = SnapshotStore::new(temp_db_path()).unwrap();
        let mut snap = sample_snapshot(45, 0);
        snap.image = vec![1, 2, 3, 4];
        assert!(store.put(snap).await.is_err());
        assert!(store.get_entries().await.unwrap().is_empty());
    }
}
