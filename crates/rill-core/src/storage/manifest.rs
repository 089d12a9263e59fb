//! SQLite-backed manifest store.
//!
//! All database work runs on one dedicated thread owned by the store:
//! callers enqueue commands over a channel and await a oneshot reply, so no
//! SQLite call ever blocks the async runtime. The thread exits when the last
//! store handle drops.

// Allow numeric casts in this module - blob lengths travel as u64 in the data
// model and as i64 in SQLite, and both are bounded far below either limit.
#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::path::Path;
use std::thread;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument};

use crate::blob::info::BlobInfo;
use crate::stream::descriptor::StreamDescriptor;

const COMMAND_QUEUE_DEPTH: usize = 64;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blob (
    blob_hash TEXT PRIMARY KEY NOT NULL,
    length INTEGER NOT NULL,
    iv TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS stream (
    stream_hash TEXT PRIMARY KEY NOT NULL,
    sd_hash TEXT NOT NULL,
    stream_name TEXT NOT NULL,
    key TEXT NOT NULL,
    suggested_file_name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS stream_blob (
    stream_hash TEXT NOT NULL,
    blob_num INTEGER NOT NULL,
    blob_hash TEXT,
    iv TEXT NOT NULL,
    length INTEGER NOT NULL,
    PRIMARY KEY (stream_hash, blob_num)
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    /// Another writer briefly holds the database; the operation may be
    /// retried.
    #[error("manifest store is busy")]
    Busy,
    /// The database failed an integrity check. Fatal; surface to the
    /// operator.
    #[error("manifest store is corrupt: {0}")]
    Corrupt(String),
    /// The stream hash is already stored with different content.
    #[error("stream {stream_hash} already stored with different content")]
    DuplicateStream { stream_hash: String },
    /// The store thread has shut down.
    #[error("manifest store is closed")]
    Closed,
    #[error("manifest store error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode::{DatabaseBusy, DatabaseCorrupt, DatabaseLocked, NotADatabase};
        match &e {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                DatabaseBusy | DatabaseLocked => StoreError::Busy,
                DatabaseCorrupt | NotADatabase => StoreError::Corrupt(e.to_string()),
                _ => StoreError::Internal(e.to_string()),
            },
            _ => StoreError::Internal(e.to_string()),
        }
    }
}

/// One stream's manifest rows: the stream row plus its ordered blob rows.
/// Used both to store a stream and as the snapshot returned by reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRow {
    pub stream_hash: String,
    pub sd_hash: String,
    /// Hex of the UTF-8 stream name, as serialized on the wire.
    pub stream_name_hex: String,
    pub key_hex: String,
    pub suggested_file_name_hex: String,
    pub blobs: Vec<BlobInfo>,
}

impl StreamRow {
    /// Manifest rows for `descriptor`, forcing its SD hash if not yet
    /// computed.
    #[must_use]
    pub fn from_descriptor(descriptor: &StreamDescriptor) -> Self {
        Self {
            stream_hash: descriptor.stream_hash().to_owned(),
            sd_hash: descriptor.sd_hash().to_owned(),
            stream_name_hex: hex::encode(descriptor.stream_name().as_bytes()),
            key_hex: descriptor.key().to_owned(),
            suggested_file_name_hex: hex::encode(descriptor.suggested_file_name().as_bytes()),
            blobs: descriptor.blobs().to_vec(),
        }
    }
}

enum Command {
    AddKnownBlobs { blobs: Vec<BlobInfo>, reply: Reply<()> },
    StoreStream { row: StreamRow, reply: Reply<()> },
    GetStream { stream_hash: String, reply: Reply<Option<StreamRow>> },
    ContainsStream { stream_hash: String, reply: Reply<bool> },
}

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Durable index of streams and their content-addressed blobs.
///
/// Cloning the handle shares the underlying store thread.
#[derive(Clone)]
pub struct ManifestStore {
    commands: mpsc::Sender<Command>,
}

impl ManifestStore {
    /// Open (or create) the manifest database at `db_path` and start the
    /// store thread. Fails if the database cannot be opened or its schema
    /// cannot be applied.
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_owned();
        let (commands, queue) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = oneshot::channel();

        thread::Builder::new()
            .name("manifest-store".into())
            .spawn(move || run_store(&db_path, queue, ready_tx))
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        ready_rx.await.map_err(|_| StoreError::Closed)??;
        Ok(Self { commands })
    }

    /// Upsert content-addressed blob rows; duplicates are no-ops. Terminator
    /// entries carry no hash and are skipped.
    pub async fn add_known_blobs(&self, blobs: &[BlobInfo]) -> Result<(), StoreError> {
        let blobs = blobs.to_vec();
        self.send(|reply| Command::AddKnownBlobs { blobs, reply }).await
    }

    /// Store a stream and its blob rows in one transaction: either every row
    /// commits or none do. Re-storing an identical stream is accepted
    /// silently; a different stream under the same hash is
    /// [`StoreError::DuplicateStream`].
    pub async fn store_stream(&self, row: StreamRow) -> Result<(), StoreError> {
        self.send(|reply| Command::StoreStream { row, reply }).await
    }

    /// Snapshot one stored stream with its blob rows in `blob_num` order.
    pub async fn get_stream(&self, stream_hash: &str) -> Result<Option<StreamRow>, StoreError> {
        let stream_hash = stream_hash.to_owned();
        self.send(|reply| Command::GetStream { stream_hash, reply }).await
    }

    pub async fn contains_stream(&self, stream_hash: &str) -> Result<bool, StoreError> {
        let stream_hash = stream_hash.to_owned();
        self.send(|reply| Command::ContainsStream { stream_hash, reply }).await
    }

    async fn send<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, StoreError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(make(reply)).await.map_err(|_| StoreError::Closed)?;
        response.await.map_err(|_| StoreError::Closed)?
    }
}

fn run_store(db_path: &Path, mut queue: mpsc::Receiver<Command>, ready: Reply<()>) {
    let mut conn = match open_database(db_path) {
        Ok(conn) => {
            let _ = ready.send(Ok(()));
            conn
        }
        Err(e) => {
            error!(path = %db_path.display(), error = %e, "failed to open manifest database");
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Some(command) = queue.blocking_recv() {
        // A dropped reply receiver means the caller gave up; the work is
        // already done either way.
        match command {
            Command::AddKnownBlobs { blobs, reply } => {
                let _ = reply.send(add_known_blobs(&mut conn, &blobs));
            }
            Command::StoreStream { row, reply } => {
                let _ = reply.send(store_stream(&mut conn, &row));
            }
            Command::GetStream { stream_hash, reply } => {
                let _ = reply.send(get_stream(&conn, &stream_hash));
            }
            Command::ContainsStream { stream_hash, reply } => {
                let _ = reply.send(contains_stream(&conn, &stream_hash));
            }
        }
    }
    debug!("manifest store thread exiting");
}

fn open_database(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

fn add_known_blobs(conn: &mut Connection, blobs: &[BlobInfo]) -> Result<(), StoreError> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO blob (blob_hash, length, iv) VALUES (?1, ?2, ?3)
             ON CONFLICT(blob_hash) DO NOTHING",
        )?;
        for blob in blobs {
            let Some(blob_hash) = &blob.blob_hash else { continue };
            stmt.execute(params![blob_hash, blob.length as i64, blob.iv])?;
        }
    }
    tx.commit()?;
    Ok(())
}

#[instrument(skip_all, fields(stream_hash = %row.stream_hash))]
fn store_stream(conn: &mut Connection, row: &StreamRow) -> Result<(), StoreError> {
    let tx = conn.transaction()?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT sd_hash FROM stream WHERE stream_hash = ?1",
            params![row.stream_hash],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(sd_hash) = existing {
        return if sd_hash == row.sd_hash {
            debug!("stream already stored, accepting");
            Ok(())
        } else {
            Err(StoreError::DuplicateStream { stream_hash: row.stream_hash.clone() })
        };
    }

    tx.execute(
        "INSERT INTO stream (stream_hash, sd_hash, stream_name, key, suggested_file_name)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            row.stream_hash,
            row.sd_hash,
            row.stream_name_hex,
            row.key_hex,
            row.suggested_file_name_hex
        ],
    )?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO stream_blob (stream_hash, blob_num, blob_hash, iv, length)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for blob in &row.blobs {
            stmt.execute(params![
                row.stream_hash,
                blob.blob_num,
                blob.blob_hash,
                blob.iv,
                blob.length as i64
            ])?;
        }
    }
    tx.commit()?;
    debug!(blob_rows = row.blobs.len(), "stored stream");
    Ok(())
}

fn get_stream(conn: &Connection, stream_hash: &str) -> Result<Option<StreamRow>, StoreError> {
    let header: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT sd_hash, stream_name, key, suggested_file_name
             FROM stream WHERE stream_hash = ?1",
            params![stream_hash],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((sd_hash, stream_name_hex, key_hex, suggested_file_name_hex)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT blob_num, blob_hash, iv, length FROM stream_blob
         WHERE stream_hash = ?1 ORDER BY blob_num",
    )?;
    let blobs = stmt
        .query_map(params![stream_hash], |r| {
            Ok(BlobInfo {
                blob_num: r.get(0)?,
                blob_hash: r.get(1)?,
                iv: r.get(2)?,
                length: r.get::<_, i64>(3)? as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(StreamRow {
        stream_hash: stream_hash.to_owned(),
        sd_hash,
        stream_name_hex,
        key_hex,
        suggested_file_name_hex,
        blobs,
    }))
}

fn contains_stream(conn: &Connection, stream_hash: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM stream WHERE stream_hash = ?1",
        params![stream_hash],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_row(stream_hash: &str, sd_hash: &str) -> StreamRow {
        StreamRow {
            stream_hash: stream_hash.to_owned(),
            sd_hash: sd_hash.to_owned(),
            stream_name_hex: "666f6f".to_owned(),
            key_hex: "aa".repeat(16),
            suggested_file_name_hex: "666f6f".to_owned(),
            blobs: vec![
                BlobInfo::new(0, 64, "00".repeat(16), Some("ab".repeat(48))).unwrap(),
                BlobInfo::terminator(1, &[0x11; 16]),
            ],
        }
    }

    #[tokio::test]
    async fn stream_round_trips_through_the_store() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::open(dir.path().join("manifest.sqlite")).await.unwrap();

        let row = sample_row(&"1".repeat(96), &"2".repeat(96));
        store.add_known_blobs(&row.blobs).await.unwrap();
        store.store_stream(row.clone()).await.unwrap();

        assert!(store.contains_stream(&row.stream_hash).await.unwrap());
        let fetched = store.get_stream(&row.stream_hash).await.unwrap().unwrap();
        assert_eq!(fetched, row);
    }

    #[tokio::test]
    async fn missing_stream_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::open(dir.path().join("manifest.sqlite")).await.unwrap();
        assert!(store.get_stream(&"9".repeat(96)).await.unwrap().is_none());
        assert!(!store.contains_stream(&"9".repeat(96)).await.unwrap());
    }

    #[tokio::test]
    async fn identical_restore_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::open(dir.path().join("manifest.sqlite")).await.unwrap();

        let row = sample_row(&"1".repeat(96), &"2".repeat(96));
        store.store_stream(row.clone()).await.unwrap();
        store.store_stream(row.clone()).await.unwrap();

        let fetched = store.get_stream(&row.stream_hash).await.unwrap().unwrap();
        assert_eq!(fetched.blobs.len(), 2);
    }

    #[tokio::test]
    async fn conflicting_stream_content_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::open(dir.path().join("manifest.sqlite")).await.unwrap();

        store.store_stream(sample_row(&"1".repeat(96), &"2".repeat(96))).await.unwrap();
        let err =
            store.store_stream(sample_row(&"1".repeat(96), &"3".repeat(96))).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateStream { .. }));
    }

    #[tokio::test]
    async fn known_blob_upsert_is_a_no_op_on_duplicates() {
        let dir = TempDir::new().unwrap();
        let store = ManifestStore::open(dir.path().join("manifest.sqlite")).await.unwrap();

        let row = sample_row(&"1".repeat(96), &"2".repeat(96));
        store.add_known_blobs(&row.blobs).await.unwrap();
        store.add_known_blobs(&row.blobs).await.unwrap();
    }
}
