//! src/services/blob_store.rs
//!
//! BlobStore: the expiring-object store. Metadata lives in an in-memory table
//! guarded by an async mutex; payloads live on local disk under
//! `upload_dir/{YYYY-MM-DD}/{id}{ext}`. Nothing about the table survives a
//! restart: payloads left on disk by a previous process are never served and
//! are not reclaimed by the sweeper.

use crate::{
    config::StoreConfig,
    models::record::ObjectRecord,
    services::clock::{Clock, SystemClock},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    collections::{BTreeSet, HashMap},
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("failed to write upload: {0}")]
    WriteFailure(#[source] io::Error),
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("object `{0}` has expired")]
    Expired(String),
    #[error("object `{0}` failed integrity verification")]
    IntegrityFailure(String),
    #[error("failed to delete object `{id}`: {source}")]
    DeleteFailure {
        id: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of one reaping pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    /// Records whose payload and metadata were both removed.
    pub removed: usize,
    /// Records left in place because their payload could not be deleted.
    pub errors: usize,
}

/// Point-in-time view of the metadata table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub objects: usize,
    pub bytes: u64,
}

/// BlobStore provides the operations behind the share service:
/// - Create an object (streams bytes to disk, verifies them, then publishes metadata)
/// - Get an object (expiry check, integrity check, then an open file handle)
/// - Delete an object (payload first, metadata only once the payload is gone)
/// - Reap expired objects (called by the sweeper)
///
/// Cloning is cheap; all clones share one table.
#[derive(Clone)]
pub struct BlobStore {
    /// Metadata table. Every read and write goes through this lock.
    records: Arc<Mutex<HashMap<String, ObjectRecord>>>,

    config: Arc<StoreConfig>,

    clock: Arc<dyn Clock>,
}

const READ_BUFFER_LEN: usize = 64 * 1024;
const MAX_EXTENSION_LEN: usize = 16;
const MAX_ID_ATTEMPTS: usize = 8;
const MAX_BUCKET_ATTEMPTS: usize = 3;

impl BlobStore {
    /// Create a store rooted at `config.upload_dir`, using wall-clock time.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
            clock,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.config.upload_dir
    }

    pub fn retention(&self) -> chrono::Duration {
        self.config.retention
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Stream an upload to disk and publish its record.
    ///
    /// - Rejects `declared_size` above the limit before touching disk.
    /// - Counts streamed bytes and aborts as soon as the limit is crossed.
    /// - Re-reads the persisted file to compute the checksum and compares it
    ///   with the digest of the bytes received.
    /// - Inserts metadata only after all of the above succeeded.
    ///
    /// The payload file is removed on every error path, including when the
    /// returned future is dropped mid-upload.
    pub async fn create<S>(
        &self,
        stream: S,
        original_name: &str,
        declared_size: u64,
    ) -> StoreResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let limit = self.config.max_upload_bytes;
        if declared_size > limit {
            return Err(StoreError::TooLarge {
                size: declared_size,
                limit,
            });
        }

        let created_at = self.clock.now();
        let bucket = bucket_for(created_at);
        let extension = sanitize_extension(original_name);
        let bucket_dir = self.config.upload_dir.join(&bucket);

        let (id, path, mut file, mut partial) = self.reserve_file(&bucket_dir, &extension).await?;

        let mut size_bytes: u64 = 0;
        let mut received = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(StoreError::WriteFailure)?;
            size_bytes += chunk.len() as u64;
            if size_bytes > limit {
                return Err(StoreError::TooLarge {
                    size: size_bytes,
                    limit,
                });
            }
            received.consume(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(StoreError::WriteFailure)?;
        }
        file.flush().await.map_err(StoreError::WriteFailure)?;
        file.sync_all().await.map_err(StoreError::WriteFailure)?;
        drop(file);

        let received = format!("{:x}", received.compute());
        let checksum = digest_file(&path).await.map_err(StoreError::WriteFailure)?;
        if checksum != received {
            warn!(
                id = %id,
                expected = %received,
                actual = %checksum,
                "persisted bytes differ from received bytes"
            );
            return Err(StoreError::WriteFailure(io::Error::new(
                ErrorKind::InvalidData,
                "persisted bytes differ from received bytes",
            )));
        }

        let record = ObjectRecord {
            id: id.clone(),
            original_name: original_name.to_string(),
            extension,
            bucket,
            size_bytes,
            checksum,
            created_at,
            expire_at: created_at + self.config.retention,
        };

        {
            let mut records = self.records.lock().await;
            if records.contains_key(&id) {
                return Err(StoreError::WriteFailure(io::Error::new(
                    ErrorKind::AlreadyExists,
                    "object identifier collision",
                )));
            }
            records.insert(id.clone(), record.clone());
        }
        partial.keep();

        info!(
            id = %record.id,
            bucket = %record.bucket,
            size_bytes = record.size_bytes,
            expire_at = %record.expire_at,
            "stored upload"
        );
        Ok(record)
    }

    /// Fetch an object for reading.
    ///
    /// Returns the record and a file handle positioned at the start of a
    /// payload whose digest was just verified. Expired records are refused even
    /// if the sweeper has not reached them yet.
    pub async fn get(&self, id: &str) -> StoreResult<(File, ObjectRecord)> {
        let record = self.lookup(id).await?;
        if record.is_expired_at(self.clock.now()) {
            return Err(StoreError::Expired(id.to_string()));
        }

        let path = record.path_in(&self.config.upload_dir);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // Deleted or reaped between lookup and open. `delete` holds the
                // lock until its record is gone, so this re-check sees it.
                let current = self.records.lock().await.get(id).cloned();
                return Err(match current {
                    None => StoreError::NotFound(id.to_string()),
                    Some(record) if record.expire_at <= self.clock.now() => {
                        StoreError::Expired(id.to_string())
                    }
                    Some(_) => {
                        warn!(id = %id, path = %path.display(), "payload missing for live record");
                        StoreError::IntegrityFailure(id.to_string())
                    }
                });
            }
            Err(err) => {
                warn!(id = %id, error = %err, "failed to open payload");
                return Err(StoreError::IntegrityFailure(id.to_string()));
            }
        };

        let actual = match digest_reader(&mut file).await {
            Ok(digest) => digest,
            Err(err) => {
                warn!(id = %id, error = %err, "failed to read payload for verification");
                return Err(StoreError::IntegrityFailure(id.to_string()));
            }
        };
        if actual != record.checksum {
            warn!(
                id = %id,
                expected = %record.checksum,
                actual = %actual,
                "payload checksum mismatch"
            );
            return Err(StoreError::IntegrityFailure(id.to_string()));
        }

        file.seek(SeekFrom::Start(0)).await?;
        Ok((file, record))
    }

    /// Explicitly delete an object.
    ///
    /// The payload is removed first; if that fails the record stays and the
    /// error is returned. An already missing payload counts as removed.
    ///
    /// The table lock is held from lookup until the record is removed, so a
    /// concurrent `get` never sees a live record without its payload.
    pub async fn delete(&self, id: &str) -> StoreResult<ObjectRecord> {
        let record = {
            let mut records = self.records.lock().await;
            let record = records
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            remove_payload(&record.path_in(&self.config.upload_dir))
                .await
                .map_err(|source| StoreError::DeleteFailure {
                    id: id.to_string(),
                    source,
                })?;
            records.remove(id);
            record
        };
        self.prune_bucket(&record.bucket).await;

        info!(id = %id, bucket = %record.bucket, "deleted upload");
        Ok(record)
    }

    /// Remove every record with `expire_at <= now` along with its payload.
    ///
    /// A payload that cannot be deleted leaves its record in place and is
    /// counted in `errors`; the pass continues with the next record. Bucket
    /// directories emptied by the pass are removed afterwards.
    pub async fn reap(&self, now: DateTime<Utc>) -> ReapReport {
        let expired: Vec<ObjectRecord> = {
            let records = self.records.lock().await;
            records
                .values()
                .filter(|record| record.expire_at <= now)
                .cloned()
                .collect()
        };

        let mut report = ReapReport::default();
        let mut touched = BTreeSet::new();
        for record in expired {
            let path = record.path_in(&self.config.upload_dir);
            if let Err(err) = remove_payload(&path).await {
                warn!(
                    id = %record.id,
                    path = %path.display(),
                    error = %err,
                    "failed to remove expired payload"
                );
                report.errors += 1;
                continue;
            }

            if self.records.lock().await.remove(&record.id).is_some() {
                report.removed += 1;
            }
            touched.insert(record.bucket);
        }

        for bucket in touched {
            self.prune_bucket(&bucket).await;
        }

        report
    }

    pub async fn stats(&self) -> StoreStats {
        let records = self.records.lock().await;
        StoreStats {
            objects: records.len(),
            bytes: records.values().map(|record| record.size_bytes).sum(),
        }
    }

    async fn lookup(&self, id: &str) -> StoreResult<ObjectRecord> {
        self.records
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Pick an unused identifier and exclusively create its payload file.
    ///
    /// `create_new` makes the file itself the reservation, so two uploads can
    /// never share a payload path. The cleanup guard is armed before the open
    /// so a cancelled upload cannot leave an empty file behind.
    async fn reserve_file(
        &self,
        bucket_dir: &Path,
        extension: &str,
    ) -> StoreResult<(String, PathBuf, File, PartialUpload)> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = Uuid::new_v4().simple().to_string();
            if self.records.lock().await.contains_key(&id) {
                continue;
            }

            let path = bucket_dir.join(format!("{}{}", id, extension));
            let mut partial = PartialUpload::new(path.clone());
            match create_in_bucket(bucket_dir, &path).await {
                Ok(file) => return Ok((id, path, file, partial)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    // Someone else's file.
                    partial.keep();
                    continue;
                }
                Err(err) => return Err(StoreError::WriteFailure(err)),
            }
        }

        Err(StoreError::WriteFailure(io::Error::new(
            ErrorKind::AlreadyExists,
            "could not allocate a unique object identifier",
        )))
    }

    /// Remove a bucket directory if it no longer holds anything.
    ///
    /// Best-effort: a non-empty or already missing directory is expected, any
    /// other failure is logged.
    async fn prune_bucket(&self, bucket: &str) {
        if bucket.is_empty() {
            return;
        }
        let dir = self.config.upload_dir.join(bucket);
        match fs::remove_dir(&dir).await {
            Ok(_) => debug!("removed empty bucket directory {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => {}
            Err(err) => warn!("failed to prune bucket directory {}: {}", dir.display(), err),
        }
    }
}

/// Removes a payload file on drop unless told to keep it.
struct PartialUpload {
    path: PathBuf,
    keep: bool,
}

impl PartialUpload {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartialUpload {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(_) => debug!("removed partial upload {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to remove partial upload {}: {}",
                self.path.display(),
                err
            ),
        }
    }
}

/// Create the bucket directory (idempotent) and a brand-new file inside it.
///
/// The sweeper may remove an empty bucket between the two steps, so a
/// vanished directory is recreated a bounded number of times.
async fn create_in_bucket(bucket_dir: &Path, path: &Path) -> io::Result<File> {
    let mut attempt = 0;
    loop {
        fs::create_dir_all(bucket_dir).await?;
        match OpenOptions::new().write(true).create_new(true).open(path).await {
            Err(err) if err.kind() == ErrorKind::NotFound && attempt + 1 < MAX_BUCKET_ATTEMPTS => {
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Delete a payload. A file that is already gone counts as deleted.
async fn remove_payload(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("payload {} already missing", path.display());
            Ok(())
        }
        Err(err) => Err(err),
    }
}

async fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path).await?;
    digest_reader(&mut file).await
}

/// Lowercase hex MD5 of everything left in `reader`.
async fn digest_reader<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut digest = Context::new();
    let mut buf = vec![0u8; READ_BUFFER_LEN];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.consume(&buf[..n]);
    }
    Ok(format!("{:x}", digest.compute()))
}

/// Date directory for uploads created at `at` (UTC).
fn bucket_for(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Extension of the client filename, including the dot, if it is safe to put
/// on disk. Anything other than a short ASCII alphanumeric suffix is dropped.
fn sanitize_extension(original_name: &str) -> String {
    let base = original_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original_name);
    match base.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.bytes().all(|b| b.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext)
        }
        _ => String::new(),
    }
}
