//! Represents a stored upload and its validity window.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Metadata for a single uploaded blob.
///
/// A record is immutable once inserted into the store. The payload lives at
/// `<upload_root>/<bucket>/<id><extension>`; the record never holds content bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Random identifier, also the filename stem on disk.
    pub id: String,

    /// Filename supplied by the client. Only echoed back on download.
    pub original_name: String,

    /// Sanitized extension including the leading dot, or empty.
    pub extension: String,

    /// Date directory (`YYYY-MM-DD`) the payload was written into.
    pub bucket: String,

    /// Size of the persisted payload in bytes.
    pub size_bytes: u64,

    /// Lowercase hex MD5 of the persisted payload.
    pub checksum: String,

    pub created_at: DateTime<Utc>,

    /// After this instant the record is no longer servable.
    pub expire_at: DateTime<Utc>,
}

impl ObjectRecord {
    /// Name of the payload file inside its bucket directory.
    pub fn file_name(&self) -> String {
        format!("{}{}", self.id, self.extension)
    }

    /// Full payload path beneath `root`.
    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(&self.bucket).join(self.file_name())
    }

    /// Whether the record has lapsed at `now`.
    ///
    /// The record is still servable at exactly `expire_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expire_at
    }
}
