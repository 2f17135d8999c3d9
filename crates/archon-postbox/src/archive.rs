//! Archive store for processed envelopes.
//!
//! Every message the router consumes lands here before it leaves its source
//! outbox, keyed `{timestamp}_{message_id}.json` inside one of four
//! buckets: `archive/` for delivered messages, `invalid/` for schema
//! failures and unknown recipients, `expired/` for TTL violations, and
//! `dead/` for messages whose retry count was exhausted.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::envelope::Envelope;
use crate::store::PostboxError;

/// The four archival buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveBucket {
    Archive,
    Invalid,
    Expired,
    Dead,
}

impl ArchiveBucket {
    pub const ALL: [ArchiveBucket; 4] = [
        ArchiveBucket::Archive,
        ArchiveBucket::Invalid,
        ArchiveBucket::Expired,
        ArchiveBucket::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for ArchiveBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamp-keyed store for processed envelopes.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
}

impl ArchiveStore {
    /// Open (and create if absent) an archive store at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PostboxError> {
        let root = root.into();
        for bucket in ArchiveBucket::ALL {
            let dir = root.join(bucket.as_str());
            fs::create_dir_all(&dir).map_err(|source| PostboxError::Io { path: dir, source })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store a decoded envelope in `bucket`. Returns the path written.
    pub fn store(
        &self,
        bucket: ArchiveBucket,
        envelope: &Envelope,
    ) -> Result<PathBuf, PostboxError> {
        let encoded = envelope.encode().map_err(|source| PostboxError::Codec {
            path: self.root.clone(),
            source,
        })?;
        self.store_raw(bucket, envelope.timestamp, &envelope.message_id, &encoded)
    }

    /// Store raw message contents (used for messages that failed to
    /// decode, which still deserve a post-mortem record).
    pub fn store_raw(
        &self,
        bucket: ArchiveBucket,
        timestamp: DateTime<Utc>,
        message_id: &str,
        contents: &str,
    ) -> Result<PathBuf, PostboxError> {
        let name = format!(
            "{}_{}.json",
            timestamp.format("%Y%m%dT%H%M%S%3fZ"),
            message_id
        );
        let dir = self.root.join(bucket.as_str());
        let tmp = dir.join(format!(".tmp-{message_id}"));
        let dest = dir.join(name);

        fs::write(&tmp, contents).map_err(|source| PostboxError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &dest).map_err(|source| PostboxError::Io {
            path: dest.clone(),
            source,
        })?;
        Ok(dest)
    }

    /// Paths currently stored in `bucket`, sorted by key.
    pub fn list(&self, bucket: ArchiveBucket) -> Result<Vec<PathBuf>, PostboxError> {
        let dir = self.root.join(bucket.as_str());
        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|source| PostboxError::Io {
            path: dir.clone(),
            source,
        })? {
            let entry = entry.map_err(|source| PostboxError::Io {
                path: dir.clone(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && name.ends_with(".json") {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Number of envelopes stored in `bucket`.
    pub fn count(&self, bucket: ArchiveBucket) -> Result<usize, PostboxError> {
        Ok(self.list(bucket)?.len())
    }
}
