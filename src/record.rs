//! Core data types for feed records.

use std::{fmt, str::FromStr, time::SystemTime};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Maximum length of record content, in bytes of trimmed text.
pub const MAX_CONTENT_LEN: usize = 4000;

/// Identifier of a single record.
///
/// Authoritative ids are assigned by the remote authority. Before a create is
/// confirmed, the client stamps the optimistic record with a locally generated
/// tentative id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId([u8; 16]);

impl RecordId {
    /// Constructs a record id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh locally-unique id for a tentative record.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes);
        Self(bytes)
    }

    /// The id as raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex representation truncated for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..4])
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.fmt_short())
    }
}

impl FromStr for RecordId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::HEXLOWER.decode(s.as_bytes())?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid record id length"))?;
        Ok(Self(bytes))
    }
}

/// Identifier of the actor that authored a record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AuthorId([u8; 16]);

impl AuthorId {
    /// Constructs an author id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The id as raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex representation truncated for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..4])
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthorId({})", self.fmt_short())
    }
}

/// Identifier partitioning the cache and the live subscription, e.g. one per
/// channel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeedKey([u8; 16]);

impl FeedKey {
    /// Constructs a feed key from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The key as raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex representation truncated for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..4])
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FeedKey({})", self.fmt_short())
    }
}

/// A single record in a feed.
///
/// Within one feed's cache, ids are unique and records are displayed ordered
/// by [`Self::created_at`] ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique id of the record.
    pub id: RecordId,
    /// The feed this record belongs to.
    pub feed: FeedKey,
    /// Author of the record.
    pub author: AuthorId,
    /// Text content, at most [`MAX_CONTENT_LEN`] bytes after trimming.
    pub content: String,
    /// Creation timestamp. Counted as micros since the Unix epoch.
    pub created_at: u64,
    /// Last-modified timestamp. Counted as micros since the Unix epoch.
    pub updated_at: u64,
    /// True until the authority has confirmed the record.
    pub tentative: bool,
}

impl Record {
    /// Builds a tentative record for an optimistic create.
    pub fn tentative(id: RecordId, feed: FeedKey, author: AuthorId, content: String) -> Self {
        let now = timestamp_now();
        Self {
            id,
            feed,
            author,
            content,
            created_at: now,
            updated_at: now,
            tentative: true,
        }
    }
}

/// The current time as micros since the Unix epoch.
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("time drift")
        .as_micros() as u64
}
