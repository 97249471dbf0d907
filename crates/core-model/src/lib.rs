use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod layout;

pub use layout::{CURRENT_VERSION, DatasetLayout};

pub type MessageId = i64;
pub type TagId = i64;
pub type GroupId = i64;

/// A message as produced by a message source, before sanitizing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMessage {
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub subject: Option<String>,
    pub sent_from: Option<String>,
    pub date: DateTime<Utc>,
    pub body: Option<String>,
    pub charset: Option<String>,
}

/// A sanitized message ready to be written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub subject: String,
    pub sent_from: String,
    pub date: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub parent_id: Option<MessageId>,
    pub message_id: String,
    pub subject: String,
    pub in_reply_to: Option<String>,
    pub sent_from: String,
    pub date: DateTime<Utc>,
    pub body: Option<String>,
    pub hidden: bool,
}

impl Message {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn preview(&self) -> MessagePreview {
        MessagePreview {
            id: self.id,
            parent_id: self.parent_id,
            message_id: self.message_id.clone(),
            subject: self.subject.clone(),
            sent_from: self.sent_from.clone(),
            date: self.date,
            hidden: self.hidden,
        }
    }
}

/// The lightweight row returned by paginated reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub id: MessageId,
    pub parent_id: Option<MessageId>,
    pub message_id: String,
    pub subject: String,
    pub sent_from: String,
    pub date: DateTime<Utc>,
    pub hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub description: Option<String>,
    pub seq: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagGroup {
    pub id: GroupId,
    pub parent_id: Option<GroupId>,
    pub name: String,
    pub description: Option<String>,
    pub seq: i64,
}

/// Audit record of a bulk visibility change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationEntry {
    pub id: i64,
    pub description: String,
    pub performed_at: DateTime<Utc>,
    pub affected_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: i64,
    pub message_id: MessageId,
    pub created_at: DateTime<Utc>,
    pub text: String,
}

/// Produces raw messages from files found under a source location.
///
/// Parsing of the underlying format lives entirely behind this trait; the
/// generator only sees normalized [`RawMessage`] records.
pub trait MessageSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn discover_files(&self, location: &Path) -> anyhow::Result<Vec<PathBuf>>;
    fn read_file(&self, path: &Path) -> anyhow::Result<Vec<RawMessage>>;
}

/// Failures callers are expected to tell apart.
///
/// Library functions return `anyhow::Result`; these values are either the
/// error itself or attached as context, so `err.downcast_ref::<DatasetError>()`
/// recovers the kind.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("invalid page request: page {page}, size {size} (pages start at 1 and size must be positive)")]
    InvalidPage { page: usize, size: usize },
    #[error("malformed query `{query}`: {reason}")]
    MalformedQuery { query: String, reason: String },
    #[error("invalid dataset at {}: {reason}", .path.display())]
    InvalidDataset { path: PathBuf, reason: String },
    #[error("dataset at {} has version {found}, expected {expected}; upgrade it first", .path.display())]
    OutdatedVersion {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
    #[error("transaction `{operation}` rolled back")]
    RolledBack { operation: &'static str },
    #[error("a {kind} named `{name}` already exists")]
    DuplicateName { kind: &'static str, name: String },
    #[error("dataset is closed")]
    Closed,
}
