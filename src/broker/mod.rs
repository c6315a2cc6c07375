//! Durable log and side-cache seams.
//!
//! The engine talks to its broker only through these traits: an ordered, replayable,
//! per-stream append log with consumer-group cursors and explicit acks (`EventLog`), and
//! a small key/value + capped-list store for read-side caching (`SideCache`).
//! `MemoryLog` implements both in process.

mod memory;

pub use memory::{MemoryLog, MemoryLogConfig};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Flat field list as carried by a stream entry: `[(name, value), ...]`.
pub type Fields = Vec<(String, String)>;

/// Ordered stream entry id, rendered as `<ms>-<seq>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: u64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Smallest id strictly greater than `self` for a given wall clock reading.
    pub fn next(&self, now_ms: u64) -> Self {
        if now_ms > self.ms {
            Self { ms: now_ms, seq: 0 }
        } else {
            Self { ms: self.ms, seq: self.seq + 1 }
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BrokerError::InvalidId(s.to_string());
        let (ms, seq) = s.split_once('-').unwrap_or((s, "0"));
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: Fields,
}

impl StreamEntry {
    pub fn new(id: EntryId, fields: Fields) -> Self {
        Self { id, fields }
    }

    /// First value for `name`. Later duplicates are ignored.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// Folds the field list into a map. A repeated name keeps its last value.
    pub fn to_map(&self) -> HashMap<&str, &str> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }
}

/// An entry handed to a group consumer, with how many times it has been delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub entry: StreamEntry,
    pub deliveries: u32,
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries never delivered to the group (`>`).
    New,
    /// This consumer's delivered-but-unacknowledged entries (`0`).
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub deliveries: u32,
}

/// Stream metadata, the shape of `XINFO STREAM` plus `XINFO GROUPS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamInfo {
    /// Entries currently retained.
    pub length: usize,
    /// Entries ever appended, including those trimmed away.
    pub entries_added: u64,
    pub first_id: Option<EntryId>,
    pub last_id: EntryId,
    pub groups: Vec<GroupInfo>,
}

impl StreamInfo {
    pub fn group(&self, name: &str) -> Option<&GroupInfo> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Entries lost to length trimming.
    pub fn trimmed(&self) -> u64 {
        self.entries_added.saturating_sub(self.length as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    /// Newest entry ever handed to any consumer of the group.
    pub last_delivered: EntryId,
    pub pending: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreated {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker operation timed out")]
    Timeout,

    #[error("no consumer group {group} on stream {stream}")]
    NoSuchGroup { stream: String, group: String },

    #[error("invalid entry id {0}")]
    InvalidId(String),
}

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Creates `group` at the start of `stream`, creating the stream if needed.
    /// An existing group is not an error.
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreated, BrokerError>;

    /// Reads up to `count` entries for `consumer`. `block` bounds the wait when nothing is available.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Delivery>, BrokerError>;

    /// Removes `id` from the group's pending list. Returns false if it was not pending.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, BrokerError>;

    /// Appends an entry and returns its id.
    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError>;

    /// Id of the newest entry, or `EntryId::ZERO` for an empty stream.
    async fn tail_id(&self, stream: &str) -> Result<EntryId, BrokerError>;

    /// Plain (group-less) read of entries strictly after `after`.
    async fn read_after(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError>;

    /// Length, trim count and per-group cursors. A missing stream reads as empty.
    async fn info(&self, stream: &str) -> Result<StreamInfo, BrokerError>;

    /// The group's pending list, oldest first.
    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError>;
}

/// Read-side cache owned by the API tier. Not authoritative engine state.
#[async_trait]
pub trait SideCache: Send + Sync {
    /// Replaces the flat balance record at `key`.
    async fn put_record(&self, key: &str, fields: Fields) -> Result<(), BrokerError>;

    async fn record(&self, key: &str) -> Result<Option<Fields>, BrokerError>;

    /// Pushes to the front of a capped, expiring list.
    async fn push_history(&self, key: &str, value: String) -> Result<(), BrokerError>;

    /// Most recent first.
    async fn history(&self, key: &str) -> Result<Vec<String>, BrokerError>;
}

pub fn balance_key(user: &str) -> String {
    format!("user_balance:{user}")
}

pub fn orders_key(user: &str) -> String {
    format!("user_orders:{user}")
}

pub fn positions_key(user: &str) -> String {
    format!("user_positions:{user}")
}
