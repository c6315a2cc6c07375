// 12.1: in-process broker. streams, consumer groups with pending lists, and the side
// cache all live behind one mutex. blocking reads park on a Notify that every append wakes.

use super::{
    BrokerError, Delivery, EntryId, EventLog, Fields, GroupCreated, GroupInfo, PendingEntry, ReadFrom, SideCache,
    StreamEntry, StreamInfo,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct MemoryLogConfig {
    /// Approximate per-stream retention. Older entries are trimmed on append.
    pub max_len: usize,
    pub history_cap: usize,
    pub history_ttl: Duration,
}

impl Default for MemoryLogConfig {
    fn default() -> Self {
        Self {
            max_len: 10_000,
            history_cap: 100,
            history_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Default)]
struct PendingInfo {
    consumer: String,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingInfo>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: VecDeque<StreamEntry>,
    last_id: EntryId,
    // appends ever made, trimmed entries included
    entries_added: u64,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn entry(&self, id: EntryId) -> Option<&StreamEntry> {
        // entries are sorted by id
        self.entries
            .binary_search_by(|e| e.id.cmp(&id))
            .ok()
            .and_then(|idx| self.entries.get(idx))
    }

    fn after(&self, after: EntryId) -> impl Iterator<Item = &StreamEntry> {
        let start = self.entries.partition_point(|e| e.id <= after);
        self.entries.iter().skip(start)
    }
}

#[derive(Debug)]
struct History {
    items: VecDeque<String>,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, StreamState>,
    records: HashMap<String, Fields>,
    histories: HashMap<String, History>,
}

impl State {
    fn group_mut(&mut self, stream: &str, group: &str) -> Result<&mut StreamState, BrokerError> {
        let no_group = || BrokerError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let state = self.streams.get_mut(stream).ok_or_else(no_group)?;
        if !state.groups.contains_key(group) {
            return Err(no_group());
        }
        Ok(state)
    }

    fn read_new(&mut self, stream: &str, group: &str, consumer: &str, count: usize) -> Result<Vec<Delivery>, BrokerError> {
        let state = self.group_mut(stream, group)?;
        let cursor = state.groups.get(group).map(|g| g.last_delivered).unwrap_or_default();
        let batch: Vec<StreamEntry> = state.after(cursor).take(count).cloned().collect();

        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(batch.len());
        for entry in batch {
            group_state.last_delivered = entry.id;
            group_state.pending.insert(
                entry.id,
                PendingInfo {
                    consumer: consumer.to_string(),
                    deliveries: 1,
                },
            );
            out.push(Delivery { entry, deliveries: 1 });
        }
        Ok(out)
    }

    fn read_pending(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, BrokerError> {
        let state = self.group_mut(stream, group)?;
        let ids: Vec<EntryId> = state
            .groups
            .get(group)
            .map(|g| {
                g.pending
                    .iter()
                    .filter(|(_, info)| info.consumer == consumer)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();

        let mut out = Vec::new();
        for id in ids {
            if out.len() >= count {
                break;
            }
            let entry = state.entry(id).cloned();
            let Some(group_state) = state.groups.get_mut(group) else {
                break;
            };
            match entry {
                Some(entry) => {
                    if let Some(info) = group_state.pending.get_mut(&id) {
                        info.deliveries += 1;
                        out.push(Delivery {
                            entry,
                            deliveries: info.deliveries,
                        });
                    }
                }
                // trimmed away while pending; nothing left to redeliver
                None => {
                    group_state.pending.remove(&id);
                }
            }
        }
        Ok(out)
    }
}

/// In-process `EventLog` + `SideCache`.
#[derive(Debug, Default)]
pub struct MemoryLog {
    state: Mutex<State>,
    appended: Notify,
    config: MemoryLogConfig,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryLogConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Number of entries currently retained in `stream`.
    pub fn len(&self, stream: &str) -> usize {
        self.state.lock().streams.get(stream).map_or(0, |s| s.entries.len())
    }

    /// Appends with an explicit id. Used to seed streams for replay. Ids must increase.
    pub fn append_with_id(&self, stream: &str, id: EntryId, fields: Fields) -> Result<EntryId, BrokerError> {
        let mut state = self.state.lock();
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if id <= stream_state.last_id {
            return Err(BrokerError::InvalidId(id.to_string()));
        }
        self.push_entry(stream_state, id, fields);
        drop(state);
        self.appended.notify_waiters();
        Ok(id)
    }

    fn push_entry(&self, stream_state: &mut StreamState, id: EntryId, fields: Fields) {
        stream_state.last_id = id;
        stream_state.entries_added += 1;
        stream_state.entries.push_back(StreamEntry::new(id, fields));
        while stream_state.entries.len() > self.config.max_len {
            stream_state.entries.pop_front();
        }
    }
}

#[async_trait]
impl EventLog for MemoryLog {
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreated, BrokerError> {
        let mut state = self.state.lock();
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        if stream_state.groups.contains_key(group) {
            return Ok(GroupCreated::AlreadyExists);
        }
        stream_state.groups.insert(group.to_string(), GroupState::default());
        Ok(GroupCreated::Created)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<Delivery>, BrokerError> {
        if from == ReadFrom::Pending {
            return self.state.lock().read_pending(stream, group, consumer, count);
        }

        let deadline = block.map(|b| Instant::now() + b);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.state.lock().read_new(stream, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, BrokerError> {
        let mut state = self.state.lock();
        let stream_state = state.group_mut(stream, group)?;
        Ok(stream_state
            .groups
            .get_mut(group)
            .is_some_and(|g| g.pending.remove(&id).is_some()))
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError> {
        let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        let mut state = self.state.lock();
        let stream_state = state.streams.entry(stream.to_string()).or_default();
        let id = stream_state.last_id.next(now_ms);
        self.push_entry(stream_state, id, fields);
        drop(state);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn tail_id(&self, stream: &str) -> Result<EntryId, BrokerError> {
        Ok(self.state.lock().streams.get(stream).map(|s| s.last_id).unwrap_or_default())
    }

    async fn read_after(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        let deadline = block.map(|b| Instant::now() + b);
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch: Vec<StreamEntry> = self
                .state
                .lock()
                .streams
                .get(stream)
                .map(|s| s.after(after).take(count).cloned().collect())
                .unwrap_or_default();
            if !batch.is_empty() {
                return Ok(batch);
            }
            let Some(deadline) = deadline else {
                return Ok(batch);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn info(&self, stream: &str) -> Result<StreamInfo, BrokerError> {
        let state = self.state.lock();
        let Some(stream_state) = state.streams.get(stream) else {
            return Ok(StreamInfo::default());
        };
        let mut groups: Vec<GroupInfo> = stream_state
            .groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                last_delivered: g.last_delivered,
                pending: g.pending.len(),
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(StreamInfo {
            length: stream_state.entries.len(),
            entries_added: stream_state.entries_added,
            first_id: stream_state.entries.front().map(|e| e.id),
            last_id: stream_state.last_id,
            groups,
        })
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError> {
        let mut state = self.state.lock();
        let stream_state = state.group_mut(stream, group)?;
        Ok(stream_state
            .groups
            .get(group)
            .map(|g| {
                g.pending
                    .iter()
                    .map(|(id, info)| PendingEntry {
                        id: *id,
                        consumer: info.consumer.clone(),
                        deliveries: info.deliveries,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl SideCache for MemoryLog {
    async fn put_record(&self, key: &str, fields: Fields) -> Result<(), BrokerError> {
        self.state.lock().records.insert(key.to_string(), fields);
        Ok(())
    }

    async fn record(&self, key: &str) -> Result<Option<Fields>, BrokerError> {
        Ok(self.state.lock().records.get(key).cloned())
    }

    async fn push_history(&self, key: &str, value: String) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let history = state.histories.entry(key.to_string()).or_insert_with(|| History {
            items: VecDeque::new(),
            expires_at: now,
        });
        if history.expires_at <= now {
            history.items.clear();
        }
        history.items.push_front(value);
        history.items.truncate(self.config.history_cap);
        history.expires_at = now + self.config.history_ttl;
        Ok(())
    }

    async fn history(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired = state.histories.get(key).is_some_and(|h| h.expires_at <= now);
        if expired {
            state.histories.remove(key);
            return Ok(Vec::new());
        }
        Ok(state
            .histories
            .get(key)
            .map(|h| h.items.iter().cloned().collect())
            .unwrap_or_default())
    }
}
