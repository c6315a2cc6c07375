//! Request stream consumer.
//!
//! The dispatcher is the engine's only writer. It reads the request stream through a
//! consumer group, decodes each entry, hands it to the engine with the entry's timestamp
//! as logical time, acknowledges it, publishes the response and refreshes the side cache.
//!
//! Delivery is at-least-once. An entry applied but not acknowledged before a restart comes
//! back; entries at or before `last_applied` are acknowledged without running again.
//! Entries that fail to decode stay unacknowledged and are retried from the pending list;
//! after `max_deliveries` attempts they move to the dead-letter stream.

use crate::broker::{
    balance_key, orders_key, positions_key, BrokerError, Delivery, EntryId, EventLog, Fields, GroupCreated,
    ReadFrom, SideCache,
};
use crate::engine::{entry_time, Effects, Engine, RebuildSummary};
use crate::message::{decode_request, EngineResponse};
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub request_stream: String,
    pub response_stream: String,
    pub group: String,
    pub consumer: String,
    /// entries per read
    pub batch_size: usize,
    /// how long a read waits for new entries
    pub block: Duration,
    /// pause after a failed broker call
    pub retry_backoff: Duration,
    /// deliveries before a malformed entry is dead-lettered
    pub max_deliveries: u32,
    /// extra attempts for acks and publishes
    pub publish_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_stream: "stream:app:request".to_string(),
            response_stream: "stream:engine:response".to_string(),
            group: "engine_group".to_string(),
            consumer: "engine-1".to_string(),
            batch_size: 10,
            block: Duration::from_secs(1),
            retry_backoff: Duration::from_millis(500),
            max_deliveries: 5,
            publish_retries: 3,
        }
    }
}

impl DispatcherConfig {
    pub fn dead_letter_stream(&self) -> String {
        format!("{}:dead", self.request_stream)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    pub processed: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub dead_lettered: u64,
    pub responses_published: u64,
    pub publish_failures: u64,
    pub ack_failures: u64,
    pub cache_failures: u64,
    pub read_errors: u64,
    pub last_error: Option<String>,
}

pub struct StreamDispatcher {
    engine: Engine,
    log: Arc<dyn EventLog>,
    cache: Option<Arc<dyn SideCache>>,
    config: DispatcherConfig,
    last_applied: Option<EntryId>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl StreamDispatcher {
    pub fn new(engine: Engine, log: Arc<dyn EventLog>, config: DispatcherConfig) -> Self {
        Self {
            engine,
            log,
            cache: None,
            config,
            last_applied: None,
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn SideCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Treat everything up to `id` as already applied.
    pub fn resume_after(mut self, id: Option<EntryId>) -> Self {
        self.last_applied = id;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn into_engine(self) -> Engine {
        self.engine
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn last_applied(&self) -> Option<EntryId> {
        self.last_applied
    }

    /// Shared handle for observing counters while `run` owns the dispatcher.
    pub fn stats_handle(&self) -> Arc<Mutex<DispatcherStats>> {
        self.stats.clone()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().clone()
    }

    /// Creates the consumer group, tolerating an existing one.
    pub async fn ensure_group(&self) -> Result<(), BrokerError> {
        let created = self
            .log
            .create_group(&self.config.request_stream, &self.config.group)
            .await?;
        if created == GroupCreated::Created {
            info!(stream = %self.config.request_stream, group = %self.config.group, "consumer group created");
        }
        Ok(())
    }

    /// Rebuilds engine state from the entries the group has already been handed.
    ///
    /// The replay stops at the group's last-delivered id. Anything after it was never seen
    /// by a consumer and goes through normal dispatch, response included.
    pub async fn recover(&mut self) -> Result<RebuildSummary, BrokerError> {
        let stream = &self.config.request_stream;
        let info = self.log.info(stream).await?;
        let through = info
            .group(&self.config.group)
            .map_or(EntryId::ZERO, |g| g.last_delivered);
        let summary = self
            .engine
            .rebuild_through(self.log.as_ref(), stream, Some(through), self.config.batch_size.max(100))
            .await?;
        self.last_applied = self.last_applied.max(summary.last_applied);
        info!(
            stream = %stream,
            group = %self.config.group,
            through = %through,
            resume_after = ?self.last_applied.map(|id| id.to_string()),
            "dispatcher recovered"
        );
        Ok(summary)
    }

    /// One read and the processing of everything it returned.
    pub async fn poll_once(&mut self) -> Result<usize, BrokerError> {
        let batch = self.read_batch().await?;
        let count = batch.len();
        for delivery in batch {
            self.process(delivery).await;
        }
        Ok(count)
    }

    /// Consume until `shutdown` changes. Returns the dispatcher so state can be inspected.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Self {
        info!(
            stream = %self.config.request_stream,
            group = %self.config.group,
            consumer = %self.config.consumer,
            "dispatcher starting"
        );

        loop {
            if *shutdown.borrow() {
                return self;
            }
            match self.ensure_group().await {
                Ok(()) => break,
                Err(e) => {
                    self.note_error(&e, |s| s.read_errors += 1);
                    warn!(error = %e, "consumer group setup failed, retrying");
                    if self.pause(&mut shutdown).await {
                        return self;
                    }
                }
            }
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = self.read_batch() => batch,
            };
            match batch {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        self.process(delivery).await;
                    }
                }
                Err(e) => {
                    self.note_error(&e, |s| s.read_errors += 1);
                    error!(error = %e, "request stream read failed");
                    if self.pause(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            processed = stats.processed,
            duplicates = stats.duplicates,
            dead_lettered = stats.dead_lettered,
            read_errors = stats.read_errors,
            "dispatcher stopped"
        );
        self
    }

    // new entries first; once caught up, sweep our own unacknowledged ones
    async fn read_batch(&self) -> Result<Vec<Delivery>, BrokerError> {
        let c = &self.config;
        let fresh = self
            .log
            .read_group(&c.request_stream, &c.group, &c.consumer, ReadFrom::New, c.batch_size, Some(c.block))
            .await?;
        if !fresh.is_empty() {
            return Ok(fresh);
        }
        self.log
            .read_group(&c.request_stream, &c.group, &c.consumer, ReadFrom::Pending, c.batch_size, None)
            .await
    }

    async fn process(&mut self, delivery: Delivery) {
        let id = delivery.entry.id;

        let envelope = match decode_request(&delivery.entry) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.note_error(&err, |s| s.malformed += 1);
                error!(entry_id = %id, deliveries = delivery.deliveries, error = %err, "malformed request left unacknowledged");
                if delivery.deliveries >= self.config.max_deliveries {
                    self.dead_letter(&delivery, &err.to_string()).await;
                }
                return;
            }
        };

        if self.last_applied.is_some_and(|last| id <= last) {
            debug!(entry_id = %id, req_id = %envelope.req_id, "already applied, acknowledging");
            self.stats.lock().duplicates += 1;
            self.ack(id).await;
            return;
        }

        let kind = envelope.request.tag().to_string();
        let req_id = envelope.req_id.clone();
        let handled = self.engine.handle(envelope, entry_time(id));
        self.last_applied = Some(id);
        self.stats.lock().processed += 1;
        debug!(entry_id = %id, req_id = %req_id, kind = %kind, "request applied");

        self.ack(id).await;
        if let Some(response) = handled.response {
            self.publish(&response).await;
        }
        self.write_cache(&handled.effects).await;
    }

    async fn ack(&self, id: EntryId) -> bool {
        let c = &self.config;
        for attempt in 0..=c.publish_retries {
            match self.log.ack(&c.request_stream, &c.group, id).await {
                Ok(_) => return true,
                Err(e) => {
                    warn!(entry_id = %id, attempt, error = %e, "ack failed");
                    if attempt < c.publish_retries {
                        tokio::time::sleep(c.retry_backoff).await;
                    }
                }
            }
        }
        // the entry comes back from the pending list and is acknowledged as a duplicate
        self.stats.lock().ack_failures += 1;
        false
    }

    async fn append_with_retry(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError> {
        let retries = self.config.publish_retries;
        let mut attempt = 0;
        loop {
            match self.log.append(stream, fields.clone()).await {
                Ok(id) => return Ok(id),
                Err(e) if attempt < retries => {
                    warn!(stream, attempt, error = %e, "append failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn publish(&self, response: &EngineResponse) {
        let fields = response.to_fields(Timestamp::now());
        match self.append_with_retry(&self.config.response_stream, fields).await {
            Ok(_) => self.stats.lock().responses_published += 1,
            Err(e) => {
                // the caller sees a timeout and must treat the outcome as unknown
                self.note_error(&e, |s| s.publish_failures += 1);
                error!(req_id = %response.req_id, kind = %response.kind, error = %e, "response lost");
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) {
        let id = delivery.entry.id;
        let mut fields = delivery.entry.fields.clone();
        fields.push(("sourceId".to_string(), id.to_string()));
        fields.push(("deliveries".to_string(), delivery.deliveries.to_string()));
        fields.push(("reason".to_string(), reason.to_string()));

        let dead = self.config.dead_letter_stream();
        match self.append_with_retry(&dead, fields).await {
            Ok(dead_id) => {
                self.stats.lock().dead_lettered += 1;
                warn!(entry_id = %id, dead_letter_id = %dead_id, stream = %dead, reason, "entry dead-lettered");
                self.ack(id).await;
            }
            Err(e) => {
                self.note_error(&e, |_| {});
                error!(entry_id = %id, error = %e, "dead-letter append failed, entry stays pending");
            }
        }
    }

    async fn write_cache(&self, effects: &Effects) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = self.write_cache_inner(cache.as_ref(), effects).await {
            self.note_error(&e, |s| s.cache_failures += 1);
            warn!(error = %e, "side cache update failed");
        }
    }

    async fn write_cache_inner(&self, cache: &dyn SideCache, effects: &Effects) -> Result<(), BrokerError> {
        for user in &effects.users {
            if let Some(balance) = self.engine.ledger().balance(user) {
                let fields = vec![
                    ("available".to_string(), balance.available.to_string()),
                    ("locked".to_string(), balance.locked.to_string()),
                    ("total".to_string(), balance.total.to_string()),
                    ("lastUpdated".to_string(), balance.last_updated.as_millis().to_string()),
                ];
                cache.put_record(&balance_key(user.as_str()), fields).await?;
            }
        }
        for order in &effects.orders {
            let json = serde_json::to_string(order).map_err(|e| BrokerError::Unavailable(e.to_string()))?;
            cache.push_history(&orders_key(order.user_id.as_str()), json).await?;
        }
        for position in &effects.positions {
            let json = serde_json::to_string(position).map_err(|e| BrokerError::Unavailable(e.to_string()))?;
            cache.push_history(&positions_key(position.user_id.as_str()), json).await?;
        }
        Ok(())
    }

    /// Sleeps for the retry backoff. True if shutdown was signalled meanwhile.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown.changed() => true,
            _ = tokio::time::sleep(self.config.retry_backoff) => false,
        }
    }

    fn note_error(&self, err: &dyn std::fmt::Display, bump: impl FnOnce(&mut DispatcherStats)) {
        let mut stats = self.stats.lock();
        bump(&mut stats);
        stats.last_error = Some(err.to_string());
    }
}
