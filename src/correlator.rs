//! Request/response correlation for callers of the engine.
//!
//! A caller registers its `reqId` *before* publishing the request, then awaits the
//! matching entry on the response stream. One background reader tails the response stream
//! and completes waiters by `reqId`. Responses nobody is waiting for are dropped.
//!
//! A timeout does not mean the request failed: the engine may still apply it. Callers
//! must treat `CorrelationError::Timeout` as "outcome unknown".

use crate::broker::{BrokerError, EntryId, EventLog, StreamEntry};
use crate::message::{EngineRequest, EngineResponse};
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub response_stream: String,
    pub timeout: Duration,
    pub block: Duration,
    pub batch_size: usize,
    pub retry_backoff: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            response_stream: "stream:engine:response".to_string(),
            timeout: Duration::from_millis(3500),
            block: Duration::from_secs(1),
            batch_size: 100,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("no response for {req_id} within {after:?}; outcome unknown")]
    Timeout { req_id: String, after: Duration },

    #[error("waiter for {0} was dropped before a response arrived")]
    Closed(String),
}

// token tells registrations for the same req id apart
#[derive(Debug)]
struct Waiter {
    token: u64,
    tx: oneshot::Sender<EngineResponse>,
}

type Waiters = Mutex<HashMap<String, Waiter>>;

#[derive(Debug)]
pub struct RequestCorrelator {
    waiters: Waiters,
    next_token: AtomicU64,
    config: CorrelatorConfig,
}

impl RequestCorrelator {
    pub fn new(config: CorrelatorConfig) -> Arc<Self> {
        Arc::new(Self {
            waiters: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(0),
            config,
        })
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Registers a waiter for `req_id`. Call before publishing the request.
    pub fn register(self: &Arc<Self>, req_id: impl Into<String>) -> PendingResponse {
        let req_id = req_id.into();
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if self.waiters.lock().insert(req_id.clone(), Waiter { token, tx }).is_some() {
            warn!(req_id = %req_id, "waiter replaced for reused request id");
        }
        PendingResponse {
            rx,
            timeout: self.config.timeout,
            guard: WaiterGuard {
                correlator: self.clone(),
                req_id,
                token,
            },
        }
    }

    /// Registers and waits in one step. Only safe when the request is published afterwards
    /// by someone else; prefer `register` + publish + `PendingResponse::wait`.
    pub async fn wait_for_response(self: &Arc<Self>, req_id: impl Into<String>) -> Result<EngineResponse, CorrelationError> {
        self.register(req_id).wait().await
    }

    /// Completes the waiter for `response.req_id`. False when nobody is waiting.
    pub fn resolve(&self, response: EngineResponse) -> bool {
        let Some(waiter) = self.waiters.lock().remove(&response.req_id) else {
            debug!(req_id = %response.req_id, "response without waiter dropped");
            return false;
        };
        waiter.tx.send(response).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Tails the response stream from its current end until `shutdown` changes.
    pub async fn run(self: Arc<Self>, log: Arc<dyn EventLog>, mut shutdown: watch::Receiver<bool>) {
        let start = loop {
            if *shutdown.borrow() {
                return;
            }
            match log.tail_id(&self.config.response_stream).await {
                Ok(id) => break id,
                Err(e) => {
                    warn!(stream = %self.config.response_stream, error = %e, "response stream tail lookup failed");
                    if self.pause(&mut shutdown).await {
                        return;
                    }
                }
            }
        };
        self.run_from(log, start, shutdown).await;
    }

    /// Tails the response stream from just after `start` until `shutdown` changes.
    pub async fn run_from(self: Arc<Self>, log: Arc<dyn EventLog>, start: EntryId, mut shutdown: watch::Receiver<bool>) {
        let stream = self.config.response_stream.clone();
        let mut cursor = start;
        info!(stream = %stream, from = %cursor, "response reader started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                batch = log.read_after(&stream, cursor, self.config.batch_size, Some(self.config.block)) => batch,
            };
            match batch {
                Ok(entries) => {
                    for entry in entries {
                        cursor = entry.id;
                        self.accept(&entry);
                    }
                }
                Err(e) => {
                    warn!(stream = %stream, error = %e, "response stream read failed");
                    if self.pause(&mut shutdown).await {
                        break;
                    }
                }
            }
        }
        info!(stream = %stream, pending = self.pending_count(), "response reader stopped");
    }

    fn accept(&self, entry: &StreamEntry) {
        match EngineResponse::from_entry(entry) {
            Ok(response) => {
                self.resolve(response);
            }
            Err(e) => warn!(entry_id = %entry.id, error = %e, "undecodable response skipped"),
        }
    }

    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = shutdown.changed() => true,
            _ = tokio::time::sleep(self.config.retry_backoff) => false,
        }
    }

    // a newer registration under the same id is left alone
    fn remove(&self, req_id: &str, token: u64) {
        let mut waiters = self.waiters.lock();
        if waiters.get(req_id).is_some_and(|w| w.token == token) {
            waiters.remove(req_id);
        }
    }
}

// removes the waiter however the wait ends
#[derive(Debug)]
struct WaiterGuard {
    correlator: Arc<RequestCorrelator>,
    req_id: String,
    token: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.correlator.remove(&self.req_id, self.token);
    }
}

/// A registered waiter. Dropping it deregisters.
#[derive(Debug)]
pub struct PendingResponse {
    rx: oneshot::Receiver<EngineResponse>,
    timeout: Duration,
    guard: WaiterGuard,
}

impl PendingResponse {
    pub fn req_id(&self) -> &str {
        &self.guard.req_id
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn wait(self) -> Result<EngineResponse, CorrelationError> {
        let PendingResponse { rx, timeout, guard } = self;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CorrelationError::Closed(guard.req_id.clone())),
            Err(_) => {
                debug!(req_id = %guard.req_id, ?timeout, "response wait timed out");
                Err(CorrelationError::Timeout {
                    req_id: guard.req_id.clone(),
                    after: timeout,
                })
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("could not encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("could not publish request: {0}")]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),
}

/// Publishes requests and awaits their responses.
#[derive(Clone)]
pub struct EngineClient {
    log: Arc<dyn EventLog>,
    correlator: Arc<RequestCorrelator>,
    request_stream: String,
}

impl EngineClient {
    pub fn new(log: Arc<dyn EventLog>, correlator: Arc<RequestCorrelator>, request_stream: impl Into<String>) -> Self {
        Self {
            log,
            correlator,
            request_stream: request_stream.into(),
        }
    }

    /// Publishes without waiting. Returns the generated `reqId` and the entry id.
    pub async fn submit(&self, request: &EngineRequest) -> Result<(String, EntryId), ClientError> {
        let req_id = Uuid::new_v4().to_string();
        let id = self.publish(request, &req_id).await?;
        Ok((req_id, id))
    }

    /// Publishes and waits for the engine's answer.
    pub async fn call(&self, request: &EngineRequest) -> Result<EngineResponse, ClientError> {
        let req_id = Uuid::new_v4().to_string();
        let pending = self.correlator.register(req_id.as_str());
        self.publish(request, &req_id).await?;
        Ok(pending.wait().await?)
    }

    async fn publish(&self, request: &EngineRequest, req_id: &str) -> Result<EntryId, ClientError> {
        let fields = request.to_fields(req_id, Timestamp::now())?;
        let id = self.log.append(&self.request_stream, fields).await?;
        debug!(req_id, kind = request.tag(), entry_id = %id, "request published");
        Ok(id)
    }
}
