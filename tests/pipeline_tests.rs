//! End-to-end pipeline tests.
//!
//! Requests go in through an `EngineClient`, the dispatcher applies them, and responses
//! come back through the correlator, all against the in-memory broker.

use async_trait::async_trait;
use margin_engine::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const REQUESTS: &str = "stream:app:request";
const RESPONSES: &str = "stream:engine:response";

fn dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        block: Duration::from_millis(10),
        retry_backoff: Duration::from_millis(5),
        max_deliveries: 3,
        ..DispatcherConfig::default()
    }
}

fn correlator_config() -> CorrelatorConfig {
    CorrelatorConfig {
        timeout: Duration::from_secs(5),
        block: Duration::from_millis(10),
        retry_backoff: Duration::from_millis(5),
        ..CorrelatorConfig::default()
    }
}

fn engine() -> Engine {
    Engine::new(EngineConfig::default(), Arc::new(RiskConfig::default()))
}

fn decimal(data: &Value, key: &str) -> Decimal {
    data[key].as_str().unwrap().parse().unwrap()
}

/// Fails a configurable number of response appends and acks before delegating.
struct FlakyLog {
    inner: Arc<MemoryLog>,
    failing_appends: AtomicU32,
    failing_acks: AtomicU32,
}

impl FlakyLog {
    fn new(inner: Arc<MemoryLog>, failing_appends: u32, failing_acks: u32) -> Self {
        Self {
            inner,
            failing_appends: AtomicU32::new(failing_appends),
            failing_acks: AtomicU32::new(failing_acks),
        }
    }

    fn trip(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventLog for FlakyLog {
    async fn create_group(&self, stream: &str, group: &str) -> Result<GroupCreated, BrokerError> {
        self.inner.create_group(stream, group).await
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
        self.inner.read_group(stream, group, consumer, from, count, block).await
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, BrokerError> {
        if Self::trip(&self.failing_acks) {
            return Err(BrokerError::Unavailable("ack refused".to_string()));
        }
        self.inner.ack(stream, group, id).await
    }

    async fn append(&self, stream: &str, fields: Fields) -> Result<EntryId, BrokerError> {
        if stream == RESPONSES && Self::trip(&self.failing_appends) {
            return Err(BrokerError::Unavailable("append refused".to_string()));
        }
        self.inner.append(stream, fields).await
    }

    async fn tail_id(&self, stream: &str) -> Result<EntryId, BrokerError> {
        self.inner.tail_id(stream).await
    }

    async fn read_after(
        &self,
        stream: &str,
        after: EntryId,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, BrokerError> {
        self.inner.read_after(stream, after, count, block).await
    }

    async fn info(&self, stream: &str) -> Result<StreamInfo, BrokerError> {
        self.inner.info(stream).await
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, BrokerError> {
        self.inner.pending(stream, group).await
    }
}

fn deposit_fields(req_id: &str, user: &str, amount: Decimal) -> Fields {
    EngineRequest::Deposit(DepositRequest {
        user_id: UserId::from(user),
        amount: Quote::new(amount),
    })
    .to_fields(req_id, Timestamp::now())
    .unwrap()
}

/// A running dispatcher plus a client wired to it.
struct Pipeline {
    store: Arc<MemoryLog>,
    client: EngineClient,
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<StreamDispatcher>,
    reader: JoinHandle<()>,
}

impl Pipeline {
    async fn start(store: Arc<MemoryLog>, log: Arc<dyn EventLog>) -> Self {
        let dispatcher = StreamDispatcher::new(engine(), log.clone(), dispatcher_config()).with_cache(store.clone());
        dispatcher.ensure_group().await.unwrap();
        let correlator = RequestCorrelator::new(correlator_config());

        let (shutdown, rx) = watch::channel(false);
        let start = log.tail_id(RESPONSES).await.unwrap();
        let reader = tokio::spawn(correlator.clone().run_from(log.clone(), start, rx.clone()));
        let dispatcher = tokio::spawn(dispatcher.run(rx));

        Self {
            client: EngineClient::new(log, correlator, REQUESTS),
            store,
            shutdown,
            dispatcher,
            reader,
        }
    }

    async fn memory() -> Self {
        let store = Arc::new(MemoryLog::new());
        Self::start(store.clone(), store).await
    }

    async fn call(&self, request: EngineRequest) -> EngineResponse {
        self.client.call(&request).await.unwrap()
    }

    async fn price(&self, symbol: &str, price: Decimal) {
        self.client
            .submit(&EngineRequest::PriceUpdate(PriceUpdateRequest {
                symbol: Symbol::from(symbol),
                price,
            }))
            .await
            .unwrap();
    }

    async fn deposit(&self, user: &str, amount: Decimal) -> EngineResponse {
        self.call(EngineRequest::Deposit(DepositRequest {
            user_id: UserId::from(user),
            amount: Quote::new(amount),
        }))
        .await
    }

    async fn order(&self, order_id: &str, user: &str, side: Side, size: Decimal, leverage: u32, limit: Option<Decimal>) -> EngineResponse {
        self.call(EngineRequest::OpenOrder(OpenOrderRequest {
            order_id: OrderId::from(order_id),
            user_id: UserId::from(user),
            symbol: Symbol::from("BTC"),
            side,
            order_type: if limit.is_some() { OrderType::Limit } else { OrderType::Market },
            size,
            leverage,
            limit_price: limit,
        }))
        .await
    }

    async fn balance(&self, user: &str) -> Value {
        let response = self
            .call(EngineRequest::GetBalance(UserQuery {
                user_id: UserId::from(user),
            }))
            .await;
        response.data().cloned().unwrap()
    }

    async fn stop(self) -> StreamDispatcher {
        self.shutdown.send(true).unwrap();
        self.reader.await.unwrap();
        self.dispatcher.await.unwrap()
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn open_then_close_after_price_doubles() {
    let pipeline = Pipeline::memory().await;

    assert!(pipeline.deposit("alice", dec!(1000)).await.is_ok());
    pipeline.price("BTC", dec!(1000)).await;

    let opened = pipeline.order("o-1", "alice", Side::Buy, dec!(1), 2, None).await;
    assert!(opened.is_ok());
    assert_eq!(opened.order_id, Some(OrderId::from("o-1")));

    let balance = pipeline.balance("alice").await;
    assert_eq!(decimal(&balance, "available"), dec!(500));
    assert_eq!(decimal(&balance, "locked"), dec!(500));

    pipeline.price("BTC", dec!(2000)).await;
    let closed = pipeline
        .call(EngineRequest::ClosePosition(ClosePositionRequest {
            user_id: UserId::from("alice"),
            position_id: PositionId::from("pos_o-1"),
        }))
        .await;
    assert!(closed.is_ok());

    let balance = pipeline.balance("alice").await;
    assert_eq!(decimal(&balance, "available"), dec!(2000));
    assert_eq!(decimal(&balance, "locked"), Decimal::ZERO);

    // side cache mirrors the ledger
    let record = pipeline.store.record(&balance_key("alice")).await.unwrap().unwrap();
    let available = record.iter().find(|(k, _)| k == "available").map(|(_, v)| v.parse::<Decimal>().unwrap());
    assert_eq!(available, Some(dec!(2000)));
    assert!(!pipeline.store.history(&positions_key("alice")).await.unwrap().is_empty());

    let dispatcher = pipeline.stop().await;
    let stats = dispatcher.stats();
    assert_eq!(stats.processed, 7);
    assert_eq!(stats.responses_published, 5);
}

#[tokio::test]
async fn failures_are_answered_with_codes() {
    let pipeline = Pipeline::memory().await;

    let no_price = pipeline.order("o-1", "bob", Side::Buy, dec!(1), 2, None).await;
    assert_eq!(no_price.error_body().unwrap().code, "NO_PRICE");
    assert_eq!(no_price.order_id, Some(OrderId::from("o-1")));

    pipeline.price("BTC", dec!(100)).await;
    pipeline.deposit("bob", dec!(10)).await;

    let too_big = pipeline.order("o-2", "bob", Side::Sell, dec!(10), 2, None).await;
    assert_eq!(too_big.error_body().unwrap().code, "INSUFFICIENT_MARGIN");

    let leverage = pipeline.order("o-3", "bob", Side::Sell, dec!(1), 1000, None).await;
    assert_eq!(leverage.error_body().unwrap().code, "VALIDATION");

    let foreign = pipeline
        .call(EngineRequest::ClosePosition(ClosePositionRequest {
            user_id: UserId::from("bob"),
            position_id: PositionId::from("pos_nothing"),
        }))
        .await;
    assert_eq!(foreign.error_body().unwrap().code, "NOT_FOUND");

    let unknown = pipeline
        .call(EngineRequest::Unknown {
            tag: "withdraw".to_string(),
        })
        .await;
    assert_eq!(unknown.error_body().unwrap().code, "UNSUPPORTED");

    // rejected orders are still listed
    let orders = pipeline
        .call(EngineRequest::GetOrders(UserQuery {
            user_id: UserId::from("bob"),
        }))
        .await;
    let statuses: Vec<&str> = orders
        .data()
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["status"].as_str().unwrap())
        .collect();
    assert!(statuses.iter().all(|s| *s == "rejected"));
    assert!(!statuses.is_empty());

    pipeline.stop().await;
}

#[tokio::test]
async fn resting_limit_fills_on_cross_and_cancel_frees_reserve() {
    let pipeline = Pipeline::memory().await;
    pipeline.deposit("bob", dec!(5000)).await;

    let resting = pipeline.order("b-1", "bob", Side::Buy, dec!(10), 5, Some(dec!(180))).await;
    assert!(resting.is_ok());
    let parked = pipeline.order("b-2", "bob", Side::Buy, dec!(10), 5, Some(dec!(150))).await;
    assert!(parked.is_ok());

    let balance = pipeline.balance("bob").await;
    assert_eq!(decimal(&balance, "locked"), dec!(660));

    pipeline.price("BTC", dec!(175)).await;
    let cancelled = pipeline
        .call(EngineRequest::CancelOrder(CancelOrderRequest {
            user_id: UserId::from("bob"),
            order_id: OrderId::from("b-2"),
        }))
        .await;
    assert!(cancelled.is_ok());

    // b-1 filled at 175 with 350 margin, b-2's 300 reserve came back
    let balance = pipeline.balance("bob").await;
    assert_eq!(decimal(&balance, "locked"), dec!(350));
    assert_eq!(decimal(&balance, "available"), dec!(4650));

    let again = pipeline
        .call(EngineRequest::CancelOrder(CancelOrderRequest {
            user_id: UserId::from("bob"),
            order_id: OrderId::from("b-1"),
        }))
        .await;
    assert_eq!(again.error_body().unwrap().code, "INVALID_STATE");

    pipeline.stop().await;
}

#[tokio::test]
async fn price_drop_liquidates_leveraged_long() {
    let pipeline = Pipeline::memory().await;
    pipeline.deposit("carol", dec!(500)).await;
    pipeline.price("BTC", dec!(200)).await;
    assert!(pipeline.order("c-1", "carol", Side::Buy, dec!(50), 50, None).await.is_ok());

    pipeline.price("BTC", dec!(190)).await;
    let positions = pipeline
        .call(EngineRequest::GetPositions(UserQuery {
            user_id: UserId::from("carol"),
        }))
        .await;
    let position = &positions.data().unwrap()[0];
    assert_eq!(position["status"], "closed");
    assert_eq!(position["closeReason"], "liquidation");

    let balance = pipeline.balance("carol").await;
    assert_eq!(decimal(&balance, "locked"), Decimal::ZERO);
    assert_eq!(decimal(&balance, "available"), Decimal::ZERO);

    pipeline.stop().await;
}

#[tokio::test]
async fn malformed_entry_is_dead_lettered_and_pipeline_continues() {
    let store = Arc::new(MemoryLog::new());
    let pipeline = Pipeline::start(store.clone(), store.clone()).await;

    let poison = store
        .append(
            REQUESTS,
            vec![
                ("type".to_string(), "deposit".to_string()),
                ("reqId".to_string(), "poison".to_string()),
                ("data".to_string(), "{not json".to_string()),
            ],
        )
        .await
        .unwrap();

    let dead = dispatcher_config().dead_letter_stream();
    eventually(|| store.len(&dead) == 1).await;

    let entries = store.read_after(&dead, EntryId::ZERO, 10, None).await.unwrap();
    assert_eq!(entries[0].field("sourceId"), Some(poison.to_string().as_str()));
    assert_eq!(entries[0].field("deliveries"), Some("3"));
    assert_eq!(entries[0].field("reqId"), Some("poison"));

    assert!(pipeline.deposit("dave", dec!(1)).await.is_ok());

    let dispatcher = pipeline.stop().await;
    let stats = dispatcher.stats();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.malformed, 3);
    // acknowledged entries leave the pending list
    assert!(store.pending(REQUESTS, "engine_group").await.unwrap().is_empty());
}

#[tokio::test]
async fn response_append_retries_through_outage() {
    let store = Arc::new(MemoryLog::new());
    let flaky: Arc<dyn EventLog> = Arc::new(FlakyLog::new(store.clone(), 2, 0));
    let pipeline = Pipeline::start(store, flaky).await;

    assert!(pipeline.deposit("erin", dec!(50)).await.is_ok());

    let dispatcher = pipeline.stop().await;
    let stats = dispatcher.stats();
    assert_eq!(stats.responses_published, 1);
    assert_eq!(stats.publish_failures, 0);
}

#[tokio::test]
async fn caller_times_out_when_engine_is_down() {
    let log = Arc::new(MemoryLog::new());
    let correlator = RequestCorrelator::new(CorrelatorConfig {
        timeout: Duration::from_millis(50),
        ..correlator_config()
    });
    let client = EngineClient::new(log.clone(), correlator.clone(), REQUESTS);

    let result = client
        .call(&EngineRequest::GetBalance(UserQuery {
            user_id: UserId::from("alice"),
        }))
        .await;
    assert!(matches!(result, Err(ClientError::Correlation(CorrelationError::Timeout { .. }))));
    assert_eq!(correlator.pending_count(), 0);

    // the request is still durable; an engine started later applies it
    assert_eq!(log.len(REQUESTS), 1);
}

#[tokio::test]
async fn restart_rebuilds_state_and_skips_applied_entries() {
    let store = Arc::new(MemoryLog::new());

    // first run: the deposit is applied but its ack never lands
    let flaky: Arc<dyn EventLog> = Arc::new(FlakyLog::new(store.clone(), 0, u32::MAX));
    let mut first = StreamDispatcher::new(engine(), flaky, dispatcher_config());
    first.ensure_group().await.unwrap();
    let id = store.append(REQUESTS, deposit_fields("r-1", "alice", dec!(100))).await.unwrap();
    assert_eq!(first.poll_once().await.unwrap(), 1);
    assert_eq!(first.stats().ack_failures, 1);
    assert_eq!(store.pending(REQUESTS, "engine_group").await.unwrap().len(), 1);

    // second run: rebuild, then the redelivered entry is acknowledged without running again
    let mut second = StreamDispatcher::new(engine(), store.clone(), dispatcher_config());
    assert_eq!(second.recover().await.unwrap().last_applied, Some(id));
    assert_eq!(second.last_applied(), Some(id));

    second.poll_once().await.unwrap();
    let stats = second.stats();
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.processed, 0);
    assert!(store.pending(REQUESTS, "engine_group").await.unwrap().is_empty());

    let balance = second.engine().ledger().balance(&UserId::from("alice")).unwrap();
    assert_eq!(balance.available, Quote::new(dec!(100)));
}

#[tokio::test]
async fn request_never_delivered_before_restart_is_answered() {
    let store = Arc::new(MemoryLog::new());

    let mut first = StreamDispatcher::new(engine(), store.clone(), dispatcher_config());
    first.ensure_group().await.unwrap();
    let applied = store.append(REQUESTS, deposit_fields("r-old", "alice", dec!(100))).await.unwrap();
    assert_eq!(first.poll_once().await.unwrap(), 1);

    // lands while the engine is down
    store.append(REQUESTS, deposit_fields("r-new", "alice", dec!(50))).await.unwrap();

    let mut second = StreamDispatcher::new(engine(), store.clone(), dispatcher_config());
    let summary = second.recover().await.unwrap();
    assert_eq!(summary.last_applied, Some(applied));
    assert_eq!(summary.applied, 1);

    assert_eq!(second.poll_once().await.unwrap(), 1);
    let stats = second.stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(stats.responses_published, 1);

    let responses = store.read_after(RESPONSES, EntryId::ZERO, 10, None).await.unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[1].field("reqId"), Some("r-new"));

    let balance = second.engine().ledger().balance(&UserId::from("alice")).unwrap();
    assert_eq!(balance.available, Quote::new(dec!(150)));
}

#[tokio::test]
async fn group_never_polled_replays_nothing_on_restart() {
    let store = Arc::new(MemoryLog::new());
    let first = StreamDispatcher::new(engine(), store.clone(), dispatcher_config());
    first.ensure_group().await.unwrap();
    store.append(REQUESTS, deposit_fields("r-new", "alice", dec!(10))).await.unwrap();

    let mut second = StreamDispatcher::new(engine(), store.clone(), dispatcher_config());
    assert_eq!(second.recover().await.unwrap().applied, 0);
    assert_eq!(second.last_applied(), None);

    assert_eq!(second.poll_once().await.unwrap(), 1);
    let stats = second.stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(store.len(RESPONSES), 1);
}

#[tokio::test]
async fn ten_x_long_closed_at_sixty_doubles_the_deposit() {
    let pipeline = Pipeline::memory().await;
    assert!(pipeline.deposit("alice", dec!(1000)).await.is_ok());
    pipeline.price("BTC", dec!(50)).await;

    assert!(pipeline.order("o-1", "alice", Side::Buy, dec!(100), 10, None).await.is_ok());
    // 100 * 50 / 10
    let balance = pipeline.balance("alice").await;
    assert_eq!(decimal(&balance, "available"), dec!(500));
    assert_eq!(decimal(&balance, "locked"), dec!(500));

    pipeline.price("BTC", dec!(60)).await;
    let closed = pipeline
        .call(EngineRequest::ClosePosition(ClosePositionRequest {
            user_id: UserId::from("alice"),
            position_id: PositionId::from("pos_o-1"),
        }))
        .await;
    assert!(closed.is_ok());
    // (60 - 50) * 100
    assert_eq!(decimal(closed.data().unwrap(), "realizedPnl"), dec!(1000));

    let balance = pipeline.balance("alice").await;
    assert_eq!(decimal(&balance, "available"), dec!(2000));
    assert_eq!(decimal(&balance, "locked"), Decimal::ZERO);

    pipeline.stop().await;
}

#[tokio::test]
async fn oversized_values_are_rejected_and_pipeline_keeps_running() {
    let pipeline = Pipeline::memory().await;

    for _ in 0..2 {
        let rejected = pipeline.deposit("mallory", Decimal::MAX).await;
        assert_eq!(rejected.error_body().unwrap().code, "VALIDATION");
    }
    pipeline.price("BTC", Decimal::MAX).await;
    let order = pipeline.order("m-1", "mallory", Side::Buy, dec!(10), 2, None).await;
    assert_eq!(order.error_body().unwrap().code, "NO_PRICE");

    assert!(pipeline.deposit("mallory", dec!(10)).await.is_ok());
    let dispatcher = pipeline.stop().await;
    assert_eq!(dispatcher.stats().processed, 5);
}

#[tokio::test]
async fn rebuilt_engine_matches_live_engine() {
    let pipeline = Pipeline::memory().await;
    pipeline.deposit("alice", dec!(1000)).await;
    pipeline.deposit("bob", dec!(3000)).await;
    pipeline.price("BTC", dec!(100)).await;
    pipeline.order("a-1", "alice", Side::Buy, dec!(5), 10, None).await;
    pipeline.order("b-1", "bob", Side::Sell, dec!(10), 3, Some(dec!(120))).await;
    pipeline.price("BTC", dec!(121)).await;
    pipeline.order("a-2", "alice", Side::Sell, dec!(2), 2, None).await;
    pipeline.price("BTC", dec!(90)).await;
    pipeline.balance("alice").await;

    let store = pipeline.store.clone();
    let live = pipeline.stop().await.into_engine();

    let mut rebuilt = engine();
    rebuilt.rebuild(store.as_ref(), REQUESTS, 3).await.unwrap();

    for user in ["alice", "bob"] {
        let user = UserId::from(user);
        assert_eq!(live.ledger().balance(&user), rebuilt.ledger().balance(&user));
        assert_eq!(live.positions().user_positions(&user), rebuilt.positions().user_positions(&user));
        assert_eq!(live.orders().user_orders(&user), rebuilt.orders().user_orders(&user));
    }
    assert_eq!(live.ledger().total_bad_debt(), rebuilt.ledger().total_bad_debt());
}
