//! Margin engine simulation.
//!
//! Runs the dispatcher and the response reader against the in-memory broker and drives
//! them through an `EngineClient`, the same way an API tier would.

use anyhow::Context;
use margin_engine::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct Sim {
    log: Arc<MemoryLog>,
    client: EngineClient,
    config: AppConfig,
}

impl Sim {
    async fn call(&self, request: EngineRequest) -> anyhow::Result<EngineResponse> {
        let response = self.client.call(&request).await?;
        match response.error_body() {
            None => println!("  {:<15} ok", response.kind),
            Some(err) => println!("  {:<15} {} ({})", response.kind, err.code, err.message),
        }
        Ok(response)
    }

    async fn price(&self, symbol: &str, price: Decimal) -> anyhow::Result<()> {
        self.client
            .submit(&EngineRequest::PriceUpdate(PriceUpdateRequest {
                symbol: Symbol::from(symbol),
                price,
            }))
            .await?;
        println!("  {symbol} -> {price}");
        Ok(())
    }

    async fn deposit(&self, user: &str, amount: Decimal) -> anyhow::Result<()> {
        self.call(EngineRequest::Deposit(DepositRequest {
            user_id: UserId::from(user),
            amount: Quote::new(amount),
        }))
        .await?;
        Ok(())
    }

    async fn market(&self, order_id: &str, user: &str, side: Side, size: Decimal, leverage: u32) -> anyhow::Result<EngineResponse> {
        self.call(EngineRequest::OpenOrder(OpenOrderRequest {
            order_id: OrderId::from(order_id),
            user_id: UserId::from(user),
            symbol: Symbol::from("BTC"),
            side,
            order_type: OrderType::Market,
            size,
            leverage,
            limit_price: None,
        }))
        .await
    }

    async fn limit(&self, order_id: &str, user: &str, side: Side, size: Decimal, leverage: u32, price: Decimal) -> anyhow::Result<EngineResponse> {
        self.call(EngineRequest::OpenOrder(OpenOrderRequest {
            order_id: OrderId::from(order_id),
            user_id: UserId::from(user),
            symbol: Symbol::from("BTC"),
            side,
            order_type: OrderType::Limit,
            size,
            leverage,
            limit_price: Some(price),
        }))
        .await
    }

    async fn balance(&self, user: &str) -> anyhow::Result<()> {
        let response = self
            .call(EngineRequest::GetBalance(UserQuery {
                user_id: UserId::from(user),
            }))
            .await?;
        let data = response.data().context("balance query failed")?;
        println!(
            "  {user}: available {} locked {} unrealized {}",
            data["available"].as_str().unwrap_or("?"),
            data["locked"].as_str().unwrap_or("?"),
            data["unrealizedPnl"].as_str().unwrap_or("?"),
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    println!("Margin Engine Simulation");
    println!("Request log in, response log out\n");

    let config = AppConfig::load_default();
    let log = Arc::new(MemoryLog::with_config(config.log_config()));
    let engine = Engine::new(config.engine.clone(), Arc::new(config.risk.clone()));
    let mut dispatcher = StreamDispatcher::new(engine, log.clone(), config.dispatcher_config());
    if config.cache.enabled {
        dispatcher = dispatcher.with_cache(log.clone());
    }
    let correlator = RequestCorrelator::new(config.correlator_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_task = tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    let start = log.tail_id(&config.streams.response).await?;
    let reader_task = tokio::spawn(correlator.clone().run_from(log.clone(), start, shutdown_rx));

    let sim = Sim {
        client: EngineClient::new(log.clone(), correlator, config.streams.request.clone()),
        log: log.clone(),
        config,
    };

    scenario_1_open_and_close(&sim).await?;
    scenario_2_limit_orders(&sim).await?;
    scenario_3_liquidation(&sim).await?;
    scenario_4_rejections(&sim).await?;

    shutdown_tx.send(true)?;
    let dispatcher = dispatcher_task.await?;
    reader_task.await?;

    let stats = dispatcher.stats();
    println!(
        "\nDispatcher: {} processed, {} responses, {} dead-lettered",
        stats.processed, stats.responses_published, stats.dead_lettered
    );

    scenario_5_rebuild(&sim, dispatcher.into_engine()).await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

/// Deposit, open a 2x long, close it after the price doubles.
async fn scenario_1_open_and_close(sim: &Sim) -> anyhow::Result<()> {
    println!("Scenario 1: Open and Close\n");

    sim.deposit("alice", dec!(1000)).await?;
    sim.price("BTC", dec!(100)).await?;
    sim.market("a-1", "alice", Side::Buy, dec!(10), 2).await?;
    sim.balance("alice").await?;

    sim.price("BTC", dec!(200)).await?;
    sim.balance("alice").await?;
    sim.call(EngineRequest::ClosePosition(ClosePositionRequest {
        user_id: UserId::from("alice"),
        position_id: PositionId::from("pos_a-1"),
    }))
    .await?;
    sim.balance("alice").await?;
    println!();
    Ok(())
}

/// A resting buy limit fills when the price dips. A second one is cancelled.
async fn scenario_2_limit_orders(sim: &Sim) -> anyhow::Result<()> {
    println!("Scenario 2: Limit Orders\n");

    sim.deposit("bob", dec!(5000)).await?;
    sim.limit("b-1", "bob", Side::Buy, dec!(10), 5, dec!(180)).await?;
    sim.limit("b-2", "bob", Side::Buy, dec!(10), 5, dec!(150)).await?;
    sim.balance("bob").await?;

    sim.price("BTC", dec!(175)).await?;
    sim.call(EngineRequest::CancelOrder(CancelOrderRequest {
        user_id: UserId::from("bob"),
        order_id: OrderId::from("b-2"),
    }))
    .await?;
    sim.balance("bob").await?;

    let orders = sim
        .call(EngineRequest::GetOrders(UserQuery {
            user_id: UserId::from("bob"),
        }))
        .await?;
    if let Some(list) = orders.data().and_then(|d| d.as_array()) {
        for order in list {
            println!("    {} {}", order["orderId"], order["status"]);
        }
    }
    println!();
    Ok(())
}

/// A 50x long is wiped out by a 5% drop.
async fn scenario_3_liquidation(sim: &Sim) -> anyhow::Result<()> {
    println!("Scenario 3: Liquidation\n");

    sim.deposit("carol", dec!(500)).await?;
    sim.price("BTC", dec!(200)).await?;
    let opened = sim.market("c-1", "carol", Side::Buy, dec!(50), 50).await?;
    if let Some(position) = opened.data().map(|d| &d["position"]) {
        println!("  liquidation price {}", position["liquidationPrice"]);
    }

    sim.price("BTC", dec!(190)).await?;
    let positions = sim
        .call(EngineRequest::GetPositions(UserQuery {
            user_id: UserId::from("carol"),
        }))
        .await?;
    if let Some(list) = positions.data().and_then(|d| d.as_array()) {
        for position in list {
            println!(
                "    {} {} pnl {}",
                position["positionId"], position["closeReason"], position["realizedPnl"]
            );
        }
    }
    sim.balance("carol").await?;
    println!();
    Ok(())
}

/// Requests the engine refuses still get an answer. Undecodable ones do not.
async fn scenario_4_rejections(sim: &Sim) -> anyhow::Result<()> {
    println!("Scenario 4: Rejections\n");

    sim.market("d-1", "dave", Side::Sell, dec!(1), 10).await?;
    sim.deposit("dave", dec!(10)).await?;
    sim.market("d-2", "dave", Side::Sell, dec!(10), 10).await?;
    sim.market("d-3", "dave", Side::Sell, dec!(1), 500).await?;
    sim.call(EngineRequest::Unknown {
        tag: "withdraw".to_string(),
    })
    .await?;

    let cached = sim.log.history(&orders_key("dave")).await?;
    println!("  cached order updates for dave: {}", cached.len());

    // an entry that never decodes is retried, then parked on the dead-letter stream
    let poison = sim
        .log
        .append(
            &sim.config.streams.request,
            vec![
                ("type".to_string(), "deposit".to_string()),
                ("reqId".to_string(), "poison".to_string()),
                ("data".to_string(), "{not json".to_string()),
            ],
        )
        .await?;
    let dead = sim.config.dispatcher_config().dead_letter_stream();
    let mut waited = 0;
    while sim.log.len(&dead) == 0 && waited < 200 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        waited += 1;
    }
    println!("  poison entry {poison}: {} dead-lettered", sim.log.len(&dead));
    println!();
    Ok(())
}

/// A fresh engine replaying the request log ends up where the live one did.
async fn scenario_5_rebuild(sim: &Sim, live: Engine) -> anyhow::Result<()> {
    println!("\nScenario 5: Rebuild From Log\n");

    let mut rebuilt = Engine::new(sim.config.engine.clone(), Arc::new(sim.config.risk.clone()));
    let summary = rebuilt
        .rebuild(sim.log.as_ref(), &sim.config.streams.request, 100)
        .await?;
    println!(
        "  replayed {} entries through {}",
        summary.applied,
        summary.last_applied.map(|id| id.to_string()).unwrap_or_default()
    );

    for user in ["alice", "bob", "carol", "dave"] {
        let user = UserId::from(user);
        let same = live.ledger().balance(&user) == rebuilt.ledger().balance(&user);
        println!("  {user}: {}", if same { "matches" } else { "DIFFERS" });
    }
    println!(
        "  open positions: live {} rebuilt {}",
        live.positions().open_count(),
        rebuilt.positions().open_count()
    );
    Ok(())
}
