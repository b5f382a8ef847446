//! End-to-end runtime tests against the in-process paper engine.
//!
//! Each test wires the full collaborator set (feed, paper link, risk book,
//! snapshot store, registry) and drives strategies through pushed book ticks.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::sync::broadcast;

use perpbot_backend::{
    config::Config,
    engine::{EngineLink, ExecutionClient, PaperEngineConfig, PaperEngineLink},
    feeds::{BookTick, PriceFeed},
    models::{Side, StrategyEvent},
    risk_book::RiskBook,
    store::{resume_all, twap_key, SnapshotStore},
    strategies::{
        scalper::{PnlFeedbackMode, ScalperParams},
        trail_stop::TrailStopParams,
        twap::TwapParams,
        StrategyCtx, StrategyRegistry,
    },
};

struct Harness {
    registry: Arc<StrategyRegistry>,
    feed: Arc<PriceFeed>,
    link: Arc<PaperEngineLink>,
    events: broadcast::Receiver<StrategyEvent>,
}

fn tick_at(mid: f64) -> BookTick {
    BookTick {
        ts_ms: chrono::Utc::now().timestamp_millis(),
        mark: mid,
        bid: mid - 0.5,
        ask: mid + 0.5,
    }
}

fn harness() -> Harness {
    let feed = PriceFeed::new("http://unused");
    let link = PaperEngineLink::new(Arc::clone(&feed), PaperEngineConfig::default());
    let risk = RiskBook::new();
    risk.spawn_consumer(link.subscribe());
    let (events_tx, events) = broadcast::channel(4096);

    let ctx = StrategyCtx {
        engine: ExecutionClient::new(Arc::clone(&link) as Arc<dyn EngineLink>),
        feed: Arc::clone(&feed),
        store: SnapshotStore::open_in_memory().unwrap(),
        risk,
        events: events_tx,
        config: Arc::new(Config::default()),
    };
    Harness {
        registry: StrategyRegistry::new(ctx),
        feed,
        link,
        events,
    }
}

/// Let spawned tasks make progress; with paused time this advances virtual
/// clocks instantly once the runtime is idle.
async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn twap_params() -> TwapParams {
    serde_json::from_value(json!({
        "subAccountId": "acct",
        "symbol": "BTCUSDT",
        "side": "long",
        "totalSize": 40.0,
        "lots": 2,
        "durationMinutes": 1,
        "leverage": 5.0,
    }))
    .unwrap()
}

fn scalper_params() -> ScalperParams {
    ScalperParams {
        sub_account: "acct".into(),
        symbol: "BTCUSDT".into(),
        start_side: Side::Neutral,
        leverage: 3.0,
        long_offset_pct: 0.3,
        short_offset_pct: 0.3,
        child_count: 1,
        skew: 0.0,
        long_size_usd: 50.0,
        short_size_usd: 50.0,
        neutral_mode: true,
        close_only: false,
        min_fill_spread_pct: 0.0,
        fill_decay_half_life_ms: 30_000,
        min_refill_delay_ms: 1_000,
        max_fills_per_minute: 30,
        allow_loss: false,
        max_loss_per_close_bps: 10.0,
        pnl_feedback_mode: PnlFeedbackMode::Off,
        long_max_price: None,
        short_min_price: None,
    }
}

#[tokio::test(start_paused = true)]
async fn twap_completes_and_cleans_its_snapshot() {
    let mut h = harness();
    h.feed.push_tick("BTCUSDT", tick_at(100.0));

    let id = h.registry.start_twap(twap_params()).unwrap();
    let key = twap_key(&id);

    // Both lots fire within the (virtual) minute.
    settle(90_000).await;

    let position = h
        .link
        .position("acct", "BTCUSDT", Side::Long)
        .expect("twap accumulated a long position");
    assert!(position.quantity > 0.0);

    // Terminal: registry entry removed, durable record deleted.
    assert!(h.registry.get(&id).is_none());
    assert!(h
        .registry
        .ctx()
        .store
        .get(&key)
        .await
        .unwrap()
        .is_none());

    // A completed event was broadcast for the account.
    let mut saw_completed = false;
    while let Ok(event) = h.events.try_recv() {
        assert_eq!(event.sub_account, "acct");
        if event.event == "twap_completed" && event.strategy_id == id {
            saw_completed = true;
        }
    }
    assert!(saw_completed);
}

#[tokio::test(start_paused = true)]
async fn twap_stop_is_idempotent_and_emits_one_terminal_event() {
    let mut h = harness();
    h.feed.push_tick("BTCUSDT", tick_at(100.0));

    let id = h.registry.start_twap(twap_params()).unwrap();
    settle(50).await;

    h.registry.stop(&id, "test", false, None).unwrap();
    settle(200).await;
    // Second stop: the entry may already be gone (no-op either way).
    let _ = h.registry.stop(&id, "test-again", false, None);
    settle(200).await;

    let mut terminal_events = 0;
    while let Ok(event) = h.events.try_recv() {
        if event.strategy_id == id && event.event == "twap_cancelled" {
            terminal_events += 1;
        }
    }
    assert_eq!(terminal_events, 1);
    assert!(h.registry.get(&id).is_none());
    // Cancel returns the store to its pre-start state.
    assert!(h
        .registry
        .ctx()
        .store
        .get(&twap_key(&id))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn chase_reprices_toward_falling_bid_then_fills() {
    let mut h = harness();
    h.feed.push_tick("BTCUSDT", tick_at(100.0));

    let id = h
        .registry
        .start_chase(serde_json::from_value(json!({
            "subAccountId": "acct",
            "symbol": "BTCUSDT",
            "side": "long",
            "qty": 1.0,
            "leverage": 5.0,
            "stalkOffsetPct": 0.5,
        })).unwrap())
        .unwrap();
    settle(50).await;

    // Walk the book down so the working order reprices.
    for mid in [99.0, 98.0, 97.0] {
        h.feed.push_tick("BTCUSDT", tick_at(mid));
        settle(50).await;
    }
    let snapshot = h.registry.get(&id).expect("chase still live");
    assert!(snapshot["repriceCount"].as_u64().unwrap() >= 1);
    assert_eq!(h.link.open_order_count("BTCUSDT"), 1);

    // Crash through the working price: the chase fills and completes.
    h.feed.push_tick("BTCUSDT", tick_at(90.0));
    settle(200).await;

    assert!(h.registry.get(&id).is_none());
    assert!(h.link.position("acct", "BTCUSDT", Side::Long).is_some());

    let mut saw_fill = false;
    while let Ok(event) = h.events.try_recv() {
        if event.strategy_id == id && event.event == "chase_completed" {
            saw_fill = true;
        }
    }
    assert!(saw_fill);
}

#[tokio::test(start_paused = true)]
async fn trail_stop_triggers_reduce_only_close() {
    let mut h = harness();
    h.feed.push_tick("BTCUSDT", tick_at(100.0));

    // Seed a long position through the engine channel.
    h.link
        .execute(
            "trade",
            "seed",
            json!({
                "subAccountId": "acct", "symbol": "BTCUSDT", "side": "long",
                "qty": 1.0, "fillPrice": 100.0, "skipExchange": true,
            }),
        )
        .await
        .unwrap();
    settle(50).await;

    let position_id = h
        .registry
        .ctx()
        .risk
        .position("acct", "BTCUSDT", Side::Long)
        .expect("risk book saw the fill")
        .position_id;

    let id = h
        .registry
        .start_trail_stop(TrailStopParams {
            sub_account: "acct".into(),
            position_id: position_id.clone(),
            callback_pct: 2.0,
            activation_price: Some(105.0),
        })
        .unwrap();

    // Duplicate trail on the same position is a conflict.
    let dup = h.registry.start_trail_stop(TrailStopParams {
        sub_account: "acct".into(),
        position_id: position_id.clone(),
        callback_pct: 2.0,
        activation_price: None,
    });
    assert!(dup.is_err());

    settle(50).await;
    for mid in [102.0, 106.0, 110.0, 108.0, 107.9] {
        h.feed.push_tick("BTCUSDT", tick_at(mid));
        settle(20).await;
    }
    // 107.9 sits above the 107.8 trigger: still armed.
    assert!(h.registry.get(&id).is_some());

    h.feed.push_tick("BTCUSDT", tick_at(107.5));
    settle(200).await;

    // Triggered: reduce-only close flattened the position.
    assert!(h.registry.get(&id).is_none());
    assert!(h.link.position("acct", "BTCUSDT", Side::Long).is_none());

    let mut saw_triggered = false;
    while let Ok(event) = h.events.try_recv() {
        if event.strategy_id == id && event.event == "trail_stop_triggered" {
            saw_triggered = true;
            assert_eq!(event.payload["reason"], "TRAIL_STOP");
        }
    }
    assert!(saw_triggered);
}

#[tokio::test(start_paused = true)]
async fn scalper_quotes_both_sides_and_refills_after_fill() {
    let mut h = harness();
    h.feed.push_tick("BTCUSDT", tick_at(100.0));

    let id = h.registry.start_scalper(scalper_params()).unwrap();
    settle(100).await;

    // One long and one short layer resting.
    assert_eq!(h.link.open_order_count("BTCUSDT"), 2);
    let snapshot = h.registry.get(&id).expect("scalper live");
    assert_eq!(snapshot["longLayers"].as_array().unwrap().len(), 1);
    assert_eq!(snapshot["shortLayers"].as_array().unwrap().len(), 1);

    // Dip through the long layer (~99.2): it fills and later refills.
    h.feed.push_tick("BTCUSDT", tick_at(98.5));
    settle(100).await;

    let snapshot = h.registry.get(&id).expect("scalper live");
    assert!(snapshot["fillCount"].as_u64().unwrap() >= 1);
    assert!(h.link.position("acct", "BTCUSDT", Side::Long).is_some());

    // The freed slot respawns a replacement chase.
    settle(2_000).await;
    assert_eq!(h.link.open_order_count("BTCUSDT"), 2);

    h.registry.stop(&id, "test", false, None).unwrap();
    settle(200).await;
    assert!(h.registry.get(&id).is_none());
    assert_eq!(h.link.open_order_count("BTCUSDT"), 0);
}

#[tokio::test(start_paused = true)]
async fn resume_fast_forwards_twap_past_downtime() {
    let h = harness();
    h.feed.push_tick("BTCUSDT", tick_at(100.0));

    // Persist a mid-flight TWAP that was down for 17 of its 20 minutes.
    let now = chrono::Utc::now().timestamp_millis();
    let interval_ms = 2 * 60 * 1_000u64;
    let started_at = now - 17 * 60 * 1_000;
    let params = serde_json::from_value::<TwapParams>(json!({
        "subAccountId": "acct",
        "symbol": "BTCUSDT",
        "side": "long",
        "totalSize": 100.0,
        "lots": 10,
        "durationMinutes": 20,
        "leverage": 5.0,
    }))
    .unwrap();
    let snapshot = json!({
        "id": "resumed-twap",
        "params": params,
        "status": "active",
        "runtime": {
            "totalSize": 100.0,
            "totalLots": 10,
            "filledLots": 4,
            "filledSize": 40.0,
            "lotSizes": vec![10.0; 10],
            "intervalMs": interval_ms,
            "jitter": false,
            "irregular": false,
            "priceLimit": null,
            "skippedTicks": 0,
            "results": [],
            "errors": [],
            "nextOrderAt": started_at + 5 * interval_ms as i64,
            "startedAt": started_at,
        },
    });
    let store = h.registry.ctx().store.clone();
    store
        .put(&twap_key("resumed-twap"), "twap", "acct", &snapshot, 12)
        .await
        .unwrap();

    let stats = resume_all(&h.registry).await.unwrap();
    assert_eq!(stats.resumed, 1);
    settle(100).await;

    let snapshot = h.registry.get(&"resumed-twap".to_string()).expect("resumed");
    // min(10, floor(17/2)) = 8; progress never regresses.
    assert_eq!(snapshot["runtime"]["filledLots"].as_u64().unwrap(), 8);

    // Lots 9 and 10 run on the next boundaries and the schedule completes.
    settle(5 * 60 * 1_000).await;
    assert!(h.registry.get(&"resumed-twap".to_string()).is_none());
    assert!(store.get(&twap_key("resumed-twap")).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn engine_per_kind_cap_yields_limit_exceeded() {
    let h = harness();
    h.feed.push_tick("BTCUSDT", tick_at(100.0));

    // Shrink the cap via a custom config.
    let mut config = Config::default();
    config.max_twap = 1;
    let ctx = StrategyCtx {
        config: Arc::new(config),
        ..h.registry.ctx().clone()
    };
    let registry = StrategyRegistry::new(ctx);

    registry.start_twap(twap_params()).unwrap();
    let second = registry.start_twap(twap_params());
    assert!(matches!(
        second,
        Err(perpbot_backend::EngineError::LimitExceeded(_))
    ));
}
