//! The strategy runtime.
//!
//! Each strategy is an independent actor: one owning tokio task driven by the
//! book stream, engine events, and timers, with a watch-based stop signal
//! honoured at every suspension point. Parents hold child ids; children send
//! lifecycle reports up through channels. No back-pointers.

pub mod chase;
pub mod registry;
pub mod scalper;
pub mod trail_stop;
pub mod twap;
pub mod twap_basket;

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::{
    config::Config,
    engine::ExecutionClient,
    feeds::PriceFeed,
    models::{StrategyEvent, StrategyStatus},
    risk_book::RiskBook,
    store::SnapshotStore,
};

pub use registry::StrategyRegistry;

/// Shared collaborators handed to every strategy actor.
#[derive(Clone)]
pub struct StrategyCtx {
    pub engine: ExecutionClient,
    pub feed: Arc<PriceFeed>,
    pub store: SnapshotStore,
    pub risk: Arc<RiskBook>,
    pub events: broadcast::Sender<StrategyEvent>,
    pub config: Arc<Config>,
}

impl StrategyCtx {
    pub fn emit(&self, event: StrategyEvent) {
        // Nobody listening is fine; the bus is fan-out only.
        let _ = self.events.send(event);
    }

    pub fn emit_lifecycle(
        &self,
        kind: &str,
        suffix: &str,
        sub_account: &str,
        strategy_id: &str,
        payload: Value,
    ) {
        self.emit(StrategyEvent::new(
            format!("{kind}_{suffix}"),
            sub_account,
            strategy_id,
            payload,
        ));
    }
}

/// A stop request carried on the watch channel. `close` asks the strategy to
/// also flatten its inventory where that is meaningful (scalper).
#[derive(Debug, Clone, Default)]
pub struct StopRequest {
    pub reason: String,
    pub close: bool,
}

/// Receiver half of the stop signal. Cheap to clone into child tasks.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<Option<StopRequest>>,
}

impl StopSignal {
    pub fn channel() -> (watch::Sender<Option<StopRequest>>, StopSignal) {
        let (tx, rx) = watch::channel(None);
        (tx, StopSignal { rx })
    }

    pub fn requested(&self) -> Option<StopRequest> {
        self.rx.borrow().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Resolve when a stop is requested. Never resolves otherwise.
    pub async fn wait(&mut self) -> StopRequest {
        loop {
            if let Some(req) = self.rx.borrow_and_update().clone() {
                return req;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped: treat as a silent stop.
                return StopRequest {
                    reason: "registry_dropped".to_string(),
                    close: false,
                };
            }
        }
    }
}

/// State shared between an actor and the registry for list/get queries.
#[derive(Debug)]
pub struct SharedState {
    status: RwLock<StrategyStatus>,
    snapshot: RwLock<Value>,
}

impl SharedState {
    pub fn new(initial: Value) -> Arc<Self> {
        Arc::new(Self {
            status: RwLock::new(StrategyStatus::Created),
            snapshot: RwLock::new(initial),
        })
    }

    pub fn status(&self) -> StrategyStatus {
        *self.status.read()
    }

    /// Monotone toward terminal states; a terminal strategy never resumes.
    /// Returns false when the transition was refused.
    pub fn set_status(&self, next: StrategyStatus) -> bool {
        let mut status = self.status.write();
        if status.is_terminal() {
            return false;
        }
        *status = next;
        true
    }

    pub fn snapshot(&self) -> Value {
        self.snapshot.read().clone()
    }

    pub fn update_snapshot(&self, value: Value) {
        *self.snapshot.write() = value;
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::engine::{EngineLink, ExecutionClient, PaperEngineConfig, PaperEngineLink};
    use crate::feeds::BookTick;

    pub(crate) struct PaperHarness {
        pub ctx: StrategyCtx,
        pub link: Arc<crate::engine::PaperEngineLink>,
        pub feed: Arc<PriceFeed>,
    }

    /// Paper-engine context for actor tests. Must be built inside a tokio
    /// runtime (the paper matcher and risk consumer are spawned tasks).
    pub(crate) fn paper_harness() -> PaperHarness {
        let feed = PriceFeed::new("http://unused");
        let link = PaperEngineLink::new(Arc::clone(&feed), PaperEngineConfig::default());
        let risk = crate::risk_book::RiskBook::new();
        risk.spawn_consumer(link.subscribe());
        let (events, _) = broadcast::channel(1024);
        let ctx = StrategyCtx {
            engine: ExecutionClient::new(Arc::clone(&link) as Arc<dyn EngineLink>),
            feed: Arc::clone(&feed),
            store: SnapshotStore::open_in_memory().unwrap(),
            risk,
            events,
            config: Arc::new(Config::default()),
        };
        PaperHarness { ctx, link, feed }
    }

    pub(crate) fn tick_at(mid: f64) -> BookTick {
        BookTick {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            mark: mid,
            bid: mid - 0.5,
            ask: mid + 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotone() {
        let shared = SharedState::new(Value::Null);
        assert_eq!(shared.status(), StrategyStatus::Created);
        assert!(shared.set_status(StrategyStatus::Active));
        assert!(shared.set_status(StrategyStatus::Completed));
        // Terminal: no further transitions observable.
        assert!(!shared.set_status(StrategyStatus::Active));
        assert!(!shared.set_status(StrategyStatus::Stopped));
        assert_eq!(shared.status(), StrategyStatus::Completed);
    }

    #[tokio::test]
    async fn stop_signal_resolves_once_requested() {
        let (tx, mut signal) = StopSignal::channel();
        assert!(!signal.is_stopped());

        tx.send(Some(StopRequest {
            reason: "user".to_string(),
            close: true,
        }))
        .unwrap();

        let req = signal.wait().await;
        assert_eq!(req.reason, "user");
        assert!(req.close);
        assert!(signal.is_stopped());
    }
}
