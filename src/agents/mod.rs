//! Strategy agents.
//!
//! An agent is a tagged variant over {trend, grid, deleverage} behind a small
//! capability interface: `on_tick`, `on_position_update`, `status`. Its only
//! execution primitive is spawning and killing scalpers by tag through the
//! registry; agents never place raw orders.

pub mod deleverage;
pub mod grid;
pub mod trend;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    engine::EngineEvent,
    error::{EngineError, EngineResult},
    feeds::{BookTick, TradeUpdate},
    models::{Position, StrategyId, StrategyStatus},
    strategies::{scalper::ScalperParams, SharedState, StopSignal, StrategyCtx, StrategyRegistry},
};

use deleverage::{DeleverageAgent, DeleverageParams};
use grid::{GridAgent, GridParams};
use trend::{TrendAgent, TrendParams};

pub const KIND: &str = "agent";

/// Status broadcasts are throttled to roughly this cadence.
const STATUS_BROADCAST_EVERY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentSpec {
    Trend(TrendParams),
    Grid(GridParams),
    Deleverage(DeleverageParams),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentParams {
    pub sub_account: String,
    pub symbol: String,
    #[serde(flatten)]
    pub spec: AgentSpec,
}

pub fn validate(params: &AgentParams) -> EngineResult<()> {
    if params.sub_account.is_empty() || params.symbol.is_empty() {
        return Err(EngineError::validation("subAccountId and symbol are required"));
    }
    match &params.spec {
        AgentSpec::Trend(p) => trend::validate(p),
        AgentSpec::Grid(p) => grid::validate(p),
        AgentSpec::Deleverage(p) => deleverage::validate(p),
    }
}

/// What an agent asks of its driver after handling an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentAction {
    Continue,
    /// Self-termination with a reason (hard stop, trailing stop, widen cap).
    StopSelf(String),
}

/// Execution surface handed to agents: scalper spawn/kill by tag, plus the
/// shared collaborators for reads.
pub struct AgentCx {
    pub registry: Arc<StrategyRegistry>,
    pub ctx: StrategyCtx,
    pub agent_id: StrategyId,
    pub sub_account: String,
    pub symbol: String,
    pub tick_count: u64,
    managed: HashMap<String, StrategyId>,
}

impl AgentCx {
    fn new(
        registry: Arc<StrategyRegistry>,
        agent_id: StrategyId,
        sub_account: String,
        symbol: String,
    ) -> Self {
        let ctx = registry.ctx().clone();
        Self {
            registry,
            ctx,
            agent_id,
            sub_account,
            symbol,
            tick_count: 0,
            managed: HashMap::new(),
        }
    }

    pub fn managed_scalpers(&self) -> &HashMap<String, StrategyId> {
        &self.managed
    }

    pub fn has_live_scalper(&self, tag: &str) -> bool {
        self.managed
            .get(tag)
            .map(|id| self.registry.is_live(id))
            .unwrap_or(false)
    }

    /// Spawn a scalper under `tag`. A live scalper under the same tag is a
    /// conflict; a dead one is replaced.
    pub fn spawn_scalper(&mut self, tag: &str, params: ScalperParams) -> EngineResult<StrategyId> {
        if self.has_live_scalper(tag) {
            return Err(EngineError::Conflict(format!(
                "agent {} already runs a scalper tagged {tag}",
                self.agent_id
            )));
        }
        let id = self.registry.start_scalper(params)?;
        debug!(agent = %self.agent_id, tag, scalper = %id, "agent spawned scalper");
        self.managed.insert(tag.to_string(), id.clone());
        Ok(id)
    }

    /// The agent is the sole authority that kills its scalpers.
    pub fn kill_scalper(&mut self, tag: &str, close: bool) {
        if let Some(id) = self.managed.remove(tag) {
            if let Err(e) = self.registry.stop(&id, "agent_kill", close, None) {
                debug!(agent = %self.agent_id, tag, scalper = %id, error = %e, "kill scalper");
            }
        }
    }

    fn kill_all(&mut self, close: bool) {
        let tags: Vec<String> = self.managed.keys().cloned().collect();
        for tag in tags {
            self.kill_scalper(&tag, close);
        }
    }
}

/// Tagged dispatch over the agent kinds.
pub enum AgentImpl {
    Trend(TrendAgent),
    Grid(GridAgent),
    Deleverage(DeleverageAgent),
}

impl AgentImpl {
    fn create(spec: &AgentSpec) -> Self {
        match spec {
            AgentSpec::Trend(p) => AgentImpl::Trend(TrendAgent::new(p.clone())),
            AgentSpec::Grid(p) => AgentImpl::Grid(GridAgent::new(p.clone())),
            AgentSpec::Deleverage(p) => AgentImpl::Deleverage(DeleverageAgent::new(p.clone())),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            AgentImpl::Trend(_) => "trend",
            AgentImpl::Grid(_) => "grid",
            AgentImpl::Deleverage(_) => "deleverage",
        }
    }

    async fn on_start(&mut self, cx: &mut AgentCx) -> EngineResult<()> {
        match self {
            AgentImpl::Grid(agent) => agent.on_start(cx),
            AgentImpl::Trend(_) | AgentImpl::Deleverage(_) => Ok(()),
        }
    }

    async fn on_tick(&mut self, cx: &mut AgentCx, tick: &BookTick) -> AgentAction {
        match self {
            AgentImpl::Trend(agent) => agent.on_tick(cx, tick).await,
            AgentImpl::Grid(agent) => agent.on_tick(cx, tick),
            AgentImpl::Deleverage(agent) => agent.on_tick(cx, tick),
        }
    }

    fn on_trade(&mut self, trade: &TradeUpdate) {
        if let AgentImpl::Trend(agent) = self {
            agent.on_trade(trade);
        }
    }

    fn on_position_update(&mut self, position: &Position) {
        match self {
            AgentImpl::Trend(agent) => agent.on_position_update(position),
            AgentImpl::Grid(agent) => agent.on_position_update(position),
            AgentImpl::Deleverage(agent) => agent.on_position_update(position),
        }
    }

    fn status(&self, cx: &AgentCx) -> Value {
        let mut status = match self {
            AgentImpl::Trend(agent) => agent.status(),
            AgentImpl::Grid(agent) => agent.status(),
            AgentImpl::Deleverage(agent) => agent.status(),
        };
        if let Value::Object(ref mut map) = status {
            map.insert("type".into(), json!(self.type_name()));
            map.insert("tickCount".into(), json!(cx.tick_count));
            map.insert("managedScalpers".into(), json!(cx.managed));
        }
        status
    }
}

pub async fn run(
    registry: Arc<StrategyRegistry>,
    id: StrategyId,
    params: AgentParams,
    mut stop: StopSignal,
    shared: Arc<SharedState>,
) {
    let mut agent = AgentImpl::create(&params.spec);
    let mut cx = AgentCx::new(
        registry,
        id.clone(),
        params.sub_account.clone(),
        params.symbol.clone(),
    );
    let ctx = cx.ctx.clone();

    ctx.feed.retain(&params.symbol);
    shared.set_status(StrategyStatus::Active);

    if let Err(e) = agent.on_start(&mut cx).await {
        warn!(agent = %id, error = %e, "agent failed to start");
        shared.set_status(StrategyStatus::Stopped);
        ctx.emit_lifecycle(
            KIND,
            "error",
            &params.sub_account,
            &id,
            json!({ "error": e.to_string() }),
        );
        ctx.feed.release(&params.symbol);
        return;
    }

    shared.update_snapshot(agent.status(&cx));
    ctx.emit_lifecycle(
        KIND,
        "started",
        &params.sub_account,
        &id,
        json!({ "type": agent.type_name(), "symbol": params.symbol }),
    );
    info!(agent = %id, kind = agent.type_name(), symbol = %params.symbol, "agent running");

    let mut book_rx = ctx.feed.subscribe();
    let mut trade_rx = ctx.feed.subscribe_trades();
    let mut engine_rx = ctx.engine.subscribe_events();
    let mut last_broadcast = Instant::now();

    loop {
        tokio::select! {
            req = stop.wait() => {
                cx.kill_all(req.close);
                if shared.set_status(StrategyStatus::Stopped) {
                    ctx.emit_lifecycle(
                        KIND,
                        "cancelled",
                        &params.sub_account,
                        &id,
                        json!({ "reason": req.reason }),
                    );
                }
                break;
            }
            update = book_rx.recv() => {
                match update {
                    Ok(update) if update.symbol == params.symbol => {
                        cx.tick_count += 1;
                        match agent.on_tick(&mut cx, &update.tick).await {
                            AgentAction::Continue => {}
                            AgentAction::StopSelf(reason) => {
                                cx.kill_all(false);
                                if shared.set_status(StrategyStatus::Stopped) {
                                    ctx.emit_lifecycle(
                                        KIND,
                                        "cancelled",
                                        &params.sub_account,
                                        &id,
                                        json!({ "reason": reason }),
                                    );
                                }
                                break;
                            }
                        }
                        shared.update_snapshot(agent.status(&cx));
                        if last_broadcast.elapsed() >= STATUS_BROADCAST_EVERY {
                            last_broadcast = Instant::now();
                            ctx.emit_lifecycle(
                                KIND,
                                "progress",
                                &params.sub_account,
                                &id,
                                agent.status(&cx),
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(agent = %id, missed = n, "agent lagged book updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        cx.kill_all(false);
                        shared.set_status(StrategyStatus::Stopped);
                        break;
                    }
                }
            }
            trade = trade_rx.recv() => {
                if let Ok(trade) = trade {
                    if trade.symbol == params.symbol {
                        agent.on_trade(&trade);
                    }
                }
            }
            event = engine_rx.recv() => {
                if let Ok(EngineEvent::PositionUpdate(position)) = event {
                    if position.sub_account == params.sub_account
                        && position.symbol == params.symbol
                    {
                        agent.on_position_update(&position);
                    }
                }
            }
        }
    }

    ctx.feed.release(&params.symbol);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_params_wire_format() {
        let raw = r#"{
            "subAccountId": "acct",
            "symbol": "BTCUSDT",
            "type": "deleverage",
            "maxNotional": 500.0,
            "reentryRatio": 0.8,
            "unwindPct": 30.0
        }"#;
        let params: AgentParams = serde_json::from_str(raw).unwrap();
        assert_eq!(params.symbol, "BTCUSDT");
        match params.spec {
            AgentSpec::Deleverage(p) => {
                assert_eq!(p.max_notional, 500.0);
                assert_eq!(p.reentry_ratio, 0.8);
            }
            other => panic!("wrong spec: {other:?}"),
        }
    }

    #[test]
    fn validate_requires_identifiers() {
        let params = AgentParams {
            sub_account: String::new(),
            symbol: "BTCUSDT".into(),
            spec: AgentSpec::Deleverage(DeleverageParams::default()),
        };
        assert!(validate(&params).is_err());
    }
}
