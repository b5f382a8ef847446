//! Process-wide strategy directory.
//!
//! Owns the id -> handle map, enforces per-kind concurrency caps and
//! sub-account ownership, and emits lifecycle broadcasts. Initialised once at
//! process start; every strategy task registers here and is removed by a
//! watcher task when its actor exits.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    chase::{self, ChaseParams},
    scalper::{self, ScalperActor, ScalperParams},
    trail_stop::{self, TrailStopActor, TrailStopParams, TrailStopRuntime},
    twap::{self, TwapActor, TwapParams, TwapRuntime},
    twap_basket::{self, TwapBasketActor, TwapBasketParams, TwapBasketRuntime},
    SharedState, StopRequest, StopSignal, StrategyCtx,
};
use crate::{
    agents::{self, AgentParams},
    error::{EngineError, EngineResult},
    models::{PositionId, StrategyId, StrategyKind, StrategyStatus, SubAccountId},
};

struct Handle {
    kind: StrategyKind,
    sub_account: SubAccountId,
    stop_tx: watch::Sender<Option<StopRequest>>,
    shared: Arc<SharedState>,
    /// Set for trail stops: the guarded position id.
    trail_position: Option<PositionId>,
}

pub struct StrategyRegistry {
    ctx: StrategyCtx,
    inner: RwLock<HashMap<StrategyId, Handle>>,
    /// Position ids with a live trail stop; duplicates are rejected.
    active_trails: Mutex<HashSet<PositionId>>,
}

impl StrategyRegistry {
    pub fn new(ctx: StrategyCtx) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            inner: RwLock::new(HashMap::new()),
            active_trails: Mutex::new(HashSet::new()),
        })
    }

    pub fn ctx(&self) -> &StrategyCtx {
        &self.ctx
    }

    fn cap_for(&self, kind: StrategyKind) -> usize {
        let cfg = &self.ctx.config;
        match kind {
            StrategyKind::Twap => cfg.max_twap,
            StrategyKind::TwapBasket => cfg.max_twap_basket,
            StrategyKind::TrailStop => cfg.max_trail_stop,
            StrategyKind::Chase => cfg.max_chase,
            StrategyKind::Scalper => cfg.max_scalper,
            StrategyKind::Agent => cfg.max_agents,
        }
    }

    fn count_kind(&self, kind: StrategyKind) -> usize {
        self.inner.read().values().filter(|h| h.kind == kind).count()
    }

    /// Common admission checks: engine readiness and the per-kind cap.
    fn admit(&self, kind: StrategyKind) -> EngineResult<()> {
        self.ctx.engine.ensure_ready()?;
        let cap = self.cap_for(kind);
        if self.count_kind(kind) >= cap {
            return Err(EngineError::LimitExceeded(format!(
                "{} cap of {cap} reached",
                kind.as_str()
            )));
        }
        Ok(())
    }

    fn register(
        self: &Arc<Self>,
        id: &StrategyId,
        kind: StrategyKind,
        sub_account: &str,
        stop_tx: watch::Sender<Option<StopRequest>>,
        shared: Arc<SharedState>,
        trail_position: Option<PositionId>,
        join: tokio::task::JoinHandle<()>,
    ) {
        self.inner.write().insert(
            id.clone(),
            Handle {
                kind,
                sub_account: sub_account.to_string(),
                stop_tx,
                shared,
                trail_position,
            },
        );

        let registry = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            let _ = join.await;
            registry.unregister(&id);
        });
    }

    fn unregister(&self, id: &StrategyId) {
        if let Some(handle) = self.inner.write().remove(id) {
            if let Some(position_id) = handle.trail_position {
                self.active_trails.lock().remove(&position_id);
            }
        }
    }

    pub fn start_twap(self: &Arc<Self>, params: TwapParams) -> EngineResult<StrategyId> {
        twap::validate(&params)?;
        self.admit(StrategyKind::Twap)?;

        let id = Uuid::new_v4().to_string();
        let shared = SharedState::new(Value::Null);
        let (stop_tx, stop_rx) = StopSignal::channel();
        let sub_account = params.sub_account.clone();
        let actor = TwapActor::new(self.ctx.clone(), id.clone(), params, Arc::clone(&shared), None);
        let join = tokio::spawn(actor.run(stop_rx));

        self.register(
            &id,
            StrategyKind::Twap,
            &sub_account,
            stop_tx,
            shared,
            None,
            join,
        );
        info!(twap = %id, "twap started");
        Ok(id)
    }

    /// Rebuild a TWAP from a durable snapshot (resume path, no cap re-check
    /// beyond the usual admission).
    pub fn resume_twap(
        self: &Arc<Self>,
        id: StrategyId,
        params: TwapParams,
        runtime: TwapRuntime,
    ) -> EngineResult<StrategyId> {
        self.admit(StrategyKind::Twap)?;
        let shared = SharedState::new(Value::Null);
        let (stop_tx, stop_rx) = StopSignal::channel();
        let sub_account = params.sub_account.clone();
        let actor = TwapActor::new(
            self.ctx.clone(),
            id.clone(),
            params,
            Arc::clone(&shared),
            Some(runtime),
        );
        let join = tokio::spawn(actor.run(stop_rx));
        self.register(
            &id,
            StrategyKind::Twap,
            &sub_account,
            stop_tx,
            shared,
            None,
            join,
        );
        info!(twap = %id, "twap resumed");
        Ok(id)
    }

    pub fn start_twap_basket(
        self: &Arc<Self>,
        params: TwapBasketParams,
    ) -> EngineResult<StrategyId> {
        twap_basket::validate(&params)?;
        self.admit(StrategyKind::TwapBasket)?;

        let id = Uuid::new_v4().to_string();
        let shared = SharedState::new(Value::Null);
        let (stop_tx, stop_rx) = StopSignal::channel();
        let sub_account = params.sub_account.clone();
        let actor =
            TwapBasketActor::new(self.ctx.clone(), id.clone(), params, Arc::clone(&shared), None);
        let join = tokio::spawn(actor.run(stop_rx));

        self.register(
            &id,
            StrategyKind::TwapBasket,
            &sub_account,
            stop_tx,
            shared,
            None,
            join,
        );
        info!(basket = %id, "twap basket started");
        Ok(id)
    }

    pub fn resume_twap_basket(
        self: &Arc<Self>,
        id: StrategyId,
        params: TwapBasketParams,
        runtime: TwapBasketRuntime,
    ) -> EngineResult<StrategyId> {
        self.admit(StrategyKind::TwapBasket)?;
        let shared = SharedState::new(Value::Null);
        let (stop_tx, stop_rx) = StopSignal::channel();
        let sub_account = params.sub_account.clone();
        let actor = TwapBasketActor::new(
            self.ctx.clone(),
            id.clone(),
            params,
            Arc::clone(&shared),
            Some(runtime),
        );
        let join = tokio::spawn(actor.run(stop_rx));
        self.register(
            &id,
            StrategyKind::TwapBasket,
            &sub_account,
            stop_tx,
            shared,
            None,
            join,
        );
        info!(basket = %id, "twap basket resumed");
        Ok(id)
    }

    pub fn start_trail_stop(self: &Arc<Self>, params: TrailStopParams) -> EngineResult<StrategyId> {
        trail_stop::validate(&params)?;
        self.admit(StrategyKind::TrailStop)?;

        // One trail stop per position.
        {
            let mut trails = self.active_trails.lock();
            if !trails.insert(params.position_id.clone()) {
                return Err(EngineError::Conflict(format!(
                    "position {} already has a trail stop",
                    params.position_id
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        let shared = SharedState::new(Value::Null);
        let sub_account = params.sub_account.clone();
        let position_id = params.position_id.clone();

        let actor = match TrailStopActor::create(
            self.ctx.clone(),
            id.clone(),
            params,
            Arc::clone(&shared),
        ) {
            Ok(actor) => actor,
            Err(e) => {
                self.active_trails.lock().remove(&position_id);
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = StopSignal::channel();
        let join = tokio::spawn(actor.run(stop_rx));
        self.register(
            &id,
            StrategyKind::TrailStop,
            &sub_account,
            stop_tx,
            shared,
            Some(position_id),
            join,
        );
        info!(trail = %id, "trail stop started");
        Ok(id)
    }

    pub fn resume_trail_stop(
        self: &Arc<Self>,
        id: StrategyId,
        params: TrailStopParams,
        runtime: TrailStopRuntime,
    ) -> EngineResult<StrategyId> {
        self.admit(StrategyKind::TrailStop)?;
        {
            let mut trails = self.active_trails.lock();
            if !trails.insert(params.position_id.clone()) {
                return Err(EngineError::Conflict(format!(
                    "position {} already has a trail stop",
                    params.position_id
                )));
            }
        }

        let shared = SharedState::new(Value::Null);
        let sub_account = params.sub_account.clone();
        let position_id = params.position_id.clone();
        let actor = TrailStopActor::resume(
            self.ctx.clone(),
            id.clone(),
            params,
            runtime,
            Arc::clone(&shared),
        );
        let (stop_tx, stop_rx) = StopSignal::channel();
        let join = tokio::spawn(actor.run(stop_rx));
        self.register(
            &id,
            StrategyKind::TrailStop,
            &sub_account,
            stop_tx,
            shared,
            Some(position_id),
            join,
        );
        info!(trail = %id, "trail stop resumed");
        Ok(id)
    }

    pub fn start_chase(self: &Arc<Self>, params: ChaseParams) -> EngineResult<StrategyId> {
        chase::validate(&params)?;
        self.admit(StrategyKind::Chase)?;

        let id = Uuid::new_v4().to_string();
        let shared = SharedState::new(Value::Null);
        let (stop_tx, stop_rx) = StopSignal::channel();
        let sub_account = params.sub_account.clone();
        let join = tokio::spawn(chase::run(
            self.ctx.clone(),
            id.clone(),
            params,
            stop_rx,
            Arc::clone(&shared),
            None,
        ));

        self.register(
            &id,
            StrategyKind::Chase,
            &sub_account,
            stop_tx,
            shared,
            None,
            join,
        );
        info!(chase = %id, "chase started");
        Ok(id)
    }

    pub fn start_scalper(self: &Arc<Self>, params: ScalperParams) -> EngineResult<StrategyId> {
        scalper::validate(&params)?;
        self.admit(StrategyKind::Scalper)?;

        let id = Uuid::new_v4().to_string();
        let shared = SharedState::new(Value::Null);
        let (stop_tx, stop_rx) = StopSignal::channel();
        let sub_account = params.sub_account.clone();
        let actor = ScalperActor::new(self.ctx.clone(), id.clone(), params, Arc::clone(&shared));
        let join = tokio::spawn(actor.run(stop_rx));

        self.register(
            &id,
            StrategyKind::Scalper,
            &sub_account,
            stop_tx,
            shared,
            None,
            join,
        );
        info!(scalper = %id, "scalper started");
        Ok(id)
    }

    pub fn start_agent(self: &Arc<Self>, params: AgentParams) -> EngineResult<StrategyId> {
        agents::validate(&params)?;
        self.admit(StrategyKind::Agent)?;

        let id = Uuid::new_v4().to_string();
        let shared = SharedState::new(Value::Null);
        let (stop_tx, stop_rx) = StopSignal::channel();
        let sub_account = params.sub_account.clone();
        let join = tokio::spawn(agents::run(
            Arc::clone(self),
            id.clone(),
            params,
            stop_rx,
            Arc::clone(&shared),
        ));

        self.register(
            &id,
            StrategyKind::Agent,
            &sub_account,
            stop_tx,
            shared,
            None,
            join,
        );
        info!(agent = %id, "agent started");
        Ok(id)
    }

    /// Idempotent stop: the first call wins, later calls are no-ops. The
    /// optional `expected_sub_account` enforces ownership at the API edge.
    pub fn stop(
        &self,
        id: &StrategyId,
        reason: &str,
        close: bool,
        expected_sub_account: Option<&str>,
    ) -> EngineResult<()> {
        let inner = self.inner.read();
        let handle = inner
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("strategy {id}")))?;
        if let Some(expected) = expected_sub_account {
            if handle.sub_account != expected {
                return Err(EngineError::NotFound(format!("strategy {id}")));
            }
        }
        if handle.shared.status().is_terminal() {
            return Ok(());
        }
        let _ = handle.stop_tx.send(Some(StopRequest {
            reason: reason.to_string(),
            close,
        }));
        Ok(())
    }

    pub fn stop_all(&self, reason: &str) {
        let inner = self.inner.read();
        info!(count = inner.len(), reason, "stopping all strategies");
        for handle in inner.values() {
            if !handle.shared.status().is_terminal() {
                let _ = handle.stop_tx.send(Some(StopRequest {
                    reason: reason.to_string(),
                    close: false,
                }));
            }
        }
    }

    pub fn get(&self, id: &StrategyId) -> Option<Value> {
        let inner = self.inner.read();
        let handle = inner.get(id)?;
        let mut snapshot = handle.shared.snapshot();
        if let Value::Object(ref mut map) = snapshot {
            map.insert("id".to_string(), Value::String(id.clone()));
            map.insert(
                "kind".to_string(),
                Value::String(handle.kind.as_str().to_string()),
            );
            map.insert(
                "status".to_string(),
                Value::String(handle.shared.status().as_str().to_string()),
            );
        }
        Some(snapshot)
    }

    pub fn list(&self, sub_account: Option<&str>, kind: Option<StrategyKind>) -> Vec<Value> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for (id, handle) in inner.iter() {
            if let Some(sub) = sub_account {
                if handle.sub_account != sub {
                    continue;
                }
            }
            if let Some(kind) = kind {
                if handle.kind != kind {
                    continue;
                }
            }
            let mut snapshot = handle.shared.snapshot();
            if let Value::Object(ref mut map) = snapshot {
                map.insert("id".to_string(), Value::String(id.clone()));
                map.insert(
                    "kind".to_string(),
                    Value::String(handle.kind.as_str().to_string()),
                );
                map.insert(
                    "status".to_string(),
                    Value::String(handle.shared.status().as_str().to_string()),
                );
            }
            out.push(snapshot);
        }
        out
    }

    pub fn active_counts(&self) -> HashMap<String, usize> {
        let inner = self.inner.read();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for handle in inner.values() {
            *counts.entry(handle.kind.as_str().to_string()).or_default() += 1;
        }
        counts
    }

    pub fn status_of(&self, id: &StrategyId) -> Option<StrategyStatus> {
        self.inner.read().get(id).map(|h| h.shared.status())
    }

    /// True when the id refers to a live, non-terminal strategy.
    pub fn is_live(&self, id: &StrategyId) -> bool {
        self.status_of(id)
            .map(|status| !status.is_terminal())
            .unwrap_or(false)
    }
}

impl Drop for StrategyRegistry {
    fn drop(&mut self) {
        let inner = self.inner.read();
        if !inner.is_empty() {
            warn!(count = inner.len(), "registry dropped with live strategies");
        }
    }
}
