//! Double-sided scalper.
//!
//! Maintains N long + N short limit layers on an exponential offset ladder,
//! each layer owning exactly one chase actor. Fill handling applies a
//! decaying fatigue score, a per-minute fill cap, a refill delay, and price
//! filters before a replacement chase is spawned on the same slot. In
//! directional mode the counter side quotes reduce-only and a loss bound
//! guards its closes.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::chase::{self, ChaseFill, ChaseParams, ChaseReport, StalkMode};
use super::{SharedState, StopRequest, StopSignal, StrategyCtx};
use crate::{
    error::{EngineError, EngineResult},
    models::{Side, StrategyId, StrategyStatus},
    signals::{exponential_offsets, skew_weights},
};

pub const KIND: &str = "scalper";

/// Venue minimum per-layer notional.
pub const MIN_LAYER_NOTIONAL_USD: f64 = 5.0;

/// Fatigue score above which refills are delayed.
const FATIGUE_THRESHOLD: f64 = 3.0;

/// Bounds for PnL feedback adjustments.
const MAX_OFFSET_WIDENING: f64 = 3.0;
const MIN_SIZE_FACTOR: f64 = 0.5;
const OFFSET_WIDEN_STEP: f64 = 1.25;
const SIZE_SHRINK_STEP: f64 = 0.85;

/// Cadence at which due respawns are processed.
const RESPAWN_SWEEP: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PnlFeedbackMode {
    Off,
    Soft,
    Full,
}

impl Default for PnlFeedbackMode {
    fn default() -> Self {
        PnlFeedbackMode::Off
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalperParams {
    pub sub_account: String,
    pub symbol: String,
    pub start_side: Side,
    pub leverage: f64,
    pub long_offset_pct: f64,
    pub short_offset_pct: f64,
    pub child_count: usize,
    /// Skew in [-100, 100]; shifts weight between tight and wide layers.
    #[serde(default)]
    pub skew: f64,
    pub long_size_usd: f64,
    pub short_size_usd: f64,
    #[serde(default)]
    pub neutral_mode: bool,
    /// Both sides quote reduce-only; nothing opens. Used for unwind and
    /// flip-close scalpers.
    #[serde(default)]
    pub close_only: bool,
    #[serde(default)]
    pub min_fill_spread_pct: f64,
    pub fill_decay_half_life_ms: u64,
    pub min_refill_delay_ms: u64,
    pub max_fills_per_minute: u32,
    #[serde(default)]
    pub allow_loss: bool,
    #[serde(default)]
    pub max_loss_per_close_bps: f64,
    #[serde(default)]
    pub pnl_feedback_mode: PnlFeedbackMode,
    #[serde(default)]
    pub long_max_price: Option<f64>,
    #[serde(default)]
    pub short_min_price: Option<f64>,
}

impl ScalperParams {
    pub fn is_neutral(&self) -> bool {
        self.neutral_mode || self.start_side == Side::Neutral
    }
}

pub fn validate(params: &ScalperParams) -> EngineResult<()> {
    if params.sub_account.is_empty() || params.symbol.is_empty() {
        return Err(EngineError::validation("subAccountId and symbol are required"));
    }
    if params.child_count == 0 || params.child_count > 20 {
        return Err(EngineError::validation("childCount must be in [1, 20]"));
    }
    if !(params.leverage > 0.0 && params.leverage <= 125.0) {
        return Err(EngineError::validation("leverage must be in (0, 125]"));
    }
    if !(params.long_offset_pct > 0.0 && params.short_offset_pct > 0.0) {
        return Err(EngineError::validation("offsets must be positive"));
    }
    if !(-100.0..=100.0).contains(&params.skew) {
        return Err(EngineError::validation("skew must be in [-100, 100]"));
    }
    if params.fill_decay_half_life_ms == 0 {
        return Err(EngineError::validation("fillDecayHalfLifeMs must be positive"));
    }

    // Every layer must clear the venue minimum notional.
    let weights = skew_weights(params.skew, params.child_count);
    for (side_usd, label) in [
        (params.long_size_usd, "long"),
        (params.short_size_usd, "short"),
    ] {
        let min_layer = weights
            .iter()
            .map(|w| w * side_usd)
            .fold(f64::INFINITY, f64::min);
        if min_layer < MIN_LAYER_NOTIONAL_USD {
            return Err(EngineError::validation(format!(
                "smallest {label} layer is {min_layer:.2} USD, below the \
                 {MIN_LAYER_NOTIONAL_USD} USD minimum"
            )));
        }
    }
    Ok(())
}

/// Realised PnL in bps of entry for closing `inventory_side` at `close_price`.
pub fn close_pnl_bps(entry_price: f64, close_price: f64, inventory_side: Side) -> f64 {
    if entry_price <= 0.0 {
        return 0.0;
    }
    match inventory_side {
        Side::Long => (close_price - entry_price) / entry_price * 10_000.0,
        Side::Short => (entry_price - close_price) / entry_price * 10_000.0,
        Side::Neutral => 0.0,
    }
}

/// Exponential-decay fatigue over millisecond timestamps: decays by half every
/// `half_life_ms` and bumps by one per fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fatigue {
    score: f64,
    last_update_ms: i64,
    half_life_ms: u64,
}

impl Fatigue {
    pub fn new(half_life_ms: u64, now_ms: i64) -> Self {
        Self {
            score: 0.0,
            last_update_ms: now_ms,
            half_life_ms: half_life_ms.max(1),
        }
    }

    fn decay(&mut self, now_ms: i64) {
        let dt = (now_ms - self.last_update_ms).max(0) as f64;
        self.score *= (-dt * std::f64::consts::LN_2 / self.half_life_ms as f64).exp();
        self.last_update_ms = now_ms;
    }

    pub fn bump(&mut self, now_ms: i64) {
        self.decay(now_ms);
        self.score += 1.0;
    }

    pub fn value(&mut self, now_ms: i64) -> f64 {
        self.decay(now_ms);
        self.score
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Active,
    PausedByPriceFilter,
    Retrying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerRuntime {
    pub chase_id: StrategyId,
    pub offset_pct: f64,
    pub weight: f64,
    pub notional_usd: f64,
    pub state: SlotState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalperRuntime {
    pub start_side: Side,
    pub neutral_mode: bool,
    pub child_count: usize,
    pub skew: f64,
    pub long_offset_pct: f64,
    pub short_offset_pct: f64,
    pub long_size_usd: f64,
    pub short_size_usd: f64,
    pub long_max_price: Option<f64>,
    pub short_min_price: Option<f64>,
    pub long_layers: Vec<LayerRuntime>,
    pub short_layers: Vec<LayerRuntime>,
    pub fatigue_score: f64,
    pub last_fill_at: Option<i64>,
    pub fill_count: u64,
    /// PnL-feedback state: multiplicative offset widening and size shrink.
    pub offset_multiplier: f64,
    pub size_multiplier: f64,
    pub realized_pnl_usd: f64,
}

struct ChildChase {
    chase_id: StrategyId,
    stop_tx: watch::Sender<Option<StopRequest>>,
}

struct PendingRespawn {
    side: Side,
    layer_idx: usize,
    due_ms: i64,
}

pub struct ScalperActor {
    ctx: StrategyCtx,
    id: StrategyId,
    params: ScalperParams,
    shared: Arc<SharedState>,
    runtime: ScalperRuntime,
    children: HashMap<(Side, usize), ChildChase>,
    reports_tx: mpsc::UnboundedSender<ChaseReport>,
    reports_rx: mpsc::UnboundedReceiver<ChaseReport>,
    pending: Vec<PendingRespawn>,
    fill_times_ms: VecDeque<i64>,
    last_fill_price: HashMap<Side, f64>,
    fatigue: Fatigue,
}

impl ScalperActor {
    pub fn new(
        ctx: StrategyCtx,
        id: StrategyId,
        params: ScalperParams,
        shared: Arc<SharedState>,
    ) -> Self {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let runtime = ScalperRuntime {
            start_side: params.start_side,
            neutral_mode: params.is_neutral(),
            child_count: params.child_count,
            skew: params.skew,
            long_offset_pct: params.long_offset_pct,
            short_offset_pct: params.short_offset_pct,
            long_size_usd: params.long_size_usd,
            short_size_usd: params.short_size_usd,
            long_max_price: params.long_max_price,
            short_min_price: params.short_min_price,
            long_layers: Vec::new(),
            short_layers: Vec::new(),
            fatigue_score: 0.0,
            last_fill_at: None,
            fill_count: 0,
            offset_multiplier: 1.0,
            size_multiplier: 1.0,
            realized_pnl_usd: 0.0,
        };
        let fatigue = Fatigue::new(params.fill_decay_half_life_ms, now_ms);
        Self {
            ctx,
            id,
            params,
            shared,
            runtime,
            children: HashMap::new(),
            reports_tx,
            reports_rx,
            pending: Vec::new(),
            fill_times_ms: VecDeque::new(),
            last_fill_price: HashMap::new(),
            fatigue,
        }
    }

    fn publish_snapshot(&mut self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.runtime.fatigue_score = self.fatigue.value(now_ms);
        if let Ok(value) = serde_json::to_value(&self.runtime) {
            self.shared.update_snapshot(value);
        }
    }

    /// Whether a side opens inventory (false => reduce-only pool).
    fn side_opens(&self, side: Side) -> bool {
        if self.params.close_only {
            return false;
        }
        self.runtime.neutral_mode || side == self.params.start_side
    }

    fn base_offset(&self, side: Side) -> f64 {
        let base = match side {
            Side::Long => self.params.long_offset_pct,
            _ => self.params.short_offset_pct,
        };
        (base * self.runtime.offset_multiplier).min(base * MAX_OFFSET_WIDENING)
    }

    fn side_usd(&self, side: Side) -> f64 {
        let base = match side {
            Side::Long => self.params.long_size_usd,
            _ => self.params.short_size_usd,
        };
        (base * self.runtime.size_multiplier).max(base * MIN_SIZE_FACTOR)
    }

    fn spawn_layer(&mut self, side: Side, layer_idx: usize, offset_pct: f64, notional_usd: f64) {
        let chase_id = format!("{}-{}-{}", self.id, side.as_str(), Uuid::new_v4());
        let reduce_only = !self.side_opens(side);
        let chase_params = ChaseParams {
            sub_account: self.params.sub_account.clone(),
            symbol: self.params.symbol.clone(),
            side,
            qty: None,
            notional_usd: Some(notional_usd),
            leverage: self.params.leverage,
            stalk_offset_pct: offset_pct,
            stalk_mode: StalkMode::Conservative,
            max_distance_pct: None,
            reduce_only,
            parent_scalper_id: Some(self.id.clone()),
            layer_idx: Some(layer_idx),
        };

        let (stop_tx, stop_rx) = StopSignal::channel();
        let chase_shared = SharedState::new(serde_json::Value::Null);
        tokio::spawn(chase::run(
            self.ctx.clone(),
            chase_id.clone(),
            chase_params,
            stop_rx,
            chase_shared,
            Some(self.reports_tx.clone()),
        ));

        self.children
            .insert((side, layer_idx), ChildChase { chase_id: chase_id.clone(), stop_tx });

        let layers = match side {
            Side::Long => &mut self.runtime.long_layers,
            _ => &mut self.runtime.short_layers,
        };
        if let Some(layer) = layers.get_mut(layer_idx) {
            layer.chase_id = chase_id;
            layer.state = SlotState::Active;
        }
    }

    fn build_layers(&mut self) {
        let n = self.params.child_count;
        let weights = skew_weights(self.params.skew, n);

        for side in [Side::Long, Side::Short] {
            let offsets = exponential_offsets(self.base_offset(side), n);
            let side_usd = self.side_usd(side);
            let layers: Vec<LayerRuntime> = (0..n)
                .map(|i| LayerRuntime {
                    chase_id: String::new(),
                    offset_pct: offsets[i],
                    weight: weights[i],
                    notional_usd: weights[i] * side_usd,
                    state: SlotState::Retrying,
                })
                .collect();
            match side {
                Side::Long => self.runtime.long_layers = layers,
                _ => self.runtime.short_layers = layers,
            }
        }

        for side in [Side::Long, Side::Short] {
            for i in 0..n {
                let (offset, notional) = {
                    let layers = match side {
                        Side::Long => &self.runtime.long_layers,
                        _ => &self.runtime.short_layers,
                    };
                    (layers[i].offset_pct, layers[i].notional_usd)
                };
                self.spawn_layer(side, i, offset, notional);
            }
        }
    }

    fn fills_in_last_minute(&mut self, now_ms: i64) -> u32 {
        while let Some(&front) = self.fill_times_ms.front() {
            if now_ms - front > 60_000 {
                self.fill_times_ms.pop_front();
            } else {
                break;
            }
        }
        self.fill_times_ms.len() as u32
    }

    fn apply_pnl_feedback(&mut self, fill: &ChaseFill) {
        if fill.reduce_only {
            // Realised PnL versus the inventory this close reduced.
            let inventory_side = fill.side.opposite();
            if let Some(position) =
                self.ctx
                    .risk
                    .position(&self.params.sub_account, &self.params.symbol, inventory_side)
            {
                let pnl_bps = close_pnl_bps(position.entry_price, fill.price, inventory_side);
                self.runtime.realized_pnl_usd += pnl_bps / 10_000.0 * fill.qty * fill.price;
            }
        }

        if self.params.pnl_feedback_mode == PnlFeedbackMode::Off {
            return;
        }
        // Persistent adverse PnL: widen offsets; in full mode also shrink size.
        let adverse_floor = -0.005 * (self.params.long_size_usd + self.params.short_size_usd);
        if self.runtime.realized_pnl_usd < adverse_floor {
            let widened = (self.runtime.offset_multiplier * OFFSET_WIDEN_STEP)
                .min(MAX_OFFSET_WIDENING);
            if widened != self.runtime.offset_multiplier {
                info!(
                    scalper = %self.id,
                    multiplier = widened,
                    "adverse pnl; widening offsets"
                );
                self.runtime.offset_multiplier = widened;
            }
            if self.params.pnl_feedback_mode == PnlFeedbackMode::Full {
                self.runtime.size_multiplier =
                    (self.runtime.size_multiplier * SIZE_SHRINK_STEP).max(MIN_SIZE_FACTOR);
            }
        }
    }

    fn handle_fill(&mut self, fill: ChaseFill) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        self.fatigue.bump(now_ms);
        self.runtime.fill_count += 1;
        self.runtime.last_fill_at = Some(now_ms);
        self.fill_times_ms.push_back(now_ms);
        self.last_fill_price.insert(fill.side, fill.price);

        let Some(layer_idx) = fill.layer_idx else {
            return;
        };
        self.children.remove(&(fill.side, layer_idx));

        self.apply_pnl_feedback(&fill);

        // Anti-overtrading: fatigue or the per-minute cap delays the refill.
        let fatigued = self.fatigue.value(now_ms) > FATIGUE_THRESHOLD
            || self.fills_in_last_minute(now_ms) > self.params.max_fills_per_minute;
        let delay_ms = if fatigued {
            debug!(scalper = %self.id, "fill pacing engaged; delaying refill");
            self.params.min_refill_delay_ms.max(250) as i64
        } else {
            0
        };

        self.set_slot_state(fill.side, layer_idx, SlotState::Retrying);
        self.pending.push(PendingRespawn {
            side: fill.side,
            layer_idx,
            due_ms: now_ms + delay_ms,
        });

        self.ctx.emit_lifecycle(
            KIND,
            "progress",
            &self.params.sub_account,
            &self.id,
            json!({
                "fillCount": self.runtime.fill_count,
                "side": fill.side,
                "layerIdx": layer_idx,
                "price": fill.price,
                "qty": fill.qty,
                "reduceOnly": fill.reduce_only,
            }),
        );
        self.publish_snapshot();
    }

    fn set_slot_state(&mut self, side: Side, layer_idx: usize, state: SlotState) {
        let layers = match side {
            Side::Long => &mut self.runtime.long_layers,
            _ => &mut self.runtime.short_layers,
        };
        if let Some(layer) = layers.get_mut(layer_idx) {
            layer.state = state;
        }
    }

    /// Guards evaluated before a slot is refilled. Returns the retry delay in
    /// ms when the respawn must wait.
    fn respawn_blocked(&mut self, side: Side, layer_idx: usize, mark: f64) -> Option<(SlotState, i64)> {
        // Price filters against the most recent fill on this side.
        let reference = self.last_fill_price.get(&side).copied().unwrap_or(mark);
        match side {
            Side::Long => {
                if let Some(max) = self.runtime.long_max_price {
                    if reference < max {
                        return Some((SlotState::PausedByPriceFilter, 1_000));
                    }
                }
            }
            Side::Short => {
                if let Some(min) = self.runtime.short_min_price {
                    if reference > min {
                        return Some((SlotState::PausedByPriceFilter, 1_000));
                    }
                }
            }
            Side::Neutral => {}
        }

        // Minimum spread from the last fill before re-quoting the same side.
        if self.params.min_fill_spread_pct > 0.0 {
            if let Some(&last) = self.last_fill_price.get(&side) {
                if last > 0.0
                    && (mark - last).abs() / last * 100.0 < self.params.min_fill_spread_pct
                {
                    return Some((SlotState::Retrying, 500));
                }
            }
        }

        // Reduce-only pool: needs inventory, and the close must respect the
        // loss bound unless losses are allowed.
        if !self.side_opens(side) {
            let inventory_side = side.opposite();
            let Some(position) = self.ctx.risk.position(
                &self.params.sub_account,
                &self.params.symbol,
                inventory_side,
            ) else {
                return Some((SlotState::Retrying, 1_000));
            };
            if !self.params.allow_loss {
                let offset = self
                    .layer(side, layer_idx)
                    .map(|l| l.offset_pct)
                    .unwrap_or(0.0);
                let target = chase::target_price(side, mark, mark, offset);
                let pnl_bps = close_pnl_bps(position.entry_price, target, inventory_side);
                if pnl_bps < -self.params.max_loss_per_close_bps {
                    return Some((SlotState::Retrying, 1_000));
                }
            }
        }

        None
    }

    fn layer(&self, side: Side, layer_idx: usize) -> Option<&LayerRuntime> {
        match side {
            Side::Long => self.runtime.long_layers.get(layer_idx),
            _ => self.runtime.short_layers.get(layer_idx),
        }
    }

    fn process_due_respawns(&mut self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut due: Vec<PendingRespawn> = Vec::new();
        self.pending.retain_mut(|p| {
            if p.due_ms <= now_ms {
                due.push(PendingRespawn {
                    side: p.side,
                    layer_idx: p.layer_idx,
                    due_ms: p.due_ms,
                });
                false
            } else {
                true
            }
        });
        if due.is_empty() {
            return;
        }

        let Some(tick) = self.ctx.feed.latest(&self.params.symbol) else {
            // No market yet; try again shortly.
            for mut p in due {
                p.due_ms = now_ms + 500;
                self.pending.push(p);
            }
            return;
        };

        for p in due {
            // A slot never holds two concurrent chases.
            if self.children.contains_key(&(p.side, p.layer_idx)) {
                continue;
            }
            match self.respawn_blocked(p.side, p.layer_idx, tick.mark) {
                Some((state, retry_ms)) => {
                    self.set_slot_state(p.side, p.layer_idx, state);
                    self.pending.push(PendingRespawn {
                        side: p.side,
                        layer_idx: p.layer_idx,
                        due_ms: now_ms + retry_ms,
                    });
                }
                None => {
                    // Feedback state applies to replacements: widened offsets,
                    // shrunk size.
                    let widen = self.runtime.offset_multiplier.min(MAX_OFFSET_WIDENING);
                    let (offset, notional) = match self.layer(p.side, p.layer_idx) {
                        Some(layer) => {
                            (layer.offset_pct * widen, layer.weight * self.side_usd(p.side))
                        }
                        None => continue,
                    };
                    self.spawn_layer(p.side, p.layer_idx, offset, notional);
                }
            }
        }
        self.publish_snapshot();
    }

    async fn shutdown(&mut self, req: &StopRequest) {
        for (_, child) in self.children.drain() {
            let _ = child.stop_tx.send(Some(StopRequest {
                reason: "scalper_stop".to_string(),
                close: false,
            }));
        }

        if req.close {
            // Flatten remaining inventory on this symbol, reduce-only.
            for position in self.ctx.risk.positions_for(&self.params.sub_account) {
                if position.symbol != self.params.symbol {
                    continue;
                }
                match self
                    .ctx
                    .engine
                    .close_position(&position.position_id, None, "SCALPER_CLOSE")
                    .await
                {
                    Ok(outcome) => {
                        debug!(
                            scalper = %self.id,
                            position = %position.position_id,
                            closed = outcome.closed_qty,
                            "closed inventory on stop"
                        );
                    }
                    Err(e) => {
                        warn!(
                            scalper = %self.id,
                            position = %position.position_id,
                            error = %e,
                            "close on stop failed"
                        );
                    }
                }
            }
        }

        if self.shared.set_status(StrategyStatus::Stopped) {
            self.ctx.emit_lifecycle(
                KIND,
                "cancelled",
                &self.params.sub_account,
                &self.id,
                json!({
                    "reason": req.reason,
                    "closedInventory": req.close,
                    "fillCount": self.runtime.fill_count,
                }),
            );
        }
        self.publish_snapshot();
    }

    pub async fn run(mut self, mut stop: StopSignal) {
        self.shared.set_status(StrategyStatus::Active);
        self.ctx.feed.retain(&self.params.symbol);
        self.build_layers();
        self.publish_snapshot();
        self.ctx.emit_lifecycle(
            KIND,
            "started",
            &self.params.sub_account,
            &self.id,
            json!({
                "symbol": self.params.symbol,
                "startSide": self.params.start_side,
                "childCount": self.params.child_count,
                "neutralMode": self.runtime.neutral_mode,
            }),
        );

        let mut sweep = tokio::time::interval(RESPAWN_SWEEP);
        loop {
            tokio::select! {
                req = stop.wait() => {
                    self.shutdown(&req).await;
                    break;
                }
                report = self.reports_rx.recv() => {
                    match report {
                        Some(ChaseReport::Filled(fill)) => self.handle_fill(fill),
                        Some(ChaseReport::Stopped { chase_id, layer_idx }) => {
                            // A child died without a fill (reject storm, feed
                            // loss). Free its slot and retry.
                            if let Some(layer_idx) = layer_idx {
                                let slot = self
                                    .children
                                    .iter()
                                    .find(|(_, c)| c.chase_id == chase_id)
                                    .map(|((side, idx), _)| (*side, *idx));
                                if let Some((side, idx)) = slot {
                                    self.children.remove(&(side, idx));
                                    self.set_slot_state(side, idx, SlotState::Retrying);
                                    self.pending.push(PendingRespawn {
                                        side,
                                        layer_idx: idx,
                                        due_ms: chrono::Utc::now().timestamp_millis() + 1_000,
                                    });
                                } else {
                                    debug!(
                                        scalper = %self.id,
                                        chase = %chase_id,
                                        layer_idx,
                                        "stop report for unknown child"
                                    );
                                }
                            }
                        }
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.process_due_respawns();
                }
            }
        }

        self.ctx.feed.release(&self.params.symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ScalperParams {
        ScalperParams {
            sub_account: "acct".into(),
            symbol: "BTCUSDT".into(),
            start_side: Side::Long,
            leverage: 5.0,
            long_offset_pct: 0.3,
            short_offset_pct: 0.3,
            child_count: 3,
            skew: 0.0,
            long_size_usd: 60.0,
            short_size_usd: 60.0,
            neutral_mode: false,
            close_only: false,
            min_fill_spread_pct: 0.0,
            fill_decay_half_life_ms: 10_000,
            min_refill_delay_ms: 2_000,
            max_fills_per_minute: 10,
            allow_loss: false,
            max_loss_per_close_bps: 5.0,
            pnl_feedback_mode: PnlFeedbackMode::Off,
            long_max_price: None,
            short_min_price: None,
        }
    }

    #[test]
    fn validation_enforces_layer_floor() {
        let p = params();
        assert!(validate(&p).is_ok());

        // 60 USD over 3 uniform layers = 20/layer; with heavy skew the small
        // layer dips below 5 USD.
        let mut skewed = params();
        skewed.skew = 100.0;
        skewed.long_size_usd = 12.0;
        skewed.short_size_usd = 12.0;
        assert!(validate(&skewed).is_err());

        let mut bad = params();
        bad.child_count = 0;
        assert!(validate(&bad).is_err());

        let mut bad = params();
        bad.long_offset_pct = 0.0;
        assert!(validate(&bad).is_err());
    }

    #[test]
    fn fatigue_halves_per_half_life() {
        let mut fatigue = Fatigue::new(1_000, 0);
        fatigue.bump(0);
        fatigue.bump(0);
        assert!((fatigue.value(0) - 2.0).abs() < 1e-9);
        // One half-life later.
        assert!((fatigue.value(1_000) - 1.0).abs() < 1e-9);
        // Far in the future the score is gone.
        assert!(fatigue.value(100_000) < 1e-9);
    }

    #[test]
    fn close_pnl_signs() {
        // Long inventory closed above entry: profit.
        assert!(close_pnl_bps(100.0, 101.0, Side::Long) > 0.0);
        assert!(close_pnl_bps(100.0, 99.0, Side::Long) < 0.0);
        // Short inventory closed below entry: profit.
        assert!(close_pnl_bps(100.0, 99.0, Side::Short) > 0.0);
        assert!((close_pnl_bps(100.0, 99.0, Side::Short) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn neutral_detection() {
        let mut p = params();
        assert!(!p.is_neutral());
        p.neutral_mode = true;
        assert!(p.is_neutral());
        p.neutral_mode = false;
        p.start_side = Side::Neutral;
        assert!(p.is_neutral());
    }
}
