use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Strategy identifier (UUID v4, assigned at start).
pub type StrategyId = String;

/// Sub-account identifier. Opaque; every strategy is scoped to exactly one.
pub type SubAccountId = String;

/// Canonical symbol form, e.g. `BTCUSDT`. The feed adapter owns wire conversion.
pub type Symbol = String;

/// Durable identifier addressing one open virtual position.
pub type PositionId = String;

/// Order side. `Neutral` is valid only for scalper intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
    Neutral,
}

impl Side {
    pub fn as_str(&self) -> &str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
            Side::Neutral => "neutral",
        }
    }

    /// The opposing directional side. Neutral has no opposite.
    pub fn opposite(&self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
            Side::Neutral => Side::Neutral,
        }
    }

    /// +1 for Long, -1 for Short, 0 for Neutral.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
            Side::Neutral => 0.0,
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            "neutral" => Ok(Side::Neutral),
            other => Err(anyhow::anyhow!("unknown side: {other}")),
        }
    }
}

/// Strategy families the registry knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Twap,
    TwapBasket,
    TrailStop,
    Chase,
    Scalper,
    Agent,
}

impl StrategyKind {
    pub fn as_str(&self) -> &str {
        match self {
            StrategyKind::Twap => "twap",
            StrategyKind::TwapBasket => "twap_basket",
            StrategyKind::TrailStop => "trail_stop",
            StrategyKind::Chase => "chase",
            StrategyKind::Scalper => "scalper",
            StrategyKind::Agent => "agent",
        }
    }
}

/// Lifecycle status. Transitions are monotone toward the terminal set;
/// a terminal strategy never resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Created,
    Active,
    Paused,
    Stopped,
    Cancelled,
    Completed,
    Triggered,
}

impl StrategyStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StrategyStatus::Stopped
                | StrategyStatus::Cancelled
                | StrategyStatus::Completed
                | StrategyStatus::Triggered
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            StrategyStatus::Created => "created",
            StrategyStatus::Active => "active",
            StrategyStatus::Paused => "paused",
            StrategyStatus::Stopped => "stopped",
            StrategyStatus::Cancelled => "cancelled",
            StrategyStatus::Completed => "completed",
            StrategyStatus::Triggered => "triggered",
        }
    }
}

/// A position as reported by the risk book. Consumed, never mutated here;
/// mutations happen inside the execution pipeline in response to fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub position_id: PositionId,
    pub sub_account: SubAccountId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub notional: f64,
    pub leverage: f64,
    pub liquidation_price: Option<f64>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.quantity > 0.0
    }

    /// Unrealised PnL in quote currency at `mark`.
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        match self.side {
            Side::Long => (mark - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - mark) * self.quantity,
            Side::Neutral => 0.0,
        }
    }

    /// Unrealised PnL in bps of entry notional.
    pub fn unrealized_pnl_bps(&self, mark: f64) -> f64 {
        let entry_notional = self.entry_price * self.quantity;
        if entry_notional <= 0.0 {
            return 0.0;
        }
        self.unrealized_pnl(mark) / entry_notional * 10_000.0
    }
}

/// Lifecycle broadcast event, tagged with the sub-account so the transport
/// layer can fan out to that account's subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyEvent {
    /// Event name, e.g. `twap_progress`, `trail_stop_triggered`.
    pub event: String,
    #[serde(rename = "subAccountId")]
    pub sub_account: SubAccountId,
    #[serde(rename = "strategyId")]
    pub strategy_id: StrategyId,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl StrategyEvent {
    pub fn new(
        event: impl Into<String>,
        sub_account: &str,
        strategy_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event: event.into(),
            sub_account: sub_account.to_string(),
            strategy_id: strategy_id.to_string(),
            payload,
            ts: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(StrategyStatus::Stopped.is_terminal());
        assert!(StrategyStatus::Cancelled.is_terminal());
        assert!(StrategyStatus::Completed.is_terminal());
        assert!(StrategyStatus::Triggered.is_terminal());
        assert!(!StrategyStatus::Active.is_terminal());
        assert!(!StrategyStatus::Paused.is_terminal());
    }

    #[test]
    fn side_parsing_and_sign() {
        assert_eq!("LONG".parse::<Side>().unwrap(), Side::Long);
        assert_eq!("sell".parse::<Side>().unwrap(), Side::Short);
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.sign(), -1.0);
    }

    #[test]
    fn pnl_bps_long_short() {
        let mut pos = Position {
            position_id: "vp-1".into(),
            sub_account: "acct".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            quantity: 2.0,
            entry_price: 100.0,
            notional: 200.0,
            leverage: 5.0,
            liquidation_price: None,
        };
        assert!((pos.unrealized_pnl_bps(101.0) - 100.0).abs() < 1e-9);
        pos.side = Side::Short;
        assert!((pos.unrealized_pnl_bps(99.0) - 100.0).abs() < 1e-9);
    }
}
