//! Read-only view of positions and exposure.
//!
//! Strategies query this book; they never mutate it. Mutations happen only in
//! the execution pipeline, in response to fills and snapshots flowing back on
//! the engine channel.

use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    engine::EngineEvent,
    models::{Position, PositionId, Side, SubAccountId, Symbol},
};

type PositionKey = (SubAccountId, Symbol, Side);

#[derive(Debug, Default)]
pub struct RiskBook {
    positions: RwLock<HashMap<PositionKey, Position>>,
}

impl RiskBook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn the consumer applying engine events to the book.
    pub fn spawn_consumer(self: &Arc<Self>, mut events: broadcast::Receiver<EngineEvent>) {
        let book = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => book.apply_event(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(missed = n, "risk book lagged engine events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn apply_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::PositionUpdate(position) => self.upsert(position.clone()),
            EngineEvent::PositionsSnapshot(positions) => {
                let mut map = self.positions.write();
                map.clear();
                for position in positions {
                    if position.is_open() {
                        map.insert(
                            (
                                position.sub_account.clone(),
                                position.symbol.clone(),
                                position.side,
                            ),
                            position.clone(),
                        );
                    }
                }
            }
            _ => {}
        }
    }

    fn upsert(&self, position: Position) {
        let key = (
            position.sub_account.clone(),
            position.symbol.clone(),
            position.side,
        );
        let mut map = self.positions.write();
        // Net qty reaching zero closes the position.
        if position.is_open() {
            map.insert(key, position);
        } else {
            map.remove(&key);
        }
    }

    pub fn position(&self, sub_account: &str, symbol: &str, side: Side) -> Option<Position> {
        self.positions
            .read()
            .get(&(sub_account.to_string(), symbol.to_string(), side))
            .cloned()
    }

    pub fn position_by_id(&self, position_id: &PositionId) -> Option<Position> {
        self.positions
            .read()
            .values()
            .find(|p| &p.position_id == position_id)
            .cloned()
    }

    pub fn positions_for(&self, sub_account: &str) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.sub_account == sub_account)
            .cloned()
            .collect()
    }

    /// Gross open notional across one sub-account and symbol.
    pub fn symbol_notional(&self, sub_account: &str, symbol: &str) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| p.sub_account == sub_account && p.symbol == symbol)
            .map(|p| p.notional)
            .sum()
    }

    /// Gross open notional across one sub-account.
    pub fn account_notional(&self, sub_account: &str) -> f64 {
        self.positions
            .read()
            .values()
            .filter(|p| p.sub_account == sub_account)
            .map(|p| p.notional)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(sub: &str, symbol: &str, side: Side, qty: f64, entry: f64) -> Position {
        Position {
            position_id: format!("{sub}:{symbol}:{}", side.as_str()),
            sub_account: sub.into(),
            symbol: symbol.into(),
            side,
            quantity: qty,
            entry_price: entry,
            notional: qty * entry,
            leverage: 3.0,
            liquidation_price: None,
        }
    }

    #[test]
    fn upsert_and_lookup() {
        let book = RiskBook::new();
        book.apply_event(&EngineEvent::PositionUpdate(position(
            "acct", "BTCUSDT", Side::Long, 2.0, 100.0,
        )));

        let p = book.position("acct", "BTCUSDT", Side::Long).unwrap();
        assert_eq!(p.quantity, 2.0);
        assert!(book
            .position_by_id(&"acct:BTCUSDT:long".to_string())
            .is_some());
        assert_eq!(book.account_notional("acct"), 200.0);
    }

    #[test]
    fn zero_qty_closes_position() {
        let book = RiskBook::new();
        book.apply_event(&EngineEvent::PositionUpdate(position(
            "acct", "BTCUSDT", Side::Long, 2.0, 100.0,
        )));
        book.apply_event(&EngineEvent::PositionUpdate(position(
            "acct", "BTCUSDT", Side::Long, 0.0, 100.0,
        )));
        assert!(book.position("acct", "BTCUSDT", Side::Long).is_none());
    }

    #[test]
    fn snapshot_replaces_book() {
        let book = RiskBook::new();
        book.apply_event(&EngineEvent::PositionUpdate(position(
            "acct", "BTCUSDT", Side::Long, 2.0, 100.0,
        )));
        book.apply_event(&EngineEvent::PositionsSnapshot(vec![
            position("acct", "ETHUSDT", Side::Short, 1.0, 3000.0),
            position("acct", "SOLUSDT", Side::Long, 0.0, 150.0),
        ]));

        assert!(book.position("acct", "BTCUSDT", Side::Long).is_none());
        assert!(book.position("acct", "ETHUSDT", Side::Short).is_some());
        // Zero-qty snapshot entries are not open positions.
        assert!(book.position("acct", "SOLUSDT", Side::Long).is_none());
        assert_eq!(book.account_notional("acct"), 3000.0);
    }

    #[test]
    fn notional_scoping() {
        let book = RiskBook::new();
        book.apply_event(&EngineEvent::PositionUpdate(position(
            "a", "BTCUSDT", Side::Long, 1.0, 100.0,
        )));
        book.apply_event(&EngineEvent::PositionUpdate(position(
            "a", "BTCUSDT", Side::Short, 1.0, 100.0,
        )));
        book.apply_event(&EngineEvent::PositionUpdate(position(
            "b", "BTCUSDT", Side::Long, 5.0, 100.0,
        )));

        assert_eq!(book.symbol_notional("a", "BTCUSDT"), 200.0);
        assert_eq!(book.account_notional("b"), 500.0);
        assert_eq!(book.positions_for("a").len(), 2);
    }
}
