use anyhow::{Context, Result};
use barter_data::{
    exchange::binance::futures::BinanceFuturesUsd,
    streams::{reconnect::Event as ReconnectEvent, Streams},
    subscription::book::OrderBooksL1,
};
use barter_instrument::instrument::market_data::{
    kind::MarketDataInstrumentKind, MarketDataInstrument,
};
use futures_util::StreamExt;
use parking_lot::RwLock;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::models::Symbol;

/// One L1 book observation. Mark is the venue fair price; until the live
/// adapter carries the dedicated mark stream it is approximated by the mid.
#[derive(Debug, Clone, Copy)]
pub struct BookTick {
    pub ts_ms: i64,
    pub mark: f64,
    pub bid: f64,
    pub ask: f64,
}

impl BookTick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread_bps(&self) -> f64 {
        if self.mark <= 0.0 {
            return 0.0;
        }
        (self.ask - self.bid).max(0.0) / self.mark * 10_000.0
    }
}

/// Book update event for reactive consumers.
#[derive(Debug, Clone)]
pub struct BookUpdate {
    pub symbol: Symbol,
    pub tick: BookTick,
}

/// Aggressive trade event.
#[derive(Debug, Clone)]
pub struct TradeUpdate {
    pub symbol: Symbol,
    pub ts_ms: i64,
    pub price: f64,
    pub qty: f64,
    pub is_buy: bool,
}

#[derive(Debug, Default)]
struct SymbolState {
    latest: Option<BookTick>,
    history: VecDeque<BookTick>,
    /// Reference count of interested strategies; last release drops the state.
    subscribers: usize,
}

/// Per-symbol price cache with broadcast fan-out, fed either by the live
/// Binance consumer or directly via [`PriceFeed::push_tick`] (paper mode,
/// tests).
#[derive(Debug)]
pub struct PriceFeed {
    inner: RwLock<HashMap<Symbol, SymbolState>>,
    update_tx: broadcast::Sender<BookUpdate>,
    trade_tx: broadcast::Sender<TradeUpdate>,
    max_history_len: usize,
    http: reqwest::Client,
    rest_snapshot_url: String,
}

impl PriceFeed {
    pub fn new(rest_snapshot_url: impl Into<String>) -> Arc<Self> {
        let (update_tx, _) = broadcast::channel(4096);
        let (trade_tx, _) = broadcast::channel(4096);
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            update_tx,
            trade_tx,
            max_history_len: 3_600, // ~1h at 1Hz
            http: reqwest::Client::new(),
            rest_snapshot_url: rest_snapshot_url.into(),
        })
    }

    /// Subscribe to book updates for all symbols; consumers filter by symbol.
    pub fn subscribe(&self) -> broadcast::Receiver<BookUpdate> {
        self.update_tx.subscribe()
    }

    pub fn subscribe_trades(&self) -> broadcast::Receiver<TradeUpdate> {
        self.trade_tx.subscribe()
    }

    /// Register interest in a symbol. Returns true when this is the first
    /// subscriber (feed-level subscription should be established).
    pub fn retain(&self, symbol: &str) -> bool {
        let mut map = self.inner.write();
        let state = map.entry(symbol.to_string()).or_default();
        state.subscribers += 1;
        state.subscribers == 1
    }

    /// Drop interest in a symbol. Returns true when this was the last
    /// subscriber; the cached state is discarded in that case.
    pub fn release(&self, symbol: &str) -> bool {
        let mut map = self.inner.write();
        match map.get_mut(symbol) {
            Some(state) => {
                state.subscribers = state.subscribers.saturating_sub(1);
                if state.subscribers == 0 {
                    map.remove(symbol);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.inner.read().get(symbol).map(|s| s.subscribers).unwrap_or(0)
    }

    pub fn latest(&self, symbol: &str) -> Option<BookTick> {
        self.inner.read().get(symbol).and_then(|s| s.latest)
    }

    /// Push one book tick into the cache and broadcast it.
    pub fn push_tick(&self, symbol: &str, tick: BookTick) {
        {
            let mut map = self.inner.write();
            let state = map.entry(symbol.to_string()).or_default();
            state.latest = Some(tick);

            // Downsample history to ~1 point per second.
            let should_push = match state.history.back() {
                Some(last) => tick.ts_ms - last.ts_ms >= 1_000,
                None => true,
            };
            if should_push {
                state.history.push_back(tick);
                while state.history.len() > self.max_history_len {
                    state.history.pop_front();
                }
            } else if let Some(last) = state.history.back_mut() {
                *last = tick;
            }
        }

        if let Err(e) = self.update_tx.send(BookUpdate {
            symbol: symbol.to_string(),
            tick,
        }) {
            trace!(symbol, "no active book subscribers: {e}");
        }
    }

    pub fn push_trade(&self, trade: TradeUpdate) {
        if let Err(e) = self.trade_tx.send(trade) {
            trace!("no active trade subscribers: {e}");
        }
    }

    /// Resolve a price, preferring the push-stream cache and falling back to
    /// one REST snapshot when the cache is cold.
    pub async fn resolve(&self, symbol: &str) -> Result<BookTick> {
        if let Some(tick) = self.latest(symbol) {
            return Ok(tick);
        }
        let tick = self.rest_snapshot(symbol).await?;
        self.push_tick(symbol, tick);
        Ok(tick)
    }

    /// One REST book-ticker snapshot.
    pub async fn rest_snapshot(&self, symbol: &str) -> Result<BookTick> {
        #[derive(serde::Deserialize)]
        struct WireBookTicker {
            #[serde(rename = "bidPrice")]
            bid_price: String,
            #[serde(rename = "askPrice")]
            ask_price: String,
        }

        let resp: WireBookTicker = self
            .http
            .get(&self.rest_snapshot_url)
            .query(&[("symbol", symbol)])
            .send()
            .await
            .context("book ticker snapshot request")?
            .json()
            .await
            .context("book ticker snapshot decode")?;

        let bid: f64 = resp.bid_price.parse().context("bid price parse")?;
        let ask: f64 = resp.ask_price.parse().context("ask price parse")?;
        anyhow::ensure!(bid > 0.0 && ask >= bid, "bad snapshot for {symbol}: {bid}/{ask}");

        Ok(BookTick {
            ts_ms: chrono::Utc::now().timestamp_millis(),
            mark: (bid + ask) / 2.0,
            bid,
            ask,
        })
    }

    /// Spawn the live Binance perpetual consumer for `symbols`.
    pub async fn spawn_live(self: &Arc<Self>, symbols: &[String]) -> Result<()> {
        // NOTE: `barter-data`'s `StreamBuilder` futures are `!Send`, so streams
        // must be initialised outside of `tokio::spawn`.
        let streams = init_streams(symbols).await?;
        for symbol in symbols {
            self.retain(symbol);
        }

        let feed = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = feed.consume(streams).await {
                warn!(error = %e, "binance book feed stopped");
            }
        });
        Ok(())
    }

    async fn consume(
        self: Arc<Self>,
        streams: Streams<
            barter_data::streams::consumer::MarketStreamResult<
                MarketDataInstrument,
                barter_data::subscription::book::OrderBookL1,
            >,
        >,
    ) -> Result<()> {
        let mut joined = streams.select_all();
        while let Some(event) = joined.next().await {
            match event {
                ReconnectEvent::Reconnecting(exchange) => {
                    warn!(?exchange, "book stream reconnecting");
                }
                ReconnectEvent::Item(Ok(market_event)) => {
                    let symbol = to_symbol(&market_event.instrument);
                    let ts_ms = market_event.time_exchange.timestamp_millis();

                    let bid = market_event
                        .kind
                        .best_bid
                        .as_ref()
                        .and_then(|l| l.price.to_string().parse::<f64>().ok());
                    let ask = market_event
                        .kind
                        .best_ask
                        .as_ref()
                        .and_then(|l| l.price.to_string().parse::<f64>().ok());

                    let (Some(bid), Some(ask)) = (bid, ask) else {
                        continue;
                    };
                    if !(bid.is_finite() && ask.is_finite() && bid > 0.0 && ask >= bid) {
                        continue;
                    }

                    self.push_tick(
                        &symbol,
                        BookTick {
                            ts_ms,
                            mark: (bid + ask) / 2.0,
                            bid,
                            ask,
                        },
                    );
                }
                ReconnectEvent::Item(Err(e)) => {
                    debug!(error = %e, "book stream error")
                }
            }
        }
        Ok(())
    }
}

async fn init_streams(
    symbols: &[String],
) -> Result<
    Streams<
        barter_data::streams::consumer::MarketStreamResult<
            MarketDataInstrument,
            barter_data::subscription::book::OrderBookL1,
        >,
    >,
> {
    let subscriptions: Vec<_> = symbols
        .iter()
        .filter_map(|s| {
            let (base, quote) = split_symbol(s)?;
            Some((
                BinanceFuturesUsd::default(),
                base,
                quote,
                MarketDataInstrumentKind::Perpetual,
                OrderBooksL1,
            ))
        })
        .collect();

    Streams::<OrderBooksL1>::builder()
        .subscribe(subscriptions)
        .init()
        .await
        .context("failed to init binance perpetual book streams")
}

/// `BTCUSDT` -> (`btc`, `usdt`). Quote is assumed to be USDT/USDC/USD.
fn split_symbol(symbol: &str) -> Option<(String, String)> {
    for quote in ["USDT", "USDC", "USD"] {
        if let Some(base) = symbol.strip_suffix(quote) {
            if !base.is_empty() {
                return Some((base.to_ascii_lowercase(), quote.to_ascii_lowercase()));
            }
        }
    }
    None
}

fn to_symbol(instrument: &MarketDataInstrument) -> String {
    format!("{}{}", instrument.base, instrument.quote).to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(ts_ms: i64, mid: f64) -> BookTick {
        BookTick {
            ts_ms,
            mark: mid,
            bid: mid - 0.5,
            ask: mid + 0.5,
        }
    }

    #[test]
    fn push_updates_latest_and_broadcasts() {
        let feed = PriceFeed::new("http://unused");
        let mut rx = feed.subscribe();
        feed.push_tick("BTCUSDT", tick(1_000, 50_000.0));

        assert_eq!(feed.latest("BTCUSDT").unwrap().mark, 50_000.0);
        let update = rx.try_recv().unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.tick.bid, 49_999.5);
    }

    #[test]
    fn refcounted_subscriptions() {
        let feed = PriceFeed::new("http://unused");
        assert!(feed.retain("ETHUSDT"));
        assert!(!feed.retain("ETHUSDT"));
        assert_eq!(feed.subscriber_count("ETHUSDT"), 2);

        assert!(!feed.release("ETHUSDT"));
        assert!(feed.release("ETHUSDT"));
        assert_eq!(feed.subscriber_count("ETHUSDT"), 0);
        // Releasing an unknown symbol is a no-op.
        assert!(!feed.release("ETHUSDT"));
    }

    #[test]
    fn history_downsamples_to_one_hz() {
        let feed = PriceFeed::new("http://unused");
        for i in 0..10 {
            feed.push_tick("BTCUSDT", tick(i * 100, 100.0 + i as f64));
        }
        let map = feed.inner.read();
        let state = map.get("BTCUSDT").unwrap();
        // All ten ticks land within one second: single history slot, latest value.
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].mark, 109.0);
    }

    #[test]
    fn spread_bps() {
        let t = BookTick {
            ts_ms: 0,
            mark: 100.0,
            bid: 99.95,
            ask: 100.05,
        };
        assert!((t.spread_bps() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn symbol_split() {
        assert_eq!(
            split_symbol("BTCUSDT"),
            Some(("btc".to_string(), "usdt".to_string()))
        );
        assert_eq!(split_symbol("USDT"), None);
        assert_eq!(split_symbol("XYZ"), None);
    }
}
