//! Market-data ingestion adapter.
//!
//! Push-only source of mark prices, best bid/ask, and aggressive trades.
//! Strategies consume the [`PriceFeed`] cache and its broadcast channels;
//! the live consumer task feeds it from Binance perpetual streams.

pub mod price_feed;

pub use price_feed::{BookTick, BookUpdate, PriceFeed, TradeUpdate};
