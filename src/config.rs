//! Process configuration. Every knob has a hard-coded default and an optional
//! env override; `.env` is honoured when present.

use serde::{Deserialize, Serialize};

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_path: String,
    /// Execution gateway WebSocket endpoint.
    pub engine_url: String,
    /// Run against the in-process paper engine instead of the gateway.
    pub paper_mode: bool,
    /// Default engine request timeout (ms).
    pub engine_timeout_ms: u64,
    /// Heartbeat staleness after which the engine is considered not ready (ms).
    pub engine_heartbeat_timeout_ms: u64,
    /// REST snapshot endpoint for cold price reads.
    pub rest_snapshot_url: String,
    /// Symbols the live feed subscribes to at startup.
    pub feed_symbols: Vec<String>,

    // Per-kind concurrency caps
    pub max_twap: usize,
    pub max_twap_basket: usize,
    pub max_trail_stop: usize,
    pub max_chase: usize,
    pub max_scalper: usize,
    pub max_agents: usize,

    // Durable snapshot TTLs
    pub twap_snapshot_ttl_hours: i64,
    pub trail_snapshot_ttl_hours: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8090,
            database_path: "./perpbot.db".to_string(),
            engine_url: "ws://127.0.0.1:9010/engine".to_string(),
            paper_mode: true,
            engine_timeout_ms: 15_000,
            engine_heartbeat_timeout_ms: 10_000,
            rest_snapshot_url: "https://fapi.binance.com/fapi/v1/ticker/bookTicker".to_string(),
            feed_symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
            ],
            max_twap: 500,
            max_twap_basket: 200,
            max_trail_stop: 500,
            max_chase: 500,
            max_scalper: 200,
            max_agents: 50,
            twap_snapshot_ttl_hours: 12,
            trail_snapshot_ttl_hours: 24,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let d = Self::default();

        let feed_symbols = std::env::var("FEED_SYMBOLS")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(d.feed_symbols);

        Self {
            port: env_parse("PORT", d.port),
            database_path: std::env::var("DATABASE_PATH").unwrap_or(d.database_path),
            engine_url: std::env::var("ENGINE_URL").unwrap_or(d.engine_url),
            paper_mode: env_flag("PAPER_MODE", d.paper_mode),
            engine_timeout_ms: env_parse("ENGINE_TIMEOUT_MS", d.engine_timeout_ms),
            engine_heartbeat_timeout_ms: env_parse(
                "ENGINE_HEARTBEAT_TIMEOUT_MS",
                d.engine_heartbeat_timeout_ms,
            ),
            rest_snapshot_url: std::env::var("REST_SNAPSHOT_URL").unwrap_or(d.rest_snapshot_url),
            feed_symbols,
            max_twap: env_parse("MAX_TWAP", d.max_twap),
            max_twap_basket: env_parse("MAX_TWAP_BASKET", d.max_twap_basket),
            max_trail_stop: env_parse("MAX_TRAIL_STOP", d.max_trail_stop),
            max_chase: env_parse("MAX_CHASE", d.max_chase),
            max_scalper: env_parse("MAX_SCALPER", d.max_scalper),
            max_agents: env_parse("MAX_AGENTS", d.max_agents),
            twap_snapshot_ttl_hours: env_parse("TWAP_SNAPSHOT_TTL_HOURS", d.twap_snapshot_ttl_hours),
            trail_snapshot_ttl_hours: env_parse(
                "TRAIL_SNAPSHOT_TTL_HOURS",
                d.trail_snapshot_ttl_hours,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.max_twap, 500);
        assert_eq!(cfg.max_agents, 50);
        assert_eq!(cfg.engine_timeout_ms, 15_000);
        assert!(cfg.paper_mode);
    }
}
