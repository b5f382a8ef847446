//! Startup resume: reconstruct running strategies from durable snapshots.
//!
//! Entries whose underlying position is gone, or whose whole schedule elapsed
//! during the outage, are discarded. A surviving TWAP fast-forwards its lot
//! counter past the downtime; skipped lots are recorded, never retried.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use crate::strategies::{
    trail_stop::TrailStopSnapshot,
    twap::TwapSnapshot,
    twap_basket::TwapBasketSnapshot,
    StrategyRegistry,
};

/// What to do with one persisted TWAP-like schedule after downtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// Every scheduled lot should already have fired.
    Discard,
    Resume {
        filled_lots: u32,
        /// Lots skipped during the outage (recorded, not retried).
        skipped: u32,
        next_order_at: i64,
    },
}

/// Lot `k` (1-based) fires at `started_at + k * interval`. After an outage,
/// the lot counter jumps to everything that should have fired and the next
/// lot lands on the next interval boundary.
pub fn compute_resume_plan(
    total_lots: u32,
    persisted_filled: u32,
    started_at_ms: i64,
    interval_ms: u64,
    now_ms: i64,
) -> ResumeDecision {
    let interval_ms = interval_ms.max(1) as i64;
    let elapsed = (now_ms - started_at_ms).max(0);
    let expected = (elapsed / interval_ms) as u32;

    // The whole schedule elapsed during downtime.
    if expected >= total_lots {
        return ResumeDecision::Discard;
    }

    let filled_lots = persisted_filled.max(expected).min(total_lots);
    ResumeDecision::Resume {
        filled_lots,
        skipped: filled_lots.saturating_sub(persisted_filled),
        next_order_at: started_at_ms + (filled_lots as i64 + 1) * interval_ms,
    }
}

#[derive(Debug, Default)]
pub struct ResumeStats {
    pub resumed: usize,
    pub discarded: usize,
}

/// Enumerate the store and rebuild actors. Called once at process start,
/// after the engine link and feed are up.
pub async fn resume_all(registry: &Arc<StrategyRegistry>) -> Result<ResumeStats> {
    let ctx = registry.ctx().clone();
    let mut stats = ResumeStats::default();

    ctx.store.sweep_expired().await?;
    let now_ms = chrono::Utc::now().timestamp_millis();

    for (key, value) in ctx.store.list_kind("twap").await? {
        let snapshot: TwapSnapshot = match serde_json::from_value(value) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(key, error = %e, "unreadable twap snapshot; discarding");
                ctx.store.delete(&key).await?;
                stats.discarded += 1;
                continue;
            }
        };
        if snapshot.status.is_terminal() {
            ctx.store.delete(&key).await?;
            stats.discarded += 1;
            continue;
        }

        let mut runtime = snapshot.runtime;
        match compute_resume_plan(
            runtime.total_lots,
            runtime.filled_lots,
            runtime.started_at,
            runtime.interval_ms,
            now_ms,
        ) {
            ResumeDecision::Discard => {
                info!(twap = %snapshot.id, "twap schedule fully elapsed; discarding");
                ctx.store.delete(&key).await?;
                stats.discarded += 1;
            }
            ResumeDecision::Resume {
                filled_lots,
                skipped,
                next_order_at,
            } => {
                if skipped > 0 {
                    runtime
                        .errors
                        .push(format!("resume: {skipped} lots skipped during downtime"));
                }
                runtime.filled_lots = filled_lots;
                runtime.next_order_at = next_order_at;
                match registry.resume_twap(snapshot.id.clone(), snapshot.params, runtime) {
                    Ok(_) => stats.resumed += 1,
                    Err(e) => {
                        warn!(twap = %snapshot.id, error = %e, "twap resume refused");
                        stats.discarded += 1;
                    }
                }
            }
        }
    }

    for (key, value) in ctx.store.list_kind("twap_basket").await? {
        let snapshot: TwapBasketSnapshot = match serde_json::from_value(value) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(key, error = %e, "unreadable basket snapshot; discarding");
                ctx.store.delete(&key).await?;
                stats.discarded += 1;
                continue;
            }
        };
        if snapshot.status.is_terminal() {
            ctx.store.delete(&key).await?;
            stats.discarded += 1;
            continue;
        }

        let mut runtime = snapshot.runtime;
        match compute_resume_plan(
            runtime.total_lots,
            runtime.filled_lots,
            runtime.started_at,
            runtime.interval_ms,
            now_ms,
        ) {
            ResumeDecision::Discard => {
                ctx.store.delete(&key).await?;
                stats.discarded += 1;
            }
            ResumeDecision::Resume {
                filled_lots,
                skipped,
                next_order_at,
            } => {
                if skipped > 0 {
                    runtime
                        .errors
                        .push(format!("resume: {skipped} lots skipped during downtime"));
                }
                runtime.filled_lots = filled_lots;
                runtime.next_order_at = next_order_at;
                match registry.resume_twap_basket(snapshot.id.clone(), snapshot.params, runtime) {
                    Ok(_) => stats.resumed += 1,
                    Err(e) => {
                        warn!(basket = %snapshot.id, error = %e, "basket resume refused");
                        stats.discarded += 1;
                    }
                }
            }
        }
    }

    for (key, value) in ctx.store.list_kind("trail_stop").await? {
        let snapshot: TrailStopSnapshot = match serde_json::from_value(value) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(key, error = %e, "unreadable trail snapshot; discarding");
                ctx.store.delete(&key).await?;
                stats.discarded += 1;
                continue;
            }
        };
        if snapshot.status.is_terminal() {
            ctx.store.delete(&key).await?;
            stats.discarded += 1;
            continue;
        }

        // Position closed elsewhere while we were down: discard, never resume.
        if ctx
            .risk
            .position_by_id(&snapshot.runtime.position_id)
            .is_none()
        {
            info!(
                trail = %snapshot.id,
                position = %snapshot.runtime.position_id,
                "trail stop target no longer open; discarding"
            );
            ctx.store.delete(&key).await?;
            stats.discarded += 1;
            continue;
        }

        match registry.resume_trail_stop(snapshot.id.clone(), snapshot.params, snapshot.runtime) {
            Ok(_) => stats.resumed += 1,
            Err(e) => {
                warn!(trail = %snapshot.id, error = %e, "trail resume refused");
                stats.discarded += 1;
            }
        }
    }

    info!(
        resumed = stats.resumed,
        discarded = stats.discarded,
        "durable resume complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seventeen_minute_outage_scenario() {
        // totalLots=10, 20 minutes => 2-minute interval; started 17 minutes
        // ago with 4 lots persisted. Expected floor(17/2) = 8.
        let interval_ms = 2 * 60 * 1_000u64;
        let now = 1_700_000_000_000i64;
        let started = now - 17 * 60 * 1_000;

        match compute_resume_plan(10, 4, started, interval_ms, now) {
            ResumeDecision::Resume {
                filled_lots,
                skipped,
                next_order_at,
            } => {
                assert_eq!(filled_lots, 8);
                assert_eq!(skipped, 4);
                // Lot 9 lands on the next interval boundary: start + 18 min.
                assert_eq!(next_order_at, started + 18 * 60 * 1_000);
            }
            other => panic!("expected resume, got {other:?}"),
        }
    }

    #[test]
    fn fully_elapsed_schedule_is_discarded() {
        let interval_ms = 60_000u64;
        let now = 1_700_000_000_000i64;
        let started = now - 3_600_000; // 60 intervals ago
        assert_eq!(
            compute_resume_plan(10, 4, started, interval_ms, now),
            ResumeDecision::Discard
        );
    }

    #[test]
    fn progress_never_regresses() {
        let interval_ms = 60_000u64;
        let now = 1_700_000_000_000i64;
        // Only 2 intervals elapsed but 5 lots were already filled.
        let started = now - 2 * 60_000;
        match compute_resume_plan(10, 5, started, interval_ms, now) {
            ResumeDecision::Resume {
                filled_lots,
                skipped,
                ..
            } => {
                assert_eq!(filled_lots, 5);
                assert_eq!(skipped, 0);
            }
            other => panic!("expected resume, got {other:?}"),
        }
    }

    #[test]
    fn completion_not_falsely_declared() {
        // 9 of 10 intervals elapsed: resume with one lot left, not discard.
        let interval_ms = 60_000u64;
        let now = 1_700_000_000_000i64;
        let started = now - 9 * 60_000;
        match compute_resume_plan(10, 0, started, interval_ms, now) {
            ResumeDecision::Resume { filled_lots, .. } => assert_eq!(filled_lots, 9),
            other => panic!("expected resume, got {other:?}"),
        }
    }
}
