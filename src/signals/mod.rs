//! Signal primitives and derived layers.
//!
//! Leaves first: rolling windows and EMA trackers are pure state machines over
//! numeric streams, mutated only by their owning strategy. On top of them sit
//! the tick regime classifier and the composite directional signal.

pub mod composite;
pub mod ema;
pub mod ladder;
pub mod regime;
pub mod rolling;

pub use composite::{CompositeConfig, CompositeInputs, CompositeResult, CompositeSignal};
pub use ema::{Ema, EmaZScore};
pub use ladder::{exponential_offsets, skew_weights, MAX_SPREAD_FACTOR};
pub use regime::{Regime, RegimeClassifier, RegimeConfig, RegimeResult};
pub use rolling::{RollingMedian, RollingQty, RollingRv};
