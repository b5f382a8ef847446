//! Durable strategy state: snapshot store and startup resume.

pub mod resume;
pub mod snapshots;

pub use resume::{compute_resume_plan, resume_all, ResumeDecision, ResumeStats};
pub use snapshots::{
    trail_stop_key, twap_basket_key, twap_key, PersistThrottle, SnapshotStore,
};
