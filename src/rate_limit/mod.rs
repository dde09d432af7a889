//! Per-source admission control and health tracking.
//!
//! Each source gets its own sliding request window and health state machine.
//! Sources never share a lock, so a saturated source cannot stall another.

mod health;
mod manager;
mod window;

pub use health::{Health, HealthTracker, Outcome};
pub use manager::{Admission, HealthTransition, RateLimitManager};
pub use window::SlidingWindow;
