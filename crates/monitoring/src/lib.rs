//! Logging bootstrap shared by services embedding the channel pool.
//!
//! Provides console or daily-rotating file logging, configured through
//! environment variables so deployments can switch destinations without a
//! rebuild. Metrics backends are intentionally not wired here; the channel
//! pool emits `tracing` events and lifecycle insights only.

mod logging;

pub use logging::{init_logging, init_test_logging};
