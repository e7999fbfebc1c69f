//! Per-key storage of received updates.
//!
//! - [`HistoryCache`]: bounded, time-ordered history per key, read by
//!   time window
//! - [`LastValueStore`]: most recent update per key
//!
//! Both hand out `Arc<Update>` so a read never observes a partially
//! written update.

mod history;
mod last_value;

pub use history::{CacheStats, HistoryCache};
pub use last_value::LastValueStore;
