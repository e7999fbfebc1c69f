//! Subscription registry for pushed updates.
//!
//! Subscriptions are indexed by key in sharded buckets so that one update
//! reaches every subscription sharing its key without touching unrelated
//! keys. Each (subscription, key) binding owns its filter state.
//!
//! Removal takes the write lock of every bucket the subscription lives in,
//! which waits out any ingestion pass still evaluating it. Once
//! [`SubscriptionRegistry::remove`] returns, no new delivery for that id
//! can be queued.

mod registry;
mod types;

pub use registry::SubscriptionRegistry;
pub use types::{
    Delivery, FrameCallback, Handler, SignalCallback, Subscription, SubscriptionStats,
};
