//! Subscription types.

use crate::dispatch::Mailbox;
use crate::types::{BusName, FilterMode, FrameData, Key, SignalData, SubscriptionId, Update};
use std::fmt;
use std::sync::Arc;

/// Callback invoked with each forwarded frame.
pub type FrameCallback = Arc<dyn Fn(&FrameData) + Send + Sync>;

/// Callback invoked with each forwarded signal.
pub type SignalCallback = Arc<dyn Fn(&SignalData) + Send + Sync>;

/// Registered subscriber callback.
#[derive(Clone)]
pub enum Handler {
    Frame(FrameCallback),
    Signal(SignalCallback),
}

impl Handler {
    /// Invoke the callback if the update matches its kind.
    pub fn invoke(&self, update: &Update) {
        match self {
            Handler::Frame(callback) => {
                if let Some(frame) = update.to_frame_data() {
                    callback(&frame);
                }
            }
            Handler::Signal(callback) => {
                if let Some(signal) = update.to_signal_data() {
                    callback(&signal);
                }
            }
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Frame(_) => write!(f, "Handler::Frame"),
            Handler::Signal(_) => write!(f, "Handler::Signal"),
        }
    }
}

/// How forwarded updates reach the callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Bounded per-subscription queue on the regular worker pool.
    Queued,
    /// Single latest-wins slot on the RT worker pool.
    RealTime,
}

/// An active subscription.
pub struct Subscription {
    pub id: SubscriptionId,
    pub bus: BusName,
    pub keys: Vec<Key>,
    pub filter: FilterMode,
    pub sampling: u16,
    pub delivery: Delivery,
    pub(crate) mailbox: Arc<Mailbox>,
}

impl Subscription {
    pub fn stats(&self) -> SubscriptionStats {
        self.mailbox.stats()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("bus", &self.bus)
            .field("keys", &self.keys)
            .field("filter", &self.filter)
            .field("sampling", &self.sampling)
            .field("delivery", &self.delivery)
            .finish()
    }
}

/// Delivery counters of one subscription.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Callbacks that returned normally.
    pub delivered: u64,
    /// Pending deliveries discarded because the mailbox was full.
    pub dropped: u64,
    /// Callbacks that panicked.
    pub callback_panics: u64,
    /// Deliveries waiting in the mailbox.
    pub pending: usize,
}
