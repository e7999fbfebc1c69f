//! Ingestion gate: the single entry point for bus updates.
//!
//! For each update the gate writes the history cache and the last-value
//! store, evaluates the subscriptions bound to the update's key and queues
//! forwarded updates on the dispatcher. Faults in the input are logged and
//! counted here; they never reach the bus driver or the read API.

use crate::cache::{HistoryCache, LastValueStore};
use crate::config::ArchitectureConfig;
use crate::decoder::SignalDecoder;
use crate::dispatch::Dispatcher;
use crate::error::CanError;
use crate::subscriptions::SubscriptionRegistry;
use crate::types::{BusName, FrameId, Key, SignalId, SignalValue, Timestamp, Update};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Snapshot of ingestion counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Frames accepted from the driver.
    pub frames_received: u64,
    /// Frames on a known bus whose id the architecture does not declare;
    /// they are decoded for signals but not stored.
    pub frames_ignored: u64,
    /// Signal updates produced by decoding or received directly.
    pub signals_received: u64,
    /// Updates dropped as malformed (unknown bus, oversize payload, type mismatch).
    pub malformed: u64,
    /// Frames the signal decoder failed on.
    pub decode_failures: u64,
    /// History writes refused by the memory ceiling.
    pub cache_rejections: u64,
    /// Forwarding decisions handed to the dispatcher.
    pub forwarded: u64,
}

#[derive(Default)]
struct Counters {
    frames_received: AtomicU64,
    frames_ignored: AtomicU64,
    signals_received: AtomicU64,
    malformed: AtomicU64,
    decode_failures: AtomicU64,
    cache_rejections: AtomicU64,
    forwarded: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Entry point invoked by bus drivers.
pub struct IngestionGate {
    architecture: Arc<ArchitectureConfig>,
    buses: HashSet<BusName>,
    max_payload_len: usize,
    history: Arc<HistoryCache>,
    last_values: Arc<LastValueStore>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    decoder: Option<Arc<dyn SignalDecoder>>,
    counters: Counters,
}

impl IngestionGate {
    pub fn new(
        architecture: Arc<ArchitectureConfig>,
        max_payload_len: usize,
        history: Arc<HistoryCache>,
        last_values: Arc<LastValueStore>,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Arc<Dispatcher>,
        decoder: Option<Arc<dyn SignalDecoder>>,
    ) -> Self {
        let buses = architecture.buses.iter().map(|b| b.name).collect();
        Self {
            architecture,
            buses,
            max_payload_len,
            history,
            last_values,
            registry,
            dispatcher,
            decoder,
            counters: Counters::default(),
        }
    }

    /// Accept one raw frame from a bus driver.
    pub fn ingest_frame(&self, bus: BusName, frame_id: FrameId, payload: Vec<u8>, timestamp: Timestamp) {
        if !self.buses.contains(&bus) {
            bump(&self.counters.malformed);
            warn!(%bus, frame_id, "frame from unknown bus dropped");
            return;
        }
        if payload.len() > self.max_payload_len {
            bump(&self.counters.malformed);
            warn!(
                %bus,
                frame_id,
                len = payload.len(),
                max = self.max_payload_len,
                "oversize frame dropped"
            );
            return;
        }
        bump(&self.counters.frames_received);

        let signals = match &self.decoder {
            Some(decoder) => match decoder.decode(bus, frame_id, &payload) {
                Ok(signals) => signals,
                Err(e) => {
                    bump(&self.counters.decode_failures);
                    warn!(%bus, frame_id, error = %e, "signal decoding failed");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        if self.architecture.declares_frame(bus, frame_id) {
            self.process(Arc::new(Update::frame(bus, frame_id, timestamp, payload)));
        } else {
            bump(&self.counters.frames_ignored);
        }

        for signal in signals {
            bump(&self.counters.signals_received);
            self.process(Arc::new(Update::signal(
                bus,
                signal.id,
                timestamp,
                signal.name,
                signal.value,
            )));
        }
    }

    /// Accept an already decoded signal value.
    ///
    /// The value must carry the type the signal database declares.
    pub fn ingest_signal(
        &self,
        bus: BusName,
        signal_id: SignalId,
        value: SignalValue,
        timestamp: Timestamp,
    ) {
        let info = match &self.decoder {
            Some(decoder) if self.buses.contains(&bus) => decoder.signal_info(bus, signal_id),
            _ => None,
        };
        let info = match info {
            Some(info) => info,
            None => {
                bump(&self.counters.malformed);
                warn!(%bus, signal_id, "unknown signal dropped");
                return;
            }
        };
        if info.data_type != value.data_type() {
            bump(&self.counters.malformed);
            warn!(
                %bus,
                signal_id,
                declared = ?info.data_type,
                got = ?value.data_type(),
                "signal type mismatch, update dropped"
            );
            return;
        }

        bump(&self.counters.signals_received);
        self.process(Arc::new(Update::signal(bus, signal_id, timestamp, info.name, value)));
    }

    fn process(&self, update: Arc<Update>) {
        match self.history.write(Arc::clone(&update)) {
            Ok(()) => {}
            Err(CanError::MemoryFull { used, ceiling }) => {
                bump(&self.counters.cache_rejections);
                warn!(key = %update.key, used, ceiling, "history cache full, key not cached");
            }
            Err(e) => {
                warn!(key = %update.key, error = %e, "history write failed");
            }
        }

        self.last_values.put(Arc::clone(&update));

        let forwarded = self.registry.fan_out(&update, |sub| {
            self.dispatcher.enqueue(&sub.mailbox, Arc::clone(&update));
        });
        self.counters
            .forwarded
            .fetch_add(forwarded as u64, Ordering::Relaxed);
    }

    pub fn knows_bus(&self, bus: BusName) -> bool {
        self.buses.contains(&bus)
    }

    pub fn is_cached(&self, key: &Key) -> bool {
        self.history.contains(key)
    }

    pub fn stats(&self) -> IngestStats {
        let c = &self.counters;
        IngestStats {
            frames_received: c.frames_received.load(Ordering::Relaxed),
            frames_ignored: c.frames_ignored.load(Ordering::Relaxed),
            signals_received: c.signals_received.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            cache_rejections: c.cache_rejections.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
        }
    }
}
