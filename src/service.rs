//! The CAN service API and the engine behind it.

use crate::cache::{CacheStats, HistoryCache, LastValueStore};
use crate::config::{ArchitectureConfig, ConfigSource, ConfigurationInfo, ServiceConfig};
use crate::decoder::SignalDecoder;
use crate::dispatch::Dispatcher;
use crate::error::{CanError, Result};
use crate::ingest::{IngestStats, IngestionGate};
use crate::subscriptions::{
    Delivery, FrameCallback, Handler, SignalCallback, Subscription, SubscriptionRegistry,
    SubscriptionStats,
};
use crate::types::{
    BusName, Clock, FilterMode, FrameData, FrameId, Key, SignalData, SignalId, SignalScalar,
    SignalValue, SubscriptionId, Timestamp, TypedSignalData, Update,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Consumer-facing CAN service.
///
/// Implementations are shared between callers through `Arc`; the engine
/// lives as long as its longest holder.
pub trait CanService: Send + Sync {
    /// Latest value of each frame, in request order.
    fn get_frame_last_value(&self, bus: BusName, frame_ids: &[FrameId]) -> Result<Vec<FrameData>>;

    /// History of each frame over the last `history_secs` seconds before
    /// its newest entry, grouped per frame in request order.
    fn get_frame_cache(
        &self,
        bus: BusName,
        frame_ids: &[FrameId],
        history_secs: u8,
    ) -> Result<Vec<FrameData>>;

    fn get_signal_last_value(
        &self,
        bus: BusName,
        signal_ids: &[SignalId],
    ) -> Result<Vec<SignalData>>;

    fn get_signal_cache(
        &self,
        bus: BusName,
        signal_ids: &[SignalId],
        history_secs: u8,
    ) -> Result<Vec<SignalData>>;

    fn subscribe_frame(
        &self,
        bus: BusName,
        frame_ids: &[FrameId],
        callback: FrameCallback,
        filter: FilterMode,
        sampling: u16,
    ) -> Result<SubscriptionId>;

    /// Like [`CanService::subscribe_frame`] with latest-wins delivery on
    /// the RT worker pool.
    fn subscribe_rt_frame(
        &self,
        bus: BusName,
        frame_ids: &[FrameId],
        callback: FrameCallback,
        filter: FilterMode,
        sampling: u16,
    ) -> Result<SubscriptionId>;

    fn subscribe_signal(
        &self,
        bus: BusName,
        signal_ids: &[SignalId],
        callback: SignalCallback,
        filter: FilterMode,
        sampling: u16,
    ) -> Result<SubscriptionId>;

    fn subscribe_rt_signal(
        &self,
        bus: BusName,
        signal_ids: &[SignalId],
        callback: SignalCallback,
        filter: FilterMode,
        sampling: u16,
    ) -> Result<SubscriptionId>;

    /// Cancel a subscription. Once this returns its callback is never
    /// invoked again.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;

    fn get_configuration(&self) -> Result<ConfigurationInfo>;
}

/// Typed signal accessors for any [`CanService`].
pub trait CanServiceExt: CanService {
    /// Latest values of signals that all carry type `T`.
    ///
    /// Fails with `InvalidArgument` if any stored value is of another type.
    fn get_signal_last_value_as<T: SignalScalar>(
        &self,
        bus: BusName,
        signal_ids: &[SignalId],
    ) -> Result<Vec<TypedSignalData<T>>> {
        narrow(self.get_signal_last_value(bus, signal_ids)?)
    }

    fn get_signal_cache_as<T: SignalScalar>(
        &self,
        bus: BusName,
        signal_ids: &[SignalId],
        history_secs: u8,
    ) -> Result<Vec<TypedSignalData<T>>> {
        narrow(self.get_signal_cache(bus, signal_ids, history_secs)?)
    }
}

impl<S: CanService + ?Sized> CanServiceExt for S {}

fn narrow<T: SignalScalar>(signals: Vec<SignalData>) -> Result<Vec<TypedSignalData<T>>> {
    signals
        .into_iter()
        .map(|s| {
            let (id, found) = (s.signal_id, s.data_type);
            TypedSignalData::from_signal(s).ok_or_else(|| {
                CanError::InvalidArgument(format!(
                    "signal {} is {:?}, not {:?}",
                    id,
                    found,
                    T::DATA_TYPE
                ))
            })
        })
        .collect()
}

/// Ingestion, caching and dispatch engine behind [`CanService`].
pub struct CanEngine {
    config: ServiceConfig,
    architecture: Arc<ArchitectureConfig>,
    /// Set when the configuration source failed at startup.
    config_error: Option<CanError>,
    clock: Clock,
    history: Arc<HistoryCache>,
    last_values: Arc<LastValueStore>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    decoder: Option<Arc<dyn SignalDecoder>>,
    gate: IngestionGate,
}

impl CanEngine {
    /// Start the engine.
    ///
    /// A failing configuration source does not prevent startup: the engine
    /// runs with an unavailable architecture and reports the failure from
    /// [`CanService::get_configuration`].
    pub fn start(
        config: ServiceConfig,
        source: &dyn ConfigSource,
        decoder: Option<Arc<dyn SignalDecoder>>,
    ) -> Result<Arc<Self>> {
        let (architecture, config_error) = match source.load() {
            Ok(architecture) => (architecture, None),
            Err(e) => {
                warn!(error = %e, "architecture configuration unavailable");
                (ArchitectureConfig::unavailable(), Some(e))
            }
        };
        let architecture = Arc::new(architecture);

        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch_workers,
            config.rt_workers,
            config.mailbox_capacity,
        )?);
        let history = Arc::new(HistoryCache::new(
            config.max_retention_ms,
            config.memory_ceiling_bytes,
        ));
        let last_values = Arc::new(LastValueStore::new());
        let registry = Arc::new(SubscriptionRegistry::new());

        let gate = IngestionGate::new(
            Arc::clone(&architecture),
            config.max_payload_len,
            Arc::clone(&history),
            Arc::clone(&last_values),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            decoder.clone(),
        );

        info!(
            architecture = ?architecture.architecture,
            buses = architecture.buses.len(),
            signals = decoder.is_some(),
            workers = config.dispatch_workers,
            rt_workers = config.rt_workers,
            "CAN service started"
        );

        Ok(Arc::new(Self {
            config,
            architecture,
            config_error,
            clock: Clock::new(),
            history,
            last_values,
            registry,
            dispatcher,
            decoder,
            gate,
        }))
    }

    // --- Ingestion ---

    /// Feed one raw frame received at `timestamp`.
    pub fn ingest_frame(&self, bus: BusName, frame_id: FrameId, payload: Vec<u8>, timestamp: Timestamp) {
        self.gate.ingest_frame(bus, frame_id, payload, timestamp);
    }

    /// Feed one raw frame stamped with the engine clock.
    pub fn ingest_frame_now(&self, bus: BusName, frame_id: FrameId, payload: Vec<u8>) {
        self.gate.ingest_frame(bus, frame_id, payload, self.clock.now());
    }

    /// Feed an already decoded signal value.
    pub fn ingest_signal(
        &self,
        bus: BusName,
        signal_id: SignalId,
        value: SignalValue,
        timestamp: Timestamp,
    ) {
        self.gate.ingest_signal(bus, signal_id, value, timestamp);
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    // --- Diagnostics ---

    pub fn ingest_stats(&self) -> IngestStats {
        self.gate.stats()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.history.stats()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    pub fn subscription_stats(&self, id: SubscriptionId) -> Result<SubscriptionStats> {
        self.registry
            .get(id)
            .map(|s| s.stats())
            .ok_or_else(|| CanError::unknown_subscription(id))
    }

    /// Drop history of keys that stopped receiving updates. Returns the
    /// bytes reclaimed.
    pub fn compact_cache(&self) -> usize {
        let reclaimed = self.history.compact(self.clock.now());
        if reclaimed > 0 {
            info!(reclaimed, "history cache compacted");
        }
        reclaimed
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    // --- Validation ---

    fn check_bus(&self, bus: BusName) -> Result<()> {
        if self.gate.knows_bus(bus) {
            Ok(())
        } else {
            Err(CanError::InvalidArgument(format!("unknown bus {}", bus)))
        }
    }

    fn frame_keys(&self, bus: BusName, frame_ids: &[FrameId]) -> Result<Vec<Key>> {
        self.check_bus(bus)?;
        if frame_ids.is_empty() {
            return Err(CanError::InvalidArgument("empty frame list".into()));
        }
        frame_ids
            .iter()
            .map(|&id| {
                if self.architecture.declares_frame(bus, id) {
                    Ok(Key::frame(bus, id))
                } else {
                    Err(CanError::InvalidArgument(format!(
                        "frame 0x{:X} not declared on {}",
                        id, bus
                    )))
                }
            })
            .collect()
    }

    fn signal_keys(&self, bus: BusName, signal_ids: &[SignalId]) -> Result<Vec<Key>> {
        let decoder = self
            .decoder
            .as_ref()
            .ok_or_else(|| CanError::NotSupported("no signal database configured".into()))?;
        self.check_bus(bus)?;
        if signal_ids.is_empty() {
            return Err(CanError::InvalidArgument("empty signal list".into()));
        }
        signal_ids
            .iter()
            .map(|&id| match decoder.signal_info(bus, id) {
                Some(_) => Ok(Key::signal(bus, id)),
                None => Err(CanError::InvalidArgument(format!(
                    "signal {} not defined on {}",
                    id, bus
                ))),
            })
            .collect()
    }

    // --- Reads ---

    fn last_values(&self, keys: &[Key]) -> Result<Vec<Arc<Update>>> {
        keys.iter()
            .map(|key| {
                self.last_values.get(key).ok_or(match key {
                    Key::Frame { .. } => CanError::FrameUninitialized(*key),
                    Key::Signal { .. } => CanError::SignalUninitialized(*key),
                })
            })
            .collect()
    }

    fn history(&self, keys: &[Key], history_secs: u8) -> Result<Vec<Arc<Update>>> {
        let window_ms = u64::from(history_secs) * 1000;
        let mut out = Vec::new();
        for key in keys {
            match self.history.read(key, window_ms) {
                Ok(updates) => out.extend(updates),
                // History compacted away after values were received.
                Err(CanError::CacheNotReady(_)) if self.last_values.contains(key) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    // --- Subscriptions ---

    fn subscribe(
        &self,
        bus: BusName,
        keys: Vec<Key>,
        handler: Handler,
        filter: FilterMode,
        sampling: u16,
        delivery: Delivery,
    ) -> Result<SubscriptionId> {
        if sampling == 0 {
            return Err(CanError::InvalidArgument("sampling must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        let keys: Vec<Key> = keys.into_iter().filter(|k| seen.insert(*k)).collect();

        let id = self.registry.allocate_id();
        let mailbox = self.dispatcher.open_mailbox(id, handler, delivery)?;
        self.registry.insert(Subscription {
            id,
            bus,
            keys,
            filter,
            sampling,
            delivery,
            mailbox,
        });

        info!(
            subscription = %id,
            %bus,
            keys = seen.len(),
            ?filter,
            sampling,
            ?delivery,
            "subscribed"
        );
        Ok(id)
    }
}

impl CanService for CanEngine {
    fn get_frame_last_value(&self, bus: BusName, frame_ids: &[FrameId]) -> Result<Vec<FrameData>> {
        let keys = self.frame_keys(bus, frame_ids)?;
        Ok(self
            .last_values(&keys)?
            .iter()
            .filter_map(|u| u.to_frame_data())
            .collect())
    }

    fn get_frame_cache(
        &self,
        bus: BusName,
        frame_ids: &[FrameId],
        history_secs: u8,
    ) -> Result<Vec<FrameData>> {
        let keys = self.frame_keys(bus, frame_ids)?;
        Ok(self
            .history(&keys, history_secs)?
            .iter()
            .filter_map(|u| u.to_frame_data())
            .collect())
    }

    fn get_signal_last_value(
        &self,
        bus: BusName,
        signal_ids: &[SignalId],
    ) -> Result<Vec<SignalData>> {
        let keys = self.signal_keys(bus, signal_ids)?;
        Ok(self
            .last_values(&keys)?
            .iter()
            .filter_map(|u| u.to_signal_data())
            .collect())
    }

    fn get_signal_cache(
        &self,
        bus: BusName,
        signal_ids: &[SignalId],
        history_secs: u8,
    ) -> Result<Vec<SignalData>> {
        let keys = self.signal_keys(bus, signal_ids)?;
        Ok(self
            .history(&keys, history_secs)?
            .iter()
            .filter_map(|u| u.to_signal_data())
            .collect())
    }

    fn subscribe_frame(
        &self,
        bus: BusName,
        frame_ids: &[FrameId],
        callback: FrameCallback,
        filter: FilterMode,
        sampling: u16,
    ) -> Result<SubscriptionId> {
        let keys = self.frame_keys(bus, frame_ids)?;
        self.subscribe(bus, keys, Handler::Frame(callback), filter, sampling, Delivery::Queued)
    }

    fn subscribe_rt_frame(
        &self,
        bus: BusName,
        frame_ids: &[FrameId],
        callback: FrameCallback,
        filter: FilterMode,
        sampling: u16,
    ) -> Result<SubscriptionId> {
        let keys = self.frame_keys(bus, frame_ids)?;
        self.subscribe(bus, keys, Handler::Frame(callback), filter, sampling, Delivery::RealTime)
    }

    fn subscribe_signal(
        &self,
        bus: BusName,
        signal_ids: &[SignalId],
        callback: SignalCallback,
        filter: FilterMode,
        sampling: u16,
    ) -> Result<SubscriptionId> {
        let keys = self.signal_keys(bus, signal_ids)?;
        self.subscribe(bus, keys, Handler::Signal(callback), filter, sampling, Delivery::Queued)
    }

    fn subscribe_rt_signal(
        &self,
        bus: BusName,
        signal_ids: &[SignalId],
        callback: SignalCallback,
        filter: FilterMode,
        sampling: u16,
    ) -> Result<SubscriptionId> {
        let keys = self.signal_keys(bus, signal_ids)?;
        self.subscribe(bus, keys, Handler::Signal(callback), filter, sampling, Delivery::RealTime)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let subscription = self
            .registry
            .remove(id)
            .ok_or_else(|| CanError::unknown_subscription(id))?;
        subscription.mailbox.close();

        let stats = subscription.stats();
        info!(
            subscription = %id,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "unsubscribed"
        );
        Ok(())
    }

    fn get_configuration(&self) -> Result<ConfigurationInfo> {
        match &self.config_error {
            Some(e) => Err(e.clone()),
            None => Ok(self.architecture.info()),
        }
    }
}
