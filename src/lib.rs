//! # CAN Service
//!
//! A CAN-bus telemetry engine: it ingests frames from bus drivers, keeps
//! the latest value and a bounded history per frame and signal, and
//! forwards updates to subscribers according to per-subscription filters.
//!
//! ## Core Concepts
//!
//! - **Ingestion**: Drivers push frames; signals are decoded from them
//! - **Cache**: Last value and time-windowed history per key
//! - **Subscriptions**: Callbacks with sampling and on-change filtering
//! - **Dispatch**: Worker pools so callbacks never block ingestion
//!
//! ## Example
//!
//! ```ignore
//! use can_service::{BusName, CanEngine, CanService, FilterMode, JsonFileSource, ServiceConfig};
//!
//! let engine = CanEngine::start(
//!     ServiceConfig::default(),
//!     &JsonFileSource::new("./architecture.json"),
//!     None,
//! )?;
//!
//! let id = engine.subscribe_frame(
//!     BusName(0),
//!     &[0x1A0],
//!     Arc::new(|frame| println!("{:?}", frame)),
//!     FilterMode::FilterOnChange,
//!     1,
//! )?;
//!
//! engine.ingest_frame_now(BusName(0), 0x1A0, vec![0x01, 0x02]);
//! engine.unsubscribe(id)?;
//! ```

pub mod cache;
pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod ingest;
pub mod service;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use cache::{CacheStats, HistoryCache, LastValueStore};
pub use config::{
    ArchitectureConfig, ArchitectureType, BusConfig, BusInfo, BusType, ConfigSource,
    ConfigurationInfo, JsonFileSource, ServiceConfig, StaticSource,
};
pub use decoder::{
    ByteOrder, DecodeError, DecodedSignal, SignalDatabase, SignalDecoder, SignalDefinition,
    SignalInfo,
};
pub use error::{CanError, ErrorCode, Result, SubscribeRetVal};
pub use ingest::IngestStats;
pub use service::{CanEngine, CanService, CanServiceExt};
pub use subscriptions::{FrameCallback, SignalCallback, SubscriptionStats};
pub use types::*;
