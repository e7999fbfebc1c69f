//! Core types for the CAN service.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Architecture-defined CAN bus identifier.
///
/// The set of valid values is supplied by the configuration source at
/// startup; the engine only checks membership.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BusName(pub u16);

impl fmt::Debug for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusName({})", self.0)
    }
}

impl fmt::Display for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus{}", self.0)
    }
}

/// CAN frame identifier (11-bit or 29-bit).
pub type FrameId = u32;

/// Signal identifier as assigned by the signal database.
pub type SignalId = u32;

/// Identifies a frame or a signal on one bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    Frame { bus: BusName, id: FrameId },
    Signal { bus: BusName, id: SignalId },
}

impl Key {
    pub fn frame(bus: BusName, id: FrameId) -> Self {
        Key::Frame { bus, id }
    }

    pub fn signal(bus: BusName, id: SignalId) -> Self {
        Key::Signal { bus, id }
    }

    pub fn bus(&self) -> BusName {
        match self {
            Key::Frame { bus, .. } | Key::Signal { bus, .. } => *bus,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Key::Frame { id, .. } | Key::Signal { id, .. } => *id,
        }
    }

    pub fn is_frame(&self) -> bool {
        matches!(self, Key::Frame { .. })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Frame { bus, id } => write!(f, "frame 0x{:X} on {}", id, bus),
            Key::Signal { bus, id } => write!(f, "signal {} on {}", id, bus),
        }
    }
}

/// Milliseconds since the service epoch.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Start of the window `window_ms` wide that ends at this timestamp.
    pub fn window_start(self, window_ms: u64) -> Timestamp {
        Timestamp(self.0.saturating_sub(window_ms))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}ms)", self.0)
    }
}

/// Monotonic clock anchored at service start.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Current relative timestamp.
    pub fn now(&self) -> Timestamp {
        Timestamp(self.epoch.elapsed().as_millis() as u64)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Declared type of a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SignalDataType {
    Bool = 0,
    Int64 = 1,
    #[serde(rename = "uint64")]
    UInt64 = 2,
    Double = 3,
    String = 4,
    Unknown = 5,
}

/// A decoded signal value tagged with its type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SignalValue {
    Bool(bool),
    Int64(i64),
    #[serde(rename = "uint64")]
    UInt64(u64),
    Double(f64),
    String(String),
}

impl SignalValue {
    pub fn data_type(&self) -> SignalDataType {
        match self {
            SignalValue::Bool(_) => SignalDataType::Bool,
            SignalValue::Int64(_) => SignalDataType::Int64,
            SignalValue::UInt64(_) => SignalDataType::UInt64,
            SignalValue::Double(_) => SignalDataType::Double,
            SignalValue::String(_) => SignalDataType::String,
        }
    }

    /// Value-for-value comparison. Doubles compare by bit pattern so that
    /// a NaN reading equals the NaN forwarded before it.
    pub fn same_value(&self, other: &SignalValue) -> bool {
        match (self, other) {
            (SignalValue::Double(a), SignalValue::Double(b)) => a.to_bits() == b.to_bits(),
            _ => self == other,
        }
    }

    fn approx_size(&self) -> usize {
        match self {
            SignalValue::String(s) => s.len(),
            _ => 8,
        }
    }
}

/// Rust scalar types that a signal value can be read as.
pub trait SignalScalar: Sized {
    const DATA_TYPE: SignalDataType;

    fn from_value(value: SignalValue) -> Option<Self>;
}

impl SignalScalar for bool {
    const DATA_TYPE: SignalDataType = SignalDataType::Bool;

    fn from_value(value: SignalValue) -> Option<Self> {
        match value {
            SignalValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl SignalScalar for i64 {
    const DATA_TYPE: SignalDataType = SignalDataType::Int64;

    fn from_value(value: SignalValue) -> Option<Self> {
        match value {
            SignalValue::Int64(v) => Some(v),
            _ => None,
        }
    }
}

impl SignalScalar for u64 {
    const DATA_TYPE: SignalDataType = SignalDataType::UInt64;

    fn from_value(value: SignalValue) -> Option<Self> {
        match value {
            SignalValue::UInt64(v) => Some(v),
            _ => None,
        }
    }
}

impl SignalScalar for f64 {
    const DATA_TYPE: SignalDataType = SignalDataType::Double;

    fn from_value(value: SignalValue) -> Option<Self> {
        match value {
            SignalValue::Double(v) => Some(v),
            _ => None,
        }
    }
}

impl SignalScalar for String {
    const DATA_TYPE: SignalDataType = SignalDataType::String;

    fn from_value(value: SignalValue) -> Option<Self> {
        match value {
            SignalValue::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Content of an update.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Raw frame bytes.
    Frame(Vec<u8>),
    /// Decoded signal with its database name.
    Signal { name: Arc<str>, value: SignalValue },
}

impl Payload {
    /// Byte-for-byte (frames) or value-for-value (signals) equality.
    pub fn same_content(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::Frame(a), Payload::Frame(b)) => a == b,
            (Payload::Signal { value: a, .. }, Payload::Signal { value: b, .. }) => a.same_value(b),
            _ => false,
        }
    }

    /// Rough heap footprint, used for the cache memory ceiling.
    pub fn approx_size(&self) -> usize {
        match self {
            Payload::Frame(bytes) => bytes.len(),
            Payload::Signal { name, value } => name.len() + value.approx_size(),
        }
    }
}

/// A timestamped observation of one key. Immutable once created.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub timestamp: Timestamp,
    pub key: Key,
    pub payload: Payload,
}

impl Update {
    pub fn frame(bus: BusName, id: FrameId, timestamp: Timestamp, bytes: Vec<u8>) -> Self {
        Self {
            timestamp,
            key: Key::frame(bus, id),
            payload: Payload::Frame(bytes),
        }
    }

    pub fn signal(
        bus: BusName,
        id: SignalId,
        timestamp: Timestamp,
        name: Arc<str>,
        value: SignalValue,
    ) -> Self {
        Self {
            timestamp,
            key: Key::signal(bus, id),
            payload: Payload::Signal { name, value },
        }
    }

    /// Frame view, `None` for signal updates.
    pub fn to_frame_data(&self) -> Option<FrameData> {
        match (&self.key, &self.payload) {
            (Key::Frame { id, .. }, Payload::Frame(bytes)) => Some(FrameData {
                timestamp: self.timestamp,
                frame_id: *id,
                frame_size: bytes.len(),
                payload: bytes.clone(),
            }),
            _ => None,
        }
    }

    /// Signal view, `None` for frame updates.
    pub fn to_signal_data(&self) -> Option<SignalData> {
        match (&self.key, &self.payload) {
            (Key::Signal { id, .. }, Payload::Signal { name, value }) => Some(SignalData {
                timestamp: self.timestamp,
                signal_id: *id,
                name: name.to_string(),
                data_type: value.data_type(),
                value: value.clone(),
            }),
            _ => None,
        }
    }
}

/// A frame as handed to API callers and frame callbacks.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameData {
    pub timestamp: Timestamp,
    pub frame_id: FrameId,
    pub frame_size: usize,
    pub payload: Vec<u8>,
}

/// A signal as handed to API callers and signal callbacks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalData {
    pub timestamp: Timestamp,
    pub signal_id: SignalId,
    pub name: String,
    pub data_type: SignalDataType,
    pub value: SignalValue,
}

/// A signal read through a typed accessor.
#[derive(Clone, Debug, PartialEq)]
pub struct TypedSignalData<T> {
    pub timestamp: Timestamp,
    pub signal_id: SignalId,
    pub name: String,
    pub value: T,
}

impl<T: SignalScalar> TypedSignalData<T> {
    /// Narrow a tagged signal; `None` when the tag is not `T::DATA_TYPE`.
    pub fn from_signal(data: SignalData) -> Option<Self> {
        let value = T::from_value(data.value)?;
        Some(Self {
            timestamp: data.timestamp,
            signal_id: data.signal_id,
            name: data.name,
            value,
        })
    }
}

/// Filtering policy applied per subscription and key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterMode {
    /// Forward every update.
    FilterOff,
    /// Forward one update out of every N.
    FilterSampling,
    /// Forward when content differs from the last forwarded content.
    FilterOnChange,
    FilterSamplingAndOnChange,
    FilterSamplingOrOnChange,
}

/// Unique identifier for a subscription. Never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
