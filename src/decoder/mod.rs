//! Signal decoding adapter.
//!
//! The engine consumes a [`SignalDecoder`] to turn raw frame payloads into
//! typed signal values and to validate signal identifiers. [`SignalDatabase`]
//! is an in-memory implementation driven by DBC-style signal definitions.

mod database;
mod extract;

pub use database::{ByteOrder, SignalDatabase, SignalDefinition};

use crate::types::{BusName, FrameId, SignalDataType, SignalId, SignalValue};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while loading definitions or decoding payloads.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload of frame 0x{frame_id:X} too short for signal {signal}: {len} bytes")]
    PayloadTooShort {
        frame_id: FrameId,
        signal: String,
        len: usize,
    },

    #[error("Invalid signal definition: {0}")]
    InvalidDefinition(String),

    #[error("Failed to parse signal database: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Static description of a signal.
#[derive(Clone, Debug, PartialEq)]
pub struct SignalInfo {
    pub id: SignalId,
    pub name: Arc<str>,
    pub data_type: SignalDataType,
    pub frame_id: FrameId,
}

/// One signal value extracted from a frame.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedSignal {
    pub id: SignalId,
    pub name: Arc<str>,
    pub value: SignalValue,
}

/// External signal database as seen by the engine.
pub trait SignalDecoder: Send + Sync {
    /// Description of a signal, `None` if the bus does not carry it.
    fn signal_info(&self, bus: BusName, signal: SignalId) -> Option<SignalInfo>;

    /// Decode every signal carried by a frame. Frames without signals
    /// decode to an empty list.
    fn decode(
        &self,
        bus: BusName,
        frame_id: FrameId,
        payload: &[u8],
    ) -> Result<Vec<DecodedSignal>, DecodeError>;
}
