//! In-memory signal database.

use super::extract::{extract_big_endian, extract_little_endian, sign_extend};
use super::{DecodeError, DecodedSignal, SignalDecoder, SignalInfo};
use crate::types::{BusName, FrameId, SignalDataType, SignalId, SignalValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Bit layout of a signal inside its frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Intel.
    LittleEndian,
    /// Motorola.
    BigEndian,
}

fn default_factor() -> f64 {
    1.0
}

/// Definition of one signal, DBC style.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalDefinition {
    pub id: SignalId,
    pub name: String,
    pub bus: BusName,
    pub frame_id: FrameId,
    pub start_bit: u16,
    /// Length in bits, 1..=64.
    pub length: u16,
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default)]
    pub offset: f64,
    pub data_type: SignalDataType,
    /// Raw value descriptions, used for string-typed signals.
    #[serde(default)]
    pub value_table: BTreeMap<i64, String>,
}

impl SignalDefinition {
    fn validate(&self) -> Result<(), DecodeError> {
        if self.length == 0 || self.length > 64 {
            return Err(DecodeError::InvalidDefinition(format!(
                "{}: length {} outside 1..=64",
                self.name, self.length
            )));
        }
        if self.data_type == SignalDataType::Unknown {
            return Err(DecodeError::InvalidDefinition(format!(
                "{}: unknown data type",
                self.name
            )));
        }
        if !self.factor.is_finite() || !self.offset.is_finite() {
            return Err(DecodeError::InvalidDefinition(format!(
                "{}: non-finite scaling",
                self.name
            )));
        }
        Ok(())
    }

    fn is_identity_scaling(&self) -> bool {
        self.factor == 1.0 && self.offset == 0.0
    }

    /// Convert the raw bits to the declared type.
    fn convert(&self, raw: u64) -> SignalValue {
        let length = self.length as usize;
        let raw_int = if self.signed {
            sign_extend(raw, length)
        } else {
            raw as i64
        };
        let physical = if self.signed {
            self.offset + self.factor * raw_int as f64
        } else {
            self.offset + self.factor * raw as f64
        };

        match self.data_type {
            SignalDataType::Bool => SignalValue::Bool(raw != 0),
            SignalDataType::Int64 if self.is_identity_scaling() => SignalValue::Int64(raw_int),
            SignalDataType::Int64 => SignalValue::Int64(physical.round() as i64),
            SignalDataType::UInt64 if self.is_identity_scaling() && !self.signed => {
                SignalValue::UInt64(raw)
            }
            SignalDataType::UInt64 => SignalValue::UInt64(physical.max(0.0).round() as u64),
            SignalDataType::Double => SignalValue::Double(physical),
            SignalDataType::String | SignalDataType::Unknown => {
                match self.value_table.get(&raw_int) {
                    Some(text) => SignalValue::String(text.clone()),
                    None => SignalValue::String(physical.to_string()),
                }
            }
        }
    }
}

struct Entry {
    definition: SignalDefinition,
    name: Arc<str>,
}

impl Entry {
    fn info(&self) -> SignalInfo {
        SignalInfo {
            id: self.definition.id,
            name: Arc::clone(&self.name),
            data_type: self.definition.data_type,
            frame_id: self.definition.frame_id,
        }
    }
}

/// Signal definitions indexed by frame and by signal id.
pub struct SignalDatabase {
    signals: HashMap<(BusName, SignalId), Arc<Entry>>,
    by_frame: HashMap<(BusName, FrameId), Vec<Arc<Entry>>>,
}

impl SignalDatabase {
    /// Build from definitions. Signal ids must be unique per bus.
    pub fn new(definitions: Vec<SignalDefinition>) -> Result<Self, DecodeError> {
        let mut signals = HashMap::new();
        let mut by_frame: HashMap<(BusName, FrameId), Vec<Arc<Entry>>> = HashMap::new();

        for definition in definitions {
            definition.validate()?;
            let key = (definition.bus, definition.id);
            if signals.contains_key(&key) {
                return Err(DecodeError::InvalidDefinition(format!(
                    "signal {} defined twice on {}",
                    definition.id, definition.bus
                )));
            }

            let entry = Arc::new(Entry {
                name: Arc::from(definition.name.as_str()),
                definition,
            });
            by_frame
                .entry((entry.definition.bus, entry.definition.frame_id))
                .or_default()
                .push(Arc::clone(&entry));
            signals.insert(key, entry);
        }

        Ok(Self { signals, by_frame })
    }

    /// Parse a JSON array of [`SignalDefinition`].
    pub fn from_json(text: &str) -> Result<Self, DecodeError> {
        let definitions: Vec<SignalDefinition> = serde_json::from_str(text)?;
        Self::new(definitions)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    fn decode_one(entry: &Entry, payload: &[u8]) -> Result<SignalValue, DecodeError> {
        let def = &entry.definition;
        let start = def.start_bit as usize;
        let length = def.length as usize;

        let raw = match def.byte_order {
            ByteOrder::LittleEndian => extract_little_endian(payload, start, length),
            ByteOrder::BigEndian => extract_big_endian(payload, start, length),
        }
        .ok_or_else(|| DecodeError::PayloadTooShort {
            frame_id: def.frame_id,
            signal: def.name.clone(),
            len: payload.len(),
        })?;

        Ok(def.convert(raw))
    }
}

impl SignalDecoder for SignalDatabase {
    fn signal_info(&self, bus: BusName, signal: SignalId) -> Option<SignalInfo> {
        self.signals.get(&(bus, signal)).map(|e| e.info())
    }

    fn decode(
        &self,
        bus: BusName,
        frame_id: FrameId,
        payload: &[u8],
    ) -> Result<Vec<DecodedSignal>, DecodeError> {
        let entries = match self.by_frame.get(&(bus, frame_id)) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };

        entries
            .iter()
            .map(|entry| {
                Ok(DecodedSignal {
                    id: entry.definition.id,
                    name: Arc::clone(&entry.name),
                    value: Self::decode_one(entry, payload)?,
                })
            })
            .collect()
    }
}
