//! Error types for the CAN service.

use crate::types::{Key, SubscriptionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for service operations.
///
/// Every variant maps onto exactly one non-success [`ErrorCode`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CanError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not supported on this architecture: {0}")]
    NotSupported(String),

    #[error("Frame not received yet: {0}")]
    FrameUninitialized(Key),

    #[error("Signal not received yet: {0}")]
    SignalUninitialized(Key),

    #[error("History cache not ready for {0}")]
    CacheNotReady(Key),

    #[error("History cache memory full ({used} of {ceiling} bytes)")]
    MemoryFull { used: usize, ceiling: usize },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl CanError {
    pub(crate) fn unknown_subscription(id: SubscriptionId) -> Self {
        CanError::InvalidArgument(format!("unknown subscription {}", id))
    }

    /// The return code this error reports at the API boundary.
    pub fn code(&self) -> ErrorCode {
        match self {
            CanError::Internal(_) => ErrorCode::Error,
            CanError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            CanError::NotSupported(_) => ErrorCode::NotSupported,
            CanError::FrameUninitialized(_) => ErrorCode::FrameUninitialized,
            CanError::SignalUninitialized(_) => ErrorCode::SignalUninitialized,
            CanError::CacheNotReady(_) => ErrorCode::CacheNotReady,
            CanError::MemoryFull { .. } => ErrorCode::MemoryFull,
            CanError::Persistence(_) => ErrorCode::Persistence,
        }
    }
}

/// Flat return-code taxonomy used by boundary layers (IPC, FFI).
///
/// Discriminants follow the declaration order of the service interface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ErrorCode {
    Success = 0,
    Error = 1,
    SignalUninitialized = 2,
    InvalidArgument = 3,
    Persistence = 4,
    NotSupported = 5,
    FrameUninitialized = 6,
    CacheNotReady = 7,
    MemoryFull = 8,
}

impl<T> From<&Result<T>> for ErrorCode {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ErrorCode::Success,
            Err(e) => e.code(),
        }
    }
}

/// Subscribe outcome flattened for boundary layers.
///
/// `subscription_id` is 0 when `error_code` is not `Success`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRetVal {
    pub error_code: ErrorCode,
    pub subscription_id: u64,
}

impl From<Result<SubscriptionId>> for SubscribeRetVal {
    fn from(result: Result<SubscriptionId>) -> Self {
        match result {
            Ok(id) => Self {
                error_code: ErrorCode::Success,
                subscription_id: id.0,
            },
            Err(e) => Self {
                error_code: e.code(),
                subscription_id: 0,
            },
        }
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, CanError>;
