pub mod aoi;
pub mod framing;
pub mod input_sequencer;
pub mod peer;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod tick_sync;

use std::time::Duration;

/// Server-assigned id of a client connection
pub type NetworkId = u32;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("No data received for {0:?}")]
    Timeout(Duration),
    #[error("Malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("Unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Decompression failed: {0}")]
    Decompression(String),
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("Batch too large: {0} bytes after compression (max {1})")]
    BatchTooLarge(usize, usize),
    #[error("Tick adjustment {0} does not fit in an i8")]
    AdjustmentOutOfRange(i32),
    #[error("Adjustment iteration {received} received, expected {expected}")]
    AdjustmentIterationMismatch { expected: u8, received: u8 },
}

impl NetworkError {
    /// The peer is out of sync with us or misbehaving. The connection must be
    /// dropped.
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            NetworkError::AdjustmentOutOfRange(_) | NetworkError::AdjustmentIterationMismatch { .. }
        )
    }
}
