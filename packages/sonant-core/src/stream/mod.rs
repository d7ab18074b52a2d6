//! Outbound carrier streaming: sink abstraction, wire messages, jitter
//! buffer and the timer-driven framer.

pub mod framer;
pub mod jitter;

pub use framer::{FramerStats, OutboundFramer};
pub use jitter::JitterBuffer;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::BridgeResult;
use crate::protocol_constants::COMPLETION_MARK_PREFIX;

/// Lifecycle state of the carrier WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    Closing,
    Closed,
}

/// Media payload wrapper of the outbound `media` message.
#[derive(Debug, Clone, Serialize)]
pub struct MediaPayload {
    /// Base64-encoded 160-byte μ-law frame.
    pub payload: String,
}

/// Mark payload wrapper of the outbound `mark` message.
#[derive(Debug, Clone, Serialize)]
pub struct MarkPayload {
    pub name: String,
}

/// Messages sent to the carrier over the media stream socket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum CarrierOutgoing {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        /// Decimal string, strictly monotonic per socket.
        #[serde(rename = "sequenceNumber")]
        sequence_number: String,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        mark: MarkPayload,
    },
}

/// Builds the completion mark name for the current wall-clock instant.
#[must_use]
pub fn completion_mark_name() -> String {
    let unix_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{COMPLETION_MARK_PREFIX}{unix_ms}")
}

/// Write side of a carrier socket as seen by the framer.
///
/// The concrete implementation lives with the WebSocket handler; tests
/// substitute an in-memory recorder. All methods are non-blocking: `send`
/// hands the message to the socket writer task and returns.
pub trait CarrierSink: Send + Sync {
    /// Current socket lifecycle state.
    fn state(&self) -> SocketState;

    /// Bytes accepted by `send` but not yet written to the wire.
    fn buffered_amount(&self) -> usize;

    /// Stream identifier announced by the carrier `start` frame, if any.
    fn stream_sid(&self) -> Option<String>;

    /// Allocates the next outbound sequence number. Strictly monotonic,
    /// starting at 1, never reused for the lifetime of the socket.
    fn next_sequence(&self) -> u64;

    /// Enqueues a message for transmission.
    fn send(&self, message: CarrierOutgoing) -> BridgeResult<()>;
}
