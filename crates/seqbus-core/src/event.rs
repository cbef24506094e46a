//! Change events and stream frames.
//!
//! Every event in a window carries the window's commit SCN; windows are
//! closed by an explicit end-of-window frame carrying the same SCN. The
//! payload encoding is opaque at this layer; consumers decode it with the
//! schemas cached at registration time.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A single change captured from the upstream database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Commit SCN of the window this event belongs to
    pub scn: u64,
    /// Logical source the change originated from
    pub source_id: u16,
    /// Capture timestamp (Unix epoch nanoseconds)
    pub timestamp_ns: u64,
    /// Serialized primary key
    pub key: Bytes,
    /// Serialized row image (schema-dependent, opaque here)
    pub payload: Bytes,
}

impl ChangeEvent {
    /// Create a new event.
    pub fn new(scn: u64, source_id: u16, key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            scn,
            source_id,
            timestamp_ns: 0,
            key: key.into(),
            payload: payload.into(),
        }
    }

    /// Set the capture timestamp.
    pub fn with_timestamp_ns(mut self, ts: u64) -> Self {
        self.timestamp_ns = ts;
        self
    }

    /// Total serialized size of key and payload.
    pub fn size(&self) -> usize {
        self.key.len() + self.payload.len()
    }
}

/// One frame of the `/stream` response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFrame {
    /// A change event inside the current window
    Event(ChangeEvent),
    /// Close of the window with commit SCN `scn`
    EndOfWindow {
        /// Commit SCN of the window being closed
        scn: u64,
    },
    /// Liveness marker; advances the stream position without carrying data
    Heartbeat {
        /// Highest SCN the relay has seen
        scn: u64,
    },
}

impl StreamFrame {
    /// The SCN this frame speaks for.
    pub fn scn(&self) -> u64 {
        match self {
            StreamFrame::Event(e) => e.scn,
            StreamFrame::EndOfWindow { scn } => *scn,
            StreamFrame::Heartbeat { scn } => *scn,
        }
    }
}
