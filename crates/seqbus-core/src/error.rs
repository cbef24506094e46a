//! Error types for the core data model.

use thiserror::Error;

/// Errors raised by checkpoint handling, frame decoding and the staging
/// buffer.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Checkpoint string could not be parsed
    #[error("Malformed checkpoint: {0}")]
    MalformedCheckpoint(String),

    /// A second partition attempted to claim partial-window status
    #[error(
        "Conflicting partial window: partition {existing} already holds a \
         partial window, rejecting partial checkpoint for {incoming}"
    )]
    ConflictingPartialWindow {
        /// Partition currently holding the partial window
        existing: String,
        /// Partition whose insertion was rejected
        incoming: String,
    },

    /// A checkpoint field combination violates the position invariants
    #[error("Checkpoint invariant violated: {0}")]
    CheckpointInvariant(String),

    /// The staging buffer cannot accept more data without dropping
    /// undelivered events
    #[error("Event buffer full: {staged} events staged, capacity {capacity}")]
    BufferFull {
        /// Events currently staged
        staged: usize,
        /// Configured event capacity
        capacity: usize,
    },

    /// A stream frame could not be decoded
    #[error("Frame decode error: {0}")]
    FrameDecode(String),

    /// A stream frame exceeds the configured maximum size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Declared frame size
        size: usize,
        /// Configured maximum
        max: usize,
    },
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
