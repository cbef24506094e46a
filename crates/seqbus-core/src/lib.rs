//! # seqbus-core - Data model for the seqbus CDC client
//!
//! Core types shared between the client protocol crate and anything that
//! needs to reason about stream positions:
//!
//! - [`Checkpoint`] / [`CheckpointMult`] - durable consumption positions,
//!   including mid-window positions, tracked per physical partition
//! - [`ChangeEvent`] / [`StreamFrame`] - the unit of change and its wire
//!   framing on the `/stream` response body
//! - [`EventBuffer`] - the in-process staging area between the network
//!   puller and the dispatcher, with window boundaries and SCN-regression
//!   detection
//!
//! ## SCN model
//!
//! An SCN is a monotonically increasing commit number. Every event in a
//! window carries the window's commit SCN, so consumers observe a
//! non-decreasing SCN sequence as long as windows are delivered in order.
//! A decrease is only legal immediately after an explicit rollback.

pub mod buffer;
pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod event;

pub use buffer::{BufferConfig, BufferItem, EventBuffer};
pub use checkpoint::{Checkpoint, CheckpointMult, ConsumptionMode, PhysicalPartition};
pub use codec::{encode_frame, FrameDecoder};
pub use error::{CoreError, Result};
pub use event::{ChangeEvent, StreamFrame};
