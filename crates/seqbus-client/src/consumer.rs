//! Consumer-facing callback interface.
//!
//! One flat trait instead of a callback class hierarchy: every method has
//! a default no-op implementation returning
//! [`ConsumerResult::Success`], so implementors override only the
//! callbacks they care about. All callbacks are invoked exclusively by the
//! dispatcher, strictly in stream order. Failure is communicated only
//! through the return value; consumers never throw across this boundary.

use crate::error::Error;
use crate::relay::{SchemaEntry, SchemaSet};
use async_trait::async_trait;
use seqbus_core::ChangeEvent;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of a consumer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerResult {
    /// Callback completed; keep going
    Success,
    /// Callback failed; the dispatcher retries up to its budget
    Error,
    /// Unrecoverable; escalate immediately without retrying
    Fatal,
}

impl ConsumerResult {
    /// True for [`ConsumerResult::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, ConsumerResult::Success)
    }
}

/// Schema lookups for decoding event payloads, built from the schema maps
/// cached at `/register` time.
#[derive(Debug, Clone, Default)]
pub struct EventDecoder {
    schemas: Arc<SchemaSet>,
    source_names: Arc<HashMap<u16, String>>,
}

impl EventDecoder {
    /// Build a decoder from the registration's schema set and source map.
    pub fn new(schemas: SchemaSet, source_names: HashMap<u16, String>) -> Self {
        Self {
            schemas: Arc::new(schemas),
            source_names: Arc::new(source_names),
        }
    }

    /// Payload schema for a source, when one was registered.
    pub fn schema_for(&self, source_id: u16) -> Option<&SchemaEntry> {
        self.schemas.source_schemas.get(&source_id)
    }

    /// Key schema for a source, extended registrations only.
    pub fn key_schema_for(&self, source_id: u16) -> Option<&SchemaEntry> {
        self.schemas.key_schemas.get(&source_id)
    }

    /// Source name for a wire id.
    pub fn source_name(&self, source_id: u16) -> Option<&str> {
        self.source_names.get(&source_id).map(|s| s.as_str())
    }

    /// Decode a JSON-encoded payload.
    pub fn decode_json(&self, event: &ChangeEvent) -> crate::error::Result<serde_json::Value> {
        Ok(serde_json::from_slice(&event.payload)?)
    }
}

/// The capability set any consumer type must implement.
///
/// Callback order per window: `on_start_data_event_sequence`, then for
/// each event `on_data_event` (bracketed by `on_start_source` /
/// `on_end_source` when the source changes), then
/// `on_end_data_event_sequence`, then `on_checkpoint`. `on_rollback`
/// announces that previously delivered partial-window data must be
/// considered undone back to the given SCN.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Consumption is starting for this registration.
    async fn on_start_consumption(&self) -> ConsumerResult {
        ConsumerResult::Success
    }

    /// Consumption stopped (graceful or after escalation).
    async fn on_stop_consumption(&self) -> ConsumerResult {
        ConsumerResult::Success
    }

    /// Events for `source` follow until `on_end_source`.
    async fn on_start_source(&self, _source: &str, _schema: Option<&SchemaEntry>) -> ConsumerResult {
        ConsumerResult::Success
    }

    /// No more events for `source` in this window.
    async fn on_end_source(&self, _source: &str, _schema: Option<&SchemaEntry>) -> ConsumerResult {
        ConsumerResult::Success
    }

    /// A window with commit SCN `scn` begins.
    async fn on_start_data_event_sequence(&self, _scn: u64) -> ConsumerResult {
        ConsumerResult::Success
    }

    /// One change event. SCNs are non-decreasing across calls, except for
    /// the first event after an `on_rollback`.
    async fn on_data_event(&self, _event: &ChangeEvent, _decoder: &EventDecoder) -> ConsumerResult {
        ConsumerResult::Success
    }

    /// The window with commit SCN `scn` completed.
    async fn on_end_data_event_sequence(&self, _scn: u64) -> ConsumerResult {
        ConsumerResult::Success
    }

    /// The checkpoint advanced to `scn` and may be persisted.
    async fn on_checkpoint(&self, _scn: u64) -> ConsumerResult {
        ConsumerResult::Success
    }

    /// Previously delivered data beyond `scn` must be considered undone.
    async fn on_rollback(&self, _scn: u64) -> ConsumerResult {
        ConsumerResult::Success
    }

    /// A non-recoverable error terminated this registration.
    async fn on_error(&self, _error: &Error) -> ConsumerResult {
        ConsumerResult::Success
    }
}

/// One consumer callback with its arguments, reified so the dispatcher
/// can retry any callback through a single budget loop.
#[derive(Debug)]
pub enum Call<'a> {
    /// `on_start_consumption`
    StartConsumption,
    /// `on_start_source`
    StartSource(&'a str, Option<&'a SchemaEntry>),
    /// `on_end_source`
    EndSource(&'a str, Option<&'a SchemaEntry>),
    /// `on_start_data_event_sequence`
    StartWindow(u64),
    /// `on_data_event`
    DataEvent(&'a ChangeEvent, &'a EventDecoder),
    /// `on_end_data_event_sequence`
    EndWindow(u64),
    /// `on_checkpoint`
    CheckpointAt(u64),
    /// `on_rollback`
    Rollback(u64),
}

impl Call<'_> {
    /// Invoke this callback on one consumer.
    pub async fn invoke(&self, consumer: &dyn Consumer) -> ConsumerResult {
        match self {
            Call::StartConsumption => consumer.on_start_consumption().await,
            Call::StartSource(source, schema) => consumer.on_start_source(source, *schema).await,
            Call::EndSource(source, schema) => consumer.on_end_source(source, *schema).await,
            Call::StartWindow(scn) => consumer.on_start_data_event_sequence(*scn).await,
            Call::DataEvent(event, decoder) => consumer.on_data_event(event, decoder).await,
            Call::EndWindow(scn) => consumer.on_end_data_event_sequence(*scn).await,
            Call::CheckpointAt(scn) => consumer.on_checkpoint(*scn).await,
            Call::Rollback(scn) => consumer.on_rollback(*scn).await,
        }
    }

    /// Callback name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Call::StartConsumption => "on_start_consumption",
            Call::StartSource(..) => "on_start_source",
            Call::EndSource(..) => "on_end_source",
            Call::StartWindow(_) => "on_start_data_event_sequence",
            Call::DataEvent(..) => "on_data_event",
            Call::EndWindow(_) => "on_end_data_event_sequence",
            Call::CheckpointAt(_) => "on_checkpoint",
            Call::Rollback(_) => "on_rollback",
        }
    }
}

/// A consumer that ignores everything. Useful as a base for tests and for
/// registrations that only care about a subset of callbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConsumer;

#[async_trait]
impl Consumer for NoopConsumer {}
