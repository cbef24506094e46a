//! Per-connection-attempt protocol state machine.
//!
//! One [`ConnectionState`] tracks a single connection attempt through the
//! sources -> register -> stream cycle. All transitions happen on the
//! puller's drain loop, so the machine needs no internal locking. Every
//! transition is appended to the attempt's history log, which is the
//! primary diagnosability and testing surface.

use crate::error::{Error, Result};
use crate::relay::{SchemaSet, ServerInfo, SourceDescriptor};
use std::collections::HashMap;

/// Protocol phase of a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// Attempt created, nothing sent yet
    Start,
    /// Choosing a relay from the candidate set
    PickServer,
    /// `/sources` request in flight
    RequestSources,
    /// `/sources` answered successfully
    SourcesResponseSuccess,
    /// `/sources` could not be sent
    SourcesRequestError,
    /// `/sources` failed while awaiting/reading the response
    SourcesResponseError,
    /// `/register` request in flight
    RequestRegister,
    /// `/register` answered successfully; schemas cached
    RegisterResponseSuccess,
    /// `/register` could not be sent
    RegisterRequestError,
    /// `/register` failed while awaiting/reading the response
    RegisterResponseError,
    /// `/stream` request in flight
    RequestStream,
    /// `/stream` opened; body being consumed
    StreamRequestSuccess,
    /// One `/stream` response body fully consumed; the stream sub-loop
    /// re-enters `RequestStream`
    StreamResponseSuccess,
    /// `/stream` could not be sent
    StreamRequestError,
    /// `/stream` failed mid-body (timeout, disconnect, malformed frame)
    StreamResponseError,
}

impl ConnState {
    /// Stable transition name used in the history log.
    pub fn name(&self) -> &'static str {
        match self {
            ConnState::Start => "START",
            ConnState::PickServer => "PICK_SERVER",
            ConnState::RequestSources => "REQUEST_SOURCES",
            ConnState::SourcesResponseSuccess => "SOURCES_RESPONSE_SUCCESS",
            ConnState::SourcesRequestError => "SOURCES_REQUEST_ERROR",
            ConnState::SourcesResponseError => "SOURCES_RESPONSE_ERROR",
            ConnState::RequestRegister => "REQUEST_REGISTER",
            ConnState::RegisterResponseSuccess => "REGISTER_RESPONSE_SUCCESS",
            ConnState::RegisterRequestError => "REGISTER_REQUEST_ERROR",
            ConnState::RegisterResponseError => "REGISTER_RESPONSE_ERROR",
            ConnState::RequestStream => "REQUEST_STREAM",
            ConnState::StreamRequestSuccess => "STREAM_REQUEST_SUCCESS",
            ConnState::StreamResponseSuccess => "STREAM_RESPONSE_SUCCESS",
            ConnState::StreamRequestError => "STREAM_REQUEST_ERROR",
            ConnState::StreamResponseError => "STREAM_RESPONSE_ERROR",
        }
    }

    /// True for any `*_ERROR` state.
    pub fn is_error(&self) -> bool {
        self.is_request_error() || self.is_response_error()
    }

    /// Send-side failure states, counted against the request budget.
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            ConnState::SourcesRequestError
                | ConnState::RegisterRequestError
                | ConnState::StreamRequestError
        )
    }

    /// Response-side failure states, counted against the response budget.
    pub fn is_response_error(&self) -> bool {
        matches!(
            self,
            ConnState::SourcesResponseError
                | ConnState::RegisterResponseError
                | ConnState::StreamResponseError
        )
    }

    fn can_transition_to(&self, to: ConnState) -> bool {
        use ConnState::*;
        if self.is_error() {
            // Every error state funnels back through server selection.
            return to == PickServer;
        }
        match self {
            Start => to == PickServer,
            PickServer => to == RequestSources,
            RequestSources => matches!(
                to,
                SourcesResponseSuccess | SourcesRequestError | SourcesResponseError
            ),
            SourcesResponseSuccess => to == RequestRegister,
            RequestRegister => matches!(
                to,
                RegisterResponseSuccess | RegisterRequestError | RegisterResponseError
            ),
            RegisterResponseSuccess => to == RequestStream,
            RequestStream => {
                matches!(to, StreamRequestSuccess | StreamRequestError | StreamResponseError)
            }
            StreamRequestSuccess => matches!(to, StreamResponseSuccess | StreamResponseError),
            StreamResponseSuccess => to == RequestStream,
            _ => false,
        }
    }
}

/// State of one connection attempt: current phase, cached metadata from
/// successful responses, and the ordered transition history.
///
/// Created when an attempt begins and discarded when it terminates; a
/// failed attempt's history is logged before a fresh attempt starts.
#[derive(Debug)]
pub struct ConnectionState {
    current: ConnState,
    history: Vec<&'static str>,
    /// Relay this attempt is bound to, set at `PickServer`
    relay: Option<ServerInfo>,
    /// Sources announced by the relay, cached at `SourcesResponseSuccess`
    sources: Vec<SourceDescriptor>,
    /// Source name -> wire id, derived from `sources`
    source_ids: HashMap<String, u16>,
    /// Schema maps cached at `RegisterResponseSuccess`
    schemas: Option<SchemaSet>,
    /// Most recent error message on this attempt
    last_error: Option<String>,
}

impl ConnectionState {
    /// Begin a new attempt.
    pub fn new() -> Self {
        Self {
            current: ConnState::Start,
            history: vec![ConnState::Start.name()],
            relay: None,
            sources: Vec::new(),
            source_ids: HashMap::new(),
            schemas: None,
            last_error: None,
        }
    }

    /// Current protocol phase.
    pub fn current(&self) -> ConnState {
        self.current
    }

    /// Ordered transition names since the attempt began.
    pub fn history(&self) -> &[&'static str] {
        &self.history
    }

    /// Move to `to`, appending it to the history.
    ///
    /// An illegal transition is a protocol-invariant violation: it means
    /// two completions raced onto the drain loop.
    pub fn transition(&mut self, to: ConnState) -> Result<()> {
        if !self.current.can_transition_to(to) {
            return Err(Error::ProtocolInvariant(format!(
                "illegal transition {} -> {}",
                self.current.name(),
                to.name()
            )));
        }
        tracing::debug!(from = self.current.name(), to = to.name(), "connection transition");
        self.current = to;
        self.history.push(to.name());
        Ok(())
    }

    /// Bind this attempt to a relay.
    pub fn set_relay(&mut self, relay: ServerInfo) {
        self.relay = Some(relay);
    }

    /// Relay this attempt is talking to.
    pub fn relay(&self) -> Option<&ServerInfo> {
        self.relay.as_ref()
    }

    /// Cache the `/sources` response.
    pub fn cache_sources(&mut self, sources: Vec<SourceDescriptor>) {
        self.source_ids = sources.iter().map(|s| (s.name.clone(), s.id)).collect();
        self.sources = sources;
    }

    /// Sources announced by the relay.
    pub fn sources(&self) -> &[SourceDescriptor] {
        &self.sources
    }

    /// Wire id for a source name, from the cached `/sources` response.
    pub fn source_id(&self, name: &str) -> Option<u16> {
        self.source_ids.get(name).copied()
    }

    /// Cache the `/register` schema maps.
    pub fn cache_schemas(&mut self, schemas: SchemaSet) {
        self.schemas = Some(schemas);
    }

    /// Schema maps cached at registration, if the attempt got that far.
    pub fn schemas(&self) -> Option<&SchemaSet> {
        self.schemas.as_ref()
    }

    /// Record the most recent error on this attempt.
    pub fn set_last_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    /// Most recent error message, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}
