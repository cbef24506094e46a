//! Relay protocol surface: server descriptors, the three upstream
//! endpoints and the transport abstraction.
//!
//! A relay answers three HTTP GET endpoints:
//!
//! - `/sources` - logical source descriptors (`{id, name}`)
//! - `/register` - schema information for a source set; the response shape
//!   is negotiated via the `x-seqbus-protocol-version` response header
//!   (legacy bare list vs. extended map)
//! - `/stream` - a chunked body of length-prefixed frames, consumed
//!   directly into the staging buffer
//!
//! Remote failures are signaled through the `x-seqbus-error-class`
//! response header; anything unrecognizable is a generic response error.
//! Send-side failures (could not transmit at all) classify as request
//! errors, everything after the request left the client as response
//! errors - the two are budgeted independently by the puller.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Response header naming the remote exception class.
pub const ERROR_CLASS_HEADER: &str = "x-seqbus-error-class";

/// Response header carrying the relay's protocol version.
pub const PROTOCOL_VERSION_HEADER: &str = "x-seqbus-protocol-version";

/// Protocol version at which the extended register response shape became
/// the default.
const EXTENDED_REGISTER_VERSION: u16 = 4;

/// A known relay: name, address and the set of logical sources it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Human-readable relay name (diagnostics)
    pub name: String,
    /// Base URL, e.g. `http://relay-1.example.com:9000`
    pub address: String,
    /// Logical sources this relay serves
    pub sources: Vec<String>,
}

impl ServerInfo {
    /// Create a relay descriptor.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        sources: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            sources,
        }
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.address)
    }
}

/// One logical source as announced by `/sources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Numeric source id used on the wire
    pub id: u16,
    /// Fully qualified source name
    pub name: String,
}

/// One schema entry from `/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    /// Source id the schema belongs to
    pub id: u16,
    /// Source name
    pub name: String,
    /// Schema version
    #[serde(default)]
    pub version: u16,
    /// The schema document itself (opaque to this layer)
    pub schema: serde_json::Value,
}

/// Schemas cached from a successful `/register`, looked up when decoding
/// events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaSet {
    /// Payload schemas, keyed by source id. Always present.
    pub source_schemas: HashMap<u16, SchemaEntry>,
    /// Key schemas, extended responses only
    pub key_schemas: HashMap<u16, SchemaEntry>,
    /// Metadata schemas, extended responses only
    pub metadata_schemas: HashMap<u16, SchemaEntry>,
}

impl SchemaSet {
    fn index(entries: Vec<SchemaEntry>) -> HashMap<u16, SchemaEntry> {
        entries.into_iter().map(|e| (e.id, e)).collect()
    }
}

/// Extended `/register` response body (protocol version >= 4).
#[derive(Debug, Deserialize)]
struct ExtendedRegisterBody {
    #[serde(rename = "sourceSchemas")]
    source_schemas: Vec<SchemaEntry>,
    #[serde(rename = "keySchemas", default)]
    key_schemas: Vec<SchemaEntry>,
    #[serde(rename = "metadataSchemas", default)]
    metadata_schemas: Vec<SchemaEntry>,
}

/// Parse a `/register` response body.
///
/// The shape is chosen by the relay's protocol version header: absent or
/// below 4 means the legacy bare list, 4 and above the extended map keyed
/// by `sourceSchemas` / `keySchemas` / `metadataSchemas` of which only
/// `sourceSchemas` is mandatory. An unrecognized shape is a response
/// error, never a panic.
pub fn parse_register_body(protocol_version: Option<u16>, body: &[u8]) -> Result<SchemaSet> {
    let extended = protocol_version.map_or(false, |v| v >= EXTENDED_REGISTER_VERSION);
    if extended {
        let parsed: ExtendedRegisterBody = serde_json::from_slice(body).map_err(|e| {
            Error::response(format!("unparsable extended register response: {e}"))
        })?;
        Ok(SchemaSet {
            source_schemas: SchemaSet::index(parsed.source_schemas),
            key_schemas: SchemaSet::index(parsed.key_schemas),
            metadata_schemas: SchemaSet::index(parsed.metadata_schemas),
        })
    } else {
        let parsed: Vec<SchemaEntry> = serde_json::from_slice(body).map_err(|e| {
            Error::response(format!("unparsable legacy register response: {e}"))
        })?;
        Ok(SchemaSet {
            source_schemas: SchemaSet::index(parsed),
            ..Default::default()
        })
    }
}

/// Parameters of one `/stream` request.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Source ids to stream
    pub source_ids: Vec<u16>,
    /// Serialized single-partition checkpoint (`checkPoint`)
    pub checkpoint: Option<String>,
    /// Serialized multi-partition checkpoint (`checkPointMult`)
    pub checkpoint_mult: Option<String>,
    /// Requested response size in bytes
    pub fetch_size: usize,
    /// Start from the relay's most recent window
    pub stream_from_latest_scn: bool,
    /// Highest event version this client understands
    pub max_event_version: u16,
}

impl StreamRequest {
    /// Query parameters in wire order.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let ids = self
            .source_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let mut params = vec![("sources", ids)];
        if let Some(cp) = &self.checkpoint {
            params.push(("checkPoint", cp.clone()));
        }
        if let Some(mult) = &self.checkpoint_mult {
            params.push(("checkPointMult", mult.clone()));
        }
        params.push(("size", self.fetch_size.to_string()));
        params.push(("output", "binary".to_string()));
        params.push((
            "streamFromLatestScn",
            self.stream_from_latest_scn.to_string(),
        ));
        params.push(("maxEventVersion", self.max_event_version.to_string()));
        params
    }
}

/// Raw bytes of a `/stream` response body, chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Transport over which relay endpoints are reached.
///
/// The production implementation is [`HttpRelayTransport`]; tests script
/// their own.
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    /// `GET /sources` - logical sources served by this relay.
    async fn fetch_sources(&self, relay: &ServerInfo) -> Result<Vec<SourceDescriptor>>;

    /// `GET /register` - schema information for the given source ids.
    async fn register(&self, relay: &ServerInfo, source_ids: &[u16]) -> Result<SchemaSet>;

    /// `GET /stream` - open the chunked event stream.
    async fn open_stream(&self, relay: &ServerInfo, request: &StreamRequest)
        -> Result<ByteStream>;
}

/// HTTP transport backed by `reqwest`.
pub struct HttpRelayTransport {
    http: reqwest::Client,
    protocol_version: u16,
}

impl HttpRelayTransport {
    /// Build a transport with the given per-request timeout.
    pub fn new(request_timeout: std::time::Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Request {
                message: format!("failed to build HTTP client: {e}"),
                source: Some(e),
            })?;
        Ok(Self {
            http,
            protocol_version: crate::config::PROTOCOL_VERSION,
        })
    }

    fn classify(e: reqwest::Error, context: &str) -> Error {
        if e.is_connect() || e.is_builder() {
            Error::Request {
                message: format!("{context}: {e}"),
                source: Some(e),
            }
        } else {
            // Timeouts, disconnects and body failures all happened after
            // the request left the client.
            Error::Response {
                message: format!("{context}: {e}"),
                class: None,
                source: Some(e),
            }
        }
    }

    /// Map a non-2xx response to a typed error using the error-class
    /// header when present.
    async fn check_status(resp: reqwest::Response, context: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let class = resp
            .headers()
            .get(ERROR_CLASS_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = resp.text().await.unwrap_or_default();
        match class {
            Some(class) => Err(Error::response_class(
                format!("{context}: {status}: {body}"),
                class,
            )),
            None => Err(Error::response(format!("{context}: {status}: {body}"))),
        }
    }

    fn remote_protocol_version(resp: &reqwest::Response) -> Option<u16> {
        resp.headers()
            .get(PROTOCOL_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }
}

#[async_trait]
impl RelayTransport for HttpRelayTransport {
    async fn fetch_sources(&self, relay: &ServerInfo) -> Result<Vec<SourceDescriptor>> {
        let url = format!("{}/sources", relay.address);
        debug!(relay = %relay, "requesting /sources");
        let resp = self
            .http
            .get(&url)
            .query(&[("protocolVersion", self.protocol_version)])
            .send()
            .await
            .map_err(|e| Self::classify(e, "/sources request failed"))?;
        let resp = Self::check_status(resp, "/sources").await?;
        let body = resp
            .bytes()
            .await
            .map_err(|e| Self::classify(e, "/sources body read failed"))?;
        serde_json::from_slice(&body)
            .map_err(|e| Error::response(format!("unparsable /sources response: {e}")))
    }

    async fn register(&self, relay: &ServerInfo, source_ids: &[u16]) -> Result<SchemaSet> {
        let url = format!("{}/register", relay.address);
        let ids = source_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        debug!(relay = %relay, sources = %ids, "requesting /register");
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("protocolVersion", self.protocol_version.to_string()),
                ("sources", ids),
            ])
            .send()
            .await
            .map_err(|e| Self::classify(e, "/register request failed"))?;
        let resp = Self::check_status(resp, "/register").await?;
        let remote_version = Self::remote_protocol_version(&resp);
        let body = resp
            .bytes()
            .await
            .map_err(|e| Self::classify(e, "/register body read failed"))?;
        parse_register_body(remote_version, &body)
    }

    async fn open_stream(
        &self,
        relay: &ServerInfo,
        request: &StreamRequest,
    ) -> Result<ByteStream> {
        let url = format!("{}/stream", relay.address);
        debug!(relay = %relay, "opening /stream");
        let resp = self
            .http
            .get(&url)
            .query(&request.query_params())
            .send()
            .await
            .map_err(|e| Self::classify(e, "/stream request failed"))?;
        let resp = Self::check_status(resp, "/stream").await?;
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| Self::classify(e, "/stream body read failed")));
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_register_shape() {
        let body = r#"[
            {"id": 1, "name": "db.orders", "version": 2, "schema": {"type": "record"}},
            {"id": 2, "name": "db.members", "schema": {"type": "record"}}
        ]"#;
        let set = parse_register_body(None, body.as_bytes()).unwrap();
        assert_eq!(set.source_schemas.len(), 2);
        assert_eq!(set.source_schemas[&1].name, "db.orders");
        assert!(set.key_schemas.is_empty());

        // Version 3 still means legacy.
        let set = parse_register_body(Some(3), body.as_bytes()).unwrap();
        assert_eq!(set.source_schemas.len(), 2);
    }

    #[test]
    fn test_extended_register_shape() {
        let body = r#"{
            "sourceSchemas": [{"id": 1, "name": "db.orders", "schema": {}}],
            "keySchemas": [{"id": 1, "name": "db.orders", "schema": {"key": true}}]
        }"#;
        let set = parse_register_body(Some(4), body.as_bytes()).unwrap();
        assert_eq!(set.source_schemas.len(), 1);
        assert_eq!(set.key_schemas.len(), 1);
        assert!(set.metadata_schemas.is_empty());
    }

    #[test]
    fn test_extended_requires_source_schemas() {
        let body = r#"{"keySchemas": []}"#;
        let err = parse_register_body(Some(4), body.as_bytes()).unwrap_err();
        assert!(err.is_response());
    }

    #[test]
    fn test_unrecognized_shape_is_response_error() {
        let err = parse_register_body(Some(4), b"[1,2,3]").unwrap_err();
        assert!(err.is_response());
        let err = parse_register_body(None, b"{\"weird\": 1}").unwrap_err();
        assert!(err.is_response());
    }

    #[test]
    fn test_stream_query_params() {
        let req = StreamRequest {
            source_ids: vec![1, 2],
            checkpoint: Some("{}".to_string()),
            checkpoint_mult: None,
            fetch_size: 4096,
            stream_from_latest_scn: false,
            max_event_version: 2,
        };
        let params = req.query_params();
        assert_eq!(params[0], ("sources", "1,2".to_string()));
        assert!(params.contains(&("checkPoint", "{}".to_string())));
        assert!(params.contains(&("size", "4096".to_string())));
        assert!(params.contains(&("output", "binary".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "checkPointMult"));
    }
}
