//! # seqbus-client - Pull/dispatch protocol for the seqbus CDC client
//!
//! Consumes ordered change streams from a set of redundant relays and
//! delivers them to registered consumers in strictly increasing SCN
//! order, across relay failures.
//!
//! Each registration runs three cooperating tasks:
//!
//! - the **puller** ([`puller::Puller`]) drives the
//!   sources -> register -> stream protocol against one relay at a time,
//!   failing over between peers and staging decoded frames into the
//!   shared [`seqbus_core::EventBuffer`]
//! - the **dispatcher** ([`dispatcher::Dispatcher`]) drains the buffer,
//!   invokes consumer callbacks in window order and advances the
//!   registration's [`seqbus_core::Checkpoint`]
//! - the **supervisor** turns the first fatal event from either task
//!   into one `on_error` per consumer and an orderly shutdown
//!
//! ```no_run
//! use seqbus_client::{CdcClient, ClientConfig, Subscription};
//! use seqbus_client::consumer::NoopConsumer;
//! use seqbus_client::relay::{HttpRelayTransport, ServerInfo};
//! use seqbus_client::store::FileCheckpointStore;
//! use seqbus_core::PhysicalPartition;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> seqbus_client::Result<()> {
//! let relays = vec![
//!     ServerInfo::new("r1", "http://relay-1:9000", vec!["db.orders".into()]),
//!     ServerInfo::new("r2", "http://relay-2:9000", vec!["db.orders".into()]),
//! ];
//! let transport = Arc::new(HttpRelayTransport::new(Duration::from_secs(10))?);
//! let store = Arc::new(FileCheckpointStore::new("/var/lib/seqbus").await?);
//! let client = CdcClient::new(ClientConfig::default(), relays, transport, store);
//!
//! let registration = client
//!     .register(Subscription::new(
//!         ["db.orders"],
//!         PhysicalPartition::new(0, "orders"),
//!         vec![Arc::new(NoopConsumer)],
//!     ))
//!     .await?;
//! registration.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod consumer;
pub mod control;
pub mod dispatcher;
pub mod error;
pub mod puller;
pub mod registry;
pub mod relay;
pub mod retry;
pub mod selector;
pub mod state;
pub mod store;

pub use client::{CdcClient, Registration, Subscription};
pub use config::{ClientConfig, DispatchConfig, PullConfig, StreamConfig};
pub use consumer::{Consumer, ConsumerResult, EventDecoder};
pub use control::{ControlHandle, ControlSignal, TaskStatus};
pub use error::{Error, Result};
pub use registry::RegistrationId;
pub use relay::{HttpRelayTransport, RelayTransport, ServerInfo};
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
