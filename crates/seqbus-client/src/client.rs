//! Client facade.
//!
//! A [`CdcClient`] owns the relay topology, the transport and the
//! checkpoint store. Each [`CdcClient::register`] call binds a source
//! subscription to its relay group and spawns the registration's puller,
//! dispatcher and supervisor; the returned [`Registration`] is the handle
//! for pausing, inspecting and shutting the trio down.
//!
//! The supervisor is the single escalation point: the first fatal event
//! from either task triggers exactly one `on_error` per consumer, then an
//! orderly shutdown of the whole registration. Later fatals (the other
//! task noticing the shutdown, for instance) are absorbed silently.

use crate::config::ClientConfig;
use crate::consumer::{Consumer, EventDecoder};
use crate::control::{control_channel, ControlHandle, TaskStatus};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::puller::{FatalEvent, Puller, TransitionLog};
use crate::registry::{RegistrationId, RegistrationRegistry};
use crate::relay::{RelayTransport, ServerInfo};
use crate::selector::RelaySelector;
use crate::store::SharedCheckpointStore;
use seqbus_core::{Checkpoint, CheckpointMult, EventBuffer, PhysicalPartition};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

/// One registration request: what to consume and from where to resume.
pub struct Subscription {
    /// Source names; must exactly match one relay group's served set
    pub sources: Vec<String>,
    /// Physical partition the checkpoint is tracked under
    pub partition: PhysicalPartition,
    /// Consumers invoked in order for every callback
    pub consumers: Vec<Arc<dyn Consumer>>,
    /// Starting position when no checkpoint is persisted; `None` means
    /// flexible (start from the most recent available window)
    pub initial_checkpoint: Option<Checkpoint>,
    /// Stable id override. The default is derived from the sources and
    /// partition, so the same subscription resumes its own checkpoint
    /// across restarts.
    pub id: Option<RegistrationId>,
}

impl Subscription {
    /// Subscribe the given consumers to a set of sources on a partition.
    pub fn new<S: Into<String>>(
        sources: impl IntoIterator<Item = S>,
        partition: PhysicalPartition,
        consumers: Vec<Arc<dyn Consumer>>,
    ) -> Self {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            partition,
            consumers,
            initial_checkpoint: None,
            id: None,
        }
    }

    /// Set the starting position used when no checkpoint is persisted.
    pub fn with_initial_checkpoint(mut self, cp: Checkpoint) -> Self {
        self.initial_checkpoint = Some(cp);
        self
    }

    /// Override the derived registration id.
    pub fn with_id(mut self, id: RegistrationId) -> Self {
        self.id = Some(id);
        self
    }

    fn derived_id(&self) -> RegistrationId {
        let mut sources = self.sources.clone();
        sources.sort();
        RegistrationId::new(format!(
            "{}-{}",
            sources.join("+").replace(['/', '\\'], "_"),
            self.partition.identity()
        ))
    }
}

/// Change-data-capture client over a set of redundant relays.
pub struct CdcClient<T: RelayTransport> {
    config: ClientConfig,
    selector: RelaySelector,
    transport: Arc<T>,
    store: SharedCheckpointStore,
    registry: Mutex<RegistrationRegistry>,
}

impl<T: RelayTransport> CdcClient<T> {
    /// Create a client over the given relays.
    pub fn new(
        config: ClientConfig,
        relays: Vec<ServerInfo>,
        transport: Arc<T>,
        store: SharedCheckpointStore,
    ) -> Self {
        Self {
            config,
            selector: RelaySelector::new(relays),
            transport,
            store,
            registry: Mutex::new(RegistrationRegistry::new()),
        }
    }

    /// Register a subscription and start consuming.
    ///
    /// Fails with [`Error::Config`] before anything connects when no relay
    /// group serves the requested source set, or when the registration id
    /// is already live on this client.
    pub async fn register(&self, subscription: Subscription) -> Result<Registration> {
        // Resolve the relay group first: an unservable subscription must
        // never get as far as a connection attempt.
        let group = self.selector.group_for(&subscription.sources)?.clone();
        if subscription.consumers.is_empty() {
            return Err(Error::Config("registration has no consumers".to_string()));
        }

        let id = subscription
            .id
            .clone()
            .unwrap_or_else(|| subscription.derived_id());
        self.registry.lock().await.insert(id.clone())?;

        let checkpoints = match self.resume_checkpoints(&id, &subscription).await {
            Ok(cps) => cps,
            Err(e) => {
                self.registry.lock().await.remove(&id);
                return Err(e);
            }
        };
        info!(registration = %id, sources = ?subscription.sources, "registration starting");

        let buffer = EventBuffer::new(self.config.buffer.clone());
        let checkpoints = Arc::new(Mutex::new(checkpoints));
        let epoch = Arc::new(AtomicU64::new(0));
        let (decoder_tx, decoder_rx) = watch::channel(EventDecoder::default());
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let transitions = TransitionLog::new();
        let (puller_ctl, puller_recv) = control_channel();
        let (dispatcher_ctl, dispatcher_recv) = control_channel();

        let puller = Puller::new(
            Arc::clone(&self.transport),
            group,
            subscription.sources.clone(),
            subscription.partition.clone(),
            self.config.pull.clone(),
            self.config.stream.clone(),
            Arc::clone(&buffer),
            Arc::clone(&checkpoints),
            Arc::clone(&epoch),
            decoder_tx,
            fatal_tx.clone(),
            puller_recv,
            transitions.clone(),
        );
        let dispatcher = Dispatcher::new(
            subscription.consumers.clone(),
            self.config.dispatch.clone(),
            Arc::clone(&buffer),
            Arc::clone(&checkpoints),
            subscription.partition.clone(),
            Arc::clone(&self.store),
            id.as_str().to_string(),
            Arc::clone(&epoch),
            decoder_rx,
            fatal_tx,
            dispatcher_recv,
        );

        tokio::spawn(puller.run());
        tokio::spawn(dispatcher.run());
        let supervisor = tokio::spawn(supervise(
            id.clone(),
            subscription.consumers,
            fatal_rx,
            puller_ctl.clone(),
            dispatcher_ctl.clone(),
            Arc::clone(&buffer),
        ));

        Ok(Registration {
            id,
            puller_ctl,
            dispatcher_ctl,
            transitions,
            checkpoints,
            buffer,
            supervisor,
        })
    }

    /// Stop a registration and release its id.
    pub async fn deregister(&self, registration: Registration) {
        registration.shutdown().await;
        self.registry.lock().await.remove(&registration.id);
    }

    /// Known relay groups.
    pub fn selector(&self) -> &RelaySelector {
        &self.selector
    }

    async fn resume_checkpoints(
        &self,
        id: &RegistrationId,
        subscription: &Subscription,
    ) -> Result<CheckpointMult> {
        if let Some(persisted) = self.store.load(id.as_str()).await? {
            if persisted.get_checkpoint(&subscription.partition).is_some() {
                info!(registration = %id, "resuming from persisted checkpoint");
                return Ok(persisted);
            }
            warn!(registration = %id, partition = %subscription.partition,
                  "persisted checkpoint lacks this partition, starting fresh");
        }
        let initial = match &subscription.initial_checkpoint {
            Some(cp) => {
                cp.validate()?;
                cp.clone()
            }
            None => Checkpoint::flexible(),
        };
        let mut mult = CheckpointMult::new();
        mult.add_checkpoint(subscription.partition.clone(), initial)?;
        Ok(mult)
    }
}

/// Handle to one live registration.
#[derive(Debug)]
pub struct Registration {
    id: RegistrationId,
    puller_ctl: ControlHandle,
    dispatcher_ctl: ControlHandle,
    transitions: TransitionLog,
    checkpoints: Arc<Mutex<CheckpointMult>>,
    buffer: Arc<EventBuffer>,
    supervisor: tokio::task::JoinHandle<()>,
}

impl Registration {
    /// Registration id, also the checkpoint store key.
    pub fn id(&self) -> &RegistrationId {
        &self.id
    }

    /// Cumulative connection-state transitions across all attempts.
    pub fn transitions(&self) -> &TransitionLog {
        &self.transitions
    }

    /// Snapshot of the current checkpoint positions.
    pub async fn checkpoints(&self) -> CheckpointMult {
        self.checkpoints.lock().await.clone()
    }

    /// Pause delivery at the next callback boundary. Pulling continues;
    /// staged data accumulates up to the buffer limit.
    pub async fn pause(&self) {
        self.dispatcher_ctl.pause().await;
    }

    /// Resume a paused registration.
    pub async fn resume(&self) {
        self.dispatcher_ctl.resume().await;
    }

    /// Dispatcher lifecycle status.
    pub fn status(&self) -> TaskStatus {
        self.dispatcher_ctl.status()
    }

    /// Shut down cooperatively and wait for both tasks to stop.
    pub async fn shutdown(&self) {
        self.puller_ctl.shutdown().await;
        self.dispatcher_ctl.shutdown().await;
        // A dispatcher parked on an empty buffer needs a nudge.
        self.buffer.wake();
        self.puller_ctl.await_status(TaskStatus::Stopped).await;
        self.dispatcher_ctl.await_status(TaskStatus::Stopped).await;
        self.supervisor.abort();
    }
}

/// First fatal wins: notify consumers once, then take the whole
/// registration down.
async fn supervise(
    id: RegistrationId,
    consumers: Vec<Arc<dyn Consumer>>,
    mut fatal_rx: mpsc::UnboundedReceiver<FatalEvent>,
    puller_ctl: ControlHandle,
    dispatcher_ctl: ControlHandle,
    buffer: Arc<EventBuffer>,
) {
    let Some(fatal) = fatal_rx.recv().await else {
        return;
    };
    error!(registration = %id, message = %fatal.message, cause = %fatal.cause,
           "registration failed, shutting down");
    for consumer in &consumers {
        let _ = consumer.on_error(&fatal.cause).await;
    }
    puller_ctl.shutdown().await;
    dispatcher_ctl.shutdown().await;
    buffer.wake();
    // Absorb secondary fatals emitted while the tasks wind down.
    while let Some(extra) = fatal_rx.recv().await {
        tracing::debug!(registration = %id, cause = %extra.cause, "suppressing secondary fatal");
    }
}
