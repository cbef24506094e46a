//! The puller: drives one connection attempt at a time for a source
//! group.
//!
//! Network completions never touch protocol state directly. Each request
//! runs on a spawned task that sends exactly one [`ConnectionMessage`]
//! into the attempt's mailbox; the drain loop below is the only consumer
//! and the only place state transitions happen, which serializes the
//! state machine without any locking. A single read timeout mid-stream
//! produces a single failure message - the reader exits after sending it,
//! so the subsequent disconnect can never double-report.

use crate::config::{PullConfig, StreamConfig};
use crate::consumer::EventDecoder;
use crate::control::ControlReceiver;
use crate::error::Error;
use crate::relay::{ByteStream, RelayTransport, SchemaSet, ServerInfo, SourceDescriptor, StreamRequest};
use crate::retry::RetryPolicy;
use crate::selector::RelayGroup;
use crate::state::{ConnState, ConnectionState};
use futures::StreamExt;
use parking_lot::Mutex as SyncMutex;
use seqbus_core::{CheckpointMult, EventBuffer, FrameDecoder, PhysicalPartition};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Completion messages delivered to the drain loop. Each spawned request
/// task sends exactly one.
enum ConnectionMessage {
    SourcesSuccess(Vec<SourceDescriptor>),
    SourcesFailed(Error),
    RegisterSuccess(SchemaSet),
    RegisterFailed(Error),
    StreamOpened(ByteStream),
    StreamOpenFailed(Error),
    /// Response body fully consumed
    StreamClosed,
    /// Response body failed mid-read (timeout, disconnect, bad frame)
    StreamFailed(Error),
}

/// Escalation sent to the registration supervisor when a retry budget is
/// exceeded; the owner is expected to perform an orderly shutdown.
#[derive(Debug)]
pub struct FatalEvent {
    /// Human-readable summary
    pub message: String,
    /// The error that exhausted the budget
    pub cause: Error,
}

/// Cumulative record of state transitions across connection attempts.
/// Shared with the registration handle for diagnostics and tests.
#[derive(Debug, Clone, Default)]
pub struct TransitionLog(Arc<SyncMutex<Vec<&'static str>>>);

impl TransitionLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, name: &'static str) {
        self.0.lock().push(name);
    }

    /// Snapshot of all transitions so far.
    pub fn snapshot(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }

    /// Occurrences of one transition name.
    pub fn count(&self, name: &str) -> usize {
        self.0.lock().iter().filter(|t| **t == name).count()
    }
}

/// Everything a puller needs to run one registration's pull loop.
pub struct Puller<T: RelayTransport> {
    transport: Arc<T>,
    group: RelayGroup,
    /// Source names this registration subscribed to
    subscription: Vec<String>,
    partition: PhysicalPartition,
    pull_cfg: PullConfig,
    stream_cfg: StreamConfig,
    buffer: Arc<EventBuffer>,
    checkpoints: Arc<Mutex<CheckpointMult>>,
    /// Bumped on every new stream epoch; the dispatcher compares it to
    /// decide whether a partial-window alignment check is due
    epoch: Arc<AtomicU64>,
    decoder_tx: watch::Sender<EventDecoder>,
    fatal_tx: mpsc::UnboundedSender<FatalEvent>,
    control: ControlReceiver,
    transitions: TransitionLog,
}

struct Attempt {
    state: ConnectionState,
    mailbox: mpsc::Receiver<ConnectionMessage>,
    mailbox_tx: mpsc::Sender<ConnectionMessage>,
    /// Ids resolved from the relay's `/sources` response, in subscription
    /// order
    source_ids: Vec<u16>,
}

enum AttemptOutcome {
    /// An error transition was recorded; counted and followed by a new
    /// attempt
    Failed { is_request: bool, error: Error },
    /// Shutdown observed; the error (if any) is suppressed
    Shutdown,
}

impl<T: RelayTransport> Puller<T> {
    /// Wire up a puller. Spawn [`Puller::run`] to start pulling.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<T>,
        group: RelayGroup,
        subscription: Vec<String>,
        partition: PhysicalPartition,
        pull_cfg: PullConfig,
        stream_cfg: StreamConfig,
        buffer: Arc<EventBuffer>,
        checkpoints: Arc<Mutex<CheckpointMult>>,
        epoch: Arc<AtomicU64>,
        decoder_tx: watch::Sender<EventDecoder>,
        fatal_tx: mpsc::UnboundedSender<FatalEvent>,
        control: ControlReceiver,
        transitions: TransitionLog,
    ) -> Self {
        Self {
            transport,
            group,
            subscription,
            partition,
            pull_cfg,
            stream_cfg,
            buffer,
            checkpoints,
            epoch,
            decoder_tx,
            fatal_tx,
            control,
            transitions,
        }
    }

    /// Drive connection attempts until shutdown or retry exhaustion.
    pub async fn run(mut self) {
        let mut request_retry = RetryPolicy::new(
            self.pull_cfg.init_sleep,
            self.pull_cfg.max_sleep,
            self.pull_cfg.backoff_multiplier,
            self.pull_cfg.jitter,
            self.pull_cfg.max_request_retries,
        );
        let mut response_retry = RetryPolicy::new(
            self.pull_cfg.init_sleep,
            self.pull_cfg.max_sleep,
            self.pull_cfg.backoff_multiplier,
            self.pull_cfg.jitter,
            self.pull_cfg.max_response_retries,
        );
        let mut tried: HashSet<String> = HashSet::new();
        let mut last_failure_was_request = false;
        let mut round_start = 0usize;

        loop {
            if !self.control.check().await {
                break;
            }

            let relay = match self
                .pick_relay(
                    &mut tried,
                    &request_retry,
                    &response_retry,
                    last_failure_was_request,
                    &mut round_start,
                )
                .await
            {
                Some(relay) => relay,
                // Shutdown arrived during the backoff sleep.
                None => break,
            };

            match self
                .run_attempt(relay, &mut request_retry, &mut response_retry, &mut tried)
                .await
            {
                AttemptOutcome::Shutdown => break,
                AttemptOutcome::Failed { is_request, error } => {
                    last_failure_was_request = is_request;
                    let within_budget = if is_request {
                        request_retry.record_failure()
                    } else {
                        response_retry.record_failure()
                    };
                    if !within_budget {
                        let attempts = if is_request {
                            request_retry.attempts()
                        } else {
                            response_retry.attempts()
                        };
                        warn!(%error, attempts, "retry limit exceeded, escalating");
                        let _ = self.fatal_tx.send(FatalEvent {
                            message: format!(
                                "retry limit exceeded after {attempts} attempts: {error}"
                            ),
                            cause: error,
                        });
                        // The owner shuts us down; no further retries here.
                        break;
                    }
                    debug!(%error, "connection attempt failed, reselecting relay");
                }
            }
        }
        self.control.mark_stopped();
        info!("puller stopped");
    }

    /// Choose the next relay: untried peers first, then backoff and a
    /// fresh round starting from the next peer, so repeated rounds do
    /// not pile every first attempt onto the same relay. Returns `None`
    /// on shutdown.
    async fn pick_relay(
        &mut self,
        tried: &mut HashSet<String>,
        request_retry: &RetryPolicy,
        response_retry: &RetryPolicy,
        last_failure_was_request: bool,
        round_start: &mut usize,
    ) -> Option<ServerInfo> {
        if let Some(relay) = self.group.pick_untried(tried) {
            let relay = relay.clone();
            tried.insert(relay.name.clone());
            return Some(relay);
        }

        // Every peer has been tried this round: sleep per the policy that
        // recorded the most recent failure, then start a fresh round.
        tried.clear();
        let sleep = if last_failure_was_request {
            request_retry.next_sleep()
        } else {
            response_retry.next_sleep()
        };
        debug!(?sleep, "all relays tried, backing off");
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = self.control.wait_shutdown() => return None,
        }
        if self.group.relays().is_empty() {
            return None;
        }
        *round_start = (*round_start + 1) % self.group.relays().len();
        let relay = self.group.relays().get(*round_start)?.clone();
        tried.insert(relay.name.clone());
        Some(relay)
    }

    /// One full connection attempt: sources -> register -> stream loop.
    async fn run_attempt(
        &mut self,
        relay: ServerInfo,
        request_retry: &mut RetryPolicy,
        response_retry: &mut RetryPolicy,
        tried: &mut HashSet<String>,
    ) -> AttemptOutcome {
        let (mailbox_tx, mailbox) = mpsc::channel(4);
        let mut attempt = Attempt {
            state: ConnectionState::new(),
            mailbox,
            mailbox_tx,
            source_ids: Vec::new(),
        };

        if let Err(e) = attempt.state.transition(ConnState::PickServer) {
            return self.invariant_failure(e);
        }
        self.transitions.push(ConnState::PickServer.name());
        attempt.state.set_relay(relay.clone());
        info!(relay = %relay, "connection attempt started");

        // --- /sources ---
        if let Err(e) = attempt.state.transition(ConnState::RequestSources) {
            return self.invariant_failure(e);
        }
        self.transitions.push(ConnState::RequestSources.name());
        let task = self.spawn_sources(&relay, attempt.mailbox_tx.clone());
        let msg = self.await_message(&mut attempt, task).await;
        let sources = match msg {
            Some(ConnectionMessage::SourcesSuccess(sources)) => sources,
            Some(ConnectionMessage::SourcesFailed(error)) => {
                return self.fail_attempt(&mut attempt, error);
            }
            Some(_) => return self.invariant_failure(Error::ProtocolInvariant(
                "unexpected completion while awaiting /sources".to_string(),
            )),
            None => return AttemptOutcome::Shutdown,
        };

        // The relay must announce every subscribed source; a gap is a
        // malformed response, not a config error - the group matched.
        attempt.state.cache_sources(sources);
        let mut source_ids = Vec::with_capacity(self.subscription.len());
        for name in &self.subscription {
            match attempt.state.source_id(name) {
                Some(id) => source_ids.push(id),
                None => {
                    let error =
                        Error::response(format!("relay {relay} does not announce source {name}"));
                    return self.fail_attempt(&mut attempt, error);
                }
            }
        }
        attempt.source_ids = source_ids;
        if let Err(e) = attempt.state.transition(ConnState::SourcesResponseSuccess) {
            return self.invariant_failure(e);
        }
        self.transitions.push(ConnState::SourcesResponseSuccess.name());

        // --- /register ---
        if let Err(e) = attempt.state.transition(ConnState::RequestRegister) {
            return self.invariant_failure(e);
        }
        self.transitions.push(ConnState::RequestRegister.name());
        let task = self.spawn_register(&relay, attempt.source_ids.clone(), attempt.mailbox_tx.clone());
        let msg = self.await_message(&mut attempt, task).await;
        let schemas = match msg {
            Some(ConnectionMessage::RegisterSuccess(schemas)) => schemas,
            Some(ConnectionMessage::RegisterFailed(error)) => {
                return self.fail_attempt(&mut attempt, error);
            }
            Some(_) => return self.invariant_failure(Error::ProtocolInvariant(
                "unexpected completion while awaiting /register".to_string(),
            )),
            None => return AttemptOutcome::Shutdown,
        };
        attempt.state.cache_schemas(schemas.clone());
        if let Err(e) = attempt.state.transition(ConnState::RegisterResponseSuccess) {
            return self.invariant_failure(e);
        }
        self.transitions.push(ConnState::RegisterResponseSuccess.name());

        let source_names = attempt
            .state
            .sources()
            .iter()
            .map(|s| (s.id, s.name.clone()))
            .collect();
        let _ = self.decoder_tx.send(EventDecoder::new(schemas, source_names));

        self.begin_stream_epoch().await;

        // --- /stream sub-loop: repeats while successful ---
        loop {
            if !self.control.check().await {
                return AttemptOutcome::Shutdown;
            }
            if let Err(e) = attempt.state.transition(ConnState::RequestStream) {
                return self.invariant_failure(e);
            }
            self.transitions.push(ConnState::RequestStream.name());

            let request = self.build_stream_request(&attempt.source_ids).await;
            let task = self.spawn_stream_open(&relay, request, attempt.mailbox_tx.clone());
            let msg = self.await_message(&mut attempt, task).await;
            let stream = match msg {
                Some(ConnectionMessage::StreamOpened(stream)) => stream,
                Some(ConnectionMessage::StreamOpenFailed(error)) => {
                    return self.fail_attempt(&mut attempt, error);
                }
                Some(_) => return self.invariant_failure(Error::ProtocolInvariant(
                    "unexpected completion while awaiting /stream".to_string(),
                )),
                None => return AttemptOutcome::Shutdown,
            };
            if let Err(e) = attempt.state.transition(ConnState::StreamRequestSuccess) {
                return self.invariant_failure(e);
            }
            self.transitions.push(ConnState::StreamRequestSuccess.name());

            let reader = self.spawn_stream_reader(stream, attempt.mailbox_tx.clone());
            let msg = self.await_message(&mut attempt, reader).await;
            match msg {
                Some(ConnectionMessage::StreamClosed) => {
                    if let Err(e) = attempt.state.transition(ConnState::StreamResponseSuccess) {
                        return self.invariant_failure(e);
                    }
                    self.transitions.push(ConnState::StreamResponseSuccess.name());
                    // A fully consumed response is a successful cycle:
                    // both budgets and the tried set reset.
                    request_retry.reset();
                    response_retry.reset();
                    tried.clear();
                    tried.insert(relay.name.clone());
                }
                Some(ConnectionMessage::StreamFailed(error)) => {
                    return self.fail_attempt(&mut attempt, error);
                }
                Some(_) => {
                    return self.invariant_failure(Error::ProtocolInvariant(
                        "unexpected completion while reading /stream body".to_string(),
                    ))
                }
                None => return AttemptOutcome::Shutdown,
            }
        }
    }

    /// Wait for the in-flight request's single completion message,
    /// racing it against shutdown. Returns `None` on shutdown, aborting
    /// the request task (the closed channel surfaces upstream as an
    /// error transition, which is suppressed because the shutdown flag
    /// is already set).
    async fn await_message(
        &mut self,
        attempt: &mut Attempt,
        task: JoinHandle<()>,
    ) -> Option<ConnectionMessage> {
        tokio::select! {
            msg = attempt.mailbox.recv() => msg,
            _ = self.control.wait_shutdown() => {
                task.abort();
                None
            }
        }
    }

    /// Record an error transition and terminate the attempt.
    fn fail_attempt(&mut self, attempt: &mut Attempt, error: Error) -> AttemptOutcome {
        if self.control.is_shutdown() {
            // The channel was closed by us; not a real failure.
            return AttemptOutcome::Shutdown;
        }
        let is_request = error.is_request();
        let err_state = match (attempt.state.current(), is_request) {
            (ConnState::RequestSources, true) => ConnState::SourcesRequestError,
            (ConnState::RequestSources, false) => ConnState::SourcesResponseError,
            (ConnState::RequestRegister, true) => ConnState::RegisterRequestError,
            (ConnState::RequestRegister, false) => ConnState::RegisterResponseError,
            (ConnState::RequestStream, true) => ConnState::StreamRequestError,
            (ConnState::RequestStream, false) => ConnState::StreamResponseError,
            // Mid-body failures are always response errors.
            (ConnState::StreamRequestSuccess, _) => ConnState::StreamResponseError,
            (from, _) => {
                return self.invariant_failure(Error::ProtocolInvariant(format!(
                    "failure delivered in non-request state {}",
                    from.name()
                )))
            }
        };
        attempt.state.set_last_error(error.to_string());
        if let Err(e) = attempt.state.transition(err_state) {
            return self.invariant_failure(e);
        }
        self.transitions.push(err_state.name());
        warn!(state = err_state.name(), %error, history = ?attempt.state.history(),
              "connection attempt failed");
        AttemptOutcome::Failed {
            is_request: err_state.is_request_error(),
            error,
        }
    }

    /// A broken serialization guarantee inside the drain loop itself.
    /// Never retried.
    fn invariant_failure(&self, error: Error) -> AttemptOutcome {
        let _ = self.fatal_tx.send(FatalEvent {
            message: "connection state machine violated".to_string(),
            cause: error,
        });
        AttemptOutcome::Shutdown
    }

    /// Start a new stream epoch. Anything still staged beyond the
    /// position the stream request resumes from came from the previous
    /// relay and will be re-served under the new relay's boundaries, so
    /// it is discarded *before* new bytes arrive - a slow consumer's
    /// undelivered backlog must never be delivered ahead of the re-served
    /// stream, and the regress flag has to be clean by the time the
    /// dispatcher runs its alignment check.
    async fn begin_stream_epoch(&self) {
        let checkpoints = self.checkpoints.lock().await;
        if let Some(cp) = checkpoints.get_checkpoint(&self.partition) {
            let resume_scn = if cp.is_partial_window() {
                debug!(prev_scn = cp.prev_scn, window_scn = cp.window_scn,
                       offset = ?cp.window_offset, "resuming with partial window");
                cp.prev_scn
            } else {
                cp.window_scn
            };
            self.buffer.rollback(resume_scn);
        }
        drop(checkpoints);
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.buffer.wake();
    }

    async fn build_stream_request(&self, source_ids: &[u16]) -> StreamRequest {
        let checkpoints = self.checkpoints.lock().await;
        let cp = checkpoints.get_checkpoint(&self.partition);
        // The serialized checkpoint carries prevScn; when the offset is
        // set the relay starts its response at that known-good boundary.
        let checkpoint = cp.map(|c| c.serialize());
        let flexible = cp.map(|c| c.flexible).unwrap_or(true);
        let checkpoint_mult = Some(checkpoints.serialize());
        StreamRequest {
            source_ids: source_ids.to_vec(),
            checkpoint,
            checkpoint_mult,
            fetch_size: self.stream_cfg.fetch_size,
            stream_from_latest_scn: flexible && self.stream_cfg.stream_from_latest_scn,
            max_event_version: self.stream_cfg.max_event_version,
        }
    }

    fn spawn_sources(&self, relay: &ServerInfo, tx: mpsc::Sender<ConnectionMessage>) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let relay = relay.clone();
        tokio::spawn(async move {
            let msg = match transport.fetch_sources(&relay).await {
                Ok(sources) => ConnectionMessage::SourcesSuccess(sources),
                Err(e) => ConnectionMessage::SourcesFailed(e),
            };
            let _ = tx.send(msg).await;
        })
    }

    fn spawn_register(
        &self,
        relay: &ServerInfo,
        source_ids: Vec<u16>,
        tx: mpsc::Sender<ConnectionMessage>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let relay = relay.clone();
        tokio::spawn(async move {
            let msg = match transport.register(&relay, &source_ids).await {
                Ok(schemas) => ConnectionMessage::RegisterSuccess(schemas),
                Err(e) => ConnectionMessage::RegisterFailed(e),
            };
            let _ = tx.send(msg).await;
        })
    }

    fn spawn_stream_open(
        &self,
        relay: &ServerInfo,
        request: StreamRequest,
        tx: mpsc::Sender<ConnectionMessage>,
    ) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let relay = relay.clone();
        tokio::spawn(async move {
            let msg = match transport.open_stream(&relay, &request).await {
                Ok(stream) => ConnectionMessage::StreamOpened(stream),
                Err(e) => ConnectionMessage::StreamOpenFailed(e),
            };
            let _ = tx.send(msg).await;
        })
    }

    /// Consume the response body into the staging buffer. Exactly one
    /// terminal message is sent on every exit path: a read timeout exits
    /// immediately after reporting, so the disconnect it causes cannot
    /// produce a second failure.
    fn spawn_stream_reader(
        &self,
        mut stream: ByteStream,
        tx: mpsc::Sender<ConnectionMessage>,
    ) -> JoinHandle<()> {
        let buffer = Arc::clone(&self.buffer);
        let read_timeout = self.pull_cfg.stream_read_timeout;
        tokio::spawn(async move {
            let mut decoder = FrameDecoder::default();
            loop {
                let chunk = match tokio::time::timeout(read_timeout, stream.next()).await {
                    Err(_) => {
                        let _ = tx
                            .send(ConnectionMessage::StreamFailed(Error::response(
                                "read timeout on /stream body",
                            )))
                            .await;
                        return;
                    }
                    Ok(None) => {
                        let _ = tx.send(ConnectionMessage::StreamClosed).await;
                        return;
                    }
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(ConnectionMessage::StreamFailed(e)).await;
                        return;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };
                decoder.feed(&chunk);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => {
                            if let Err(e) = buffer.append_frame(frame) {
                                let _ = tx
                                    .send(ConnectionMessage::StreamFailed(Error::response(
                                        format!("staging buffer rejected frame: {e}"),
                                    )))
                                    .await;
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = tx
                                .send(ConnectionMessage::StreamFailed(Error::response(format!(
                                    "malformed stream frame: {e}"
                                ))))
                                .await;
                            return;
                        }
                    }
                }
            }
        })
    }
}
