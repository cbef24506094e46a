//! The dispatcher: drains the staging buffer and drives consumer
//! callbacks in strict stream order.
//!
//! The dispatcher is the only caller of consumer callbacks and the only
//! writer of the registration's checkpoint, so delivery order and
//! checkpoint advancement cannot race. Failed callbacks are retried
//! against their own budget, independent of the puller's network budgets;
//! exhaustion escalates to the registration supervisor.
//!
//! When the puller opens a new stream epoch while the checkpoint sits
//! inside a partial window, the first staged item decides between the two
//! resume paths: an event carrying the interrupted window's SCN means the
//! new relay serves the identical window, so delivery resumes mid-window
//! after silently skipping the already-delivered prefix; anything else
//! means the relays disagree on window boundaries, and consumers get an
//! `on_rollback` to the last known-good boundary before any further data.

use crate::config::DispatchConfig;
use crate::consumer::{Call, Consumer, ConsumerResult, EventDecoder};
use crate::control::ControlReceiver;
use crate::error::{Error, Result};
use crate::puller::FatalEvent;
use crate::store::SharedCheckpointStore;
use seqbus_core::{
    BufferItem, ChangeEvent, Checkpoint, CheckpointMult, EventBuffer, PhysicalPartition,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Drains one registration's staging buffer into its consumers.
pub struct Dispatcher {
    consumers: Vec<Arc<dyn Consumer>>,
    config: DispatchConfig,
    buffer: Arc<EventBuffer>,
    checkpoints: Arc<Mutex<CheckpointMult>>,
    partition: PhysicalPartition,
    store: SharedCheckpointStore,
    /// Store key, the registration id
    store_key: String,
    epoch: Arc<AtomicU64>,
    decoder_rx: watch::Receiver<EventDecoder>,
    fatal_tx: mpsc::UnboundedSender<FatalEvent>,
    control: ControlReceiver,

    // Delivery-position state, all owned by this task.
    last_epoch: u64,
    in_window: bool,
    current_window_scn: u64,
    current_source: Option<u16>,
    /// Already-delivered events to swallow when resuming mid-window
    skip_remaining: u64,
    last_delivered_scn: Option<u64>,
    windows_since_persist: u32,
}

impl Dispatcher {
    /// Wire up a dispatcher. Spawn [`Dispatcher::run`] to start draining.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumers: Vec<Arc<dyn Consumer>>,
        config: DispatchConfig,
        buffer: Arc<EventBuffer>,
        checkpoints: Arc<Mutex<CheckpointMult>>,
        partition: PhysicalPartition,
        store: SharedCheckpointStore,
        store_key: String,
        epoch: Arc<AtomicU64>,
        decoder_rx: watch::Receiver<EventDecoder>,
        fatal_tx: mpsc::UnboundedSender<FatalEvent>,
        control: ControlReceiver,
    ) -> Self {
        Self {
            consumers,
            config,
            buffer,
            checkpoints,
            partition,
            store,
            store_key,
            epoch,
            decoder_rx,
            fatal_tx,
            control,
            last_epoch: 0,
            in_window: false,
            current_window_scn: 0,
            current_source: None,
            skip_remaining: 0,
            last_delivered_scn: None,
            windows_since_persist: 0,
        }
    }

    /// Drain until shutdown or escalation.
    pub async fn run(mut self) {
        if let Err(e) = self.deliver(Call::StartConsumption).await {
            self.escalate(e);
            self.finish().await;
            return;
        }

        loop {
            if !self.control.check().await {
                break;
            }

            let epoch = self.epoch.load(Ordering::SeqCst);
            if epoch != self.last_epoch {
                self.last_epoch = epoch;
                match self.on_new_epoch().await {
                    Ok(true) => {}
                    // Shutdown arrived while waiting for the first item.
                    Ok(false) => break,
                    Err(e) => {
                        self.escalate(e);
                        break;
                    }
                }
                continue;
            }

            let Some(item) = self.buffer.pop_next() else {
                tokio::select! {
                    _ = self.buffer.wait_ready() => {}
                    _ = self.control.wait_shutdown() => break,
                }
                continue;
            };

            let outcome = match item {
                BufferItem::Event(event) => self.handle_event(event).await,
                BufferItem::EndOfWindow(scn) => self.handle_end_of_window(scn).await,
            };
            if let Err(e) = outcome {
                self.escalate(e);
                break;
            }
        }
        self.finish().await;
    }

    /// Resolve the resume position against a freshly opened stream epoch.
    ///
    /// Returns `Ok(false)` when shutdown interrupted the wait for the
    /// first staged item.
    async fn on_new_epoch(&mut self) -> Result<bool> {
        let resume = {
            let map = self.checkpoints.lock().await;
            match map.get_checkpoint(&self.partition) {
                Some(cp) if cp.is_partial_window() => Some(cp.clone()),
                _ => None,
            }
        };
        let Some(cp) = resume else {
            // Clean boundary: the new epoch simply continues.
            self.in_window = false;
            self.current_source = None;
            self.skip_remaining = 0;
            return Ok(true);
        };

        // The alignment check needs the epoch's first staged item.
        let first = loop {
            if let Some(item) = self.buffer.peek_next() {
                break item;
            }
            tokio::select! {
                _ = self.buffer.wait_ready() => {}
                _ = self.control.wait_shutdown() => return Ok(false),
            }
        };

        let aligned = matches!(&first, BufferItem::Event(e) if e.scn == cp.window_scn);
        if aligned {
            // Already-delivered events of the interrupted window are
            // window_offset + 1 deep; swallow exactly that many.
            let offset = cp.window_offset.ok_or_else(|| {
                Error::ProtocolInvariant("partial window without an offset".to_string())
            })?;
            self.skip_remaining = offset + 1;
            self.in_window = true;
            self.current_window_scn = cp.window_scn;
            debug!(
                window_scn = cp.window_scn,
                skip = self.skip_remaining,
                "resuming mid-window on aligned relay"
            );
            return Ok(true);
        }

        info!(
            prev_scn = cp.prev_scn,
            window_scn = cp.window_scn,
            first_scn = first.scn(),
            "window boundaries differ across relays, rolling back"
        );
        self.deliver(Call::Rollback(cp.prev_scn)).await?;
        self.with_checkpoint(|cp| cp.rollback_to_prev()).await?;
        // Consumers have acknowledged the rollback; the persisted position
        // must never again claim the abandoned partial window.
        self.persist_checkpoint().await?;
        if self.buffer.is_scn_regress() {
            return Err(Error::ProtocolInvariant(
                "SCN regression survived the rollback".to_string(),
            ));
        }
        self.in_window = false;
        self.current_source = None;
        self.skip_remaining = 0;
        self.last_delivered_scn = Some(cp.prev_scn);
        Ok(true)
    }

    async fn handle_event(&mut self, event: ChangeEvent) -> Result<()> {
        if self.skip_remaining > 0 {
            if !self.in_window || event.scn != self.current_window_scn {
                return Err(Error::ProtocolInvariant(format!(
                    "mid-window resume ran out of window {} while skipping",
                    self.current_window_scn
                )));
            }
            self.skip_remaining -= 1;
            return Ok(());
        }

        if self.in_window {
            if event.scn != self.current_window_scn {
                return Err(Error::ProtocolInvariant(format!(
                    "event SCN {} inside window {} without a boundary",
                    event.scn, self.current_window_scn
                )));
            }
        } else {
            if let Some(last) = self.last_delivered_scn {
                if event.scn < last {
                    return Err(Error::ProtocolInvariant(format!(
                        "delivery order violated: SCN {} after {}",
                        event.scn, last
                    )));
                }
            }
            // A window re-served after a rollback carries the checkpoint's
            // own windowScn; starting it again must not consume a new
            // prevScn slot.
            let fresh = self
                .with_checkpoint(|cp| {
                    if cp.window_scn == event.scn {
                        false
                    } else {
                        cp.start_window(event.scn);
                        true
                    }
                })
                .await?;
            if !fresh {
                debug!(scn = event.scn, "re-entering window at checkpoint boundary");
            }
            self.in_window = true;
            self.current_window_scn = event.scn;
            self.current_source = None;
            self.deliver(Call::StartWindow(event.scn)).await?;
        }

        if self.current_source != Some(event.source_id) {
            if let Some(prev) = self.current_source {
                self.deliver_source_bracket(prev, false).await?;
            }
            self.deliver_source_bracket(event.source_id, true).await?;
            self.current_source = Some(event.source_id);
        }

        let decoder = self.decoder_rx.borrow().clone();
        self.deliver(Call::DataEvent(&event, &decoder)).await?;
        self.last_delivered_scn = Some(event.scn);
        self.with_checkpoint(|cp| cp.event_processed()).await?;
        Ok(())
    }

    async fn handle_end_of_window(&mut self, scn: u64) -> Result<()> {
        if self.skip_remaining > 0 {
            return Err(Error::ProtocolInvariant(format!(
                "window {scn} closed while {} resumed events were still owed",
                self.skip_remaining
            )));
        }
        if !self.in_window {
            // Empty window: nothing to deliver, but the position advances.
            self.with_checkpoint(|cp| {
                if cp.window_scn != scn {
                    cp.start_window(scn);
                }
                cp.end_window(scn);
            })
            .await?;
            self.last_delivered_scn = Some(scn);
            return self.maybe_persist().await;
        }
        if scn != self.current_window_scn {
            return Err(Error::ProtocolInvariant(format!(
                "boundary SCN {scn} does not close window {}",
                self.current_window_scn
            )));
        }

        if let Some(src) = self.current_source.take() {
            self.deliver_source_bracket(src, false).await?;
        }
        self.deliver(Call::EndWindow(scn)).await?;
        self.with_checkpoint(|cp| cp.end_window(scn)).await?;
        self.deliver(Call::CheckpointAt(scn)).await?;
        self.in_window = false;
        self.last_delivered_scn = Some(scn);
        self.maybe_persist().await
    }

    /// Invoke one callback on every consumer, retrying per the budget.
    async fn deliver(&self, call: Call<'_>) -> Result<()> {
        for consumer in &self.consumers {
            let mut failures = 0u32;
            loop {
                match call.invoke(consumer.as_ref()).await {
                    ConsumerResult::Success => break,
                    ConsumerResult::Fatal => {
                        return Err(Error::Fatal(format!(
                            "consumer returned FATAL from {}",
                            call.name()
                        )));
                    }
                    ConsumerResult::Error => {
                        failures += 1;
                        if failures > self.config.max_consumer_retries {
                            return Err(Error::Processing(format!(
                                "consumer failed {} after {failures} attempts",
                                call.name()
                            )));
                        }
                        warn!(callback = call.name(), failures, "consumer callback failed, retrying");
                        tokio::time::sleep(self.config.consumer_retry_delay).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn deliver_source_bracket(&self, source_id: u16, start: bool) -> Result<()> {
        let decoder = self.decoder_rx.borrow().clone();
        let name = decoder
            .source_name(source_id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("source-{source_id}"));
        let schema = decoder.schema_for(source_id);
        let call = if start {
            Call::StartSource(&name, schema)
        } else {
            Call::EndSource(&name, schema)
        };
        self.deliver(call).await
    }

    async fn with_checkpoint<R>(&self, f: impl FnOnce(&mut Checkpoint) -> R) -> Result<R> {
        let mut map = self.checkpoints.lock().await;
        let cp = map.get_checkpoint_mut(&self.partition).ok_or_else(|| {
            Error::Fatal(format!("no checkpoint for partition {}", self.partition))
        })?;
        Ok(f(cp))
    }

    async fn maybe_persist(&mut self) -> Result<()> {
        self.windows_since_persist += 1;
        if self.windows_since_persist >= self.config.checkpoint_interval {
            self.persist_checkpoint().await?;
            self.windows_since_persist = 0;
        }
        Ok(())
    }

    async fn persist_checkpoint(&self) -> Result<()> {
        let snapshot = self.checkpoints.lock().await.clone();
        self.store.save(&self.store_key, &snapshot).await
    }

    fn escalate(&self, error: Error) {
        warn!(%error, "dispatcher escalating");
        let _ = self.fatal_tx.send(FatalEvent {
            message: "dispatch failed".to_string(),
            cause: error,
        });
    }

    /// Best-effort teardown: the current position is persisted and
    /// consumers are told consumption stopped.
    async fn finish(&mut self) {
        if let Err(e) = self.persist_checkpoint().await {
            warn!(error = %e, "failed to persist checkpoint on shutdown");
        }
        for consumer in &self.consumers {
            let _ = consumer.on_stop_consumption().await;
        }
        self.control.mark_stopped();
        info!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::control_channel;
    use crate::store::{CheckpointStore, MemoryCheckpointStore};
    use async_trait::async_trait;
    use seqbus_core::{BufferConfig, StreamFrame};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<String>>,
        fail_data_events: StdMutex<u32>,
    }

    impl Recorder {
        fn record(&self, s: String) {
            self.calls.lock().unwrap().push(s);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Consumer for Recorder {
        async fn on_start_consumption(&self) -> ConsumerResult {
            self.record("start_consumption".into());
            ConsumerResult::Success
        }

        async fn on_stop_consumption(&self) -> ConsumerResult {
            self.record("stop_consumption".into());
            ConsumerResult::Success
        }

        async fn on_start_source(
            &self,
            source: &str,
            _schema: Option<&crate::relay::SchemaEntry>,
        ) -> ConsumerResult {
            self.record(format!("start_source:{source}"));
            ConsumerResult::Success
        }

        async fn on_end_source(
            &self,
            source: &str,
            _schema: Option<&crate::relay::SchemaEntry>,
        ) -> ConsumerResult {
            self.record(format!("end_source:{source}"));
            ConsumerResult::Success
        }

        async fn on_start_data_event_sequence(&self, scn: u64) -> ConsumerResult {
            self.record(format!("start_window:{scn}"));
            ConsumerResult::Success
        }

        async fn on_data_event(&self, event: &ChangeEvent, _d: &EventDecoder) -> ConsumerResult {
            let mut fail = self.fail_data_events.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                self.record(format!("data_event_error:{}", event.scn));
                return ConsumerResult::Error;
            }
            self.record(format!("data_event:{}:{}", event.scn, event.source_id));
            ConsumerResult::Success
        }

        async fn on_end_data_event_sequence(&self, scn: u64) -> ConsumerResult {
            self.record(format!("end_window:{scn}"));
            ConsumerResult::Success
        }

        async fn on_checkpoint(&self, scn: u64) -> ConsumerResult {
            self.record(format!("checkpoint:{scn}"));
            ConsumerResult::Success
        }

        async fn on_rollback(&self, scn: u64) -> ConsumerResult {
            self.record(format!("rollback:{scn}"));
            ConsumerResult::Success
        }
    }

    struct Fixture {
        consumer: Arc<Recorder>,
        buffer: Arc<EventBuffer>,
        checkpoints: Arc<Mutex<CheckpointMult>>,
        store: Arc<MemoryCheckpointStore>,
        epoch: Arc<AtomicU64>,
        fatal_rx: mpsc::UnboundedReceiver<FatalEvent>,
        handle: crate::control::ControlHandle,
        task: tokio::task::JoinHandle<()>,
        _decoder_tx: watch::Sender<EventDecoder>,
    }

    async fn fixture(config: DispatchConfig, initial: Checkpoint) -> Fixture {
        let consumer = Arc::new(Recorder::default());
        let buffer = EventBuffer::new(BufferConfig::default());
        let partition = PhysicalPartition::new(0, "orders");
        let mut mult = CheckpointMult::new();
        mult.add_checkpoint(partition.clone(), initial).unwrap();
        let checkpoints = Arc::new(Mutex::new(mult));
        let store = Arc::new(MemoryCheckpointStore::new());
        let epoch = Arc::new(AtomicU64::new(1));
        let (decoder_tx, decoder_rx) = watch::channel(EventDecoder::default());
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (handle, control) = control_channel();

        let dispatcher = Dispatcher::new(
            vec![consumer.clone() as Arc<dyn Consumer>],
            config,
            Arc::clone(&buffer),
            Arc::clone(&checkpoints),
            partition,
            store.clone() as SharedCheckpointStore,
            "reg-1".to_string(),
            Arc::clone(&epoch),
            decoder_rx,
            fatal_tx,
            control,
        );
        let task = tokio::spawn(dispatcher.run());
        Fixture {
            consumer,
            buffer,
            checkpoints,
            store,
            epoch,
            fatal_rx,
            handle,
            task,
            _decoder_tx: decoder_tx,
        }
    }

    fn event(scn: u64, source: u16) -> StreamFrame {
        StreamFrame::Event(ChangeEvent::new(scn, source, &b"k"[..], &b"v"[..]))
    }

    async fn settle(buffer: &EventBuffer) {
        for _ in 0..200 {
            if buffer.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        // Give the dispatcher a beat to finish the last callback.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_window_delivery_order_and_source_brackets() {
        let mut fx = fixture(DispatchConfig::default(), Checkpoint::online(10, 20)).await;

        fx.buffer.append_frame(event(30, 1)).unwrap();
        fx.buffer.append_frame(event(30, 1)).unwrap();
        fx.buffer.append_frame(event(30, 2)).unwrap();
        fx.buffer.append_frame(StreamFrame::EndOfWindow { scn: 30 }).unwrap();
        settle(&fx.buffer).await;

        fx.handle.shutdown().await;
        fx.task.await.unwrap();

        assert_eq!(
            fx.consumer.calls(),
            vec![
                "start_consumption",
                "start_window:30",
                "start_source:source-1",
                "data_event:30:1",
                "data_event:30:1",
                "end_source:source-1",
                "start_source:source-2",
                "data_event:30:2",
                "end_source:source-2",
                "end_window:30",
                "checkpoint:30",
                "stop_consumption",
            ]
        );
        assert!(fx.fatal_rx.try_recv().is_err());

        let map = fx.checkpoints.lock().await;
        let cp = map
            .get_checkpoint(&PhysicalPartition::new(0, "orders"))
            .unwrap();
        assert_eq!(cp.window_scn, 30);
        assert_eq!(cp.prev_scn, 20);
        assert!(!cp.is_partial_window());
    }

    #[tokio::test]
    async fn test_checkpoint_persisted_per_interval() {
        let config = DispatchConfig {
            checkpoint_interval: 2,
            ..Default::default()
        };
        let mut fx = fixture(config, Checkpoint::online(0, 10)).await;

        fx.buffer.append_frame(event(20, 1)).unwrap();
        fx.buffer.append_frame(StreamFrame::EndOfWindow { scn: 20 }).unwrap();
        settle(&fx.buffer).await;
        // One window is below the interval; nothing persisted yet.
        assert_eq!(fx.store.load("reg-1").await.unwrap(), None);

        fx.buffer.append_frame(event(30, 1)).unwrap();
        fx.buffer.append_frame(StreamFrame::EndOfWindow { scn: 30 }).unwrap();
        settle(&fx.buffer).await;

        let persisted = fx.store.load("reg-1").await.unwrap().unwrap();
        let cp = persisted
            .get_checkpoint(&PhysicalPartition::new(0, "orders"))
            .unwrap();
        assert_eq!(cp.window_scn, 30);

        fx.handle.shutdown().await;
        fx.task.await.unwrap();
        drop(fx.fatal_rx);
    }

    #[tokio::test]
    async fn test_aligned_resume_skips_delivered_prefix() {
        let mut partial = Checkpoint::online(20, 30);
        // Events 0 and 1 of window 30 were already delivered.
        partial.window_offset = Some(1);
        let mut fx = fixture(DispatchConfig::default(), partial).await;

        // The aligned relay re-serves window 30 from its start.
        fx.buffer.append_frame(event(30, 1)).unwrap();
        fx.buffer.append_frame(event(30, 1)).unwrap();
        fx.buffer.append_frame(event(30, 2)).unwrap();
        fx.buffer.append_frame(StreamFrame::EndOfWindow { scn: 30 }).unwrap();
        settle(&fx.buffer).await;

        fx.handle.shutdown().await;
        fx.task.await.unwrap();

        // Only the third event is delivered; no rollback, no re-start of
        // the window.
        let calls = fx.consumer.calls();
        assert!(!calls.iter().any(|c| c.starts_with("rollback")));
        assert!(!calls.iter().any(|c| c.starts_with("start_window")));
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("data_event:")).count(),
            1
        );
        assert!(calls.contains(&"data_event:30:2".to_string()));
        assert!(calls.contains(&"end_window:30".to_string()));
        assert!(fx.fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_misaligned_resume_rolls_back() {
        let mut partial = Checkpoint::online(20, 30);
        partial.window_offset = Some(7);
        let mut fx = fixture(DispatchConfig::default(), partial).await;

        // The new relay cuts windows differently: its next window after
        // boundary 20 is 25, not 30.
        fx.buffer.append_frame(event(25, 1)).unwrap();
        fx.buffer.append_frame(StreamFrame::EndOfWindow { scn: 25 }).unwrap();
        settle(&fx.buffer).await;

        fx.handle.shutdown().await;
        fx.task.await.unwrap();

        let calls = fx.consumer.calls();
        let rollback_pos = calls.iter().position(|c| c == "rollback:20").unwrap();
        let first_event = calls
            .iter()
            .position(|c| c.starts_with("data_event:"))
            .unwrap();
        assert!(rollback_pos < first_event, "rollback must precede data: {calls:?}");
        assert!(calls.contains(&"start_window:25".to_string()));
        assert!(calls.contains(&"end_window:25".to_string()));

        // The re-delivered window advanced the persisted position.
        let persisted = fx.store.load("reg-1").await.unwrap().unwrap();
        let cp = persisted
            .get_checkpoint(&PhysicalPartition::new(0, "orders"))
            .unwrap();
        assert_eq!(cp.window_scn, 25);
        assert!(fx.fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_consumer_retry_budget_escalates() {
        let config = DispatchConfig {
            max_consumer_retries: 1,
            consumer_retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let mut fx = fixture(config, Checkpoint::online(0, 10)).await;
        *fx.consumer.fail_data_events.lock().unwrap() = u32::MAX;

        fx.buffer.append_frame(event(20, 1)).unwrap();
        let fatal = fx.fatal_rx.recv().await.unwrap();
        assert!(matches!(fatal.cause, Error::Processing(_)));

        fx.task.await.unwrap();
        // The failing event never advanced the checkpoint.
        let map = fx.checkpoints.lock().await;
        let cp = map
            .get_checkpoint(&PhysicalPartition::new(0, "orders"))
            .unwrap();
        assert!(cp.is_partial_window() || cp.window_scn == 20);
        drop(map);
        drop(fx.handle);
    }

    #[tokio::test]
    async fn test_transient_consumer_error_is_retried() {
        let config = DispatchConfig {
            max_consumer_retries: 3,
            consumer_retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let mut fx = fixture(config, Checkpoint::online(0, 10)).await;
        *fx.consumer.fail_data_events.lock().unwrap() = 2;

        fx.buffer.append_frame(event(20, 1)).unwrap();
        fx.buffer.append_frame(StreamFrame::EndOfWindow { scn: 20 }).unwrap();
        settle(&fx.buffer).await;

        fx.handle.shutdown().await;
        fx.task.await.unwrap();

        let calls = fx.consumer.calls();
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("data_event_error")).count(),
            2
        );
        assert!(calls.contains(&"data_event:20:1".to_string()));
        assert!(fx.fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_order_window_is_invariant_violation() {
        let mut fx = fixture(DispatchConfig::default(), Checkpoint::online(0, 10)).await;

        fx.buffer.append_frame(event(30, 1)).unwrap();
        fx.buffer.append_frame(StreamFrame::EndOfWindow { scn: 30 }).unwrap();
        settle(&fx.buffer).await;

        // An older window after 30 without a rollback is never tolerated.
        fx.buffer.append_frame(event(25, 1)).unwrap();
        let fatal = fx.fatal_rx.recv().await.unwrap();
        assert!(matches!(fatal.cause, Error::ProtocolInvariant(_)));
        fx.task.await.unwrap();
        drop(fx.handle);
    }
}
