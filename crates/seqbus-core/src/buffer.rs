//! In-process staging buffer between the network puller and the
//! dispatcher.
//!
//! Decoded stream frames are appended by the connection's drain loop and
//! consumed, strictly in arrival order, by the dispatcher. The buffer
//! tracks window boundaries, keeps an SCN index over the undelivered
//! backlog, and watches for SCN regressions: an appended SCN lower than
//! the last appended one raises the regress flag, which only a controlled
//! [`EventBuffer::rollback`] may clear. A regress flag that is still set
//! once a rollback has completed indicates the regression bypassed the
//! rollback path and is a protocol violation at the dispatch layer.

use crate::error::{CoreError, Result};
use crate::event::{ChangeEvent, StreamFrame};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Buffer sizing and limits.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum undelivered events staged before appends fail. Appends
    /// never overwrite undelivered data.
    pub max_staged_events: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_staged_events: 100_000,
        }
    }
}

/// One undelivered item, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferItem {
    /// A change event inside the current window
    Event(ChangeEvent),
    /// The current window closed at this commit SCN
    EndOfWindow(u64),
}

impl BufferItem {
    /// The SCN this item speaks for.
    pub fn scn(&self) -> u64 {
        match self {
            BufferItem::Event(e) => e.scn,
            BufferItem::EndOfWindow(scn) => *scn,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<BufferItem>,
    staged_events: usize,
    /// Highest SCN appended so far (events, boundaries and heartbeats)
    last_appended_scn: Option<u64>,
    scn_regress: bool,
}

/// Append-only staging area with window boundaries and an SCN index.
///
/// Shared between the puller (producer) and the dispatcher (consumer) of
/// one registration; other registrations own their own instance.
#[derive(Debug)]
pub struct EventBuffer {
    inner: Mutex<Inner>,
    config: BufferConfig,
    ready: Notify,
}

impl EventBuffer {
    /// Create a buffer with the given limits.
    pub fn new(config: BufferConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            config,
            ready: Notify::new(),
        })
    }

    /// Append one decoded stream frame.
    ///
    /// Heartbeats advance the SCN watermark but are never staged for
    /// delivery. Fails with [`CoreError::BufferFull`] rather than dropping
    /// undelivered data.
    pub fn append_frame(&self, frame: StreamFrame) -> Result<()> {
        let mut inner = self.inner.lock();
        let scn = frame.scn();
        if let Some(last) = inner.last_appended_scn {
            if scn < last {
                tracing::warn!(scn, last, "SCN regression observed in staged stream");
                inner.scn_regress = true;
            }
        }
        inner.last_appended_scn = Some(scn.max(inner.last_appended_scn.unwrap_or(0)));

        match frame {
            StreamFrame::Event(e) => {
                if inner.staged_events >= self.config.max_staged_events {
                    return Err(CoreError::BufferFull {
                        staged: inner.staged_events,
                        capacity: self.config.max_staged_events,
                    });
                }
                inner.staged_events += 1;
                inner.items.push_back(BufferItem::Event(e));
            }
            StreamFrame::EndOfWindow { scn } => {
                inner.items.push_back(BufferItem::EndOfWindow(scn));
            }
            StreamFrame::Heartbeat { .. } => {}
        }
        drop(inner);
        self.ready.notify_one();
        Ok(())
    }

    /// Look at the next undelivered item without consuming it.
    pub fn peek_next(&self) -> Option<BufferItem> {
        self.inner.lock().items.front().cloned()
    }

    /// Pop the next undelivered item, in arrival order.
    pub fn pop_next(&self) -> Option<BufferItem> {
        let mut inner = self.inner.lock();
        let item = inner.items.pop_front();
        if let Some(BufferItem::Event(_)) = item {
            inner.staged_events -= 1;
        }
        item
    }

    /// Wait until at least one item is staged or [`EventBuffer::wake`] is
    /// called.
    pub async fn wait_ready(&self) {
        if !self.is_empty() {
            return;
        }
        self.ready.notified().await;
    }

    /// Wake a waiting consumer without staging data (used on shutdown and
    /// on stream-epoch changes).
    pub fn wake(&self) {
        self.ready.notify_one();
    }

    /// True when an appended SCN went backwards without an intervening
    /// [`EventBuffer::rollback`].
    pub fn is_scn_regress(&self) -> bool {
        self.inner.lock().scn_regress
    }

    /// Discard everything staged beyond `prev_scn`, clear the regress flag
    /// and reset the append watermark to the known-good boundary.
    ///
    /// `is_scn_regress()` reads false immediately after this returns.
    pub fn rollback(&self, prev_scn: u64) {
        let mut inner = self.inner.lock();
        inner.items.retain(|item| item.scn() <= prev_scn);
        inner.staged_events = inner
            .items
            .iter()
            .filter(|i| matches!(i, BufferItem::Event(_)))
            .count();
        inner.scn_regress = false;
        inner.last_appended_scn = Some(prev_scn);
        tracing::debug!(prev_scn, remaining = inner.items.len(), "buffer rolled back");
    }

    /// Lowest SCN in the undelivered backlog.
    pub fn min_scn(&self) -> Option<u64> {
        self.inner.lock().items.iter().map(|i| i.scn()).min()
    }

    /// Highest SCN in the undelivered backlog.
    pub fn max_scn(&self) -> Option<u64> {
        self.inner.lock().items.iter().map(|i| i.scn()).max()
    }

    /// Undelivered events currently staged.
    pub fn staged_events(&self) -> usize {
        self.inner.lock().staged_events
    }

    /// True when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// True when the backlog ends inside an unclosed window.
    pub fn has_partial_tail(&self) -> bool {
        let inner = self.inner.lock();
        matches!(inner.items.back(), Some(BufferItem::Event(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(scn: u64, n: u16) -> StreamFrame {
        StreamFrame::Event(ChangeEvent::new(scn, n, &b"k"[..], &b"v"[..]))
    }

    #[test]
    fn test_window_assembly_in_order() {
        let buf = EventBuffer::new(BufferConfig::default());
        buf.append_frame(event(20, 1)).unwrap();
        buf.append_frame(event(20, 2)).unwrap();
        buf.append_frame(StreamFrame::EndOfWindow { scn: 20 }).unwrap();

        assert_eq!(buf.staged_events(), 2);
        assert_eq!(buf.min_scn(), Some(20));
        assert_eq!(buf.max_scn(), Some(20));

        assert!(matches!(buf.pop_next(), Some(BufferItem::Event(e)) if e.source_id == 1));
        assert!(matches!(buf.pop_next(), Some(BufferItem::Event(e)) if e.source_id == 2));
        assert_eq!(buf.pop_next(), Some(BufferItem::EndOfWindow(20)));
        assert_eq!(buf.pop_next(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_heartbeats_are_not_staged() {
        let buf = EventBuffer::new(BufferConfig::default());
        buf.append_frame(StreamFrame::Heartbeat { scn: 5 }).unwrap();
        assert!(buf.is_empty());
        // But they do advance the watermark: an older event now regresses.
        buf.append_frame(event(3, 1)).unwrap();
        assert!(buf.is_scn_regress());
    }

    #[test]
    fn test_regress_flag_and_rollback_clears_it() {
        let buf = EventBuffer::new(BufferConfig::default());
        buf.append_frame(event(30, 1)).unwrap();
        assert!(!buf.is_scn_regress());

        buf.append_frame(event(25, 1)).unwrap();
        assert!(buf.is_scn_regress());

        buf.rollback(20);
        assert!(!buf.is_scn_regress());
        assert!(buf.is_empty());

        // Fresh data from the known-good boundary is accepted cleanly.
        buf.append_frame(event(25, 1)).unwrap();
        assert!(!buf.is_scn_regress());
    }

    #[test]
    fn test_rollback_discards_only_beyond_boundary() {
        let buf = EventBuffer::new(BufferConfig::default());
        buf.append_frame(event(20, 1)).unwrap();
        buf.append_frame(StreamFrame::EndOfWindow { scn: 20 }).unwrap();
        buf.append_frame(event(30, 1)).unwrap();
        buf.append_frame(event(30, 2)).unwrap();

        buf.rollback(20);
        assert_eq!(buf.staged_events(), 1);
        assert_eq!(buf.max_scn(), Some(20));
        assert!(!buf.has_partial_tail());
    }

    #[test]
    fn test_partial_tail() {
        let buf = EventBuffer::new(BufferConfig::default());
        buf.append_frame(event(30, 1)).unwrap();
        assert!(buf.has_partial_tail());
        buf.append_frame(StreamFrame::EndOfWindow { scn: 30 }).unwrap();
        assert!(!buf.has_partial_tail());
    }

    #[test]
    fn test_capacity_protects_undelivered_data() {
        let buf = EventBuffer::new(BufferConfig {
            max_staged_events: 2,
        });
        buf.append_frame(event(10, 1)).unwrap();
        buf.append_frame(event(10, 2)).unwrap();
        assert!(matches!(
            buf.append_frame(event(10, 3)),
            Err(CoreError::BufferFull { staged: 2, .. })
        ));

        // Draining frees capacity.
        buf.pop_next();
        buf.append_frame(event(10, 3)).unwrap();
    }

    #[tokio::test]
    async fn test_wait_ready_wakes_on_append() {
        let buf = EventBuffer::new(BufferConfig::default());
        let buf2 = Arc::clone(&buf);
        let waiter = tokio::spawn(async move {
            buf2.wait_ready().await;
            buf2.pop_next()
        });
        tokio::task::yield_now().await;
        buf.append_frame(event(1, 1)).unwrap();
        let got = waiter.await.unwrap();
        assert!(matches!(got, Some(BufferItem::Event(_))));
    }
}
