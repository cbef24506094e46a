//! Bootstrap snapshot-bypass decision.
//!
//! Before the pull loop starts, a consumer far behind the live stream
//! normally needs a full bootstrap snapshot. When the requested catch-up
//! range is still retained in the change-log tables and small enough, the
//! snapshot can be bypassed and the consumer started directly in catch-up
//! mode. This decision only shapes the *initial* checkpoint handed to the
//! puller/dispatcher pair; it plays no part in steady-state operation.

use crate::error::{Error, Result};
use async_trait::async_trait;
use seqbus_core::Checkpoint;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// One retained change-log segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSegment {
    /// First SCN covered by the segment
    pub start_scn: u64,
    /// Last SCN covered by the segment
    pub end_scn: u64,
    /// Approximate row count in the segment
    pub rows: u64,
}

/// Read-side view of the upstream change-log tables.
#[async_trait]
pub trait ChangeLogInspector: Send + Sync {
    /// Lowest SCN still retained for a source. `None` means the
    /// minimum-SCN metadata itself is missing, which is fatal.
    async fn min_retained_scn(&self, source: &str) -> Result<Option<u64>>;

    /// Log segments overlapping `[since_scn, start_scn]`, used to
    /// approximate the row distance of the catch-up range.
    async fn segments_in_range(
        &self,
        source: &str,
        since_scn: u64,
        start_scn: u64,
    ) -> Result<Vec<LogSegment>>;
}

/// Settings for the bypass decision.
#[derive(Debug, Clone)]
pub struct SnapshotBypassConfig {
    /// Master switch; independent of the flexible-checkpoint switch
    pub enabled: bool,
    /// Sources explicitly excluded from bypass
    pub disabled_sources: HashSet<String>,
    /// Default row-distance ceiling
    pub max_row_distance: u64,
    /// Per-source row-distance overrides
    pub per_source_row_distance: HashMap<String, u64>,
}

impl Default for SnapshotBypassConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled_sources: HashSet::new(),
            max_row_distance: 1_000_000,
            per_source_row_distance: HashMap::new(),
        }
    }
}

/// Outcome of the bypass evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassDecision {
    /// Catch-up is servable from retained change logs
    Catchup,
    /// A full snapshot is required
    Snapshot {
        /// Why the bypass was refused
        reason: &'static str,
    },
}

/// Evaluates whether catch-up can be served from retained change logs.
pub struct SnapshotBypassPolicy<I> {
    config: SnapshotBypassConfig,
    inspector: I,
}

impl<I: ChangeLogInspector> SnapshotBypassPolicy<I> {
    /// Create a policy over the given inspector.
    pub fn new(config: SnapshotBypassConfig, inspector: I) -> Self {
        Self { config, inspector }
    }

    /// Decide between catch-up and a full snapshot for one source.
    ///
    /// Bypass requires all of: `since_scn > 0` (a full bootstrap is never
    /// bypassed), the source not excluded, the range
    /// `[since_scn, start_scn]` fully retained, and the approximate row
    /// distance within the per-source ceiling.
    pub async fn evaluate(
        &self,
        source: &str,
        since_scn: u64,
        start_scn: u64,
    ) -> Result<BypassDecision> {
        if !self.config.enabled {
            return Ok(BypassDecision::Snapshot {
                reason: "bypass disabled",
            });
        }
        if since_scn == 0 {
            return Ok(BypassDecision::Snapshot {
                reason: "full bootstrap requested",
            });
        }
        if self.config.disabled_sources.contains(source) {
            return Ok(BypassDecision::Snapshot {
                reason: "source excluded from bypass",
            });
        }

        let min_scn = self
            .inspector
            .min_retained_scn(source)
            .await?
            .ok_or_else(|| {
                Error::Fatal(format!("minimum-SCN metadata missing for source {source}"))
            })?;
        if min_scn > since_scn {
            debug!(source, since_scn, min_scn, "catch-up range purged from change log");
            return Ok(BypassDecision::Snapshot {
                reason: "range not retained",
            });
        }

        // The range may span several log segments; the distance is the
        // sum of their per-segment row counts.
        let segments = self
            .inspector
            .segments_in_range(source, since_scn, start_scn)
            .await?;
        let row_distance: u64 = segments.iter().map(|s| s.rows).sum();
        let ceiling = self
            .config
            .per_source_row_distance
            .get(source)
            .copied()
            .unwrap_or(self.config.max_row_distance);
        if row_distance > ceiling {
            debug!(source, row_distance, ceiling, "row distance exceeds bypass ceiling");
            return Ok(BypassDecision::Snapshot {
                reason: "row distance too large",
            });
        }

        info!(source, since_scn, start_scn, row_distance, "bypassing bootstrap snapshot");
        Ok(BypassDecision::Catchup)
    }

    /// Derive the initial checkpoint for a source.
    pub async fn initial_checkpoint(
        &self,
        source: &str,
        since_scn: u64,
        start_scn: u64,
    ) -> Result<Checkpoint> {
        match self.evaluate(source, since_scn, start_scn).await? {
            BypassDecision::Catchup => Ok(Checkpoint::bootstrap_catchup(since_scn, start_scn)),
            BypassDecision::Snapshot { .. } => Ok(Checkpoint::bootstrap_snapshot(since_scn)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqbus_core::ConsumptionMode;

    struct FixedInspector {
        min_scn: Option<u64>,
        segments: Vec<LogSegment>,
    }

    #[async_trait]
    impl ChangeLogInspector for FixedInspector {
        async fn min_retained_scn(&self, _source: &str) -> Result<Option<u64>> {
            Ok(self.min_scn)
        }

        async fn segments_in_range(
            &self,
            _source: &str,
            _since_scn: u64,
            _start_scn: u64,
        ) -> Result<Vec<LogSegment>> {
            Ok(self.segments.clone())
        }
    }

    fn inspector() -> FixedInspector {
        FixedInspector {
            min_scn: Some(50),
            segments: vec![
                LogSegment {
                    start_scn: 50,
                    end_scn: 200,
                    rows: 300,
                },
                LogSegment {
                    start_scn: 200,
                    end_scn: 400,
                    rows: 400,
                },
            ],
        }
    }

    fn policy(config: SnapshotBypassConfig) -> SnapshotBypassPolicy<FixedInspector> {
        SnapshotBypassPolicy::new(config, inspector())
    }

    #[tokio::test]
    async fn test_bypass_granted() {
        let p = policy(SnapshotBypassConfig::default());
        assert_eq!(p.evaluate("S1", 100, 400).await.unwrap(), BypassDecision::Catchup);

        let cp = p.initial_checkpoint("S1", 100, 400).await.unwrap();
        assert_eq!(cp.mode, ConsumptionMode::BootstrapCatchup);
        assert_eq!(cp.bootstrap_since_scn, Some(100));
        assert_eq!(cp.bootstrap_start_scn, Some(400));
    }

    #[tokio::test]
    async fn test_full_bootstrap_never_bypassed() {
        let p = policy(SnapshotBypassConfig::default());
        assert!(matches!(
            p.evaluate("S1", 0, 400).await.unwrap(),
            BypassDecision::Snapshot { .. }
        ));
    }

    #[tokio::test]
    async fn test_excluded_source() {
        let mut cfg = SnapshotBypassConfig::default();
        cfg.disabled_sources.insert("S1".to_string());
        let p = policy(cfg);
        assert!(matches!(
            p.evaluate("S1", 100, 400).await.unwrap(),
            BypassDecision::Snapshot {
                reason: "source excluded from bypass"
            }
        ));
    }

    #[tokio::test]
    async fn test_purged_range() {
        let mut insp = inspector();
        insp.min_scn = Some(150);
        let p = SnapshotBypassPolicy::new(SnapshotBypassConfig::default(), insp);
        assert!(matches!(
            p.evaluate("S1", 100, 400).await.unwrap(),
            BypassDecision::Snapshot {
                reason: "range not retained"
            }
        ));
    }

    #[tokio::test]
    async fn test_row_distance_sums_across_segments() {
        let mut cfg = SnapshotBypassConfig::default();
        // Two segments of 300 + 400 rows; a ceiling of 600 refuses.
        cfg.max_row_distance = 600;
        let p = policy(cfg.clone());
        assert!(matches!(
            p.evaluate("S1", 100, 400).await.unwrap(),
            BypassDecision::Snapshot {
                reason: "row distance too large"
            }
        ));

        // A per-source override wins over the default.
        cfg.per_source_row_distance.insert("S1".to_string(), 1000);
        let p = policy(cfg);
        assert_eq!(p.evaluate("S1", 100, 400).await.unwrap(), BypassDecision::Catchup);
    }

    #[tokio::test]
    async fn test_missing_min_scn_is_fatal() {
        let insp = FixedInspector {
            min_scn: None,
            segments: vec![],
        };
        let p = SnapshotBypassPolicy::new(SnapshotBypassConfig::default(), insp);
        assert!(matches!(p.evaluate("S1", 100, 400).await, Err(Error::Fatal(_))));
    }

    #[tokio::test]
    async fn test_snapshot_checkpoint_when_refused() {
        let p = policy(SnapshotBypassConfig {
            enabled: false,
            ..Default::default()
        });
        let cp = p.initial_checkpoint("S1", 100, 400).await.unwrap();
        assert_eq!(cp.mode, ConsumptionMode::BootstrapSnapshot);
        assert_eq!(cp.bootstrap_since_scn, Some(100));
    }
}
