//! # Consumption checkpoints
//!
//! Durable position tracking for resumable stream consumption.
//!
//! A [`Checkpoint`] records the position within a single physical
//! partition's change stream, including a mid-window position when delivery
//! of a window was interrupted. A [`CheckpointMult`] maps physical
//! partitions to their checkpoints and enforces the cross-partition
//! invariant that at most one partition may be inside a partial window at
//! any time.
//!
//! ## Wire format
//!
//! `Checkpoint` serializes to a flat JSON object with stable wire names
//! (`windowScn`, `windowOffset`, `prevScn`, ...). A clean window boundary
//! is encoded as `windowOffset = -1`. `CheckpointMult` serializes to a JSON
//! map keyed by partition identity strings (`"<name>_<id>"`) plus the
//! literal key `"cursorPartition"` for the advisory cursor hint. Unknown
//! keys are ignored on deserialization for forward compatibility.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How the consumer is currently sourcing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumptionMode {
    /// Consuming the live relay stream
    #[default]
    Online,
    /// Consuming a full bootstrap snapshot
    BootstrapSnapshot,
    /// Catching up from retained change logs after (or instead of) a snapshot
    BootstrapCatchup,
}

/// An independent stream-position domain.
///
/// Checkpoints are tracked per physical partition; the canonical identity
/// string `"<name>_<id>"` is used as the map key on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalPartition {
    /// Numeric partition id, unique within a name
    pub id: u32,
    /// Partition name (stream/database identifier)
    pub name: String,
}

impl PhysicalPartition {
    /// Create a new partition handle.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Canonical identity string used as the wire map key.
    pub fn identity(&self) -> String {
        format!("{}_{}", self.name, self.id)
    }
}

impl fmt::Display for PhysicalPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.name, self.id)
    }
}

impl FromStr for PhysicalPartition {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, id) = s
            .rsplit_once('_')
            .ok_or_else(|| CoreError::MalformedCheckpoint(format!("bad partition key: {s}")))?;
        if name.is_empty() {
            return Err(CoreError::MalformedCheckpoint(format!(
                "empty partition name in key: {s}"
            )));
        }
        let id = id
            .parse::<u32>()
            .map_err(|_| CoreError::MalformedCheckpoint(format!("bad partition id in key: {s}")))?;
        Ok(Self::new(id, name))
    }
}

/// Serialize `Option<u64>` window offsets with the `-1` clean-boundary
/// sentinel used on the wire.
mod offset_wire {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<u64>, s: S) -> std::result::Result<S::Ok, S::Error> {
        match v {
            Some(off) => s.serialize_i64(*off as i64),
            None => s.serialize_i64(-1),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<u64>, D::Error> {
        let raw = i64::deserialize(d)?;
        if raw < 0 {
            Ok(None)
        } else {
            Ok(Some(raw as u64))
        }
    }
}

/// Consumption position within one physical partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Current consumption mode
    #[serde(rename = "consumption_mode", default)]
    pub mode: ConsumptionMode,

    /// SCN of the current/most-recent window boundary
    #[serde(rename = "windowScn", default)]
    pub window_scn: u64,

    /// Index of the last fully-processed event inside the current window;
    /// `None` means a clean window boundary (wire form: `-1`)
    #[serde(rename = "windowOffset", with = "offset_wire", default)]
    pub window_offset: Option<u64>,

    /// The window boundary immediately preceding `window_scn`
    #[serde(rename = "prevScn", default)]
    pub prev_scn: u64,

    /// SCN the bootstrap was requested from (bootstrap modes only)
    #[serde(rename = "bootstrap_since_scn", default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_since_scn: Option<u64>,

    /// SCN at which the bootstrap producer started (bootstrap modes only)
    #[serde(rename = "bootstrap_start_scn", default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_start_scn: Option<u64>,

    /// SCN the bootstrap must reach before going online (bootstrap modes only)
    #[serde(rename = "bootstrap_target_scn", default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_target_scn: Option<u64>,

    /// No fixed position: start from the most recent available window.
    /// Used when no prior checkpoint exists.
    #[serde(rename = "flexible", default)]
    pub flexible: bool,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            mode: ConsumptionMode::Online,
            window_scn: 0,
            window_offset: None,
            prev_scn: 0,
            bootstrap_since_scn: None,
            bootstrap_start_scn: None,
            bootstrap_target_scn: None,
            flexible: false,
        }
    }
}

impl Checkpoint {
    /// Online checkpoint at a clean window boundary.
    pub fn online(prev_scn: u64, window_scn: u64) -> Self {
        Self {
            window_scn,
            prev_scn,
            ..Default::default()
        }
    }

    /// Flexible checkpoint: no fixed position, stream from the most recent
    /// available window.
    pub fn flexible() -> Self {
        Self {
            flexible: true,
            ..Default::default()
        }
    }

    /// Bootstrap-catchup checkpoint produced by the snapshot-bypass
    /// decision.
    pub fn bootstrap_catchup(since_scn: u64, start_scn: u64) -> Self {
        Self {
            mode: ConsumptionMode::BootstrapCatchup,
            window_scn: since_scn,
            prev_scn: since_scn,
            bootstrap_since_scn: Some(since_scn),
            bootstrap_start_scn: Some(start_scn),
            ..Default::default()
        }
    }

    /// Bootstrap-snapshot checkpoint for a full bootstrap.
    pub fn bootstrap_snapshot(since_scn: u64) -> Self {
        Self {
            mode: ConsumptionMode::BootstrapSnapshot,
            bootstrap_since_scn: Some(since_scn),
            ..Default::default()
        }
    }

    /// True when delivery of the current window was interrupted before its
    /// end boundary.
    pub fn is_partial_window(&self) -> bool {
        self.window_offset.is_some()
    }

    /// Record the start of a new window.
    ///
    /// The previous `window_scn` becomes `prev_scn`; the new window's
    /// commit SCN becomes `window_scn`. Taking a position also makes a
    /// flexible checkpoint concrete.
    pub fn start_window(&mut self, window_scn: u64) {
        self.prev_scn = self.window_scn;
        self.window_scn = window_scn;
        self.window_offset = None;
        self.flexible = false;
    }

    /// Record that one more event of the current window was fully
    /// processed.
    pub fn event_processed(&mut self) {
        self.window_offset = Some(match self.window_offset {
            Some(off) => off + 1,
            None => 0,
        });
    }

    /// Record a clean window boundary.
    pub fn end_window(&mut self, end_scn: u64) {
        self.window_offset = None;
        self.window_scn = end_scn;
    }

    /// Complete a rollback: forget the partial window and fall back to the
    /// last known-good boundary.
    ///
    /// Afterwards `window_offset` is `None` and `window_scn == prev_scn`.
    pub fn rollback_to_prev(&mut self) {
        self.window_offset = None;
        self.window_scn = self.prev_scn;
    }

    /// Check the position invariants.
    pub fn validate(&self) -> Result<()> {
        if self.prev_scn > self.window_scn {
            return Err(CoreError::CheckpointInvariant(format!(
                "prevScn {} > windowScn {}",
                self.prev_scn, self.window_scn
            )));
        }
        Ok(())
    }

    /// Serialize to the flat JSON wire form.
    pub fn serialize(&self) -> String {
        // Serialization of a plain struct with string keys cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Deserialize from the flat JSON wire form. Unknown keys are ignored.
    pub fn deserialize(s: &str) -> Result<Self> {
        let cp: Checkpoint = serde_json::from_str(s)
            .map_err(|e| CoreError::MalformedCheckpoint(e.to_string()))?;
        cp.validate()?;
        Ok(cp)
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Checkpoint(mode={:?} prevScn={} windowScn={} windowOffset={})",
            self.mode,
            self.prev_scn,
            self.window_scn,
            self.window_offset.map(|o| o as i64).unwrap_or(-1)
        )
    }
}

/// Wire key for the advisory cursor-partition hint.
const CURSOR_PARTITION_KEY: &str = "cursorPartition";

/// Per-partition checkpoints for a multi-partition stream.
///
/// Holds one [`Checkpoint`] per [`PhysicalPartition`] plus an advisory
/// cursor hint (the last partition drained). At most one partition may be
/// inside a partial window; [`CheckpointMult::add_checkpoint`] enforces
/// this on every insertion.
///
/// Equality compares only the partition map. The cursor hint is advisory
/// and never required for correctness.
#[derive(Debug, Clone, Default)]
pub struct CheckpointMult {
    checkpoints: BTreeMap<PhysicalPartition, Checkpoint>,
    cursor_partition: Option<PhysicalPartition>,
}

impl CheckpointMult {
    /// Create an empty checkpoint map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the checkpoint for a partition.
    ///
    /// Fails with [`CoreError::ConflictingPartialWindow`] if a *different*
    /// partition already holds partial-window status and the incoming
    /// checkpoint also reports a partial window.
    pub fn add_checkpoint(&mut self, partition: PhysicalPartition, cp: Checkpoint) -> Result<()> {
        if cp.is_partial_window() {
            if let Some(holder) = self.partial_window_partition() {
                if *holder != partition {
                    return Err(CoreError::ConflictingPartialWindow {
                        existing: holder.identity(),
                        incoming: partition.identity(),
                    });
                }
            }
        }
        self.checkpoints.insert(partition, cp);
        Ok(())
    }

    /// Look up the checkpoint for a partition.
    pub fn get_checkpoint(&self, partition: &PhysicalPartition) -> Option<&Checkpoint> {
        self.checkpoints.get(partition)
    }

    /// Mutable lookup, used by the dispatcher to advance positions.
    pub fn get_checkpoint_mut(&mut self, partition: &PhysicalPartition) -> Option<&mut Checkpoint> {
        self.checkpoints.get_mut(partition)
    }

    /// The partition currently inside a partial window, if any.
    pub fn partial_window_partition(&self) -> Option<&PhysicalPartition> {
        self.checkpoints
            .iter()
            .find(|(_, cp)| cp.is_partial_window())
            .map(|(p, _)| p)
    }

    /// Advisory hint: last partition drained across a multi-partition
    /// stream.
    pub fn cursor_partition(&self) -> Option<&PhysicalPartition> {
        self.cursor_partition.as_ref()
    }

    /// Set the advisory cursor hint.
    pub fn set_cursor_partition(&mut self, partition: Option<PhysicalPartition>) {
        self.cursor_partition = partition;
    }

    /// Iterate over all (partition, checkpoint) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&PhysicalPartition, &Checkpoint)> {
        self.checkpoints.iter()
    }

    /// Number of tracked partitions.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    /// True when no partitions are tracked.
    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Serialize to the JSON wire map.
    pub fn serialize(&self) -> String {
        let mut map = serde_json::Map::new();
        for (partition, cp) in &self.checkpoints {
            // A plain struct with string keys always converts.
            let value = serde_json::to_value(cp).unwrap_or(serde_json::Value::Null);
            map.insert(partition.identity(), value);
        }
        if let Some(cursor) = &self.cursor_partition {
            map.insert(
                CURSOR_PARTITION_KEY.to_string(),
                serde_json::Value::String(cursor.identity()),
            );
        }
        serde_json::Value::Object(map).to_string()
    }

    /// Deserialize from the JSON wire map.
    ///
    /// Keys that are neither `"cursorPartition"` nor well-formed partition
    /// identities are skipped for forward compatibility. Unparsable input
    /// fails with [`CoreError::MalformedCheckpoint`]; a conflicting
    /// partial-window pair fails with
    /// [`CoreError::ConflictingPartialWindow`].
    pub fn deserialize(s: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(s)
            .map_err(|e| CoreError::MalformedCheckpoint(e.to_string()))?;
        let map = value.as_object().ok_or_else(|| {
            CoreError::MalformedCheckpoint("checkpoint mult is not a JSON object".to_string())
        })?;

        let mut mult = CheckpointMult::new();
        for (key, val) in map {
            if key == CURSOR_PARTITION_KEY {
                if let Some(identity) = val.as_str() {
                    match identity.parse::<PhysicalPartition>() {
                        Ok(p) => mult.cursor_partition = Some(p),
                        Err(_) => {
                            tracing::debug!(key = %identity, "ignoring malformed cursor partition")
                        }
                    }
                }
                continue;
            }
            let partition = match key.parse::<PhysicalPartition>() {
                Ok(p) => p,
                Err(_) => {
                    // Forward compatibility: newer writers may add keys we
                    // do not understand.
                    tracing::debug!(key = %key, "ignoring unrecognized checkpoint key");
                    continue;
                }
            };
            let cp: Checkpoint = serde_json::from_value(val.clone())
                .map_err(|e| CoreError::MalformedCheckpoint(e.to_string()))?;
            cp.validate()?;
            mult.add_checkpoint(partition, cp)?;
        }
        Ok(mult)
    }
}

impl PartialEq for CheckpointMult {
    fn eq(&self, other: &Self) -> bool {
        // The cursor hint is advisory and excluded from equality.
        self.checkpoints == other.checkpoints
    }
}

impl Eq for CheckpointMult {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_wire_names() {
        let mut cp = Checkpoint::online(20, 30);
        cp.window_offset = Some(8);
        let json: serde_json::Value = serde_json::from_str(&cp.serialize()).unwrap();
        assert_eq!(json["windowScn"], 30);
        assert_eq!(json["prevScn"], 20);
        assert_eq!(json["windowOffset"], 8);
        assert_eq!(json["consumption_mode"], "ONLINE");
    }

    #[test]
    fn test_clean_boundary_serializes_minus_one() {
        let cp = Checkpoint::online(20, 30);
        let json: serde_json::Value = serde_json::from_str(&cp.serialize()).unwrap();
        assert_eq!(json["windowOffset"], -1);

        let back = Checkpoint::deserialize(&cp.serialize()).unwrap();
        assert_eq!(back.window_offset, None);
        assert!(!back.is_partial_window());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let mut cp = Checkpoint::bootstrap_catchup(100, 500);
        cp.bootstrap_target_scn = Some(900);
        let back = Checkpoint::deserialize(&cp.serialize()).unwrap();
        assert_eq!(back, cp);
    }

    #[test]
    fn test_checkpoint_ignores_unknown_keys() {
        let s = r#"{"windowScn": 42, "prevScn": 40, "windowOffset": -1,
                    "consumption_mode": "ONLINE", "shinyNewField": true}"#;
        let cp = Checkpoint::deserialize(s).unwrap();
        assert_eq!(cp.window_scn, 42);
        assert_eq!(cp.prev_scn, 40);
    }

    #[test]
    fn test_checkpoint_malformed() {
        assert!(matches!(
            Checkpoint::deserialize("not json"),
            Err(CoreError::MalformedCheckpoint(_))
        ));
    }

    #[test]
    fn test_checkpoint_invariant() {
        let s = r#"{"windowScn": 10, "prevScn": 20, "windowOffset": -1}"#;
        assert!(matches!(
            Checkpoint::deserialize(s),
            Err(CoreError::CheckpointInvariant(_))
        ));
    }

    #[test]
    fn test_window_progression() {
        let mut cp = Checkpoint::online(10, 20);
        cp.start_window(30);
        assert_eq!(cp.prev_scn, 20);
        assert_eq!(cp.window_scn, 30);

        cp.event_processed();
        cp.event_processed();
        assert_eq!(cp.window_offset, Some(1));
        assert!(cp.is_partial_window());

        cp.end_window(30);
        assert_eq!(cp.window_offset, None);
        assert_eq!(cp.window_scn, 30);
        assert_eq!(cp.prev_scn, 20);
    }

    #[test]
    fn test_flexible_becomes_concrete_once_positioned() {
        let mut cp = Checkpoint::flexible();
        cp.start_window(10);
        assert!(!cp.flexible);
        assert_eq!(cp.window_scn, 10);
    }

    #[test]
    fn test_rollback_restores_boundary() {
        let mut cp = Checkpoint::online(20, 30);
        cp.window_offset = Some(8);

        cp.rollback_to_prev();
        assert_eq!(cp.window_offset, None);
        assert_eq!(cp.window_scn, cp.prev_scn);
        assert_eq!(cp.window_scn, 20);
    }

    #[test]
    fn test_partition_identity_round_trip() {
        let p = PhysicalPartition::new(3, "orders");
        assert_eq!(p.identity(), "orders_3");
        assert_eq!("orders_3".parse::<PhysicalPartition>().unwrap(), p);

        // Underscores in the name bind to the left.
        let q = "member_account_12".parse::<PhysicalPartition>().unwrap();
        assert_eq!(q.name, "member_account");
        assert_eq!(q.id, 12);

        assert!("noid".parse::<PhysicalPartition>().is_err());
        assert!("bad_id".parse::<PhysicalPartition>().is_err());
    }

    #[test]
    fn test_mult_round_trip() {
        let mut mult = CheckpointMult::new();
        mult.add_checkpoint(PhysicalPartition::new(0, "orders"), Checkpoint::online(10, 20))
            .unwrap();
        let mut partial = Checkpoint::online(20, 30);
        partial.window_offset = Some(4);
        mult.add_checkpoint(PhysicalPartition::new(1, "orders"), partial)
            .unwrap();
        mult.set_cursor_partition(Some(PhysicalPartition::new(1, "orders")));

        let back = CheckpointMult::deserialize(&mult.serialize()).unwrap();
        assert_eq!(back, mult);
        assert_eq!(
            back.cursor_partition().map(|p| p.identity()),
            Some("orders_1".to_string())
        );
    }

    #[test]
    fn test_mult_equality_ignores_cursor() {
        let mut a = CheckpointMult::new();
        a.add_checkpoint(PhysicalPartition::new(0, "p"), Checkpoint::online(1, 2))
            .unwrap();
        let mut b = a.clone();
        b.set_cursor_partition(Some(PhysicalPartition::new(0, "p")));
        assert_eq!(a, b);
    }

    #[test]
    fn test_mult_conflicting_partial_windows() {
        let mut partial_a = Checkpoint::online(10, 20);
        partial_a.window_offset = Some(2);
        let mut partial_b = Checkpoint::online(30, 40);
        partial_b.window_offset = Some(5);

        let mut mult = CheckpointMult::new();
        mult.add_checkpoint(PhysicalPartition::new(0, "p"), partial_a)
            .unwrap();
        let err = mult
            .add_checkpoint(PhysicalPartition::new(1, "p"), partial_b)
            .unwrap_err();
        assert!(matches!(err, CoreError::ConflictingPartialWindow { .. }));
    }

    #[test]
    fn test_mult_replacing_own_partial_is_allowed() {
        let mut partial = Checkpoint::online(10, 20);
        partial.window_offset = Some(2);
        let part = PhysicalPartition::new(0, "p");

        let mut mult = CheckpointMult::new();
        mult.add_checkpoint(part.clone(), partial.clone()).unwrap();
        partial.window_offset = Some(3);
        mult.add_checkpoint(part, partial).unwrap();
    }

    #[test]
    fn test_mult_skips_unrecognized_keys() {
        let s = r#"{"orders_0": {"windowScn": 5, "prevScn": 5, "windowOffset": -1},
                    "futureExtension": {"whatever": 1}}"#;
        let mult = CheckpointMult::deserialize(s).unwrap();
        assert_eq!(mult.len(), 1);
        assert!(mult
            .get_checkpoint(&PhysicalPartition::new(0, "orders"))
            .is_some());
    }

    #[test]
    fn test_mult_malformed() {
        assert!(matches!(
            CheckpointMult::deserialize("[1,2,3]"),
            Err(CoreError::MalformedCheckpoint(_))
        ));
    }
}
