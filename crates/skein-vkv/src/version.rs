//! Vector-clock ordering and merge.
//!
//! One counter slot per cluster member, indexed by the node's position
//! in the sorted membership list. A write bumps the writer's own slot;
//! replication merges clocks componentwise. Vectors of different
//! lengths are compared as if padded with zeros.

use serde::{Deserialize, Serialize};

/// A value together with the clock of the write that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: i64,
    pub version: Vec<u32>,
}

/// Causal relation between two clocks.
///
/// Identical clocks are reported as `Concurrent`: two writes carrying
/// the same clock came from different nodes and neither happened before
/// the other, so they still need the deterministic tie-break.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionOrder {
    /// `a` happened before `b`.
    Less,
    /// `b` happened before `a`.
    Greater,
    /// Neither dominates.
    Concurrent,
}

fn slot(v: &[u32], i: usize) -> u32 {
    v.get(i).copied().unwrap_or(0)
}

/// Compare two clocks componentwise.
pub fn compare(a: &[u32], b: &[u32]) -> VersionOrder {
    let len = a.len().max(b.len());
    let mut a_ahead = false;
    let mut b_ahead = false;
    for i in 0..len {
        let (x, y) = (slot(a, i), slot(b, i));
        if x < y {
            b_ahead = true;
        } else if x > y {
            a_ahead = true;
        }
    }
    match (a_ahead, b_ahead) {
        (true, false) => VersionOrder::Greater,
        (false, true) => VersionOrder::Less,
        _ => VersionOrder::Concurrent,
    }
}

/// Componentwise maximum. The result dominates both inputs, so a value
/// stored under the merged clock is never overwritten by a replay of
/// either side.
pub fn merge(a: &[u32], b: &[u32]) -> Vec<u32> {
    let len = a.len().max(b.len());
    (0..len).map(|i| slot(a, i).max(slot(b, i))).collect()
}
