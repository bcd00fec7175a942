//! Sequence Reconciler
//!
//! Merges a batch of freshly decoded records into the canonical log.
//! Duplicates are dropped, holes are filled with placeholder records and the
//! result is strictly ordered by `seq_no`.
//!
//! # Guarantees
//!
//! After every call the log has unique, ascending `seq_no` and every integer
//! between its first and last entry is present exactly once, either as a
//! genuine record or as a placeholder. Reconciling the same batch twice is a
//! no-op the second time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::log::CanonicalLog;
use crate::models::VitalRecord;

/// Default ceiling on placeholders synthesized for a single hole.
pub const DEFAULT_MAX_GAP_FILL: u64 = 10_000;

/// What happens when a genuine record arrives for a `seq_no` already held by
/// a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderPolicy {
    /// Replace the placeholder; the record keeps `missed_live = true`.
    Upgrade,
    /// Treat the record as a duplicate, the placeholder stays forever.
    Keep,
}

impl Default for PlaceholderPolicy {
    fn default() -> Self {
        Self::Upgrade
    }
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    /// New genuine records merged
    pub accepted: u64,
    /// Records dropped because their `seq_no` was already held
    pub duplicates: u64,
    /// Placeholders synthesized
    pub placeholders: u64,
    /// Placeholders replaced by genuine records
    pub upgraded: u64,
    /// Records accepted below the previous head
    pub backfilled: u64,
    /// Records dropped because the hole they open exceeds `max_gap_fill`
    pub implausible: u64,
}

impl MergeStats {
    pub fn changed(&self) -> bool {
        self.accepted + self.placeholders + self.upgraded > 0
    }
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub log: CanonicalLog,
    pub stats: MergeStats,
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    origin: u64,
    placeholder_policy: PlaceholderPolicy,
    max_gap_fill: u64,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            origin: 1,
            placeholder_policy: PlaceholderPolicy::default(),
            max_gap_fill: DEFAULT_MAX_GAP_FILL,
        }
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// First expected `seq_no` when merging into an empty log.
    pub fn with_origin(mut self, origin: u64) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_placeholder_policy(mut self, policy: PlaceholderPolicy) -> Self {
        self.placeholder_policy = policy;
        self
    }

    pub fn with_max_gap_fill(mut self, max_gap_fill: u64) -> Self {
        self.max_gap_fill = max_gap_fill;
        self
    }

    pub fn origin(&self) -> u64 {
        self.origin
    }

    pub fn placeholder_policy(&self) -> PlaceholderPolicy {
        self.placeholder_policy
    }

    /// Merge `incoming` into `existing`, producing a new log.
    ///
    /// `existing` is never mutated; the caller swaps in the returned log.
    pub fn reconcile(&self, existing: &CanonicalLog, mut incoming: Vec<VitalRecord>) -> Reconciliation {
        let mut stats = MergeStats::default();
        let mut merged: BTreeMap<u64, VitalRecord> =
            existing.iter().map(|r| (r.seq_no, r.clone())).collect();
        let mut last_seen = existing
            .last_seq()
            .unwrap_or_else(|| self.origin.saturating_sub(1));

        // Live copies sort ahead of recovered copies of the same seq_no
        incoming.sort_by_key(|r| (r.seq_no, r.missed_live));

        for mut record in incoming {
            if let Some(held) = merged.get_mut(&record.seq_no) {
                if self.placeholder_policy == PlaceholderPolicy::Upgrade
                    && held.is_placeholder()
                    && !record.is_placeholder()
                {
                    record.missed_live = true;
                    *held = record;
                    stats.upgraded += 1;
                } else {
                    stats.duplicates += 1;
                }
                continue;
            }

            let expected = last_seen.saturating_add(1);
            if record.seq_no > expected {
                let missing = record.seq_no - expected;
                if missing > self.max_gap_fill {
                    warn!(
                        seq_no = record.seq_no,
                        last_seen,
                        missing,
                        "Dropping record: gap exceeds placeholder ceiling"
                    );
                    stats.implausible += 1;
                    continue;
                }

                for gap_seq in expected..record.seq_no {
                    merged.entry(gap_seq).or_insert_with(|| {
                        stats.placeholders += 1;
                        VitalRecord::placeholder(gap_seq, &record.patient_id)
                    });
                }
                record.missed_live = true;
            } else if record.seq_no < last_seen {
                let next_held = merged
                    .range(record.seq_no + 1..)
                    .next()
                    .map(|(seq, _)| *seq)
                    .unwrap_or(record.seq_no + 1);
                if next_held - record.seq_no - 1 > self.max_gap_fill {
                    warn!(
                        seq_no = record.seq_no,
                        next_held,
                        "Dropping backfilled record: hole exceeds placeholder ceiling"
                    );
                    stats.implausible += 1;
                    continue;
                }
                record.missed_live = true;
                stats.backfilled += 1;
            }

            last_seen = last_seen.max(record.seq_no);
            stats.accepted += 1;
            merged.insert(record.seq_no, record);
        }

        stats.placeholders += fill_interior_holes(&mut merged);

        if stats.placeholders > 0 || stats.upgraded > 0 {
            debug!(
                placeholders = stats.placeholders,
                upgraded = stats.upgraded,
                duplicates = stats.duplicates,
                "Reconciled batch with sequence gaps"
            );
        }

        Reconciliation {
            log: CanonicalLog::from_sorted(merged.into_values().collect()),
            stats,
        }
    }
}

/// Merge with the default policy.
pub fn reconcile(existing: &CanonicalLog, incoming: Vec<VitalRecord>) -> CanonicalLog {
    Reconciler::default().reconcile(existing, incoming).log
}

/// Fill holes below the previous floor left by backfilled records. Each
/// placeholder borrows the patient id of the next genuine neighbour above it.
fn fill_interior_holes(merged: &mut BTreeMap<u64, VitalRecord>) -> u64 {
    let mut holes: Vec<(u64, String)> = Vec::new();
    let mut prev: Option<u64> = None;

    for (&seq, record) in merged.iter() {
        if let Some(p) = prev {
            for gap_seq in p + 1..seq {
                holes.push((gap_seq, record.patient_id.clone()));
            }
        }
        prev = Some(seq);
    }

    let filled = holes.len() as u64;
    for (gap_seq, patient_id) in holes {
        merged.insert(gap_seq, VitalRecord::placeholder(gap_seq, &patient_id));
    }
    filled
}
