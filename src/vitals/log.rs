//! Canonical merged log
//!
//! Strictly ascending by `seq_no`, no duplicates, no holes between the first
//! and last entry. Only the reconciler builds non-empty logs.

use serde::{Serialize, Serializer};

use crate::models::VitalRecord;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalLog {
    records: Vec<VitalRecord>,
}

impl CanonicalLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callers guarantee ascending, unique, hole-free input.
    pub(crate) fn from_sorted(records: Vec<VitalRecord>) -> Self {
        debug_assert!(records.windows(2).all(|w| w[1].seq_no == w[0].seq_no + 1));
        Self { records }
    }

    pub fn records(&self) -> &[VitalRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VitalRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_seq(&self) -> Option<u64> {
        self.records.first().map(|r| r.seq_no)
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.records.last().map(|r| r.seq_no)
    }

    pub fn get(&self, seq_no: u64) -> Option<&VitalRecord> {
        self.records
            .binary_search_by_key(&seq_no, |r| r.seq_no)
            .ok()
            .map(|idx| &self.records[idx])
    }

    pub fn contains(&self, seq_no: u64) -> bool {
        self.get(seq_no).is_some()
    }

    pub fn placeholder_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_placeholder()).count()
    }

    /// Newest `n` records, for bounded display windows.
    pub fn tail(&self, n: usize) -> &[VitalRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    pub fn seq_nos(&self) -> impl Iterator<Item = u64> + '_ {
        self.records.iter().map(|r| r.seq_no)
    }

    pub fn into_records(self) -> Vec<VitalRecord> {
        self.records
    }
}

impl<'a> IntoIterator for &'a CanonicalLog {
    type Item = &'a VitalRecord;
    type IntoIter = std::slice::Iter<'a, VitalRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

impl Serialize for CanonicalLog {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.records.serialize(serializer)
    }
}
