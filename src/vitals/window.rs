//! Poll windows and window-local gap detection

use std::collections::BTreeSet;

use serde::Serialize;

/// Inclusive `seq_no` range requested from the remote log in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PollWindow {
    pub start: u64,
    pub end: u64,
}

impl PollWindow {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// First window of a fresh log: `1..=size`.
    pub fn initial(size: u64) -> Self {
        Self::after(0, size)
    }

    /// Window following `last_seq_no`: `last+1..=last+size`.
    pub fn after(last_seq_no: u64, size: u64) -> Self {
        let start = last_seq_no.saturating_add(1);
        let end = start.saturating_add(size.max(1) - 1);
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, seq_no: u64) -> bool {
        (self.start..=self.end).contains(&seq_no)
    }

    /// Sequence numbers inside this window that the response skipped.
    ///
    /// Only `[start, newest observed]` is checked: anything past the newest
    /// returned row has not been produced yet and is not a loss.
    pub fn missing<I>(&self, observed: I) -> Vec<u64>
    where
        I: IntoIterator<Item = u64>,
    {
        let seen: BTreeSet<u64> = observed
            .into_iter()
            .filter(|seq| self.contains(*seq))
            .collect();

        let Some(&newest) = seen.iter().next_back() else {
            return Vec::new();
        };

        (self.start..=newest)
            .filter(|seq| !seen.contains(seq))
            .collect()
    }

    /// Smallest window covering every sequence number in `seqs`.
    pub fn span(seqs: &[u64]) -> Option<Self> {
        let min = seqs.iter().copied().min()?;
        let max = seqs.iter().copied().max()?;
        Some(Self::new(min, max))
    }
}

impl std::fmt::Display for PollWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..={}]", self.start, self.end)
    }
}
