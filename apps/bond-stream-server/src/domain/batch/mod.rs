//! Batch Coalescing Window
//!
//! The batch stage's accumulation state: change notifications collect into
//! an open window, duplicates per bond collapse to the latest value (the
//! first-seen position is kept), and when the window's counter reaches the
//! configured threshold the whole window flushes into one newline-delimited
//! blob for broadcast.
//!
//! # Coalescing modes
//!
//! The primary contract counts *raw* notifications: a window closes after
//! exactly N updates regardless of how many were duplicates, bounding
//! worst-case latency at the cost of variable batch cardinality (1..=N
//! distinct bonds). Counting *distinct* bonds instead is offered as a
//! configuration variant of the same window, not a second algorithm.

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::bond::BondUpdate;

// =============================================================================
// Coalescing Mode
// =============================================================================

/// What the window threshold counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoalescingMode {
    /// Count every notification, duplicates included (bounded latency).
    #[default]
    RawCount,
    /// Count only first-seen bonds (fixed batch cardinality).
    DistinctCount,
}

impl CoalescingMode {
    /// Parse a mode from a config string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "distinct-count" | "distinct" => Self::DistinctCount,
            _ => Self::RawCount,
        }
    }

    /// Get the mode name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RawCount => "raw-count",
            Self::DistinctCount => "distinct-count",
        }
    }
}

// =============================================================================
// Coalescing Window
// =============================================================================

/// A flushed window, ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchMessage {
    /// Newline-delimited serialized states, one line per distinct bond,
    /// in first-seen-within-window order, newest value per bond.
    pub payload: String,
    /// Number of distinct bonds in the batch.
    pub distinct: usize,
    /// Number of raw notifications the window consumed.
    pub raw: usize,
}

/// Accumulates change notifications and flushes them in coalesced batches.
pub struct CoalescingWindow {
    threshold: usize,
    mode: CoalescingMode,
    states: Vec<Arc<str>>,
    position_by_id: HashMap<String, usize>,
    raw_count: usize,
    counted: usize,
}

impl CoalescingWindow {
    /// Create an empty window that flushes when `threshold` is reached.
    ///
    /// A threshold of zero is treated as one: every notification flushes.
    #[must_use]
    pub fn new(threshold: usize, mode: CoalescingMode) -> Self {
        Self {
            threshold: threshold.max(1),
            mode,
            states: Vec::with_capacity(threshold.max(1)),
            position_by_id: HashMap::new(),
            raw_count: 0,
            counted: 0,
        }
    }

    /// Absorb one change notification.
    ///
    /// Returns the flushed batch when this notification closed the window;
    /// the window is then empty and ready for the next one.
    pub fn push(&mut self, update: BondUpdate) -> Option<BatchMessage> {
        match self.position_by_id.get(&update.bond_id).copied() {
            Some(position) => {
                // Seen this window: latest value wins, position unchanged.
                self.states[position] = update.serialized;
            }
            None => {
                self.position_by_id
                    .insert(update.bond_id, self.states.len());
                self.states.push(update.serialized);
                if self.mode == CoalescingMode::DistinctCount {
                    self.counted += 1;
                }
            }
        }

        self.raw_count += 1;
        if self.mode == CoalescingMode::RawCount {
            self.counted += 1;
        }

        (self.counted >= self.threshold).then(|| self.flush())
    }

    /// Number of distinct bonds accumulated in the open window.
    #[must_use]
    pub fn distinct_len(&self) -> usize {
        self.states.len()
    }

    /// Raw notifications absorbed by the open window.
    #[must_use]
    pub const fn raw_count(&self) -> usize {
        self.raw_count
    }

    /// Whether the open window holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Close the window and format its contents for the wire.
    fn flush(&mut self) -> BatchMessage {
        let mut payload =
            String::with_capacity(self.states.iter().map(|s| s.len() + 1).sum());
        for state in &self.states {
            payload.push_str(state);
            payload.push('\n');
        }

        let message = BatchMessage {
            payload,
            distinct: self.states.len(),
            raw: self.raw_count,
        };

        self.states.clear();
        self.position_by_id.clear();
        self.raw_count = 0;
        self.counted = 0;

        message
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn update(id: &str, state: &str) -> BondUpdate {
        BondUpdate {
            bond_id: id.to_string(),
            serialized: state.into(),
        }
    }

    #[test]
    fn flushes_exactly_at_raw_threshold() {
        let mut window = CoalescingWindow::new(3, CoalescingMode::RawCount);

        assert!(window.push(update("A", "a1")).is_none());
        assert!(window.push(update("B", "b1")).is_none());
        let batch = window.push(update("C", "c1")).unwrap();

        assert_eq!(batch.payload, "a1\nb1\nc1\n");
        assert_eq!(batch.distinct, 3);
        assert_eq!(batch.raw, 3);
        assert!(window.is_empty());
    }

    #[test]
    fn duplicates_coalesce_to_latest_in_place() {
        let mut window = CoalescingWindow::new(3, CoalescingMode::RawCount);

        assert!(window.push(update("A", "a1")).is_none());
        assert!(window.push(update("A", "a2")).is_none());
        let batch = window.push(update("B", "b1")).unwrap();

        // A keeps its first-seen position with its latest value.
        assert_eq!(batch.payload, "a2\nb1\n");
        assert_eq!(batch.distinct, 2);
        assert_eq!(batch.raw, 3);
    }

    #[test]
    fn duplicates_count_toward_raw_threshold() {
        let mut window = CoalescingWindow::new(4, CoalescingMode::RawCount);

        for state in ["a1", "a2", "a3"] {
            assert!(window.push(update("A", state)).is_none());
        }
        let batch = window.push(update("A", "a4")).unwrap();

        // Worst case: a batch of one.
        assert_eq!(batch.payload, "a4\n");
        assert_eq!(batch.distinct, 1);
        assert_eq!(batch.raw, 4);
    }

    #[test]
    fn window_resets_between_batches() {
        let mut window = CoalescingWindow::new(2, CoalescingMode::RawCount);

        let first = window.push(update("A", "a1")).is_none()
            && window.push(update("B", "b1")).is_some();
        assert!(first);

        // A's position from the previous window must not leak.
        assert!(window.push(update("A", "a2")).is_none());
        let batch = window.push(update("C", "c1")).unwrap();
        assert_eq!(batch.payload, "a2\nc1\n");
    }

    #[test]
    fn distinct_mode_ignores_duplicates_for_threshold() {
        let mut window = CoalescingWindow::new(2, CoalescingMode::DistinctCount);

        assert!(window.push(update("A", "a1")).is_none());
        assert!(window.push(update("A", "a2")).is_none());
        assert!(window.push(update("A", "a3")).is_none());
        let batch = window.push(update("B", "b1")).unwrap();

        assert_eq!(batch.payload, "a3\nb1\n");
        assert_eq!(batch.distinct, 2);
        assert_eq!(batch.raw, 4);
    }

    #[test]
    fn zero_threshold_flushes_every_update() {
        let mut window = CoalescingWindow::new(0, CoalescingMode::RawCount);
        let batch = window.push(update("A", "a1")).unwrap();
        assert_eq!(batch.payload, "a1\n");
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(
            CoalescingMode::from_str_case_insensitive("raw-count"),
            CoalescingMode::RawCount
        );
        assert_eq!(
            CoalescingMode::from_str_case_insensitive("DISTINCT-COUNT"),
            CoalescingMode::DistinctCount
        );
        assert_eq!(
            CoalescingMode::from_str_case_insensitive("unknown"),
            CoalescingMode::RawCount
        );
    }
}
