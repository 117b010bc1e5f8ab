//! Bounded FIFO of closed bars for one stream
//!
//! Bars are kept in ascending timestamp order, one per timestamp. A closed
//! bar is final: a second close for the same timestamp is ignored. Pushing
//! the (N+1)th bar evicts the oldest one.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use types::bar::Bar;

/// Result of pushing a closed bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Appended at the tail, possibly evicting the oldest bar.
    Appended { evicted: Option<Bar> },
    /// A closed bar with the same timestamp is already present; ignored.
    Duplicate,
    /// Older than the newest bar in the window; ignored.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollingWindow {
    bars: VecDeque<Bar>,
}

impl RollingWindow {
    pub fn new() -> Self {
        Self {
            bars: VecDeque::new(),
        }
    }

    /// Build a window from loader output.
    ///
    /// Open bars are dropped, bars are ordered by timestamp, duplicates keep
    /// the first occurrence and only the newest `capacity` bars survive.
    pub fn from_history(history: Vec<Bar>, capacity: usize) -> Self {
        let mut closed: Vec<Bar> = history.into_iter().filter(|bar| bar.closed).collect();
        closed.sort_by_key(|bar| bar.timestamp);

        let mut bars: VecDeque<Bar> = VecDeque::with_capacity(closed.len().min(capacity));
        for bar in closed {
            if !bars.back().is_some_and(|last| last.same_period(&bar)) {
                bars.push_back(bar);
            }
        }
        while bars.len() > capacity {
            bars.pop_front();
        }
        Self { bars }
    }

    /// Push a closed bar, evicting from the front past `capacity`.
    pub fn push_closed(&mut self, bar: Bar, capacity: usize) -> PushOutcome {
        if let Some(last) = self.newest() {
            if last.same_period(&bar) {
                return PushOutcome::Duplicate;
            }
            if bar.timestamp < last.timestamp {
                return PushOutcome::Stale;
            }
        }

        self.bars.push_back(bar);
        let mut evicted = None;
        while self.bars.len() > capacity {
            evicted = self.bars.pop_front();
        }
        PushOutcome::Appended { evicted }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn newest(&self) -> Option<&Bar> {
        self.bars.back()
    }

    pub fn into_bars(self) -> Vec<Bar> {
        self.bars.into()
    }
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    fn bar(ts: i64, closed: bool) -> Bar {
        Bar::new(ts, Decimal::ONE, Decimal::TWO, Decimal::ONE, Decimal::TWO, Decimal::TEN, closed)
    }

    #[test]
    fn test_evicts_exactly_on_overflow() {
        let mut window = RollingWindow::new();
        for ts in 0..3 {
            assert_eq!(window.push_closed(bar(ts, true), 3), PushOutcome::Appended { evicted: None });
        }
        assert_eq!(window.len(), 3);

        let outcome = window.push_closed(bar(3, true), 3);
        assert_eq!(outcome, PushOutcome::Appended { evicted: Some(bar(0, true)) });
        assert_eq!(window.len(), 3);
        assert_eq!(window.newest().unwrap().timestamp, 3);
        let stamps: Vec<i64> = window.into_bars().iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![1, 2, 3]);
    }

    #[test]
    fn test_second_close_for_timestamp_is_ignored() {
        let mut window = RollingWindow::new();
        let first = bar(10, true);
        window.push_closed(first.clone(), 5);

        let mut revised = bar(10, true);
        revised.close = Decimal::from(7);
        assert_eq!(window.push_closed(revised, 5), PushOutcome::Duplicate);
        assert_eq!(window.len(), 1);
        assert_eq!(window.newest(), Some(&first));
    }

    #[test]
    fn test_from_history_keeps_first_duplicate() {
        let mut revised = bar(2, true);
        revised.close = Decimal::from(9);
        let window = RollingWindow::from_history(vec![bar(1, true), bar(2, true), revised], 5);
        let bars = window.into_bars();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[1], bar(2, true));
    }

    #[test]
    fn test_stale_bar_ignored() {
        let mut window = RollingWindow::new();
        window.push_closed(bar(10, true), 5);
        assert_eq!(window.push_closed(bar(5, true), 5), PushOutcome::Stale);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_from_history_filters_sorts_and_trims() {
        let history = vec![bar(3, true), bar(1, true), bar(2, true), bar(4, false), bar(2, true)];
        let window = RollingWindow::from_history(history, 2);
        let stamps: Vec<i64> = window.into_bars().iter().map(|b| b.timestamp).collect();
        assert_eq!(stamps, vec![2, 3]);
    }

    #[test]
    fn test_serializes_as_plain_array() {
        let mut window = RollingWindow::new();
        window.push_closed(bar(1, true), 5);
        let json = serde_json::to_value(&window).unwrap();
        assert!(json.is_array());
        let back: RollingWindow = serde_json::from_value(json).unwrap();
        assert_eq!(back, window);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity(capacity in 1usize..50, count in 0usize..200) {
            let mut window = RollingWindow::new();
            for ts in 0..count {
                window.push_closed(bar(ts as i64, true), capacity);
                prop_assert!(window.len() <= capacity);
            }
            prop_assert_eq!(window.len(), count.min(capacity));
        }

        #[test]
        fn prop_eviction_happens_only_past_capacity(capacity in 1usize..30) {
            let mut window = RollingWindow::new();
            for ts in 0..capacity {
                let outcome = window.push_closed(bar(ts as i64, true), capacity);
                prop_assert_eq!(outcome, PushOutcome::Appended { evicted: None });
            }
            let outcome = window.push_closed(bar(capacity as i64, true), capacity);
            prop_assert_eq!(outcome, PushOutcome::Appended { evicted: Some(bar(0, true)) });
        }
    }
}
