// Watermark Hold
//
// Each open window holds the output watermark at the pane timestamp its
// elements will carry. Late elements must not pin the watermark, so their
// contribution is shifted to the garbage-collection bound.

use crate::error::Result;
use crate::state::{tags, StateBackend, StateNamespace, WatermarkHoldCell};
use crate::time::Timestamp;
use crate::value::StreamKey;
use crate::windowing::BoundedWindow;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy combining per-element timestamps into a pane's output timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputTimeFn {
    /// The earliest contributing timestamp.
    #[default]
    Earliest,

    /// The latest contributing timestamp.
    Latest,

    /// The window's maximum timestamp, independent of contributions.
    EndOfWindow,
}

impl OutputTimeFn {
    /// Per-element representative instant for a window.
    pub fn assign(&self, window: &BoundedWindow, ts: Timestamp) -> Timestamp {
        match self {
            OutputTimeFn::Earliest | OutputTimeFn::Latest => ts,
            OutputTimeFn::EndOfWindow => window.max_timestamp(),
        }
    }

    /// Fold two contributions.
    pub fn combine(&self, a: Timestamp, b: Timestamp) -> Timestamp {
        match self {
            OutputTimeFn::Earliest => a.min(b),
            OutputTimeFn::Latest => a.max(b),
            OutputTimeFn::EndOfWindow => a.max(b),
        }
    }

    /// Fold holds carried over from merged source windows. End-of-window
    /// holds are recomputed for the merged window's own bound.
    pub fn merge(&self, result: &BoundedWindow, holds: &[Timestamp]) -> Option<Timestamp> {
        if holds.is_empty() {
            return None;
        }
        match self {
            OutputTimeFn::Earliest => holds.iter().copied().min(),
            OutputTimeFn::Latest => holds.iter().copied().max(),
            OutputTimeFn::EndOfWindow => Some(result.max_timestamp()),
        }
    }
}

fn hold_cell(window: &BoundedWindow) -> WatermarkHoldCell {
    WatermarkHoldCell::new(StateNamespace::Window(*window), tags::HOLD)
}

/// Record one element's hold contribution. A late element (behind the input
/// watermark) contributes the garbage-collection bound instead of its own
/// timestamp.
pub fn add_element_hold<B: StateBackend + ?Sized>(
    backend: &mut B,
    key: &StreamKey,
    window: &BoundedWindow,
    ts: Timestamp,
    output_time_fn: OutputTimeFn,
    input_watermark: Timestamp,
    allowed_lateness: Duration,
) -> Result<()> {
    let contribution = if ts < input_watermark {
        window.max_timestamp().saturating_add(allowed_lateness)
    } else {
        output_time_fn.assign(window, ts)
    };
    hold_cell(window).add(backend, key, output_time_fn, contribution)
}

/// Fold the holds of merged source windows into the result window, clearing
/// the sources.
pub fn merge_holds<B: StateBackend + ?Sized>(
    backend: &mut B,
    key: &StreamKey,
    sources: &[BoundedWindow],
    result: &BoundedWindow,
    output_time_fn: OutputTimeFn,
) -> Result<()> {
    let mut holds = Vec::new();
    for source in sources {
        let cell = hold_cell(source);
        if let Some(hold) = cell.read(backend, key)? {
            holds.push(hold);
        }
        if source != result {
            cell.clear(backend, key)?;
        }
    }

    match output_time_fn.merge(result, &holds) {
        Some(merged) => {
            hold_cell(result).clear(backend, key)?;
            hold_cell(result).add(backend, key, output_time_fn, merged)
        }
        None => hold_cell(result).clear(backend, key),
    }
}

/// Read and release the window's hold at pane emission. The published pane
/// timestamp defaults to the window's maximum timestamp when the hold is
/// absent or beyond it.
pub fn extract_and_release<B: StateBackend + ?Sized>(
    backend: &mut B,
    key: &StreamKey,
    window: &BoundedWindow,
) -> Result<Timestamp> {
    let cell = hold_cell(window);
    let hold = cell.read(backend, key)?;
    cell.clear(backend, key)?;
    Ok(match hold {
        Some(hold) if hold <= window.max_timestamp() => hold,
        _ => window.max_timestamp(),
    })
}

/// Remove the hold without emitting, used at window teardown.
pub fn clear_hold<B: StateBackend + ?Sized>(
    backend: &mut B,
    key: &StreamKey,
    window: &BoundedWindow,
) -> Result<()> {
    hold_cell(window).clear(backend, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryStateBackend;

    fn w(start: i64, end: i64) -> BoundedWindow {
        BoundedWindow::new(Timestamp::from_millis(start), Timestamp::from_millis(end))
    }

    #[test]
    fn test_earliest_hold() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let window = w(0, 10);

        for ts in [9i64, 1, 5] {
            add_element_hold(
                &mut backend,
                &key,
                &window,
                Timestamp::from_millis(ts),
                OutputTimeFn::Earliest,
                Timestamp::MIN,
                Duration::ZERO,
            )
            .unwrap();
        }
        assert_eq!(
            extract_and_release(&mut backend, &key, &window).unwrap(),
            Timestamp::from_millis(1)
        );
    }

    #[test]
    fn test_latest_hold() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let window = w(0, 10);

        for ts in [1i64, 9, 5] {
            add_element_hold(
                &mut backend,
                &key,
                &window,
                Timestamp::from_millis(ts),
                OutputTimeFn::Latest,
                Timestamp::MIN,
                Duration::ZERO,
            )
            .unwrap();
        }
        assert_eq!(
            extract_and_release(&mut backend, &key, &window).unwrap(),
            Timestamp::from_millis(9)
        );
    }

    #[test]
    fn test_absent_hold_defaults_to_max_timestamp() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let window = w(0, 10);
        assert_eq!(
            extract_and_release(&mut backend, &key, &window).unwrap(),
            Timestamp::from_millis(9)
        );
    }

    #[test]
    fn test_late_element_shifts_to_gc_bound() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let window = w(0, 10);

        // ts=2 is behind the watermark at 8; its contribution becomes
        // max_timestamp + lateness, clamped back to max_timestamp on read.
        add_element_hold(
            &mut backend,
            &key,
            &window,
            Timestamp::from_millis(2),
            OutputTimeFn::Earliest,
            Timestamp::from_millis(8),
            Duration::from_millis(5),
        )
        .unwrap();

        let cell_value = WatermarkHoldCell::new(StateNamespace::Window(window), tags::HOLD)
            .read(&backend, &key)
            .unwrap();
        assert_eq!(cell_value, Some(Timestamp::from_millis(14)));
        assert_eq!(
            extract_and_release(&mut backend, &key, &window).unwrap(),
            Timestamp::from_millis(9)
        );
    }

    #[test]
    fn test_merge_recomputes_end_of_window() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let a = w(1, 11);
        let b = w(9, 19);
        let merged = w(1, 19);

        add_element_hold(
            &mut backend,
            &key,
            &a,
            Timestamp::from_millis(1),
            OutputTimeFn::EndOfWindow,
            Timestamp::MIN,
            Duration::ZERO,
        )
        .unwrap();
        add_element_hold(
            &mut backend,
            &key,
            &b,
            Timestamp::from_millis(9),
            OutputTimeFn::EndOfWindow,
            Timestamp::MIN,
            Duration::ZERO,
        )
        .unwrap();

        merge_holds(&mut backend, &key, &[a, b], &merged, OutputTimeFn::EndOfWindow).unwrap();
        assert_eq!(
            extract_and_release(&mut backend, &key, &merged).unwrap(),
            Timestamp::from_millis(18)
        );
        assert!(clear_hold(&mut backend, &key, &a).is_ok());
    }

    #[test]
    fn test_merge_earliest_takes_min() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let a = w(1, 11);
        let b = w(9, 19);
        let merged = w(1, 19);

        for (window, ts) in [(a, 4i64), (b, 9)] {
            add_element_hold(
                &mut backend,
                &key,
                &window,
                Timestamp::from_millis(ts),
                OutputTimeFn::Earliest,
                Timestamp::MIN,
                Duration::ZERO,
            )
            .unwrap();
        }

        merge_holds(&mut backend, &key, &[a, b], &merged, OutputTimeFn::Earliest).unwrap();
        assert_eq!(
            extract_and_release(&mut backend, &key, &merged).unwrap(),
            Timestamp::from_millis(4)
        );
    }
}
