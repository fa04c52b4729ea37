// Window Assignment
//
// Converts an element timestamp into its set of event-time windows. Fixed and
// sliding windows are pure functions of the timestamp; session windows start
// as a per-element proto window and coalesce in the ActiveWindowSet.

use crate::error::{Result, StreamError};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod active;

pub use active::{ActiveWindowSet, MergeProposal};

/// A half-open event-time interval `[start, end)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BoundedWindow {
    /// Window start (inclusive).
    pub start: Timestamp,

    /// Window end (exclusive).
    pub end: Timestamp,
}

impl BoundedWindow {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// The window covering all of event time.
    pub fn global() -> Self {
        Self {
            start: Timestamp::MIN,
            end: Timestamp::END_OF_GLOBAL_WINDOW.next(),
        }
    }

    /// Latest timestamp the window contains (one tick before `end`).
    pub fn max_timestamp(&self) -> Timestamp {
        self.end.prev()
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// True when the two intervals share at least one tick.
    pub fn intersects(&self, other: &BoundedWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Smallest window covering both intervals.
    pub fn span(&self, other: &BoundedWindow) -> BoundedWindow {
        BoundedWindow {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for BoundedWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Window shape specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WindowFn {
    /// Fixed-size, non-overlapping windows aligned to the epoch.
    Fixed { size: Duration },

    /// Fixed-size windows starting every `period`, overlapping when
    /// `period < size`.
    Sliding { size: Duration, period: Duration },

    /// Per-key session windows separated by at least `gap` of inactivity.
    Sessions { gap: Duration },

    /// A single window covering all of event time.
    Global,
}

impl WindowFn {
    /// Assign a timestamp to its windows. Deterministic and side-effect-free.
    pub fn assign(&self, ts: Timestamp) -> Vec<BoundedWindow> {
        match self {
            WindowFn::Fixed { size } => {
                let size_ms = duration_millis(*size);
                let start = ts.as_millis().div_euclid(size_ms) * size_ms;
                vec![BoundedWindow::new(
                    Timestamp::from_millis(start),
                    Timestamp::from_millis(start + size_ms),
                )]
            }

            WindowFn::Sliding { size, period } => {
                let size_ms = duration_millis(*size);
                let period_ms = duration_millis(*period);
                let last_start = ts.as_millis().div_euclid(period_ms) * period_ms;

                let mut windows = Vec::new();
                let mut start = last_start;
                while start + size_ms > ts.as_millis() {
                    windows.push(BoundedWindow::new(
                        Timestamp::from_millis(start),
                        Timestamp::from_millis(start + size_ms),
                    ));
                    start -= period_ms;
                }
                windows
            }

            WindowFn::Sessions { gap } => {
                vec![BoundedWindow::new(ts, ts.saturating_add(*gap))]
            }

            WindowFn::Global => vec![BoundedWindow::global()],
        }
    }

    /// Whether windows produced by this shape coalesce with each other.
    pub fn is_merging(&self) -> bool {
        matches!(self, WindowFn::Sessions { .. })
    }

    /// Deterministic projection used when reading foreign windowed state: the
    /// window of this shape containing the main window's maximum timestamp.
    /// Merging shapes project onto the global window.
    pub fn side_input_window(&self, main: &BoundedWindow) -> BoundedWindow {
        match self {
            WindowFn::Fixed { .. } => self.assign(main.max_timestamp())[0],
            WindowFn::Sliding { .. } => {
                // Of the overlapping candidates, the one starting last is the
                // tightest window containing the instant.
                let candidates = self.assign(main.max_timestamp());
                candidates
                    .into_iter()
                    .max_by_key(|w| w.start)
                    .unwrap_or_else(BoundedWindow::global)
            }
            WindowFn::Sessions { .. } | WindowFn::Global => BoundedWindow::global(),
        }
    }

    /// Validate parameters and probe the assignment/merge invariants. Run at
    /// configuration time so a malformed shape fails before any data flows.
    pub fn self_check(&self) -> Result<()> {
        match self {
            WindowFn::Fixed { size } => {
                if size.is_zero() {
                    return Err(StreamError::Configuration(
                        "fixed window size must be greater than zero".to_string(),
                    ));
                }
            }
            WindowFn::Sliding { size, period } => {
                if size.is_zero() || period.is_zero() {
                    return Err(StreamError::Configuration(
                        "sliding window size and period must be greater than zero".to_string(),
                    ));
                }
                if period > size {
                    return Err(StreamError::Configuration(format!(
                        "sliding window period {:?} must not exceed size {:?}",
                        period, size
                    )));
                }
            }
            WindowFn::Sessions { gap } => {
                if gap.is_zero() {
                    return Err(StreamError::Configuration(
                        "session gap must be greater than zero".to_string(),
                    ));
                }
            }
            WindowFn::Global => {}
        }

        for probe in [0i64, 1, 999, 1_000_000] {
            let ts = Timestamp::from_millis(probe);
            let first = self.assign(ts);
            let second = self.assign(ts);
            if first != second {
                return Err(StreamError::Configuration(format!(
                    "window fn {:?} is not deterministic at ts={}",
                    self, ts
                )));
            }
            if first.is_empty() {
                return Err(StreamError::Configuration(format!(
                    "window fn {:?} assigned no windows at ts={}",
                    self, ts
                )));
            }
            for w in &first {
                if !w.contains(ts) {
                    return Err(StreamError::Configuration(format!(
                        "window fn {:?} assigned {} which does not contain ts={}",
                        self, w, ts
                    )));
                }
            }
        }

        if self.is_merging() {
            active::self_check_merging()?;
        }

        Ok(())
    }
}

impl fmt::Display for WindowFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowFn::Fixed { size } => write!(f, "Fixed({:?})", size),
            WindowFn::Sliding { size, period } => write!(f, "Sliding({:?}, {:?})", size, period),
            WindowFn::Sessions { gap } => write!(f, "Sessions({:?})", gap),
            WindowFn::Global => write!(f, "Global"),
        }
    }
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_assignment() {
        let window_fn = WindowFn::Fixed { size: Duration::from_millis(10) };

        let windows = window_fn.assign(Timestamp::from_millis(15));
        assert_eq!(
            windows,
            vec![BoundedWindow::new(Timestamp::from_millis(10), Timestamp::from_millis(20))]
        );

        // An element exactly at a boundary belongs to the next window.
        let windows = window_fn.assign(Timestamp::from_millis(10));
        assert_eq!(windows[0].start, Timestamp::from_millis(10));

        let windows = window_fn.assign(Timestamp::from_millis(9));
        assert_eq!(windows[0].end, Timestamp::from_millis(10));
    }

    #[test]
    fn test_fixed_assignment_negative_timestamps() {
        let window_fn = WindowFn::Fixed { size: Duration::from_millis(10) };
        let windows = window_fn.assign(Timestamp::from_millis(-3));
        assert_eq!(
            windows,
            vec![BoundedWindow::new(Timestamp::from_millis(-10), Timestamp::from_millis(0))]
        );
    }

    #[test]
    fn test_sliding_assignment() {
        let window_fn = WindowFn::Sliding {
            size: Duration::from_millis(30),
            period: Duration::from_millis(10),
        };

        let windows = window_fn.assign(Timestamp::from_millis(25));
        assert_eq!(windows.len(), 3);
        for w in &windows {
            assert!(w.contains(Timestamp::from_millis(25)));
        }
        let starts: Vec<i64> = windows.iter().map(|w| w.start.as_millis()).collect();
        assert!(starts.contains(&0));
        assert!(starts.contains(&10));
        assert!(starts.contains(&20));
    }

    #[test]
    fn test_session_assignment() {
        let window_fn = WindowFn::Sessions { gap: Duration::from_millis(10) };
        let windows = window_fn.assign(Timestamp::from_millis(7));
        assert_eq!(
            windows,
            vec![BoundedWindow::new(Timestamp::from_millis(7), Timestamp::from_millis(17))]
        );
    }

    #[test]
    fn test_global_assignment() {
        let windows = WindowFn::Global.assign(Timestamp::from_millis(123));
        assert_eq!(windows, vec![BoundedWindow::global()]);
        assert_eq!(windows[0].max_timestamp(), Timestamp::END_OF_GLOBAL_WINDOW);
    }

    #[test]
    fn test_side_input_window() {
        let main = BoundedWindow::new(Timestamp::from_millis(0), Timestamp::from_millis(25));

        let fixed = WindowFn::Fixed { size: Duration::from_millis(10) };
        assert_eq!(
            fixed.side_input_window(&main),
            BoundedWindow::new(Timestamp::from_millis(20), Timestamp::from_millis(30))
        );

        let sliding = WindowFn::Sliding {
            size: Duration::from_millis(20),
            period: Duration::from_millis(10),
        };
        assert_eq!(sliding.side_input_window(&main).start, Timestamp::from_millis(20));

        let sessions = WindowFn::Sessions { gap: Duration::from_millis(10) };
        assert_eq!(sessions.side_input_window(&main), BoundedWindow::global());
    }

    #[test]
    fn test_self_check_rejects_bad_shapes() {
        assert!(WindowFn::Fixed { size: Duration::ZERO }.self_check().is_err());
        assert!(WindowFn::Sliding {
            size: Duration::from_millis(10),
            period: Duration::from_millis(20),
        }
        .self_check()
        .is_err());
        assert!(WindowFn::Sessions { gap: Duration::ZERO }.self_check().is_err());

        assert!(WindowFn::Fixed { size: Duration::from_millis(10) }.self_check().is_ok());
        assert!(WindowFn::Global.self_check().is_ok());
    }

    #[test]
    fn test_window_span_and_intersects() {
        let a = BoundedWindow::new(Timestamp::from_millis(0), Timestamp::from_millis(10));
        let b = BoundedWindow::new(Timestamp::from_millis(5), Timestamp::from_millis(15));
        let c = BoundedWindow::new(Timestamp::from_millis(10), Timestamp::from_millis(20));

        assert!(a.intersects(&b));
        // Touching intervals do not intersect.
        assert!(!a.intersects(&c));
        assert_eq!(a.span(&b), BoundedWindow::new(Timestamp::from_millis(0), Timestamp::from_millis(15)));
    }
}
