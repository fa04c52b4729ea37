// Pane Metadata
//
// Every emission for a (key, window) carries its position in the firing
// sequence and its timing relative to the watermark passing end-of-window.

use crate::time::Timestamp;
use crate::windowing::BoundedWindow;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timing of a pane relative to the end of its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaneTiming {
    /// Fired before the watermark reached the end of the window.
    Early,

    /// The first firing at or after the watermark passed the end of the
    /// window, with no prior late firings.
    OnTime,

    /// Any firing after an on-time pane.
    Late,
}

impl fmt::Display for PaneTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaneTiming::Early => write!(f, "EARLY"),
            PaneTiming::OnTime => write!(f, "ON_TIME"),
            PaneTiming::Late => write!(f, "LATE"),
        }
    }
}

/// Position and timing metadata for one pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaneInfo {
    /// True for the window's first firing.
    pub is_first: bool,

    /// True when the window will fire no more.
    pub is_last: bool,

    pub timing: PaneTiming,

    /// Firings so far, zero-based.
    pub index: u64,

    /// Non-speculative (on-time or late) firings so far, zero-based; -1 for
    /// an early pane.
    pub non_speculative_index: i64,
}

/// Timing of the next pane given the watermark and the previous pane.
pub fn timing_for(
    watermark: Timestamp,
    window: &BoundedWindow,
    previous: Option<&PaneInfo>,
) -> PaneTiming {
    if watermark < window.end {
        return PaneTiming::Early;
    }
    match previous {
        // Only speculative panes so far, so this is the on-time firing.
        None => PaneTiming::OnTime,
        Some(prev) if prev.timing == PaneTiming::Early => PaneTiming::OnTime,
        Some(_) => PaneTiming::Late,
    }
}

/// The pane following `previous` with the given timing.
pub fn next_pane(previous: Option<PaneInfo>, timing: PaneTiming, is_last: bool) -> PaneInfo {
    match previous {
        None => PaneInfo {
            is_first: true,
            is_last,
            timing,
            index: 0,
            non_speculative_index: if timing == PaneTiming::Early { -1 } else { 0 },
        },
        Some(prev) => PaneInfo {
            is_first: false,
            is_last,
            timing,
            index: prev.index + 1,
            non_speculative_index: if timing == PaneTiming::Early {
                -1
            } else {
                prev.non_speculative_index.max(-1) + 1
            },
        },
    }
}
