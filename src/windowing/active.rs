// Active Window Set
//
// Per-key bookkeeping for merging window shapes: which windows are currently
// active, and for each active window the source windows whose state
// namespaces may still hold its data. Reads union over the sources until the
// next persist compacts them into the representative.

use super::BoundedWindow;
use crate::error::{Result, StreamError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A proposed coalescing of overlapping active windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeProposal {
    /// Windows to merge, ordered by start.
    pub to_merge: Vec<BoundedWindow>,

    /// The window covering all of `to_merge`.
    pub result: BoundedWindow,
}

/// The set of active windows for one key.
///
/// Invariant: after merging, no two active windows overlap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActiveWindowSet {
    active: BTreeMap<BoundedWindow, Vec<BoundedWindow>>,
}

impl ActiveWindowSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a window as active. A window already present keeps its
    /// existing state addresses.
    pub fn add_window(&mut self, window: BoundedWindow) {
        self.active.entry(window).or_insert_with(|| vec![window]);
    }

    /// Compute the minimal merge: active windows sorted by start, adjacent
    /// overlapping runs coalesced into their span. Idempotent; an already
    /// merged set yields no proposals.
    pub fn merge_proposals(&self) -> Vec<MergeProposal> {
        let mut proposals = Vec::new();
        let mut run: Vec<BoundedWindow> = Vec::new();
        let mut span: Option<BoundedWindow> = None;

        for window in self.active.keys() {
            match span {
                Some(current) if window.start < current.end => {
                    run.push(*window);
                    span = Some(current.span(window));
                }
                _ => {
                    if run.len() > 1 {
                        proposals.push(MergeProposal {
                            to_merge: std::mem::take(&mut run),
                            result: span.expect("span tracks a non-empty run"),
                        });
                    }
                    run.clear();
                    run.push(*window);
                    span = Some(*window);
                }
            }
        }
        if run.len() > 1 {
            proposals.push(MergeProposal {
                to_merge: run,
                result: span.expect("span tracks a non-empty run"),
            });
        }

        proposals
    }

    /// Apply a merge: the sources leave the active set and the result window
    /// inherits the union of their state addresses.
    pub fn record_merge(&mut self, proposal: &MergeProposal) {
        let mut addresses = Vec::new();
        for source in &proposal.to_merge {
            if let Some(mut addrs) = self.active.remove(source) {
                addresses.append(&mut addrs);
            }
        }
        if !addresses.contains(&proposal.result) {
            addresses.push(proposal.result);
        }
        addresses.sort();
        addresses.dedup();
        self.active.insert(proposal.result, addresses);
    }

    /// The active window covering `window`, if any.
    pub fn representative(&self, window: &BoundedWindow) -> Option<BoundedWindow> {
        self.active
            .keys()
            .find(|active| active.start <= window.start && window.end <= active.end)
            .copied()
    }

    /// Source windows whose namespaces may hold state for `window`.
    pub fn state_addresses(&self, window: &BoundedWindow) -> Vec<BoundedWindow> {
        self.active.get(window).cloned().unwrap_or_else(|| vec![*window])
    }

    /// Collapse a window's state addresses to itself after its sources have
    /// been physically merged.
    pub fn compact(&mut self, window: &BoundedWindow) {
        if let Some(addrs) = self.active.get_mut(window) {
            *addrs = vec![*window];
        }
    }

    pub fn remove(&mut self, window: &BoundedWindow) {
        self.active.remove(window);
    }

    pub fn windows(&self) -> impl Iterator<Item = &BoundedWindow> {
        self.active.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }
}

/// Probe the merge computation with a synthetic overlapping set; a
/// non-convex or non-idempotent result is a programming error surfaced at
/// configuration time.
pub(crate) fn self_check_merging() -> Result<()> {
    use crate::time::Timestamp;

    let mut set = ActiveWindowSet::new();
    let a = BoundedWindow::new(Timestamp::from_millis(0), Timestamp::from_millis(10));
    let b = BoundedWindow::new(Timestamp::from_millis(5), Timestamp::from_millis(15));
    let c = BoundedWindow::new(Timestamp::from_millis(20), Timestamp::from_millis(30));
    set.add_window(a);
    set.add_window(b);
    set.add_window(c);

    let proposals = set.merge_proposals();
    if proposals.len() != 1
        || proposals[0].to_merge != vec![a, b]
        || proposals[0].result != a.span(&b)
    {
        return Err(StreamError::Configuration(format!(
            "window merge self-check produced a non-convex result: {:?}",
            proposals
        )));
    }

    set.record_merge(&proposals[0]);
    if !set.merge_proposals().is_empty() {
        return Err(StreamError::Configuration(
            "window merge self-check is not idempotent".to_string(),
        ));
    }

    Ok(())
}
