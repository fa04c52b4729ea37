// Trigger Tree
//
// Triggers are an immutable sum-type tree shared across all keys and
// windows. Per-(key, window) execution state lives in a finished-bits bitmap
// indexed by the tree's depth-first ordering plus a handful of per-node
// state cells; the executor in `executor` drives the protocol.

use crate::error::{Result, StreamError};
use crate::state::tags;
use crate::time::Timestamp;
use crate::windowing::BoundedWindow;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub mod executor;

pub use executor::{MergeSource, TriggerContext, TriggerExecutor};

/// Outcome of one scripted trigger evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Nothing to do.
    Continue,

    /// Fire and stay available for later panes.
    Fire,

    /// Fire and mark the node finished.
    FireAndFinish,

    /// Mark the node finished without firing.
    Finish,
}

/// Decision queue feeding a scripted trigger leaf. Used by the trigger
/// tester to drive composites through prescribed outcomes.
#[derive(Clone, Default)]
pub struct ScriptHandle {
    id: usize,
    decisions: Arc<Mutex<VecDeque<TriggerDecision>>>,
}

impl ScriptHandle {
    /// Queue the decision the leaf reports for its next observed event.
    pub fn enqueue(&self, decision: TriggerDecision) {
        self.decisions.lock().push_back(decision);
    }

    pub(crate) fn pop(&self) -> Option<TriggerDecision> {
        self.decisions.lock().pop_front()
    }
}

impl fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptHandle({})", self.id)
    }
}

impl PartialEq for ScriptHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// When a pane may be emitted for a (key, window).
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Fire once when the input watermark reaches the end of the window.
    /// This is the default trigger.
    Default,

    /// Same condition as `Default`, stated explicitly.
    AfterEndOfWindow,

    /// Fire once the watermark passes the timestamp of the first element in
    /// the current pane plus `delay`.
    AfterFirstElementEventTime { delay: Duration },

    /// Fire once processing time passes the first element's processing time
    /// plus `delay`.
    AfterFirstElementProcessingTime { delay: Duration },

    /// Fire once synchronized processing time passes the first element's
    /// synchronized time.
    AfterSynchronizedProcessingTime,

    /// Fire once the pane holds at least `at_least` elements.
    AfterCount { at_least: u64 },

    /// Fire every time the subtrigger fires; never finishes.
    Repeatedly { repeated: Box<Trigger> },

    /// Fire on `main`; finish (additionally firing) when `until` fires.
    OrFinally { main: Box<Trigger>, until: Box<Trigger> },

    /// Fire each time the current subtrigger in sequence fires, advancing on
    /// subtrigger finish; finishes after the last one.
    AfterEach { subtriggers: Vec<Trigger> },

    /// Fire and finish when any subtrigger fires.
    AfterFirst { subtriggers: Vec<Trigger> },

    /// Fire and finish once all subtriggers have fired.
    AfterAll { subtriggers: Vec<Trigger> },

    /// Test-only leaf reporting queued decisions.
    Scripted { script: ScriptHandle },
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::Default
    }
}

impl Trigger {
    pub fn after_end_of_window() -> Trigger {
        Trigger::AfterEndOfWindow
    }

    pub fn after_count(at_least: u64) -> Trigger {
        Trigger::AfterCount { at_least }
    }

    pub fn repeatedly(repeated: Trigger) -> Trigger {
        Trigger::Repeatedly { repeated: Box::new(repeated) }
    }

    /// Wrap this trigger so that it finishes when `until` fires.
    pub fn or_finally(self, until: Trigger) -> Trigger {
        Trigger::OrFinally { main: Box::new(self), until: Box::new(until) }
    }

    pub fn after_each(subtriggers: Vec<Trigger>) -> Trigger {
        Trigger::AfterEach { subtriggers }
    }

    pub fn after_first(subtriggers: Vec<Trigger>) -> Trigger {
        Trigger::AfterFirst { subtriggers }
    }

    pub fn after_all(subtriggers: Vec<Trigger>) -> Trigger {
        Trigger::AfterAll { subtriggers }
    }

    /// A scripted leaf plus the handle its decisions are queued through.
    pub fn scripted(id: usize) -> (Trigger, ScriptHandle) {
        let handle = ScriptHandle { id, decisions: Arc::new(Mutex::new(VecDeque::new())) };
        (Trigger::Scripted { script: handle.clone() }, handle)
    }

    pub fn children(&self) -> Vec<&Trigger> {
        match self {
            Trigger::Repeatedly { repeated } => vec![repeated],
            Trigger::OrFinally { main, until } => vec![main, until],
            Trigger::AfterEach { subtriggers }
            | Trigger::AfterFirst { subtriggers }
            | Trigger::AfterAll { subtriggers } => subtriggers.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Nodes in this subtree, counting the node itself.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(|c| c.node_count()).sum::<usize>()
    }

    /// Whether the semantic contract is to fire at most once.
    pub fn is_once(&self) -> bool {
        match self {
            Trigger::Default
            | Trigger::AfterEndOfWindow
            | Trigger::AfterFirstElementEventTime { .. }
            | Trigger::AfterFirstElementProcessingTime { .. }
            | Trigger::AfterSynchronizedProcessingTime
            | Trigger::AfterCount { .. } => true,
            Trigger::Repeatedly { .. }
            | Trigger::OrFinally { .. }
            | Trigger::AfterEach { .. }
            | Trigger::Scripted { .. } => false,
            Trigger::AfterFirst { subtriggers } | Trigger::AfterAll { subtriggers } => {
                subtriggers.iter().all(|t| t.is_once())
            }
        }
    }

    /// The trigger a downstream grouping uses to preserve this trigger's
    /// timing intent. The continuation of a once trigger is itself once.
    pub fn continuation(&self) -> Trigger {
        match self {
            Trigger::Default => Trigger::Default,
            Trigger::AfterEndOfWindow => Trigger::AfterEndOfWindow,
            Trigger::AfterFirstElementEventTime { delay } => {
                Trigger::AfterFirstElementEventTime { delay: *delay }
            }
            // Downstream, the upstream processing-time delay has already been
            // spent; synchronized time keeps the panes aligned.
            Trigger::AfterFirstElementProcessingTime { .. } => {
                Trigger::AfterSynchronizedProcessingTime
            }
            Trigger::AfterSynchronizedProcessingTime => Trigger::AfterSynchronizedProcessingTime,
            Trigger::AfterCount { .. } => Trigger::AfterCount { at_least: 1 },
            Trigger::Repeatedly { repeated } => Trigger::repeatedly(repeated.continuation()),
            Trigger::OrFinally { main, until } => {
                main.continuation().or_finally(until.continuation())
            }
            Trigger::AfterEach { subtriggers } => {
                Trigger::after_each(subtriggers.iter().map(|t| t.continuation()).collect())
            }
            Trigger::AfterFirst { subtriggers } => {
                Trigger::after_first(subtriggers.iter().map(|t| t.continuation()).collect())
            }
            Trigger::AfterAll { subtriggers } => {
                Trigger::after_all(subtriggers.iter().map(|t| t.continuation()).collect())
            }
            Trigger::Scripted { .. } => Trigger::Default,
        }
    }

    /// The minimum watermark at which this trigger is guaranteed to have
    /// fired at least once for the window. Element- and processing-time
    /// conditions carry no watermark guarantee.
    pub fn watermark_that_guarantees_firing(&self, window: &BoundedWindow) -> Timestamp {
        match self {
            Trigger::Default | Trigger::AfterEndOfWindow => window.end,
            Trigger::AfterFirstElementEventTime { .. }
            | Trigger::AfterFirstElementProcessingTime { .. }
            | Trigger::AfterSynchronizedProcessingTime
            | Trigger::AfterCount { .. }
            | Trigger::Scripted { .. } => Timestamp::MAX,
            Trigger::Repeatedly { repeated } => repeated.watermark_that_guarantees_firing(window),
            Trigger::OrFinally { main, until } => main
                .watermark_that_guarantees_firing(window)
                .min(until.watermark_that_guarantees_firing(window)),
            Trigger::AfterEach { subtriggers } => subtriggers
                .first()
                .map(|t| t.watermark_that_guarantees_firing(window))
                .unwrap_or(Timestamp::MAX),
            Trigger::AfterFirst { subtriggers } => subtriggers
                .iter()
                .map(|t| t.watermark_that_guarantees_firing(window))
                .min()
                .unwrap_or(Timestamp::MAX),
            Trigger::AfterAll { subtriggers } => subtriggers
                .iter()
                .map(|t| t.watermark_that_guarantees_firing(window))
                .max()
                .unwrap_or(Timestamp::MAX),
        }
    }

    /// State tags this node reads during evaluation, declared so the
    /// executor can prefetch them in one batch.
    pub fn state_tags(&self) -> &'static [&'static str] {
        match self {
            Trigger::AfterFirstElementEventTime { .. }
            | Trigger::AfterFirstElementProcessingTime { .. }
            | Trigger::AfterSynchronizedProcessingTime => &[tags::TARGET],
            Trigger::AfterCount { .. } => &[tags::COUNT],
            Trigger::Scripted { .. } => &[tags::LATCH],
            _ => &[],
        }
    }

    /// Whether the node's merge behaviour is defined for merging window
    /// shapes. Synchronized-time targets taken in different source windows
    /// are not comparable, so the pairing is rejected at configuration time.
    pub fn supports_merging(&self) -> bool {
        match self {
            Trigger::AfterSynchronizedProcessingTime => false,
            _ => self.children().iter().all(|c| c.supports_merging()),
        }
    }

    /// Structural validation, run at configuration time.
    pub fn validate(&self) -> Result<()> {
        match self {
            Trigger::AfterCount { at_least } if *at_least == 0 => {
                return Err(StreamError::Configuration(
                    "element count trigger requires a threshold of at least 1".to_string(),
                ));
            }
            Trigger::AfterEach { subtriggers }
            | Trigger::AfterFirst { subtriggers }
            | Trigger::AfterAll { subtriggers }
                if subtriggers.is_empty() =>
            {
                return Err(StreamError::Configuration(format!(
                    "composite trigger {} requires at least one subtrigger",
                    self
                )));
            }
            _ => {}
        }
        for child in self.children() {
            child.validate()?;
        }
        Ok(())
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, name: &str, children: &[Trigger]) -> fmt::Result {
            write!(f, "{}(", name)?;
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", child)?;
            }
            write!(f, ")")
        }

        match self {
            Trigger::Default => write!(f, "Default"),
            Trigger::AfterEndOfWindow => write!(f, "AfterEndOfWindow"),
            Trigger::AfterFirstElementEventTime { delay } => {
                write!(f, "AfterFirstElementEventTime({:?})", delay)
            }
            Trigger::AfterFirstElementProcessingTime { delay } => {
                write!(f, "AfterFirstElementProcessingTime({:?})", delay)
            }
            Trigger::AfterSynchronizedProcessingTime => {
                write!(f, "AfterSynchronizedProcessingTime")
            }
            Trigger::AfterCount { at_least } => write!(f, "AfterCount({})", at_least),
            Trigger::Repeatedly { repeated } => write!(f, "Repeatedly({})", repeated),
            Trigger::OrFinally { main, until } => {
                write!(f, "OrFinally({}, {})", main, until)
            }
            Trigger::AfterEach { subtriggers } => list(f, "AfterEach", subtriggers),
            Trigger::AfterFirst { subtriggers } => list(f, "AfterFirst", subtriggers),
            Trigger::AfterAll { subtriggers } => list(f, "AfterAll", subtriggers),
            Trigger::Scripted { script } => write!(f, "Scripted({})", script.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(start: i64, end: i64) -> BoundedWindow {
        BoundedWindow::new(Timestamp::from_millis(start), Timestamp::from_millis(end))
    }

    #[test]
    fn test_node_count_is_dfs_size() {
        let trigger = Trigger::repeatedly(Trigger::after_first(vec![
            Trigger::after_count(3),
            Trigger::AfterEndOfWindow,
        ]));
        assert_eq!(trigger.node_count(), 4);
    }

    #[test]
    fn test_once_classification() {
        assert!(Trigger::AfterEndOfWindow.is_once());
        assert!(Trigger::after_count(5).is_once());
        assert!(!Trigger::repeatedly(Trigger::after_count(5)).is_once());

        assert!(Trigger::after_all(vec![Trigger::after_count(1), Trigger::AfterEndOfWindow]).is_once());
        assert!(!Trigger::after_first(vec![
            Trigger::after_count(1),
            Trigger::repeatedly(Trigger::after_count(1)),
        ])
        .is_once());
    }

    #[test]
    fn test_continuation_composition() {
        assert_eq!(Trigger::after_count(10).continuation(), Trigger::after_count(1));
        assert_eq!(Trigger::AfterEndOfWindow.continuation(), Trigger::AfterEndOfWindow);
        assert_eq!(
            Trigger::AfterFirstElementProcessingTime { delay: Duration::from_secs(1) }
                .continuation(),
            Trigger::AfterSynchronizedProcessingTime
        );

        let repeated = Trigger::repeatedly(Trigger::after_count(10));
        assert_eq!(repeated.continuation(), Trigger::repeatedly(Trigger::after_count(1)));
    }

    #[test]
    fn test_continuation_is_fixed_point() {
        let triggers = vec![
            Trigger::Default,
            Trigger::after_count(7),
            Trigger::AfterFirstElementProcessingTime { delay: Duration::from_secs(2) },
            Trigger::repeatedly(Trigger::after_count(3)).or_finally(Trigger::AfterEndOfWindow),
            Trigger::after_all(vec![Trigger::after_count(2), Trigger::AfterEndOfWindow]),
        ];
        for trigger in triggers {
            let once = trigger.continuation();
            assert_eq!(once.continuation(), once, "continuation of {} not fixed", trigger);
        }
    }

    #[test]
    fn test_continuation_of_once_is_once() {
        let trigger = Trigger::after_all(vec![Trigger::after_count(4), Trigger::AfterEndOfWindow]);
        assert!(trigger.is_once());
        assert!(trigger.continuation().is_once());
    }

    #[test]
    fn test_watermark_guarantee_composition() {
        let window = w(0, 10);
        let end = Timestamp::from_millis(10);

        assert_eq!(Trigger::AfterEndOfWindow.watermark_that_guarantees_firing(&window), end);
        assert_eq!(
            Trigger::after_count(2).watermark_that_guarantees_firing(&window),
            Timestamp::MAX
        );
        assert_eq!(
            Trigger::after_first(vec![Trigger::after_count(2), Trigger::AfterEndOfWindow])
                .watermark_that_guarantees_firing(&window),
            end
        );
        assert_eq!(
            Trigger::after_all(vec![Trigger::after_count(2), Trigger::AfterEndOfWindow])
                .watermark_that_guarantees_firing(&window),
            Timestamp::MAX
        );
        assert_eq!(
            Trigger::repeatedly(Trigger::AfterEndOfWindow)
                .watermark_that_guarantees_firing(&window),
            end
        );
    }

    #[test]
    fn test_validation() {
        assert!(Trigger::after_count(0).validate().is_err());
        assert!(Trigger::after_all(vec![]).validate().is_err());
        assert!(Trigger::repeatedly(Trigger::after_first(vec![])).validate().is_err());
        assert!(Trigger::repeatedly(Trigger::after_count(2)).validate().is_ok());
    }

    #[test]
    fn test_merging_support() {
        assert!(Trigger::AfterEndOfWindow.supports_merging());
        assert!(!Trigger::AfterSynchronizedProcessingTime.supports_merging());
        assert!(!Trigger::repeatedly(Trigger::AfterSynchronizedProcessingTime).supports_merging());
    }

    #[test]
    fn test_scripted_queue() {
        let (trigger, handle) = Trigger::scripted(1);
        handle.enqueue(TriggerDecision::Continue);
        handle.enqueue(TriggerDecision::FireAndFinish);
        assert_eq!(handle.pop(), Some(TriggerDecision::Continue));
        assert_eq!(handle.pop(), Some(TriggerDecision::FireAndFinish));
        assert_eq!(handle.pop(), None);
        assert!(!trigger.is_once());
    }
}
