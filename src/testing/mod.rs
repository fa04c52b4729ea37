// Trigger Tester
//
// Public harness for end-to-end windowing tests: a single-key engine over
// in-memory state, timers, and sink, with direct control over clocks and
// timer firings, and inspection of the keyed state in use. Scripted trigger
// decisions are queued through the handles returned by `Trigger::scripted`.

use crate::clock::ManualClock;
use crate::engine::{WindowingEngine, WindowingStrategy};
use crate::error::Result;
use crate::metrics::InMemoryCounters;
use crate::reduce::ReduceFn;
use crate::sink::{CollectingSink, SinkHandle, WindowedValue};
use crate::state::InMemoryStateBackend;
use crate::time::{TimeDomain, Timestamp};
use crate::value::{StreamKey, StreamValue};
use crate::windowing::BoundedWindow;
use std::sync::Arc;

/// Drives one key through the windowing core.
pub struct TriggerTester {
    engine: WindowingEngine<InMemoryStateBackend>,
    output: SinkHandle,
    counters: Arc<InMemoryCounters>,
    clock: Arc<ManualClock>,
    key: StreamKey,
}

impl TriggerTester {
    /// A tester over raw (buffering) grouping.
    pub fn new(strategy: WindowingStrategy) -> Result<Self> {
        Self::with_reduce_fn(strategy, ReduceFn::Buffering)
    }

    pub fn with_reduce_fn(strategy: WindowingStrategy, reduce_fn: ReduceFn) -> Result<Self> {
        let sink = CollectingSink::new();
        let output = sink.handle();
        let counters = Arc::new(InMemoryCounters::new());
        let clock = Arc::new(ManualClock::default());
        let engine =
            WindowingEngine::new(strategy, reduce_fn, InMemoryStateBackend::new(), Box::new(sink))?
                .with_counters(counters.clone())
                .with_clock(clock.clone());
        Ok(Self { engine, output, counters, clock, key: StreamKey::new("k") })
    }

    pub fn with_key(mut self, key: impl Into<StreamKey>) -> Self {
        self.key = key.into();
        self
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn process_element(&mut self, value: impl Into<StreamValue>, ts: i64) -> Result<()> {
        let value = value.into();
        let ts = Timestamp::from_millis(ts);
        self.engine.process_element(&self.key, value, ts)
    }

    pub fn advance_input_watermark(&mut self, to: i64) -> Result<()> {
        self.engine.advance_input_watermark(Timestamp::from_millis(to))
    }

    pub fn advance_processing_time(&mut self, to: i64) -> Result<()> {
        self.engine.advance_processing_time(Timestamp::from_millis(to))
    }

    /// Constrain the upstream synchronized clock.
    pub fn set_synchronized_time(&mut self, to: i64) {
        self.clock.set_synchronized(Timestamp::from_millis(to));
    }

    /// Fire one timer directly, bypassing the clock advance.
    pub fn fire_timer(
        &mut self,
        window: BoundedWindow,
        tag: &str,
        ts: i64,
        domain: TimeDomain,
    ) -> Result<()> {
        self.engine.fire_timer(&self.key, &window, tag, Timestamp::from_millis(ts), domain)
    }

    /// Force a merge pass over the active window set.
    pub fn merge_windows(&mut self) -> Result<()> {
        self.engine.merge_active_windows(&self.key)
    }

    pub fn persist(&mut self) -> Result<()> {
        self.engine.persist(&self.key)
    }

    /// Drain the panes emitted so far.
    pub fn extract_output(&mut self) -> Vec<WindowedValue> {
        self.output.take()
    }

    /// Whether the trigger root has finished for the window.
    pub fn is_marked_finished(&self, window: BoundedWindow) -> bool {
        self.engine.is_finished(&self.key, &window).unwrap_or(false)
    }

    pub fn is_window_closed(&self, window: BoundedWindow) -> bool {
        self.engine.is_closed(&self.key, &window).unwrap_or(false)
    }

    /// Namespaces holding state for the key, in storage-key form.
    pub fn state_namespaces_in_use(&self) -> Vec<String> {
        self.engine.backend().namespaces_in_use(&self.key)
    }

    pub fn has_timers_for(&self, window: BoundedWindow) -> bool {
        self.engine
            .timer_service()
            .has_timers_for(&self.key, &crate::state::StateNamespace::Window(window))
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name)
    }

    pub fn current_input_watermark(&self) -> Timestamp {
        self.engine.current_input_watermark()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PANES_FIRED;
    use crate::windowing::WindowFn;
    use std::time::Duration;

    #[test]
    fn test_tester_round_trip() {
        let strategy =
            WindowingStrategy::new(WindowFn::Fixed { size: Duration::from_millis(10) });
        let mut tester = TriggerTester::new(strategy).unwrap();

        tester.process_element(1i64, 1).unwrap();
        tester.process_element(2i64, 5).unwrap();
        tester.advance_input_watermark(10).unwrap();

        let panes = tester.extract_output();
        assert_eq!(panes.len(), 1);
        assert_eq!(tester.counter(PANES_FIRED), 1);

        let window = BoundedWindow::new(Timestamp::from_millis(0), Timestamp::from_millis(10));
        assert!(tester.is_marked_finished(window));
        assert!(tester.is_window_closed(window));
    }

    #[test]
    fn test_state_inspection() {
        let strategy =
            WindowingStrategy::new(WindowFn::Fixed { size: Duration::from_millis(10) });
        let mut tester = TriggerTester::new(strategy).unwrap();

        tester.process_element(1i64, 1).unwrap();
        assert!(!tester.state_namespaces_in_use().is_empty());

        tester.advance_input_watermark(100).unwrap();
        assert!(tester.state_namespaces_in_use().is_empty());
    }
}
