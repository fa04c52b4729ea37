// Windowing Engine
//
// The per-key state machine at the heart of the core: assigns elements to
// windows, coalesces session windows, buffers or combines values, maintains
// watermark holds, drives the trigger tree, and emits panes with metadata.
// All work for one key happens synchronously on the calling task; clock
// advances flow in through the timer service.

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StreamError};
use crate::metrics::{
    Counters, NoopCounters, DROPPED_DUE_TO_CLOSED_WINDOW, DROPPED_DUE_TO_LATENESS, PANES_FIRED,
};
use crate::reduce::{hold, pane, AccumulationMode, OutputTimeFn, PaneInfo, ReduceFn};
use crate::sink::{OutputSink, WindowedValue};
use crate::state::{tags, StateBackend, StateNamespace, ValueCell};
use crate::time::{TimeDomain, Timestamp};
use crate::timers::{FiredTimer, InMemoryTimerService, TimerService};
use crate::triggers::executor::{parse_trigger_timer_tag, MergeSource};
use crate::triggers::{Trigger, TriggerContext, TriggerExecutor};
use crate::value::{StreamKey, StreamValue};
use crate::windowing::{ActiveWindowSet, BoundedWindow, MergeProposal, WindowFn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub mod shards;

/// Timer tag for the window cleanup timer.
pub(crate) const CLEANUP_TAG: &str = "cleanup";

/// Lifecycle phase of a (key, window).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowPhase {
    Active,
    Closed,
}

/// Complete windowing configuration for one grouping.
#[derive(Debug, Clone)]
pub struct WindowingStrategy {
    pub window_fn: WindowFn,
    pub trigger: Trigger,
    pub allowed_lateness: Duration,
    pub accumulation_mode: AccumulationMode,
    pub output_time_fn: OutputTimeFn,
}

impl Default for WindowingStrategy {
    fn default() -> Self {
        Self::new(WindowFn::Global)
    }
}

impl WindowingStrategy {
    pub fn new(window_fn: WindowFn) -> Self {
        Self {
            window_fn,
            trigger: Trigger::Default,
            allowed_lateness: Duration::ZERO,
            accumulation_mode: AccumulationMode::DiscardingFiredPanes,
            output_time_fn: OutputTimeFn::Earliest,
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.allowed_lateness = lateness;
        self
    }

    pub fn with_output_time_fn(mut self, output_time_fn: OutputTimeFn) -> Self {
        self.output_time_fn = output_time_fn;
        self
    }

    /// Fail fast on malformed shapes and unsupported pairings, naming both
    /// sides of a bad pairing.
    pub fn validate(&self) -> Result<()> {
        self.window_fn.self_check()?;
        self.trigger.validate()?;
        if self.window_fn.is_merging() && !self.trigger.supports_merging() {
            return Err(StreamError::Configuration(format!(
                "trigger {} has no merge behaviour and cannot be paired with merging window fn {}",
                self.trigger, self.window_fn
            )));
        }
        Ok(())
    }
}

/// The windowing and trigger execution core for a set of keys.
pub struct WindowingEngine<B: StateBackend> {
    strategy: WindowingStrategy,
    reduce_fn: ReduceFn,
    backend: B,
    timers: Box<dyn TimerService>,
    clock: Arc<dyn Clock>,
    sink: Box<dyn OutputSink>,
    counters: Arc<dyn Counters>,
}

impl<B: StateBackend> WindowingEngine<B> {
    pub fn new(
        strategy: WindowingStrategy,
        reduce_fn: ReduceFn,
        backend: B,
        sink: Box<dyn OutputSink>,
    ) -> Result<Self> {
        strategy.validate()?;
        Ok(Self {
            strategy,
            reduce_fn,
            backend,
            timers: Box::new(InMemoryTimerService::new()),
            clock: Arc::new(SystemClock),
            sink,
            counters: Arc::new(NoopCounters),
        })
    }

    pub fn with_counters(mut self, counters: Arc<dyn Counters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timer_service(mut self, timers: Box<dyn TimerService>) -> Self {
        self.timers = timers;
        self
    }

    pub fn strategy(&self) -> &WindowingStrategy {
        &self.strategy
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn timer_service(&self) -> &dyn TimerService {
        self.timers.as_ref()
    }

    pub fn current_input_watermark(&self) -> Timestamp {
        self.timers.current_event_time()
    }

    /// Whether the trigger root has finished for the window.
    pub fn is_finished(&self, key: &StreamKey, window: &BoundedWindow) -> Result<bool> {
        let executor = TriggerExecutor::new(&self.strategy.trigger);
        let bits = executor.load_bits(&self.backend, key, window)?;
        Ok(executor.is_root_finished(&bits))
    }

    pub fn is_closed(&self, key: &StreamKey, window: &BoundedWindow) -> Result<bool> {
        Ok(self.read_phase(key, window)? == WindowPhase::Closed)
    }

    /// Assign, store, and possibly fire panes for one element, synchronously.
    pub fn process_element(
        &mut self,
        key: &StreamKey,
        value: StreamValue,
        ts: Timestamp,
    ) -> Result<()> {
        let watermark = self.timers.current_event_time();
        let assigned = self.strategy.window_fn.assign(ts);

        let mut targets: Vec<BoundedWindow> = Vec::with_capacity(assigned.len());
        if self.strategy.window_fn.is_merging() {
            let mut active = self.read_active(key)?;
            for proto in assigned {
                if self.is_expired(&proto, watermark) {
                    self.counters.increment(DROPPED_DUE_TO_LATENESS, 1);
                    debug!(key = %key, window = %proto, ts = %ts, "dropped element past allowed lateness");
                    continue;
                }
                active.add_window(proto);
                // Merging happens on demand as windows are added.
                let proposals = active.merge_proposals();
                for proposal in &proposals {
                    self.apply_merge(key, &mut active, proposal)?;
                }
                let representative = active.representative(&proto).ok_or_else(|| {
                    StreamError::Internal(format!(
                        "window {} has no representative after merging",
                        proto
                    ))
                })?;
                if !targets.contains(&representative) {
                    targets.push(representative);
                }
            }
            self.write_active(key, &active)?;
        } else {
            for window in assigned {
                if self.is_expired(&window, watermark) {
                    self.counters.increment(DROPPED_DUE_TO_LATENESS, 1);
                    debug!(key = %key, window = %window, ts = %ts, "dropped element past allowed lateness");
                    continue;
                }
                targets.push(window);
            }
        }

        for window in targets {
            if self.read_phase(key, &window)? == WindowPhase::Closed {
                self.counters.increment(DROPPED_DUE_TO_CLOSED_WINDOW, 1);
                debug!(key = %key, window = %window, ts = %ts, "dropped element for closed window");
                continue;
            }

            self.reduce_fn.process_value(&mut self.backend, key, &window, &value)?;
            hold::add_element_hold(
                &mut self.backend,
                key,
                &window,
                ts,
                self.strategy.output_time_fn,
                watermark,
                self.strategy.allowed_lateness,
            )?;

            let cleanup_at = self.cleanup_time(&window);
            self.timers.set_timer(
                key,
                &StateNamespace::Window(window),
                CLEANUP_TAG,
                cleanup_at,
                TimeDomain::EventTime,
            );

            self.run_trigger_element(key, &window, ts)?;
            self.evaluate_window(key, &window)?;
        }

        self.persist(key)
    }

    /// Advance the input watermark and fire due event-time timers.
    pub fn advance_input_watermark(&mut self, to: Timestamp) -> Result<()> {
        debug!(to = %to, "advancing input watermark");
        let fired = self.timers.advance_watermark(to);
        self.dispatch_timers(fired)
    }

    /// Advance processing time and fire due processing-time and
    /// synchronized-processing-time timers.
    pub fn advance_processing_time(&mut self, to: Timestamp) -> Result<()> {
        let cap = self.clock.synchronized_now();
        let fired = self.timers.advance_processing_time(to, cap);
        self.dispatch_timers(fired)
    }

    /// Inject one timer firing directly, as a timer service would.
    pub fn fire_timer(
        &mut self,
        key: &StreamKey,
        window: &BoundedWindow,
        tag: &str,
        timestamp: Timestamp,
        domain: TimeDomain,
    ) -> Result<()> {
        let namespace = StateNamespace::Window(*window);
        self.timers.delete_timer(key, &namespace, tag, domain);
        self.handle_fired_timer(FiredTimer {
            key: key.clone(),
            namespace,
            tag: tag.to_string(),
            timestamp,
            domain,
        })?;
        self.persist(key)
    }

    /// Coalesce any unmerged active windows for the key and re-evaluate the
    /// merge results.
    pub fn merge_active_windows(&mut self, key: &StreamKey) -> Result<()> {
        if !self.strategy.window_fn.is_merging() {
            return Ok(());
        }
        let mut active = self.read_active(key)?;
        let proposals = active.merge_proposals();
        for proposal in &proposals {
            self.apply_merge(key, &mut active, proposal)?;
        }
        self.write_active(key, &active)?;
        for proposal in &proposals {
            self.evaluate_window(key, &proposal.result)?;
        }
        self.persist(key)
    }

    /// Flush pending state for the key. For merging shapes this first
    /// compacts union-read source namespaces into their representatives, so
    /// sources are empty once the persist completes.
    pub fn persist(&mut self, key: &StreamKey) -> Result<()> {
        if self.strategy.window_fn.is_merging() {
            let mut active = self.read_active(key)?;
            let representatives: Vec<BoundedWindow> = active.windows().copied().collect();
            for representative in representatives {
                let addresses = active.state_addresses(&representative);
                if addresses.len() > 1 || addresses.first() != Some(&representative) {
                    let sources: Vec<BoundedWindow> = addresses
                        .iter()
                        .copied()
                        .filter(|address| *address != representative)
                        .collect();
                    self.reduce_fn.on_merge(
                        &mut self.backend,
                        key,
                        &sources,
                        &representative,
                    )?;
                    active.compact(&representative);
                }
            }
            self.write_active(key, &active)?;
        }
        self.backend.persist(key)
    }

    fn is_expired(&self, window: &BoundedWindow, watermark: Timestamp) -> bool {
        watermark > window.end.saturating_add(self.strategy.allowed_lateness)
    }

    /// One tick past the lateness horizon, so an element arriving exactly at
    /// the horizon is still admitted.
    fn cleanup_time(&self, window: &BoundedWindow) -> Timestamp {
        window.end.saturating_add(self.strategy.allowed_lateness).next()
    }

    fn read_phase(&self, key: &StreamKey, window: &BoundedWindow) -> Result<WindowPhase> {
        let cell: ValueCell<WindowPhase> =
            ValueCell::new(StateNamespace::Window(*window), tags::PHASE);
        Ok(cell.read(&self.backend, key)?.unwrap_or(WindowPhase::Active))
    }

    fn read_active(&self, key: &StreamKey) -> Result<ActiveWindowSet> {
        let cell: ValueCell<ActiveWindowSet> =
            ValueCell::new(StateNamespace::Global, tags::ACTIVE_WINDOWS);
        Ok(cell.read(&self.backend, key)?.unwrap_or_default())
    }

    fn write_active(&mut self, key: &StreamKey, active: &ActiveWindowSet) -> Result<()> {
        let cell: ValueCell<ActiveWindowSet> =
            ValueCell::new(StateNamespace::Global, tags::ACTIVE_WINDOWS);
        if active.is_empty() {
            cell.clear(&mut self.backend, key)
        } else {
            cell.write(&mut self.backend, key, active)
        }
    }

    fn state_addresses(&self, key: &StreamKey, window: &BoundedWindow) -> Result<Vec<BoundedWindow>> {
        if !self.strategy.window_fn.is_merging() {
            return Ok(vec![*window]);
        }
        Ok(self.read_active(key)?.state_addresses(window))
    }

    /// Physically coalesce merged source windows' control state into the
    /// result window. Content cells stay at their source addresses for
    /// union reads until the next persist.
    fn apply_merge(
        &mut self,
        key: &StreamKey,
        active: &mut ActiveWindowSet,
        proposal: &MergeProposal,
    ) -> Result<()> {
        let result = proposal.result;
        debug!(key = %key, result = %result, sources = ?proposal.to_merge, "merging windows");

        let executor = TriggerExecutor::new(&self.strategy.trigger);
        let mut sources = Vec::with_capacity(proposal.to_merge.len());
        for window in &proposal.to_merge {
            let bits = executor.load_bits(&self.backend, key, window)?;
            sources.push(MergeSource { window: *window, bits });
        }

        let mut bits = vec![false; executor.node_count()];
        {
            let mut ctx = TriggerContext {
                backend: &mut self.backend,
                timers: self.timers.as_mut(),
                key,
                window: result,
                counters: self.counters.as_ref(),
            };
            executor.on_merge(&mut ctx, &sources, &mut bits)?;
        }
        executor.store_bits(&mut self.backend, key, &result, &bits)?;

        hold::merge_holds(
            &mut self.backend,
            key,
            &proposal.to_merge,
            &result,
            self.strategy.output_time_fn,
        )?;

        // The source with the most firings carries the pane sequence on.
        let mut carried: Option<PaneInfo> = None;
        for window in &proposal.to_merge {
            let cell: ValueCell<PaneInfo> =
                ValueCell::new(StateNamespace::Window(*window), tags::PANE);
            if let Some(info) = cell.read(&self.backend, key)? {
                carried = Some(match carried {
                    Some(current) if current.index >= info.index => current,
                    _ => info,
                });
            }
            cell.clear(&mut self.backend, key)?;
        }
        if let Some(info) = carried {
            let cell: ValueCell<PaneInfo> =
                ValueCell::new(StateNamespace::Window(result), tags::PANE);
            cell.write(&mut self.backend, key, &info)?;
        }

        // Merging never revives a closed window.
        let mut closed = false;
        for window in &proposal.to_merge {
            let cell: ValueCell<WindowPhase> =
                ValueCell::new(StateNamespace::Window(*window), tags::PHASE);
            if cell.read(&self.backend, key)? == Some(WindowPhase::Closed) {
                closed = true;
            }
            cell.clear(&mut self.backend, key)?;
        }

        for window in &proposal.to_merge {
            if *window != result {
                let cell: ValueCell<Vec<bool>> =
                    ValueCell::new(StateNamespace::Window(*window), tags::FINISHED);
                cell.clear(&mut self.backend, key)?;
                self.timers.delete_for_namespace(key, &StateNamespace::Window(*window));
            }
        }

        let cleanup_at = self.cleanup_time(&result);
        self.timers.set_timer(
            key,
            &StateNamespace::Window(result),
            CLEANUP_TAG,
            cleanup_at,
            TimeDomain::EventTime,
        );

        active.record_merge(proposal);

        if closed {
            let cell: ValueCell<WindowPhase> =
                ValueCell::new(StateNamespace::Window(result), tags::PHASE);
            cell.write(&mut self.backend, key, &WindowPhase::Closed)?;
            self.timers.delete_for_namespace(key, &StateNamespace::Window(result));
            self.timers.set_timer(
                key,
                &StateNamespace::Window(result),
                CLEANUP_TAG,
                cleanup_at,
                TimeDomain::EventTime,
            );
        }
        Ok(())
    }

    fn run_trigger_element(
        &mut self,
        key: &StreamKey,
        window: &BoundedWindow,
        ts: Timestamp,
    ) -> Result<()> {
        let executor = TriggerExecutor::new(&self.strategy.trigger);
        let mut bits = executor.load_bits(&self.backend, key, window)?;
        {
            let mut ctx = TriggerContext {
                backend: &mut self.backend,
                timers: self.timers.as_mut(),
                key,
                window: *window,
                counters: self.counters.as_ref(),
            };
            executor.prefetch(&ctx);
            executor.on_element(&mut ctx, &mut bits, ts)?;
        }
        executor.store_bits(&mut self.backend, key, window, &bits)
    }

    fn dispatch_timers(&mut self, fired: Vec<FiredTimer>) -> Result<()> {
        let mut touched: Vec<StreamKey> = Vec::new();
        for timer in fired {
            if !touched.contains(&timer.key) {
                touched.push(timer.key.clone());
            }
            self.handle_fired_timer(timer)?;
        }
        for key in touched {
            self.persist(&key)?;
        }
        Ok(())
    }

    fn handle_fired_timer(&mut self, timer: FiredTimer) -> Result<()> {
        let Some(window) = timer.namespace.window().copied() else {
            return Ok(());
        };
        let key = timer.key.clone();

        if timer.tag == CLEANUP_TAG {
            return self.garbage_collect(&key, &window);
        }
        let Some(node) = parse_trigger_timer_tag(&timer.tag) else {
            return Ok(());
        };
        if self.read_phase(&key, &window)? == WindowPhase::Closed {
            return Ok(());
        }
        if self.strategy.window_fn.is_merging()
            && self.read_active(&key)?.representative(&window) != Some(window)
        {
            // The window was merged away; its timers died with it.
            return Ok(());
        }

        let executor = TriggerExecutor::new(&self.strategy.trigger);
        let mut bits = executor.load_bits(&self.backend, &key, &window)?;
        {
            let mut ctx = TriggerContext {
                backend: &mut self.backend,
                timers: self.timers.as_mut(),
                key: &key,
                window,
                counters: self.counters.as_ref(),
            };
            executor.prefetch(&ctx);
            executor.on_timer(&mut ctx, &mut bits, node)?;
        }
        executor.store_bits(&mut self.backend, &key, &window, &bits)?;

        self.evaluate_window(&key, &window)
    }

    /// Ask the trigger root whether to fire and, when it does, emit one pane
    /// and run the lifecycle transition.
    fn evaluate_window(&mut self, key: &StreamKey, window: &BoundedWindow) -> Result<()> {
        let executor = TriggerExecutor::new(&self.strategy.trigger);
        let mut bits = executor.load_bits(&self.backend, key, window)?;

        let fire = {
            let mut ctx = TriggerContext {
                backend: &mut self.backend,
                timers: self.timers.as_mut(),
                key,
                window: *window,
                counters: self.counters.as_ref(),
            };
            executor.should_fire(&mut ctx, &bits)?
        };
        if !fire {
            return Ok(());
        }

        {
            let mut ctx = TriggerContext {
                backend: &mut self.backend,
                timers: self.timers.as_mut(),
                key,
                window: *window,
                counters: self.counters.as_ref(),
            };
            executor.on_fire(&mut ctx, &mut bits)?;
        }
        executor.store_bits(&mut self.backend, key, window, &bits)?;
        let root_finished = executor.is_root_finished(&bits);

        let addresses = self.state_addresses(key, window)?;
        let pane_cell: ValueCell<PaneInfo> =
            ValueCell::new(StateNamespace::Window(*window), tags::PANE);
        let previous = pane_cell.read(&self.backend, key)?;

        let emitted = self.reduce_fn.on_trigger(
            &mut self.backend,
            key,
            window,
            &addresses,
            self.counters.as_ref(),
        )?;
        let output_ts = hold::extract_and_release(&mut self.backend, key, window)?;

        if let Some(value) = emitted {
            let watermark = self.timers.current_event_time();
            let timing = pane::timing_for(watermark, window, previous.as_ref());
            let info = pane::next_pane(previous, timing, root_finished);
            debug!(
                key = %key,
                window = %window,
                index = info.index,
                timing = %info.timing,
                ts = %output_ts,
                "emitting pane"
            );
            self.sink.emit(WindowedValue {
                key: key.clone(),
                value,
                timestamp: output_ts,
                window: *window,
                pane: info,
            })?;
            self.counters.increment(PANES_FIRED, 1);
            pane_cell.write(&mut self.backend, key, &info)?;
        }

        if root_finished {
            self.close_window(key, window)?;
        }
        Ok(())
    }

    /// Trigger root finished: tear down everything but the closed marker,
    /// which drops late elements until the lateness horizon passes.
    fn close_window(&mut self, key: &StreamKey, window: &BoundedWindow) -> Result<()> {
        debug!(key = %key, window = %window, "closing window");
        let cell: ValueCell<WindowPhase> =
            ValueCell::new(StateNamespace::Window(*window), tags::PHASE);
        cell.write(&mut self.backend, key, &WindowPhase::Closed)?;

        let addresses = self.state_addresses(key, window)?;
        self.reduce_fn.clear(&mut self.backend, key, &addresses)?;
        hold::clear_hold(&mut self.backend, key, window)?;
        let executor = TriggerExecutor::new(&self.strategy.trigger);
        executor.clear_state(&mut self.backend, key, window)?;

        self.timers.delete_for_namespace(key, &StateNamespace::Window(*window));
        let cleanup_at = self.cleanup_time(window);
        self.timers.set_timer(
            key,
            &StateNamespace::Window(*window),
            CLEANUP_TAG,
            cleanup_at,
            TimeDomain::EventTime,
        );
        Ok(())
    }

    /// The lateness horizon passed: remove every trace of the window. No
    /// pane is emitted on this path.
    fn garbage_collect(&mut self, key: &StreamKey, window: &BoundedWindow) -> Result<()> {
        debug!(key = %key, window = %window, "garbage collecting window");
        let addresses = self.state_addresses(key, window)?;

        let executor = TriggerExecutor::new(&self.strategy.trigger);
        executor.clear_state(&mut self.backend, key, window)?;
        for address in &addresses {
            self.backend.clear_namespace(key, &StateNamespace::Window(*address))?;
            self.timers.delete_for_namespace(key, &StateNamespace::Window(*address));
        }
        self.backend.clear_namespace(key, &StateNamespace::Window(*window))?;
        self.timers.delete_for_namespace(key, &StateNamespace::Window(*window));

        if self.strategy.window_fn.is_merging() {
            let mut active = self.read_active(key)?;
            active.remove(window);
            self.write_active(key, &active)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryCounters;
    use crate::sink::CollectingSink;
    use crate::state::InMemoryStateBackend;

    fn fixed_engine(
        size_ms: u64,
    ) -> (WindowingEngine<InMemoryStateBackend>, crate::sink::SinkHandle, Arc<InMemoryCounters>)
    {
        let sink = CollectingSink::new();
        let handle = sink.handle();
        let counters = Arc::new(InMemoryCounters::new());
        let engine = WindowingEngine::new(
            WindowingStrategy::new(WindowFn::Fixed { size: Duration::from_millis(size_ms) }),
            ReduceFn::Buffering,
            InMemoryStateBackend::new(),
            Box::new(sink),
        )
        .unwrap()
        .with_counters(counters.clone());
        (engine, handle, counters)
    }

    #[test]
    fn test_strategy_validation_rejects_bad_pairing() {
        let strategy = WindowingStrategy::new(WindowFn::Sessions {
            gap: Duration::from_millis(10),
        })
        .with_trigger(Trigger::AfterSynchronizedProcessingTime);
        let err = strategy.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("AfterSynchronizedProcessingTime"), "{}", message);
        assert!(message.contains("Sessions"), "{}", message);
    }

    #[test]
    fn test_single_window_fires_on_watermark() {
        let (mut engine, output, _) = fixed_engine(10);
        let key = StreamKey::new("k");

        engine.process_element(&key, StreamValue::Int64(1), Timestamp::from_millis(1)).unwrap();
        engine.process_element(&key, StreamValue::Int64(2), Timestamp::from_millis(9)).unwrap();
        assert!(output.is_empty());

        engine.advance_input_watermark(Timestamp::from_millis(10)).unwrap();
        let panes = output.take();
        assert_eq!(panes.len(), 1);
        assert_eq!(panes[0].window.end, Timestamp::from_millis(10));
        assert_eq!(panes[0].timestamp, Timestamp::from_millis(1));
        assert_eq!(panes[0].pane.index, 0);
        assert!(panes[0].pane.is_first);
        assert!(panes[0].pane.is_last);
    }

    #[test]
    fn test_closed_window_drops_elements() {
        let (mut engine, output, counters) = fixed_engine(10);
        let key = StreamKey::new("k");

        engine.process_element(&key, StreamValue::Int64(1), Timestamp::from_millis(1)).unwrap();
        engine.advance_input_watermark(Timestamp::from_millis(10)).unwrap();
        assert_eq!(output.take().len(), 1);

        // The window fired and closed; a late element for it is dropped.
        engine.process_element(&key, StreamValue::Int64(2), Timestamp::from_millis(5)).unwrap();
        assert_eq!(counters.get(DROPPED_DUE_TO_CLOSED_WINDOW), 1);
        assert!(output.is_empty());
    }

    #[test]
    fn test_expired_element_drops_with_counter() {
        let (mut engine, output, counters) = fixed_engine(10);
        let key = StreamKey::new("k");

        engine.advance_input_watermark(Timestamp::from_millis(50)).unwrap();
        engine.process_element(&key, StreamValue::Int64(1), Timestamp::from_millis(1)).unwrap();
        assert_eq!(counters.get(DROPPED_DUE_TO_LATENESS), 1);
        assert!(output.is_empty());
    }

    #[test]
    fn test_cleanup_removes_all_state() {
        let (mut engine, _, _) = fixed_engine(10);
        let key = StreamKey::new("k");

        engine.process_element(&key, StreamValue::Int64(1), Timestamp::from_millis(1)).unwrap();
        engine.advance_input_watermark(Timestamp::from_millis(100)).unwrap();

        assert!(engine.backend().namespaces_in_use(&key).is_empty());
        let window = BoundedWindow::new(Timestamp::from_millis(0), Timestamp::from_millis(10));
        assert!(!engine.timer_service().has_timers_for(&key, &StateNamespace::Window(window)));
    }
}
