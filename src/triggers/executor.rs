// Trigger Executor
//
// Drives the trigger tree for one (key, window): element arrivals, window
// merges, and timer firings update per-node state; after each event the
// runner asks the root `should_fire` and, when true, walks `on_fire` in
// depth-first order. Finished bits for the whole tree live in one bitmap
// indexed by DFS position. The context borrows the state backend and timer
// service for the duration of a single event; nothing is retained across
// events outside the backend.

use super::{ScriptHandle, Trigger, TriggerDecision};
use crate::error::Result;
use crate::metrics::{Counters, ONCE_TRIGGER_REFIRE_SUPPRESSED};
use crate::reduce::SumInt64Fn;
use crate::state::{tags, CombiningCell, StateBackend, StateNamespace, ValueCell};
use crate::time::{TimeDomain, Timestamp};
use crate::timers::TimerService;
use crate::value::{StreamKey, StreamValue};
use crate::windowing::BoundedWindow;

/// Everything a trigger node may touch while handling one event.
pub struct TriggerContext<'a, B: StateBackend + ?Sized> {
    pub backend: &'a mut B,
    pub timers: &'a mut dyn TimerService,
    pub key: &'a StreamKey,
    pub window: BoundedWindow,
    pub counters: &'a dyn Counters,
}

/// One pre-merge window and its finished bits.
#[derive(Debug, Clone)]
pub struct MergeSource {
    pub window: BoundedWindow,
    pub bits: Vec<bool>,
}

/// Timer tag addressed to one trigger node.
pub(crate) fn trigger_timer_tag(node: usize) -> String {
    format!("trigger-{}", node)
}

pub(crate) fn parse_trigger_timer_tag(tag: &str) -> Option<usize> {
    tag.strip_prefix("trigger-")?.parse().ok()
}

fn target_cell(window: BoundedWindow, node: usize) -> ValueCell<Timestamp> {
    ValueCell::new(StateNamespace::WindowAndTrigger(window, node as u32), tags::TARGET)
}

fn count_cell(window: BoundedWindow, node: usize) -> CombiningCell {
    CombiningCell::new(StateNamespace::WindowAndTrigger(window, node as u32), tags::COUNT)
}

fn latch_cell(window: BoundedWindow, node: usize) -> ValueCell<(bool, bool)> {
    ValueCell::new(StateNamespace::WindowAndTrigger(window, node as u32), tags::LATCH)
}

/// Stateless walker over an immutable trigger tree.
pub struct TriggerExecutor<'t> {
    root: &'t Trigger,
}

impl<'t> TriggerExecutor<'t> {
    pub fn new(root: &'t Trigger) -> Self {
        Self { root }
    }

    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    fn bits_cell(window: BoundedWindow) -> ValueCell<Vec<bool>> {
        ValueCell::new(StateNamespace::Window(window), tags::FINISHED)
    }

    pub fn load_bits<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        key: &StreamKey,
        window: &BoundedWindow,
    ) -> Result<Vec<bool>> {
        let mut bits = Self::bits_cell(*window)
            .read(backend, key)?
            .unwrap_or_default();
        bits.resize(self.node_count(), false);
        Ok(bits)
    }

    pub fn store_bits<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        window: &BoundedWindow,
        bits: &Vec<bool>,
    ) -> Result<()> {
        Self::bits_cell(*window).write(backend, key, bits)
    }

    pub fn is_root_finished(&self, bits: &[bool]) -> bool {
        bits.first().copied().unwrap_or(false)
    }

    /// Issue opportunistic read prefetches for every cell the tree may
    /// touch, so a batched backend can amortize round trips.
    pub fn prefetch<B: StateBackend + ?Sized>(&self, ctx: &TriggerContext<'_, B>) {
        ctx.backend.prefetch(
            ctx.key,
            &StateNamespace::Window(ctx.window),
            &[tags::FINISHED, tags::PANE, tags::PHASE, tags::HOLD],
        );
        self.prefetch_node(self.root, 0, ctx);
    }

    fn prefetch_node<B: StateBackend + ?Sized>(
        &self,
        trigger: &Trigger,
        node: usize,
        ctx: &TriggerContext<'_, B>,
    ) {
        let node_tags = trigger.state_tags();
        if !node_tags.is_empty() {
            ctx.backend.prefetch(
                ctx.key,
                &StateNamespace::WindowAndTrigger(ctx.window, node as u32),
                node_tags,
            );
        }
        let mut child_idx = node + 1;
        for child in trigger.children() {
            self.prefetch_node(child, child_idx, ctx);
            child_idx += child.node_count();
        }
    }

    pub fn on_element<B: StateBackend + ?Sized>(
        &self,
        ctx: &mut TriggerContext<'_, B>,
        bits: &mut Vec<bool>,
        ts: Timestamp,
    ) -> Result<()> {
        self.elem(self.root, 0, ctx, bits, ts)?;
        self.settle(self.root, 0, ctx, bits)
    }

    pub fn on_timer<B: StateBackend + ?Sized>(
        &self,
        ctx: &mut TriggerContext<'_, B>,
        bits: &mut Vec<bool>,
        node: usize,
    ) -> Result<()> {
        self.timer(self.root, 0, ctx, bits, node)?;
        self.settle(self.root, 0, ctx, bits)
    }

    /// Recompute trigger state for the merge result. Source windows have
    /// already been coalesced in the active set; their per-node state is
    /// read here and cleared afterwards.
    pub fn on_merge<B: StateBackend + ?Sized>(
        &self,
        ctx: &mut TriggerContext<'_, B>,
        sources: &[MergeSource],
        bits: &mut Vec<bool>,
    ) -> Result<()> {
        self.merge(self.root, 0, ctx, sources, bits)?;
        for source in sources {
            if source.window == ctx.window {
                continue;
            }
            for node in 0..self.node_count() {
                ctx.backend.clear_namespace(
                    ctx.key,
                    &StateNamespace::WindowAndTrigger(source.window, node as u32),
                )?;
            }
        }
        self.settle(self.root, 0, ctx, bits)
    }

    pub fn should_fire<B: StateBackend + ?Sized>(
        &self,
        ctx: &mut TriggerContext<'_, B>,
        bits: &[bool],
    ) -> Result<bool> {
        self.node_should_fire(self.root, 0, ctx, bits)
    }

    pub fn on_fire<B: StateBackend + ?Sized>(
        &self,
        ctx: &mut TriggerContext<'_, B>,
        bits: &mut Vec<bool>,
    ) -> Result<()> {
        self.fire(self.root, 0, ctx, bits)
    }

    /// Drop all per-node state for the window.
    pub fn clear_state<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        window: &BoundedWindow,
    ) -> Result<()> {
        for node in 0..self.node_count() {
            backend.clear_namespace(key, &StateNamespace::WindowAndTrigger(*window, node as u32))?;
        }
        Ok(())
    }

    fn elem<B: StateBackend + ?Sized>(
        &self,
        trigger: &Trigger,
        node: usize,
        ctx: &mut TriggerContext<'_, B>,
        bits: &mut Vec<bool>,
        ts: Timestamp,
    ) -> Result<()> {
        if bits[node] {
            return Ok(());
        }
        match trigger {
            Trigger::Default | Trigger::AfterEndOfWindow => {
                ctx.timers.set_timer(
                    ctx.key,
                    &StateNamespace::Window(ctx.window),
                    &trigger_timer_tag(node),
                    ctx.window.end,
                    TimeDomain::EventTime,
                );
            }

            Trigger::AfterFirstElementEventTime { delay } => {
                let cell = target_cell(ctx.window, node);
                if cell.read(ctx.backend, ctx.key)?.is_none() {
                    let target = ts.saturating_add(*delay);
                    cell.write(ctx.backend, ctx.key, &target)?;
                    ctx.timers.set_timer(
                        ctx.key,
                        &StateNamespace::Window(ctx.window),
                        &trigger_timer_tag(node),
                        target,
                        TimeDomain::EventTime,
                    );
                }
            }

            Trigger::AfterFirstElementProcessingTime { delay } => {
                let cell = target_cell(ctx.window, node);
                if cell.read(ctx.backend, ctx.key)?.is_none() {
                    let target = ctx.timers.current_processing_time().saturating_add(*delay);
                    cell.write(ctx.backend, ctx.key, &target)?;
                    ctx.timers.set_timer(
                        ctx.key,
                        &StateNamespace::Window(ctx.window),
                        &trigger_timer_tag(node),
                        target,
                        TimeDomain::ProcessingTime,
                    );
                }
            }

            Trigger::AfterSynchronizedProcessingTime => {
                let cell = target_cell(ctx.window, node);
                if cell.read(ctx.backend, ctx.key)?.is_none() {
                    let target = ctx.timers.current_synchronized_processing_time();
                    cell.write(ctx.backend, ctx.key, &target)?;
                    ctx.timers.set_timer(
                        ctx.key,
                        &StateNamespace::Window(ctx.window),
                        &trigger_timer_tag(node),
                        target,
                        TimeDomain::SynchronizedProcessingTime,
                    );
                }
            }

            Trigger::AfterCount { .. } => {
                count_cell(ctx.window, node).add(
                    ctx.backend,
                    ctx.key,
                    &SumInt64Fn,
                    &StreamValue::Int64(1),
                )?;
            }

            Trigger::Repeatedly { repeated } => {
                self.elem(repeated, node + 1, ctx, bits, ts)?;
            }

            Trigger::OrFinally { main, until } => {
                let until_idx = node + 1 + main.node_count();
                self.elem(main, node + 1, ctx, bits, ts)?;
                self.elem(until, until_idx, ctx, bits, ts)?;
            }

            Trigger::AfterEach { subtriggers } => {
                let mut child_idx = node + 1;
                for child in subtriggers {
                    if !bits[child_idx] {
                        self.elem(child, child_idx, ctx, bits, ts)?;
                        break;
                    }
                    child_idx += child.node_count();
                }
            }

            Trigger::AfterFirst { subtriggers } | Trigger::AfterAll { subtriggers } => {
                let mut child_idx = node + 1;
                for child in subtriggers {
                    if !bits[child_idx] {
                        self.elem(child, child_idx, ctx, bits, ts)?;
                    }
                    child_idx += child.node_count();
                }
            }

            Trigger::Scripted { script } => {
                self.apply_script(script, node, ctx, bits)?;
            }
        }
        Ok(())
    }

    fn timer<B: StateBackend + ?Sized>(
        &self,
        trigger: &Trigger,
        node: usize,
        ctx: &mut TriggerContext<'_, B>,
        bits: &mut Vec<bool>,
        target: usize,
    ) -> Result<()> {
        if node == target {
            if bits[node] {
                return Ok(());
            }
            // Time-based conditions are evaluated against the current
            // clocks; only scripted leaves carry per-firing state.
            if let Trigger::Scripted { script } = trigger {
                self.apply_script(script, node, ctx, bits)?;
            }
            return Ok(());
        }

        let mut child_idx = node + 1;
        for child in trigger.children() {
            let child_end = child_idx + child.node_count();
            if (child_idx..child_end).contains(&target) {
                return self.timer(child, child_idx, ctx, bits, target);
            }
            child_idx = child_end;
        }
        Ok(())
    }

    fn merge<B: StateBackend + ?Sized>(
        &self,
        trigger: &Trigger,
        node: usize,
        ctx: &mut TriggerContext<'_, B>,
        sources: &[MergeSource],
        bits: &mut Vec<bool>,
    ) -> Result<()> {
        let mut child_idx = node + 1;
        for child in trigger.children() {
            self.merge(child, child_idx, ctx, sources, bits)?;
            child_idx += child.node_count();
        }

        let finished_in_all = sources.iter().all(|s| s.bits.get(node).copied().unwrap_or(false));

        match trigger {
            Trigger::Default | Trigger::AfterEndOfWindow => {
                // Already finished for the result only if some source's end
                // was passed by the watermark and that source had fired.
                let wm = ctx.timers.current_event_time();
                let finished = sources
                    .iter()
                    .any(|s| s.bits.get(node).copied().unwrap_or(false) && wm >= s.window.end);
                bits[node] = finished;
                if !finished {
                    ctx.timers.set_timer(
                        ctx.key,
                        &StateNamespace::Window(ctx.window),
                        &trigger_timer_tag(node),
                        ctx.window.end,
                        TimeDomain::EventTime,
                    );
                }
            }

            Trigger::AfterFirstElementEventTime { .. }
            | Trigger::AfterFirstElementProcessingTime { .. }
            | Trigger::AfterSynchronizedProcessingTime => {
                bits[node] = finished_in_all;
                if !finished_in_all {
                    let mut earliest: Option<Timestamp> = None;
                    for source in sources {
                        let cell = target_cell(source.window, node);
                        if let Some(target) = cell.read(ctx.backend, ctx.key)? {
                            earliest =
                                Some(earliest.map_or(target, |current| current.min(target)));
                        }
                    }
                    if let Some(target) = earliest {
                        target_cell(ctx.window, node).write(ctx.backend, ctx.key, &target)?;
                        let domain = match trigger {
                            Trigger::AfterFirstElementEventTime { .. } => TimeDomain::EventTime,
                            Trigger::AfterFirstElementProcessingTime { .. } => {
                                TimeDomain::ProcessingTime
                            }
                            _ => TimeDomain::SynchronizedProcessingTime,
                        };
                        ctx.timers.set_timer(
                            ctx.key,
                            &StateNamespace::Window(ctx.window),
                            &trigger_timer_tag(node),
                            target,
                            domain,
                        );
                    }
                }
            }

            Trigger::AfterCount { .. } => {
                bits[node] = finished_in_all;
                if !finished_in_all {
                    let namespaces: Vec<StateNamespace> = sources
                        .iter()
                        .map(|s| StateNamespace::WindowAndTrigger(s.window, node as u32))
                        .collect();
                    let merged = count_cell(ctx.window, node).read_merged(
                        ctx.backend,
                        ctx.key,
                        &namespaces,
                        &SumInt64Fn,
                    )?;
                    if let Some(total) = merged {
                        count_cell(ctx.window, node).write_accumulator(
                            ctx.backend,
                            ctx.key,
                            &total,
                        )?;
                    }
                }
            }

            Trigger::Scripted { script } => {
                bits[node] = finished_in_all;
                if !finished_in_all {
                    self.apply_script(script, node, ctx, bits)?;
                }
            }

            Trigger::Repeatedly { .. } => {
                bits[node] = false;
            }

            Trigger::OrFinally { .. }
            | Trigger::AfterEach { .. }
            | Trigger::AfterFirst { .. }
            | Trigger::AfterAll { .. } => {
                bits[node] = finished_in_all;
            }
        }
        Ok(())
    }

    /// Post-event pass: an `AfterAll` composite privately fires once-children
    /// whose condition holds, so conditions observed mid-stream stay
    /// satisfied when the remaining children catch up.
    fn settle<B: StateBackend + ?Sized>(
        &self,
        trigger: &Trigger,
        node: usize,
        ctx: &mut TriggerContext<'_, B>,
        bits: &mut Vec<bool>,
    ) -> Result<()> {
        let mut child_idx = node + 1;
        for child in trigger.children() {
            self.settle(child, child_idx, ctx, bits)?;
            child_idx += child.node_count();
        }

        if let Trigger::AfterAll { subtriggers } = trigger {
            if !bits[node] {
                let mut child_idx = node + 1;
                for child in subtriggers {
                    if !bits[child_idx]
                        && child.is_once()
                        && self.node_should_fire(child, child_idx, ctx, bits)?
                    {
                        self.fire(child, child_idx, ctx, bits)?;
                    }
                    child_idx += child.node_count();
                }
            }
        }
        Ok(())
    }

    fn node_should_fire<B: StateBackend + ?Sized>(
        &self,
        trigger: &Trigger,
        node: usize,
        ctx: &mut TriggerContext<'_, B>,
        bits: &[bool],
    ) -> Result<bool> {
        if bits[node] {
            return Ok(false);
        }
        match trigger {
            Trigger::Default | Trigger::AfterEndOfWindow => {
                Ok(ctx.timers.current_event_time() >= ctx.window.end)
            }

            Trigger::AfterFirstElementEventTime { .. } => {
                Ok(match target_cell(ctx.window, node).read(ctx.backend, ctx.key)? {
                    Some(target) => ctx.timers.current_event_time() >= target,
                    None => false,
                })
            }

            Trigger::AfterFirstElementProcessingTime { .. } => {
                Ok(match target_cell(ctx.window, node).read(ctx.backend, ctx.key)? {
                    Some(target) => ctx.timers.current_processing_time() >= target,
                    None => false,
                })
            }

            Trigger::AfterSynchronizedProcessingTime => {
                Ok(match target_cell(ctx.window, node).read(ctx.backend, ctx.key)? {
                    Some(target) => ctx.timers.current_synchronized_processing_time() >= target,
                    None => false,
                })
            }

            Trigger::AfterCount { at_least } => {
                let count = count_cell(ctx.window, node)
                    .extract(ctx.backend, ctx.key, &SumInt64Fn)?
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                Ok(count >= *at_least as i64)
            }

            Trigger::Repeatedly { repeated } => {
                self.node_should_fire(repeated, node + 1, ctx, bits)
            }

            Trigger::OrFinally { main, until } => {
                let until_idx = node + 1 + main.node_count();
                Ok(self.node_should_fire(until, until_idx, ctx, bits)?
                    || self.node_should_fire(main, node + 1, ctx, bits)?)
            }

            Trigger::AfterEach { subtriggers } => {
                let mut child_idx = node + 1;
                for child in subtriggers {
                    if !bits[child_idx] {
                        return self.node_should_fire(child, child_idx, ctx, bits);
                    }
                    child_idx += child.node_count();
                }
                Ok(false)
            }

            Trigger::AfterFirst { subtriggers } => {
                let mut child_idx = node + 1;
                for child in subtriggers {
                    if !bits[child_idx] && self.node_should_fire(child, child_idx, ctx, bits)? {
                        return Ok(true);
                    }
                    child_idx += child.node_count();
                }
                Ok(false)
            }

            Trigger::AfterAll { subtriggers } => {
                let mut child_idx = node + 1;
                for child in subtriggers {
                    if !bits[child_idx] && !self.node_should_fire(child, child_idx, ctx, bits)? {
                        return Ok(false);
                    }
                    child_idx += child.node_count();
                }
                Ok(true)
            }

            Trigger::Scripted { .. } => {
                Ok(match latch_cell(ctx.window, node).read(ctx.backend, ctx.key)? {
                    Some((fire, _)) => fire,
                    None => false,
                })
            }
        }
    }

    fn fire<B: StateBackend + ?Sized>(
        &self,
        trigger: &Trigger,
        node: usize,
        ctx: &mut TriggerContext<'_, B>,
        bits: &mut Vec<bool>,
    ) -> Result<()> {
        if bits[node] {
            if trigger.is_once() {
                debug_assert!(false, "once trigger {} fired twice", trigger);
                ctx.counters.increment(ONCE_TRIGGER_REFIRE_SUPPRESSED, 1);
            }
            return Ok(());
        }
        match trigger {
            Trigger::Default | Trigger::AfterEndOfWindow => {
                bits[node] = true;
            }

            Trigger::AfterFirstElementEventTime { .. }
            | Trigger::AfterFirstElementProcessingTime { .. }
            | Trigger::AfterSynchronizedProcessingTime => {
                target_cell(ctx.window, node).clear(ctx.backend, ctx.key)?;
                bits[node] = true;
            }

            Trigger::AfterCount { .. } => {
                count_cell(ctx.window, node).clear(ctx.backend, ctx.key)?;
                bits[node] = true;
            }

            Trigger::Scripted { script: _ } => {
                let cell = latch_cell(ctx.window, node);
                let finish = cell
                    .read(ctx.backend, ctx.key)?
                    .map(|(_, finish)| finish)
                    .unwrap_or(false);
                cell.clear(ctx.backend, ctx.key)?;
                bits[node] = finish;
            }

            Trigger::Repeatedly { repeated } => {
                let child_idx = node + 1;
                if self.node_should_fire(repeated, child_idx, ctx, bits)? {
                    self.fire(repeated, child_idx, ctx, bits)?;
                }
                if bits[child_idx] {
                    self.reset(repeated, child_idx, ctx, bits)?;
                }
            }

            Trigger::OrFinally { main, until } => {
                let main_idx = node + 1;
                let until_idx = main_idx + main.node_count();
                // The composite finishes as soon as `until` fires, whatever
                // the subtrigger's own finish semantics.
                let until_fired = self.node_should_fire(until, until_idx, ctx, bits)?;
                if self.node_should_fire(main, main_idx, ctx, bits)? {
                    self.fire(main, main_idx, ctx, bits)?;
                }
                if until_fired {
                    self.fire(until, until_idx, ctx, bits)?;
                }
                if until_fired || bits[main_idx] || bits[until_idx] {
                    bits[node] = true;
                }
            }

            Trigger::AfterEach { subtriggers } => {
                let mut child_idx = node + 1;
                for child in subtriggers {
                    if !bits[child_idx] {
                        if self.node_should_fire(child, child_idx, ctx, bits)? {
                            self.fire(child, child_idx, ctx, bits)?;
                        }
                        break;
                    }
                    child_idx += child.node_count();
                }
                bits[node] = self.all_children_finished(trigger, node, bits);
            }

            Trigger::AfterFirst { subtriggers } | Trigger::AfterAll { subtriggers } => {
                let mut child_idx = node + 1;
                for child in subtriggers {
                    if !bits[child_idx] && self.node_should_fire(child, child_idx, ctx, bits)? {
                        self.fire(child, child_idx, ctx, bits)?;
                    }
                    child_idx += child.node_count();
                }
                bits[node] = true;
            }
        }
        Ok(())
    }

    fn all_children_finished(&self, trigger: &Trigger, node: usize, bits: &[bool]) -> bool {
        let mut child_idx = node + 1;
        for child in trigger.children() {
            if !bits[child_idx] {
                return false;
            }
            child_idx += child.node_count();
        }
        true
    }

    /// Clear a subtree's finished bits and per-node state so a repeated
    /// trigger starts its next cycle fresh.
    fn reset<B: StateBackend + ?Sized>(
        &self,
        trigger: &Trigger,
        node: usize,
        ctx: &mut TriggerContext<'_, B>,
        bits: &mut Vec<bool>,
    ) -> Result<()> {
        for idx in node..node + trigger.node_count() {
            bits[idx] = false;
            ctx.backend.clear_namespace(
                ctx.key,
                &StateNamespace::WindowAndTrigger(ctx.window, idx as u32),
            )?;
        }
        Ok(())
    }

    fn apply_script<B: StateBackend + ?Sized>(
        &self,
        script: &ScriptHandle,
        node: usize,
        ctx: &mut TriggerContext<'_, B>,
        bits: &mut Vec<bool>,
    ) -> Result<()> {
        let Some(decision) = script.pop() else {
            return Ok(());
        };
        let cell = latch_cell(ctx.window, node);
        match decision {
            TriggerDecision::Continue => cell.clear(ctx.backend, ctx.key)?,
            TriggerDecision::Fire => cell.write(ctx.backend, ctx.key, &(true, false))?,
            TriggerDecision::FireAndFinish => cell.write(ctx.backend, ctx.key, &(true, true))?,
            TriggerDecision::Finish => {
                cell.clear(ctx.backend, ctx.key)?;
                bits[node] = true;
            }
        }
        Ok(())
    }
}
