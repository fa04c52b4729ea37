// Timer Service
//
// Prioritised per-key timers in three clock domains. A timer's identity is
// (key, namespace, tag, domain); setting an identity again replaces the
// earlier timestamp. Matured timers are removed before callbacks run, so a
// callback may re-set the same identity without it being cancelled by the
// ongoing firing.

use crate::state::StateNamespace;
use crate::time::{TimeDomain, Timestamp};
use crate::value::StreamKey;
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// A matured timer handed back to the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTimer {
    pub key: StreamKey,
    pub namespace: StateNamespace,
    pub tag: String,
    pub timestamp: Timestamp,
    pub domain: TimeDomain,
}

/// Prioritised timer set shared by all keys of one worker.
pub trait TimerService: Send {
    /// Set (or replace) the timer with this identity.
    fn set_timer(
        &mut self,
        key: &StreamKey,
        ns: &StateNamespace,
        tag: &str,
        timestamp: Timestamp,
        domain: TimeDomain,
    );

    fn delete_timer(&mut self, key: &StreamKey, ns: &StateNamespace, tag: &str, domain: TimeDomain);

    /// Delete every timer scoped to the namespace, across all domains.
    fn delete_for_namespace(&mut self, key: &StreamKey, ns: &StateNamespace);

    /// Advance the input watermark, returning matured EVENT_TIME timers in
    /// nondecreasing timestamp order (insertion order on ties).
    fn advance_watermark(&mut self, to: Timestamp) -> Vec<FiredTimer>;

    /// Advance processing time, returning matured PROCESSING_TIME timers and
    /// those SYNCHRONIZED_PROCESSING_TIME timers at or before
    /// `min(to, synchronized_cap)`.
    fn advance_processing_time(&mut self, to: Timestamp, synchronized_cap: Timestamp)
        -> Vec<FiredTimer>;

    fn current_event_time(&self) -> Timestamp;

    fn current_processing_time(&self) -> Timestamp;

    fn current_synchronized_processing_time(&self) -> Timestamp;

    /// Whether any timer remains scoped to the namespace.
    fn has_timers_for(&self, key: &StreamKey, ns: &StateNamespace) -> bool;
}

type TimerIdentity = (StreamKey, String, String, TimeDomain);

#[derive(Debug, Default)]
struct DomainTimers {
    // Ordered by (timestamp, insertion sequence).
    ordered: BTreeMap<(Timestamp, u64), (StreamKey, StateNamespace, String)>,
    index: HashMap<TimerIdentity, (Timestamp, u64)>,
}

impl DomainTimers {
    fn set(
        &mut self,
        seq: u64,
        key: &StreamKey,
        ns: &StateNamespace,
        tag: &str,
        timestamp: Timestamp,
        domain: TimeDomain,
    ) {
        let identity = (key.clone(), ns.key(), tag.to_string(), domain);
        if let Some(old) = self.index.remove(&identity) {
            self.ordered.remove(&old);
        }
        self.ordered
            .insert((timestamp, seq), (key.clone(), ns.clone(), tag.to_string()));
        self.index.insert(identity, (timestamp, seq));
    }

    fn delete(&mut self, key: &StreamKey, ns: &StateNamespace, tag: &str, domain: TimeDomain) {
        let identity = (key.clone(), ns.key(), tag.to_string(), domain);
        if let Some(slot) = self.index.remove(&identity) {
            self.ordered.remove(&slot);
        }
    }

    fn delete_namespace(&mut self, key: &StreamKey, ns: &StateNamespace, domain: TimeDomain) {
        let ns_key = ns.key();
        let doomed: Vec<(Timestamp, u64)> = self
            .ordered
            .iter()
            .filter(|(_, (k, n, _))| k == key && n.key() == ns_key)
            .map(|(slot, _)| *slot)
            .collect();
        for slot in doomed {
            if let Some((k, n, tag)) = self.ordered.remove(&slot) {
                self.index.remove(&(k, n.key(), tag, domain));
            }
        }
    }

    /// Pop all timers at or before `to`, already ordered.
    fn mature(&mut self, to: Timestamp, domain: TimeDomain) -> Vec<FiredTimer> {
        let remaining = self.ordered.split_off(&(to.next(), 0));
        let matured = std::mem::replace(&mut self.ordered, remaining);

        let mut fired = Vec::with_capacity(matured.len());
        for ((timestamp, _), (key, namespace, tag)) in matured {
            self.index.remove(&(key.clone(), namespace.key(), tag.clone(), domain));
            fired.push(FiredTimer { key, namespace, tag, timestamp, domain });
        }
        fired
    }

    fn has_namespace(&self, key: &StreamKey, ns: &StateNamespace) -> bool {
        let ns_key = ns.key();
        self.ordered
            .values()
            .any(|(k, n, _)| k == key && n.key() == ns_key)
    }
}

/// Heap-backed timer service for tests and single-process runs.
#[derive(Debug)]
pub struct InMemoryTimerService {
    event: DomainTimers,
    processing: DomainTimers,
    synchronized: DomainTimers,
    seq: u64,
    event_time: Timestamp,
    processing_time: Timestamp,
    synchronized_time: Timestamp,
}

impl InMemoryTimerService {
    pub fn new() -> Self {
        Self {
            event: DomainTimers::default(),
            processing: DomainTimers::default(),
            synchronized: DomainTimers::default(),
            seq: 0,
            event_time: Timestamp::MIN,
            processing_time: Timestamp::MIN,
            synchronized_time: Timestamp::MIN,
        }
    }

    fn domain_mut(&mut self, domain: TimeDomain) -> &mut DomainTimers {
        match domain {
            TimeDomain::EventTime => &mut self.event,
            TimeDomain::ProcessingTime => &mut self.processing,
            TimeDomain::SynchronizedProcessingTime => &mut self.synchronized,
        }
    }
}

impl Default for InMemoryTimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService for InMemoryTimerService {
    fn set_timer(
        &mut self,
        key: &StreamKey,
        ns: &StateNamespace,
        tag: &str,
        timestamp: Timestamp,
        domain: TimeDomain,
    ) {
        self.seq += 1;
        let seq = self.seq;
        self.domain_mut(domain).set(seq, key, ns, tag, timestamp, domain);
    }

    fn delete_timer(
        &mut self,
        key: &StreamKey,
        ns: &StateNamespace,
        tag: &str,
        domain: TimeDomain,
    ) {
        self.domain_mut(domain).delete(key, ns, tag, domain);
    }

    fn delete_for_namespace(&mut self, key: &StreamKey, ns: &StateNamespace) {
        self.event.delete_namespace(key, ns, TimeDomain::EventTime);
        self.processing.delete_namespace(key, ns, TimeDomain::ProcessingTime);
        self.synchronized
            .delete_namespace(key, ns, TimeDomain::SynchronizedProcessingTime);
    }

    fn advance_watermark(&mut self, to: Timestamp) -> Vec<FiredTimer> {
        if to < self.event_time {
            warn!(from = %self.event_time, to = %to, "ignoring watermark regression");
            return Vec::new();
        }
        self.event_time = to;
        self.event.mature(to, TimeDomain::EventTime)
    }

    fn advance_processing_time(
        &mut self,
        to: Timestamp,
        synchronized_cap: Timestamp,
    ) -> Vec<FiredTimer> {
        if to < self.processing_time {
            warn!(from = %self.processing_time, to = %to, "ignoring processing-time regression");
            return Vec::new();
        }
        self.processing_time = to;

        let synchronized_to = to.min(synchronized_cap);
        if synchronized_to > self.synchronized_time {
            self.synchronized_time = synchronized_to;
        }

        let mut fired = self.processing.mature(to, TimeDomain::ProcessingTime);
        fired.extend(
            self.synchronized
                .mature(self.synchronized_time, TimeDomain::SynchronizedProcessingTime),
        );
        fired
    }

    fn current_event_time(&self) -> Timestamp {
        self.event_time
    }

    fn current_processing_time(&self) -> Timestamp {
        self.processing_time
    }

    fn current_synchronized_processing_time(&self) -> Timestamp {
        self.synchronized_time
    }

    fn has_timers_for(&self, key: &StreamKey, ns: &StateNamespace) -> bool {
        self.event.has_namespace(key, ns)
            || self.processing.has_namespace(key, ns)
            || self.synchronized.has_namespace(key, ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windowing::BoundedWindow;

    fn ns(start: i64, end: i64) -> StateNamespace {
        StateNamespace::Window(BoundedWindow::new(
            Timestamp::from_millis(start),
            Timestamp::from_millis(end),
        ))
    }

    #[test]
    fn test_set_replaces_same_identity() {
        let mut timers = InMemoryTimerService::new();
        let key = StreamKey::new("k");

        timers.set_timer(&key, &ns(0, 10), "t", Timestamp::from_millis(10), TimeDomain::EventTime);
        timers.set_timer(&key, &ns(0, 10), "t", Timestamp::from_millis(20), TimeDomain::EventTime);

        assert!(timers.advance_watermark(Timestamp::from_millis(10)).is_empty());
        let fired = timers.advance_watermark(Timestamp::from_millis(20));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].timestamp, Timestamp::from_millis(20));
    }

    #[test]
    fn test_distinct_tags_coexist() {
        let mut timers = InMemoryTimerService::new();
        let key = StreamKey::new("k");

        timers.set_timer(&key, &ns(0, 10), "trigger-0", Timestamp::from_millis(10), TimeDomain::EventTime);
        timers.set_timer(&key, &ns(0, 10), "cleanup", Timestamp::from_millis(11), TimeDomain::EventTime);

        let fired = timers.advance_watermark(Timestamp::from_millis(100));
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].tag, "trigger-0");
        assert_eq!(fired[1].tag, "cleanup");
    }

    #[test]
    fn test_fires_in_nondecreasing_order_with_insertion_ties() {
        let mut timers = InMemoryTimerService::new();
        let key = StreamKey::new("k");

        timers.set_timer(&key, &ns(0, 10), "b", Timestamp::from_millis(5), TimeDomain::EventTime);
        timers.set_timer(&key, &ns(0, 10), "a", Timestamp::from_millis(5), TimeDomain::EventTime);
        timers.set_timer(&key, &ns(0, 10), "c", Timestamp::from_millis(3), TimeDomain::EventTime);

        let fired = timers.advance_watermark(Timestamp::from_millis(5));
        let tags: Vec<&str> = fired.iter().map(|f| f.tag.as_str()).collect();
        assert_eq!(tags, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_past_timer_fires_on_next_advance() {
        let mut timers = InMemoryTimerService::new();
        let key = StreamKey::new("k");

        timers.advance_watermark(Timestamp::from_millis(50));
        timers.set_timer(&key, &ns(0, 10), "t", Timestamp::from_millis(10), TimeDomain::EventTime);

        let fired = timers.advance_watermark(Timestamp::from_millis(51));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].timestamp, Timestamp::from_millis(10));
    }

    #[test]
    fn test_synchronized_timers_gated_by_cap() {
        let mut timers = InMemoryTimerService::new();
        let key = StreamKey::new("k");

        timers.set_timer(
            &key,
            &ns(0, 10),
            "s",
            Timestamp::from_millis(10),
            TimeDomain::SynchronizedProcessingTime,
        );

        // Processing time advances past the target but the upstream cap lags.
        let fired = timers.advance_processing_time(
            Timestamp::from_millis(100),
            Timestamp::from_millis(5),
        );
        assert!(fired.is_empty());

        let fired = timers.advance_processing_time(
            Timestamp::from_millis(101),
            Timestamp::from_millis(50),
        );
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].domain, TimeDomain::SynchronizedProcessingTime);
    }

    #[test]
    fn test_delete_for_namespace() {
        let mut timers = InMemoryTimerService::new();
        let key = StreamKey::new("k");

        timers.set_timer(&key, &ns(0, 10), "a", Timestamp::from_millis(5), TimeDomain::EventTime);
        timers.set_timer(&key, &ns(0, 10), "b", Timestamp::from_millis(6), TimeDomain::ProcessingTime);
        timers.set_timer(&key, &ns(10, 20), "c", Timestamp::from_millis(7), TimeDomain::EventTime);

        assert!(timers.has_timers_for(&key, &ns(0, 10)));
        timers.delete_for_namespace(&key, &ns(0, 10));
        assert!(!timers.has_timers_for(&key, &ns(0, 10)));
        assert!(timers.has_timers_for(&key, &ns(10, 20)));
    }

    #[test]
    fn test_watermark_regression_is_ignored() {
        let mut timers = InMemoryTimerService::new();
        timers.advance_watermark(Timestamp::from_millis(100));
        timers.advance_watermark(Timestamp::from_millis(50));
        assert_eq!(timers.current_event_time(), Timestamp::from_millis(100));
    }
}
