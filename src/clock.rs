// Clocks
//
// Processing time and synchronized processing time are injectable so the
// executor can be driven deterministically in tests. Synchronized time is a
// lower bound agreed with upstream workers; the system clock reports no
// upstream constraint, so synchronized time degenerates to processing time
// unless a coordinated clock is supplied.

use crate::time::Timestamp;
use chrono::Utc;
use parking_lot::Mutex;

/// Source of processing-time and synchronized-processing-time instants.
pub trait Clock: Send + Sync {
    /// Current wall-clock processing time.
    fn processing_now(&self) -> Timestamp;

    /// Upstream synchronized processing time. Timers in the synchronized
    /// domain fire only up to the minimum of this and the advanced
    /// processing time.
    fn synchronized_now(&self) -> Timestamp;
}

/// Wall-clock backed clock with no upstream synchronization constraint.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn processing_now(&self) -> Timestamp {
        Timestamp::from_millis(Utc::now().timestamp_millis())
    }

    fn synchronized_now(&self) -> Timestamp {
        Timestamp::MAX
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    processing: Mutex<Timestamp>,
    synchronized: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            processing: Mutex::new(start),
            synchronized: Mutex::new(Timestamp::MAX),
        }
    }

    pub fn set_processing(&self, to: Timestamp) {
        *self.processing.lock() = to;
    }

    pub fn set_synchronized(&self, to: Timestamp) {
        *self.synchronized.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Timestamp::MIN)
    }
}

impl Clock for ManualClock {
    fn processing_now(&self) -> Timestamp {
        *self.processing.lock()
    }

    fn synchronized_now(&self) -> Timestamp {
        *self.synchronized.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::default();
        assert_eq!(clock.processing_now(), Timestamp::MIN);
        assert_eq!(clock.synchronized_now(), Timestamp::MAX);

        clock.set_processing(Timestamp::from_millis(500));
        clock.set_synchronized(Timestamp::from_millis(400));
        assert_eq!(clock.processing_now(), Timestamp::from_millis(500));
        assert_eq!(clock.synchronized_now(), Timestamp::from_millis(400));
    }

    #[test]
    fn test_system_clock_is_unconstrained() {
        let clock = SystemClock;
        assert!(clock.processing_now() > Timestamp::MIN);
        assert_eq!(clock.synchronized_now(), Timestamp::MAX);
    }
}
