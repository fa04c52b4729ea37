// Event-Time Primitives
//
// Timestamps are millisecond instants on a single totally-ordered axis with
// designated MIN/MAX sentinels and an end-of-global-window bound. All window
// arithmetic in the crate saturates at the sentinels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A monotonic instant in milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Earliest representable instant.
    pub const MIN: Timestamp = Timestamp(i64::MIN);

    /// Latest representable instant.
    pub const MAX: Timestamp = Timestamp(i64::MAX);

    /// Maximum timestamp of the global window, held one day short of MAX so
    /// that lateness and cleanup offsets never overflow.
    pub const END_OF_GLOBAL_WINDOW: Timestamp = Timestamp(i64::MAX - 86_400_000);

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_millis())
    }

    /// Convert to a UTC datetime; sentinels clamp to the chrono-representable range.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0)
    }

    pub fn saturating_add(&self, d: Duration) -> Timestamp {
        let millis = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(millis))
    }

    pub fn saturating_sub(&self, d: Duration) -> Timestamp {
        let millis = i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_sub(millis))
    }

    /// The next tick (one millisecond later).
    pub fn next(&self) -> Timestamp {
        Timestamp(self.0.saturating_add(1))
    }

    /// The previous tick (one millisecond earlier).
    pub fn prev(&self) -> Timestamp {
        Timestamp(self.0.saturating_sub(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Timestamp::MIN => write!(f, "-inf"),
            Timestamp::MAX => write!(f, "+inf"),
            Timestamp(ms) => write!(f, "{}", ms),
        }
    }
}

impl From<i64> for Timestamp {
    fn from(millis: i64) -> Self {
        Timestamp(millis)
    }
}

/// The clock domain a timer or time query refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeDomain {
    /// Event time, advanced by the input watermark.
    EventTime,

    /// Wall-clock time of the processing worker.
    ProcessingTime,

    /// Processing time synchronized across upstream workers.
    SynchronizedProcessingTime,
}

impl fmt::Display for TimeDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeDomain::EventTime => write!(f, "event-time"),
            TimeDomain::ProcessingTime => write!(f, "processing-time"),
            TimeDomain::SynchronizedProcessingTime => write!(f, "synchronized-processing-time"),
        }
    }
}
