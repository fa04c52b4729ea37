// RustyStream - Windowing and trigger execution core for keyed event streams
// Core library module

pub mod clock;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod reduce;
pub mod sink;
pub mod state;
pub mod testing;
pub mod time;
pub mod timers;
pub mod triggers;
pub mod value;
pub mod windowing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::shards::{ShardConfig, ShardedDriver};
pub use engine::{WindowPhase, WindowingEngine, WindowingStrategy};
pub use error::{Result, StreamError};
pub use metrics::{Counters, InMemoryCounters, NoopCounters};
pub use reduce::{
    AccumulationMode, CombineFn, OutputTimeFn, PaneInfo, PaneTiming, ReduceFn, SumInt64Fn,
};
pub use sink::{CollectingSink, OutputSink, SinkHandle, WindowedValue};
pub use state::{
    CachedStateBackend, InMemoryStateBackend, StateBackend, StateCache, StateCacheConfig,
    StateNamespace,
};
pub use testing::TriggerTester;
pub use time::{TimeDomain, Timestamp};
pub use timers::{FiredTimer, InMemoryTimerService, TimerService};
pub use triggers::{ScriptHandle, Trigger, TriggerDecision, TriggerExecutor};
pub use value::{StreamKey, StreamValue};
pub use windowing::{ActiveWindowSet, BoundedWindow, MergeProposal, WindowFn};
