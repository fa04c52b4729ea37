// Reduce Functions
//
// The content-carrying state across elements and firings. Buffering keeps
// the raw values in a bag cell; combining folds them into an accumulator.
// Only DISCARDING_FIRED_PANES accumulation is supported: per-pane state is
// cleared after every firing.

use crate::error::{Result, StreamError};
use crate::metrics::{Counters, BYTES_READ};
use crate::state::{tags, BagCell, CombiningCell, StateBackend, StateNamespace};
use crate::value::{StreamKey, StreamValue};
use crate::windowing::BoundedWindow;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod hold;
pub mod pane;

pub use hold::OutputTimeFn;
pub use pane::{PaneInfo, PaneTiming};

/// Policy governing whether a pane's state is cleared after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccumulationMode {
    /// State is cleared after every firing; panes never overlap in content.
    DiscardingFiredPanes,
}

/// An associative aggregation over stream values.
pub trait CombineFn: Send + Sync {
    fn create_accumulator(&self) -> StreamValue;

    fn add_input(&self, accumulator: StreamValue, input: &StreamValue) -> Result<StreamValue>;

    fn merge_accumulators(&self, accumulators: Vec<StreamValue>) -> Result<StreamValue>;

    fn extract_output(&self, accumulator: StreamValue) -> Result<StreamValue>;
}

/// Sums 64-bit integer inputs. Also backs the element-count trigger state.
#[derive(Debug, Default, Clone, Copy)]
pub struct SumInt64Fn;

impl CombineFn for SumInt64Fn {
    fn create_accumulator(&self) -> StreamValue {
        StreamValue::Int64(0)
    }

    fn add_input(&self, accumulator: StreamValue, input: &StreamValue) -> Result<StreamValue> {
        let current = accumulator.as_i64().unwrap_or(0);
        let input = input.as_i64().ok_or_else(|| {
            StreamError::InvalidOperation(format!("sum combine requires integers, got {:?}", input))
        })?;
        Ok(StreamValue::Int64(current.saturating_add(input)))
    }

    fn merge_accumulators(&self, accumulators: Vec<StreamValue>) -> Result<StreamValue> {
        let mut total = 0i64;
        for accumulator in accumulators {
            total = total.saturating_add(accumulator.as_i64().unwrap_or(0));
        }
        Ok(StreamValue::Int64(total))
    }

    fn extract_output(&self, accumulator: StreamValue) -> Result<StreamValue> {
        Ok(accumulator)
    }
}

/// How grouped values are carried between elements and firings.
#[derive(Clone)]
pub enum ReduceFn {
    /// Raw grouping: buffered values are emitted as an array.
    Buffering,

    /// Incremental aggregation through a combine function.
    Combining(Arc<dyn CombineFn>),
}

impl fmt::Debug for ReduceFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceFn::Buffering => write!(f, "Buffering"),
            ReduceFn::Combining(_) => write!(f, "Combining"),
        }
    }
}

fn buffer_cell(window: &BoundedWindow) -> BagCell<StreamValue> {
    BagCell::new(StateNamespace::Window(*window), tags::BUFFER)
}

fn accumulator_cell(window: &BoundedWindow) -> CombiningCell {
    CombiningCell::new(StateNamespace::Window(*window), tags::ACCUMULATOR)
}

impl ReduceFn {
    /// Append or accumulate one value into the window's content state.
    pub fn process_value<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        window: &BoundedWindow,
        value: &StreamValue,
    ) -> Result<()> {
        match self {
            ReduceFn::Buffering => buffer_cell(window).append(backend, key, value),
            ReduceFn::Combining(combine) => accumulator_cell(window)
                .add(backend, key, combine.as_ref(), value)
                .map_err(|e| match e {
                    StreamError::UserCode { .. } => e,
                    other => StreamError::user_code(
                        format!("combine fn for key {} window {}", key, window),
                        other,
                    ),
                }),
        }
    }

    /// Physically merge content state from source windows into the result.
    /// Until this runs (at the next persist), reads union over the sources.
    pub fn on_merge<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        sources: &[BoundedWindow],
        result: &BoundedWindow,
    ) -> Result<()> {
        match self {
            ReduceFn::Buffering => {
                let result_cell = buffer_cell(result);
                for source in sources {
                    if source == result {
                        continue;
                    }
                    let source_cell = buffer_cell(source);
                    for value in source_cell.read_all(backend, key)? {
                        result_cell.append(backend, key, &value)?;
                    }
                    source_cell.clear(backend, key)?;
                }
                Ok(())
            }
            ReduceFn::Combining(combine) => {
                let namespaces: Vec<StateNamespace> = sources
                    .iter()
                    .chain(std::iter::once(result))
                    .map(|w| StateNamespace::Window(*w))
                    .collect();
                let merged = accumulator_cell(result).read_merged(
                    backend,
                    key,
                    &namespaces,
                    combine.as_ref(),
                )?;
                for source in sources {
                    if source != result {
                        accumulator_cell(source).clear(backend, key)?;
                    }
                }
                match merged {
                    Some(accumulator) => {
                        accumulator_cell(result).write_accumulator(backend, key, &accumulator)
                    }
                    None => accumulator_cell(result).clear(backend, key),
                }
            }
        }
    }

    /// Open the group for emission: read the union of content state across
    /// the window's state addresses, account the bytes read, extract the
    /// output value, and clear the per-pane state (discarding mode).
    ///
    /// Returns `None` when no content has accumulated since the last firing.
    pub fn on_trigger<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        window: &BoundedWindow,
        addresses: &[BoundedWindow],
        counters: &dyn Counters,
    ) -> Result<Option<StreamValue>> {
        let namespaces: Vec<StateNamespace> =
            addresses.iter().map(|w| StateNamespace::Window(*w)).collect();

        match self {
            ReduceFn::Buffering => {
                let values =
                    buffer_cell(window).read_merged(backend, key, &namespaces)?;
                if values.is_empty() {
                    return Ok(None);
                }
                // The whole group is accounted when it is opened, regardless
                // of how much of it the consumer iterates.
                let bytes: usize = values.iter().map(|v| v.byte_size()).sum();
                counters.increment(BYTES_READ, bytes as u64);

                self.clear(backend, key, addresses)?;
                Ok(Some(StreamValue::Array(values)))
            }
            ReduceFn::Combining(combine) => {
                let accumulator = accumulator_cell(window).read_merged(
                    backend,
                    key,
                    &namespaces,
                    combine.as_ref(),
                )?;
                let Some(accumulator) = accumulator else {
                    return Ok(None);
                };
                counters.increment(BYTES_READ, accumulator.byte_size() as u64);

                let output = combine.extract_output(accumulator).map_err(|e| {
                    StreamError::user_code(
                        format!("combine fn for key {} window {}", key, window),
                        e,
                    )
                })?;
                self.clear(backend, key, addresses)?;
                Ok(Some(output))
            }
        }
    }

    /// Remove all content state at the given addresses.
    pub fn clear<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        addresses: &[BoundedWindow],
    ) -> Result<()> {
        for address in addresses {
            match self {
                ReduceFn::Buffering => buffer_cell(address).clear(backend, key)?,
                ReduceFn::Combining(_) => accumulator_cell(address).clear(backend, key)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryCounters;
    use crate::state::InMemoryStateBackend;
    use crate::time::Timestamp;

    fn w(start: i64, end: i64) -> BoundedWindow {
        BoundedWindow::new(Timestamp::from_millis(start), Timestamp::from_millis(end))
    }

    #[test]
    fn test_buffering_roundtrip() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let counters = InMemoryCounters::new();
        let reduce = ReduceFn::Buffering;
        let window = w(0, 10);

        for v in [1i64, 2, 3] {
            reduce.process_value(&mut backend, &key, &window, &StreamValue::Int64(v)).unwrap();
        }

        let out = reduce
            .on_trigger(&mut backend, &key, &window, &[window], &counters)
            .unwrap()
            .unwrap();
        let mut values: Vec<i64> =
            out.as_array().unwrap().iter().filter_map(|v| v.as_i64()).collect();
        values.sort();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(counters.get(BYTES_READ), 24);

        // Discarding mode: the next open finds nothing.
        assert!(reduce
            .on_trigger(&mut backend, &key, &window, &[window], &counters)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_combining_roundtrip() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let counters = InMemoryCounters::new();
        let reduce = ReduceFn::Combining(Arc::new(SumInt64Fn));
        let window = w(0, 10);

        for v in [5i64, 6, 7] {
            reduce.process_value(&mut backend, &key, &window, &StreamValue::Int64(v)).unwrap();
        }

        let out = reduce
            .on_trigger(&mut backend, &key, &window, &[window], &counters)
            .unwrap();
        assert_eq!(out, Some(StreamValue::Int64(18)));
    }

    #[test]
    fn test_merge_concatenates_buffers() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let counters = InMemoryCounters::new();
        let reduce = ReduceFn::Buffering;

        let a = w(1, 11);
        let b = w(9, 19);
        let merged = w(1, 19);

        reduce.process_value(&mut backend, &key, &a, &StreamValue::Int64(1)).unwrap();
        reduce.process_value(&mut backend, &key, &b, &StreamValue::Int64(2)).unwrap();

        // Union read without a physical merge.
        let out = reduce
            .on_trigger(&mut backend, &key, &merged, &[a, b, merged], &counters)
            .unwrap()
            .unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);

        // Physical merge after fresh contents.
        reduce.process_value(&mut backend, &key, &a, &StreamValue::Int64(3)).unwrap();
        reduce.process_value(&mut backend, &key, &b, &StreamValue::Int64(4)).unwrap();
        reduce.on_merge(&mut backend, &key, &[a, b], &merged).unwrap();
        assert!(!backend.namespace_in_use(&key, &StateNamespace::Window(a)).unwrap());

        let out = reduce
            .on_trigger(&mut backend, &key, &merged, &[merged], &counters)
            .unwrap()
            .unwrap();
        assert_eq!(out.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_merge_combines_accumulators() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let counters = InMemoryCounters::new();
        let reduce = ReduceFn::Combining(Arc::new(SumInt64Fn));

        let a = w(1, 11);
        let b = w(9, 19);
        let merged = w(1, 19);

        reduce.process_value(&mut backend, &key, &a, &StreamValue::Int64(10)).unwrap();
        reduce.process_value(&mut backend, &key, &b, &StreamValue::Int64(20)).unwrap();
        reduce.on_merge(&mut backend, &key, &[a, b], &merged).unwrap();

        let out = reduce
            .on_trigger(&mut backend, &key, &merged, &[merged], &counters)
            .unwrap();
        assert_eq!(out, Some(StreamValue::Int64(30)));
    }

    #[test]
    fn test_group_open_accounts_full_size() {
        let mut backend = InMemoryStateBackend::new();
        let key = StreamKey::new("k");
        let counters = InMemoryCounters::new();
        let reduce = ReduceFn::Buffering;
        let window = w(0, 100);

        for v in 0..10i64 {
            reduce.process_value(&mut backend, &key, &window, &StreamValue::Int64(v)).unwrap();
        }
        reduce.on_trigger(&mut backend, &key, &window, &[window], &counters).unwrap();
        assert_eq!(counters.get(BYTES_READ), 80);
    }
}
