// Typed State Cells
//
// Thin typed views over the raw byte cells of a StateBackend. Cells are
// created lazily on first write and cleared explicitly; merged reads union
// over source namespaces until the next persist compacts them.

use super::{StateBackend, StateNamespace};
use crate::error::Result;
use crate::value::{StreamKey, StreamValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::serde::decode_from_slice(bytes, bincode::config::standard())?.0)
}

/// A single typed value.
#[derive(Debug, Clone)]
pub struct ValueCell<T> {
    ns: StateNamespace,
    tag: &'static str,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> ValueCell<T> {
    pub fn new(ns: StateNamespace, tag: &'static str) -> Self {
        Self { ns, tag, _marker: PhantomData }
    }

    pub fn read<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        key: &StreamKey,
    ) -> Result<Option<T>> {
        match backend.read(key, &self.ns, self.tag)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn write<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        value: &T,
    ) -> Result<()> {
        backend.write(key, &self.ns, self.tag, encode(value)?)
    }

    pub fn clear<B: StateBackend + ?Sized>(&self, backend: &mut B, key: &StreamKey) -> Result<()> {
        backend.clear_value(key, &self.ns, self.tag)
    }
}

/// An unordered multi-set of values with O(1) append.
///
/// `read_all` preserves append order in the in-memory backend but callers
/// must not rely on any particular order.
#[derive(Debug, Clone)]
pub struct BagCell<T> {
    ns: StateNamespace,
    tag: &'static str,
    _marker: PhantomData<T>,
}

impl<T: Serialize + DeserializeOwned> BagCell<T> {
    pub fn new(ns: StateNamespace, tag: &'static str) -> Self {
        Self { ns, tag, _marker: PhantomData }
    }

    pub fn append<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        value: &T,
    ) -> Result<()> {
        backend.bag_append(key, &self.ns, self.tag, encode(value)?)
    }

    pub fn read_all<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        key: &StreamKey,
    ) -> Result<Vec<T>> {
        backend
            .bag_read(key, &self.ns, self.tag)?
            .iter()
            .map(|bytes| decode(bytes))
            .collect()
    }

    /// Union view over this cell's tag across several namespaces.
    pub fn read_merged<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        key: &StreamKey,
        sources: &[StateNamespace],
    ) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for ns in sources {
            for bytes in backend.bag_read(key, ns, self.tag)? {
                values.push(decode(&bytes)?);
            }
        }
        Ok(values)
    }

    pub fn clear<B: StateBackend + ?Sized>(&self, backend: &mut B, key: &StreamKey) -> Result<()> {
        backend.bag_clear(key, &self.ns, self.tag)
    }
}

/// Accumulator cell driven by a `CombineFn`, initialised lazily on first add.
#[derive(Debug, Clone)]
pub struct CombiningCell {
    ns: StateNamespace,
    tag: &'static str,
}

impl CombiningCell {
    pub fn new(ns: StateNamespace, tag: &'static str) -> Self {
        Self { ns, tag }
    }

    pub fn add<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        combine: &dyn crate::reduce::CombineFn,
        input: &StreamValue,
    ) -> Result<()> {
        let accumulator = match backend.read(key, &self.ns, self.tag)? {
            Some(bytes) => decode(&bytes)?,
            None => combine.create_accumulator(),
        };
        let accumulator = combine.add_input(accumulator, input)?;
        backend.write(key, &self.ns, self.tag, encode(&accumulator)?)
    }

    pub fn read_accumulator<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        key: &StreamKey,
    ) -> Result<Option<StreamValue>> {
        match backend.read(key, &self.ns, self.tag)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn write_accumulator<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        accumulator: &StreamValue,
    ) -> Result<()> {
        backend.write(key, &self.ns, self.tag, encode(accumulator)?)
    }

    /// Merge accumulators across namespaces without flushing the sources.
    pub fn read_merged<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        key: &StreamKey,
        sources: &[StateNamespace],
        combine: &dyn crate::reduce::CombineFn,
    ) -> Result<Option<StreamValue>> {
        let mut accumulators = Vec::new();
        for ns in sources {
            if let Some(bytes) = backend.read(key, ns, self.tag)? {
                accumulators.push(decode(&bytes)?);
            }
        }
        match accumulators.len() {
            0 => Ok(None),
            1 => Ok(accumulators.pop()),
            _ => combine.merge_accumulators(accumulators).map(Some),
        }
    }

    pub fn extract<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        key: &StreamKey,
        combine: &dyn crate::reduce::CombineFn,
    ) -> Result<Option<StreamValue>> {
        match self.read_accumulator(backend, key)? {
            Some(accumulator) => combine.extract_output(accumulator).map(Some),
            None => Ok(None),
        }
    }

    pub fn clear<B: StateBackend + ?Sized>(&self, backend: &mut B, key: &StreamKey) -> Result<()> {
        backend.clear_value(key, &self.ns, self.tag)
    }
}

/// A single instant folded by an `OutputTimeFn`.
#[derive(Debug, Clone)]
pub struct WatermarkHoldCell {
    cell: ValueCell<crate::time::Timestamp>,
}

impl WatermarkHoldCell {
    pub fn new(ns: StateNamespace, tag: &'static str) -> Self {
        Self { cell: ValueCell::new(ns, tag) }
    }

    /// Fold a contribution into the stored hold.
    pub fn add<B: StateBackend + ?Sized>(
        &self,
        backend: &mut B,
        key: &StreamKey,
        output_time_fn: crate::reduce::OutputTimeFn,
        contribution: crate::time::Timestamp,
    ) -> Result<()> {
        let folded = match self.cell.read(backend, key)? {
            Some(existing) => output_time_fn.combine(existing, contribution),
            None => contribution,
        };
        self.cell.write(backend, key, &folded)
    }

    pub fn read<B: StateBackend + ?Sized>(
        &self,
        backend: &B,
        key: &StreamKey,
    ) -> Result<Option<crate::time::Timestamp>> {
        self.cell.read(backend, key)
    }

    pub fn clear<B: StateBackend + ?Sized>(&self, backend: &mut B, key: &StreamKey) -> Result<()> {
        self.cell.clear(backend, key)
    }
}
