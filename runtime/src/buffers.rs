//! Caller-facing argument and result buffers.

use std::collections::BTreeMap;

use kiln_device::{DeviceMemory, MaybeOwningDeviceMemory, OwnedDeviceMemory};

use crate::types::ShapeIndex;

/// Pre-bound argument: device buffers per leaf, never donated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapedBuffer {
    pub device_ordinal: usize,
    pub buffers: BTreeMap<ShapeIndex, DeviceMemory>,
}

impl ShapedBuffer {
    pub fn new(device_ordinal: usize) -> Self {
        Self { device_ordinal, buffers: BTreeMap::new() }
    }

    /// Single-leaf argument.
    pub fn scalar(device_ordinal: usize, memory: DeviceMemory) -> Self {
        Self::new(device_ordinal).with(ShapeIndex::root(), memory)
    }

    pub fn with(mut self, index: impl Into<ShapeIndex>, memory: DeviceMemory) -> Self {
        self.buffers.insert(index.into(), memory);
        self
    }
}

/// Argument whose leaves are borrowed or donated to the execution.
#[derive(Debug, Default)]
pub struct ExecutionInput {
    pub buffers: BTreeMap<ShapeIndex, MaybeOwningDeviceMemory>,
}

impl ExecutionInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-leaf borrowed argument.
    pub fn borrowed(memory: DeviceMemory) -> Self {
        Self::new().with(ShapeIndex::root(), memory)
    }

    /// Single-leaf donated argument.
    pub fn donated(memory: OwnedDeviceMemory) -> Self {
        Self::new().with(ShapeIndex::root(), memory)
    }

    pub fn with(mut self, index: impl Into<ShapeIndex>, memory: impl Into<MaybeOwningDeviceMemory>) -> Self {
        self.buffers.insert(index.into(), memory.into());
        self
    }
}

/// One leaf of the result.
#[derive(Debug)]
pub enum OutputBuffer {
    /// Memory the caller now owns.
    Owned(OwnedDeviceMemory),
    /// Memory owned elsewhere (caller inputs, cached constants).
    Borrowed(DeviceMemory),
}

impl OutputBuffer {
    pub fn memory(&self) -> DeviceMemory {
        match self {
            OutputBuffer::Owned(owned) => owned.memory(),
            OutputBuffer::Borrowed(memory) => *memory,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, OutputBuffer::Owned(_))
    }
}

/// Result of one call.
#[derive(Debug, Default)]
pub struct ExecutionOutput {
    pub buffers: BTreeMap<ShapeIndex, OutputBuffer>,
    /// Output leaves whose memory is a caller input.
    pub aliased: Vec<ShapeIndex>,
    /// Donated inputs no output reused. Keep them alive until the device work of
    /// the call has completed; dropping them frees the memory.
    pub to_be_released: Vec<OwnedDeviceMemory>,
}

impl ExecutionOutput {
    pub fn memory(&self, index: &ShapeIndex) -> Option<DeviceMemory> {
        self.buffers.get(index).map(OutputBuffer::memory)
    }

    /// Memory of the root (non-tuple) result.
    pub fn root(&self) -> Option<DeviceMemory> {
        self.memory(&ShapeIndex::root())
    }

    pub fn is_aliased(&self, index: &ShapeIndex) -> bool {
        self.aliased.contains(index)
    }
}

/// The two argument shapes, unified for the allocation builder.
#[derive(Debug)]
pub(crate) enum Arguments<'a> {
    Shaped(&'a [&'a ShapedBuffer]),
    Inputs(&'a mut [ExecutionInput]),
}

impl Arguments<'_> {
    pub(crate) fn len(&self) -> usize {
        match self {
            Arguments::Shaped(shaped) => shaped.len(),
            Arguments::Inputs(inputs) => inputs.len(),
        }
    }

    pub(crate) fn leaf(&self, number: usize, index: &ShapeIndex) -> Option<DeviceMemory> {
        match self {
            Arguments::Shaped(shaped) => shaped.get(number)?.buffers.get(index).copied(),
            Arguments::Inputs(inputs) => inputs.get(number)?.buffers.get(index).map(MaybeOwningDeviceMemory::memory),
        }
    }

    pub(crate) fn is_donated(&self, number: usize, index: &ShapeIndex) -> bool {
        match self {
            Arguments::Shaped(_) => false,
            Arguments::Inputs(inputs) => inputs
                .get(number)
                .and_then(|input| input.buffers.get(index))
                .is_some_and(MaybeOwningDeviceMemory::is_owned),
        }
    }

    /// Move a donated leaf's ownership out of the arguments.
    pub(crate) fn take_donated(&mut self, number: usize, index: &ShapeIndex) -> Option<OwnedDeviceMemory> {
        match self {
            Arguments::Shaped(_) => None,
            Arguments::Inputs(inputs) => inputs.get_mut(number)?.buffers.get_mut(index)?.take_ownership(),
        }
    }

    /// Ownership of every donated leaf still held by the arguments.
    pub(crate) fn drain_donated(&mut self) -> Vec<OwnedDeviceMemory> {
        match self {
            Arguments::Shaped(_) => Vec::new(),
            Arguments::Inputs(inputs) => inputs
                .iter_mut()
                .flat_map(|input| input.buffers.values_mut())
                .filter_map(MaybeOwningDeviceMemory::take_ownership)
                .collect(),
        }
    }

    /// First pre-bound argument ordinal that differs from `ordinal`.
    pub(crate) fn foreign_ordinal(&self, ordinal: usize) -> Option<usize> {
        match self {
            Arguments::Shaped(shaped) => shaped.iter().map(|s| s.device_ordinal).find(|&o| o != ordinal),
            Arguments::Inputs(_) => None,
        }
    }
}
