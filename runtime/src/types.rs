//! Buffer-allocation plan, constants and output metadata.
//!
//! These types are produced by the compiler and consumed read-only by the
//! runtime. Allocation slots are identified by their position in the plan.

use std::fmt;

use derive_more::Display;
use smallvec::SmallVec;

/// Position of a leaf buffer inside a (possibly nested) tuple value.
///
/// The empty index is the root, i.e. a non-tuple value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeIndex(SmallVec<[usize; 4]>);

impl ShapeIndex {
    /// The root (non-tuple) position.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn new(indices: &[usize]) -> Self {
        Self(SmallVec::from_slice(indices))
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[usize]> for ShapeIndex {
    fn from(indices: &[usize]) -> Self {
        Self::new(indices)
    }
}

impl<const N: usize> From<[usize; N]> for ShapeIndex {
    fn from(indices: [usize; N]) -> Self {
        Self::new(&indices)
    }
}

impl fmt::Display for ShapeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, index) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{index}")?;
        }
        write!(f, "}}")
    }
}

/// Which caller argument leaf a parameter allocation binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
#[display("param {number} {shape_index}")]
pub struct ParameterSlot {
    pub number: usize,
    pub shape_index: ShapeIndex,
}

/// One logical memory slot of the compiled computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferAllocation {
    pub index: usize,
    pub size: usize,
    /// Set when the slot is bound to a caller argument.
    pub parameter: Option<ParameterSlot>,
    /// Slot holds a constant resolved through the module globals.
    pub is_constant: bool,
    /// Slot may hold (part of) the result.
    pub maybe_live_out: bool,
    /// Slot has no backing memory and is bound to a null handle.
    pub is_thread_local: bool,
}

impl BufferAllocation {
    /// Scratch or output memory allocated per call.
    pub fn temp(index: usize, size: usize) -> Self {
        Self { index, size, parameter: None, is_constant: false, maybe_live_out: false, is_thread_local: false }
    }

    pub fn parameter(index: usize, size: usize, number: usize, shape_index: impl Into<ShapeIndex>) -> Self {
        let parameter = Some(ParameterSlot { number, shape_index: shape_index.into() });
        Self { parameter, ..Self::temp(index, size) }
    }

    pub fn constant(index: usize, size: usize) -> Self {
        Self { is_constant: true, ..Self::temp(index, size) }
    }

    pub fn thread_local(index: usize) -> Self {
        Self { is_thread_local: true, ..Self::temp(index, 0) }
    }

    pub fn live_out(mut self) -> Self {
        self.maybe_live_out = true;
        self
    }

    pub fn is_parameter(&self) -> bool {
        self.parameter.is_some()
    }

    /// Whether the slot gets fresh memory from the allocator on each call.
    pub fn is_temp(&self) -> bool {
        !self.is_parameter() && !self.is_constant && !self.is_thread_local
    }
}

/// Where a constant's device storage comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConstantStorage {
    /// A global symbol of the loaded module; content (if any) is copied into it.
    #[default]
    Embedded,
    /// Freshly allocated device memory initialized with the content.
    Allocated,
}

/// A constant the executable needs resolved on each device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstantInfo {
    pub symbol_name: String,
    pub content: Vec<u8>,
    /// Allocation slot backed by this constant, if any.
    pub allocation_index: Option<usize>,
    pub storage: ConstantStorage,
}

impl ConstantInfo {
    pub fn embedded(symbol_name: impl Into<String>, content: Vec<u8>, allocation_index: Option<usize>) -> Self {
        Self { symbol_name: symbol_name.into(), content, allocation_index, storage: ConstantStorage::Embedded }
    }

    pub fn allocated(symbol_name: impl Into<String>, content: Vec<u8>, allocation_index: Option<usize>) -> Self {
        Self { storage: ConstantStorage::Allocated, ..Self::embedded(symbol_name, content, allocation_index) }
    }
}

/// Whether an output is required to reuse its aliased input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum AliasKind {
    /// Reuse the input when donated, otherwise write into a copy of it.
    #[display("may-alias")]
    MayAlias,
    /// The input must be donated.
    #[display("must-alias")]
    MustAlias,
}

/// Input leaf an output is allowed to share memory with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AliasConfig {
    pub parameter_number: usize,
    pub parameter_index: ShapeIndex,
    pub kind: AliasKind,
}

/// Where one output leaf lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub allocation_index: usize,
    /// The output is a parameter returned unchanged.
    pub passthrough: bool,
    pub alias: Option<AliasConfig>,
}

impl OutputInfo {
    pub fn new(allocation_index: usize) -> Self {
        Self { allocation_index, passthrough: false, alias: None }
    }

    pub fn passthrough(allocation_index: usize) -> Self {
        Self { passthrough: true, ..Self::new(allocation_index) }
    }

    pub fn aliasing(
        mut self,
        parameter_number: usize,
        parameter_index: impl Into<ShapeIndex>,
        kind: AliasKind,
    ) -> Self {
        self.alias = Some(AliasConfig { parameter_number, parameter_index: parameter_index.into(), kind });
        self
    }
}

/// Byte range of an allocation slot used by a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("alloc{allocation}[{offset}..+{size}]")]
pub struct BufferSlice {
    pub allocation: usize,
    pub offset: usize,
    pub size: usize,
}

impl BufferSlice {
    pub fn new(allocation: usize, offset: usize, size: usize) -> Self {
        Self { allocation, offset, size }
    }

    /// The whole of `allocation`.
    pub fn whole(allocation: &BufferAllocation) -> Self {
        Self::new(allocation.index, 0, allocation.size)
    }
}
