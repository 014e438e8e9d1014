//! Dependency-scheduled device work.
//!
//! A [`Schedule`] is an ordered list of [`WorkUnit`]s. Each unit names the
//! logical stream it runs on and the units it depends on; the order of the list
//! is a valid topological order (dependencies always come first).

use std::collections::{BTreeSet, HashMap, HashSet};

use derive_more::Display;
use kiln_device::LaunchDims;
use smallvec::SmallVec;
use snafu::ensure;

use crate::error::{InvalidDescriptorSnafu, Result};
use crate::types::{BufferAllocation, BufferSlice};

/// Identifier of a work unit, unique within a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("unit#{_0}")]
pub struct WorkUnitId(pub u32);

/// Logical stream of a schedule. Stream 0 is the caller's stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("s{_0}")]
pub struct StreamId(pub u32);

impl StreamId {
    pub const PRIMARY: StreamId = StreamId(0);

    pub fn is_primary(&self) -> bool {
        *self == Self::PRIMARY
    }
}

/// What a work unit does on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkKind {
    Kernel { name: String, args: Vec<BufferSlice>, dims: LaunchDims },
    Copy { src: BufferSlice, dst: BufferSlice },
    Memset { dst: BufferSlice, value: u8 },
}

impl WorkKind {
    /// Every slice the unit touches.
    pub fn slices(&self) -> SmallVec<[BufferSlice; 4]> {
        match self {
            WorkKind::Kernel { args, .. } => args.iter().copied().collect(),
            WorkKind::Copy { src, dst } => SmallVec::from_slice(&[*src, *dst]),
            WorkKind::Memset { dst, .. } => SmallVec::from_slice(&[*dst]),
        }
    }
}

/// One unit of device work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub id: WorkUnitId,
    pub stream: StreamId,
    pub depends_on: SmallVec<[WorkUnitId; 4]>,
    pub kind: WorkKind,
}

impl WorkUnit {
    pub fn kernel(id: u32, name: impl Into<String>, args: Vec<BufferSlice>) -> Self {
        Self::primary(id, WorkKind::Kernel { name: name.into(), args, dims: LaunchDims::default() })
    }

    pub fn copy(id: u32, src: BufferSlice, dst: BufferSlice) -> Self {
        Self::primary(id, WorkKind::Copy { src, dst })
    }

    pub fn memset(id: u32, dst: BufferSlice, value: u8) -> Self {
        Self::primary(id, WorkKind::Memset { dst, value })
    }

    fn primary(id: u32, kind: WorkKind) -> Self {
        Self { id: WorkUnitId(id), stream: StreamId::PRIMARY, depends_on: SmallVec::new(), kind }
    }

    pub fn on_stream(mut self, stream: u32) -> Self {
        self.stream = StreamId(stream);
        self
    }

    pub fn after(mut self, deps: &[u32]) -> Self {
        self.depends_on.extend(deps.iter().map(|&d| WorkUnitId(d)));
        self
    }

    pub fn with_dims(mut self, launch: LaunchDims) -> Self {
        if let WorkKind::Kernel { dims, .. } = &mut self.kind {
            *dims = launch;
        }
        self
    }

    /// Human-readable name used in logs and errors.
    pub fn label(&self) -> String {
        match &self.kind {
            WorkKind::Kernel { name, .. } => format!("{} (kernel '{name}' on {})", self.id, self.stream),
            WorkKind::Copy { .. } => format!("{} (copy on {})", self.id, self.stream),
            WorkKind::Memset { .. } => format!("{} (memset on {})", self.id, self.stream),
        }
    }
}

/// Ordered work units with declared dependencies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    units: Vec<WorkUnit>,
}

impl Schedule {
    pub fn new(units: Vec<WorkUnit>) -> Self {
        Self { units }
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Units that at least one later unit depends on.
    pub fn depended_on(&self) -> HashSet<WorkUnitId> {
        self.units.iter().flat_map(|u| u.depends_on.iter().copied()).collect()
    }

    /// Distinct logical streams used, in ascending order.
    pub fn stream_ids(&self) -> BTreeSet<StreamId> {
        self.units.iter().map(|u| u.stream).collect()
    }

    /// Check ids, dependency order and slice bounds against the allocation plan.
    pub fn validate(&self, allocations: &[BufferAllocation]) -> Result<()> {
        let mut seen: HashMap<WorkUnitId, usize> = HashMap::with_capacity(self.units.len());
        for (position, unit) in self.units.iter().enumerate() {
            for dep in &unit.depends_on {
                ensure!(
                    seen.contains_key(dep),
                    InvalidDescriptorSnafu {
                        reason: format!("{} depends on {dep}, which does not precede it in the schedule", unit.id)
                    }
                );
            }

            for slice in unit.kind.slices() {
                let allocation = allocations.get(slice.allocation);
                let fits = allocation
                    .is_some_and(|a| slice.offset.checked_add(slice.size).is_some_and(|end| end <= a.size));
                ensure!(
                    fits,
                    InvalidDescriptorSnafu { reason: format!("{} references out-of-bounds {slice}", unit.id) }
                );
            }

            if let WorkKind::Copy { src, dst } = &unit.kind {
                ensure!(
                    src.size == dst.size,
                    InvalidDescriptorSnafu { reason: format!("{} copies {src} into differently sized {dst}", unit.id) }
                );
            }

            ensure!(
                seen.insert(unit.id, position).is_none(),
                InvalidDescriptorSnafu { reason: format!("duplicate work unit id {}", unit.id) }
            );
        }
        Ok(())
    }
}
