//! Per-call binding of allocation slots to device memory.
//!
//! [`BufferAllocations`] maps every allocation index of the plan to a concrete
//! device address for one call. Slots are bound with this precedence:
//!
//! 1. output slots aliased to an input: the donated input itself, or a fresh
//!    buffer initialized with a device-side copy of a non-donated input
//!    (passthrough outputs excepted, they bind as the parameter slot they are);
//! 2. parameter slots: the caller's buffer for that parameter leaf, borrowed;
//! 3. constant slots: the address resolved in the module globals, borrowed;
//! 4. thread-local and zero-sized slots: a null handle;
//! 5. everything else: fresh memory from the call's allocator, owned by the call.
//!
//! Owned slots are freed when the bindings are dropped, unless result packaging
//! moved their ownership into the output first.

use std::collections::HashMap;
use std::sync::Arc;

use derive_more::Display;
use kiln_device::{Allocator, Device, DeviceMemory, OwnedDeviceMemory, StreamHandle, allocate_owned};
use snafu::{OptionExt, ResultExt, ensure};
use tracing::{debug, trace};

use crate::buffers::Arguments;
use crate::descriptor::ExecutableDescriptor;
use crate::error::{AllocationSnafu, ArgumentMismatchSnafu, InvalidDescriptorSnafu, Result};
use crate::globals::ModuleGlobals;
use crate::types::{AliasConfig, AliasKind, BufferAllocation, BufferSlice, ShapeIndex};

/// Where a slot's memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SlotSource {
    /// Caller argument, borrowed.
    #[display("parameter")]
    Parameter,
    /// Caller argument whose ownership was moved into the call.
    #[display("donated")]
    Donated,
    /// Resolved constant, borrowed from the module globals.
    #[display("constant")]
    Constant,
    /// Fresh memory owned by the call.
    #[display("temporary")]
    Temporary,
    /// No backing memory.
    #[display("null")]
    Null,
}

#[derive(Debug)]
struct Slot {
    memory: DeviceMemory,
    source: SlotSource,
    owned: Option<OwnedDeviceMemory>,
}

impl Slot {
    fn borrowed(memory: DeviceMemory, source: SlotSource) -> Self {
        Self { memory, source, owned: None }
    }

    fn owned(owned: OwnedDeviceMemory, source: SlotSource) -> Self {
        Self { memory: owned.memory(), source, owned: Some(owned) }
    }
}

/// Device-side copy initializing a may-alias output from its non-donated input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasCopy {
    pub dst: DeviceMemory,
    pub src: DeviceMemory,
}

/// Concrete memory for every allocation slot of one call.
#[derive(Debug)]
pub struct BufferAllocations {
    slots: Vec<Slot>,
    alias_copies: Vec<AliasCopy>,
    fresh: usize,
}

impl BufferAllocations {
    pub(crate) fn build(
        descriptor: &ExecutableDescriptor,
        arguments: &mut Arguments<'_>,
        globals: &ModuleGlobals,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Self> {
        let expected = descriptor.parameter_count();
        ensure!(
            arguments.len() == expected,
            ArgumentMismatchSnafu { reason: format!("expected {expected} arguments, got {}", arguments.len()) }
        );

        // Must-alias violations are caught before anything is allocated.
        let mut aliases: HashMap<usize, &AliasConfig> = HashMap::new();
        for (index, output) in descriptor.outputs() {
            let Some(alias) = &output.alias else { continue };
            let donated = arguments.is_donated(alias.parameter_number, &alias.parameter_index);
            ensure!(
                donated || alias.kind == AliasKind::MayAlias,
                ArgumentMismatchSnafu {
                    reason: format!(
                        "output {index} must alias param {} {} but that input was not donated",
                        alias.parameter_number, alias.parameter_index
                    )
                }
            );
            // A passthrough output is the parameter slot itself and never gets a buffer of its own.
            if !output.passthrough {
                aliases.insert(output.allocation_index, alias);
            }
        }

        let mut bindings =
            Self { slots: Vec::with_capacity(descriptor.allocations().len()), alias_copies: Vec::new(), fresh: 0 };
        for allocation in descriptor.allocations() {
            let slot = if allocation.is_thread_local {
                Slot::borrowed(DeviceMemory::NULL, SlotSource::Null)
            } else if let Some(alias) = aliases.get(&allocation.index) {
                bindings.bind_alias(allocation, alias, arguments, allocator)?
            } else if let Some(parameter) = &allocation.parameter {
                let input = argument(arguments, parameter.number, &parameter.shape_index, allocation)?;
                Slot::borrowed(input, SlotSource::Parameter)
            } else if allocation.is_constant {
                let memory = globals.address(allocation.index).context(InvalidDescriptorSnafu {
                    reason: format!("constant allocation {} has no resolved address", allocation.index),
                })?;
                Slot::borrowed(memory, SlotSource::Constant)
            } else if allocation.size == 0 {
                Slot::borrowed(DeviceMemory::NULL, SlotSource::Null)
            } else {
                Slot::owned(bindings.allocate(allocation, allocator)?, SlotSource::Temporary)
            };

            trace!(allocation = allocation.index, memory = %slot.memory, source = %slot.source, "slot bound");
            bindings.slots.push(slot);
        }

        debug!(
            slots = bindings.slots.len(),
            fresh = bindings.fresh,
            alias_copies = bindings.alias_copies.len(),
            allocator = allocator.name(),
            "buffer allocations built"
        );
        Ok(bindings)
    }

    fn bind_alias(
        &mut self,
        allocation: &BufferAllocation,
        alias: &AliasConfig,
        arguments: &mut Arguments<'_>,
        allocator: &Arc<dyn Allocator>,
    ) -> Result<Slot> {
        let input = argument(arguments, alias.parameter_number, &alias.parameter_index, allocation)?;
        if let Some(owned) = arguments.take_donated(alias.parameter_number, &alias.parameter_index) {
            return Ok(Slot::owned(owned, SlotSource::Donated));
        }

        let owned = self.allocate(allocation, allocator)?;
        self.alias_copies.push(AliasCopy { dst: owned.memory(), src: input });
        Ok(Slot::owned(owned, SlotSource::Temporary))
    }

    fn allocate(&mut self, allocation: &BufferAllocation, allocator: &Arc<dyn Allocator>) -> Result<OwnedDeviceMemory> {
        let owned = allocate_owned(allocator, allocation.size)
            .context(AllocationSnafu { allocation: allocation.index, size: allocation.size })?;
        self.fresh += 1;
        Ok(owned)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Memory bound to allocation `index`.
    pub fn memory(&self, index: usize) -> Option<DeviceMemory> {
        self.slots.get(index).map(|s| s.memory)
    }

    pub fn source(&self, index: usize) -> Option<SlotSource> {
        self.slots.get(index).map(|s| s.source)
    }

    /// Memory of every slot in allocation order.
    pub fn addresses(&self) -> Vec<DeviceMemory> {
        self.slots.iter().map(|s| s.memory).collect()
    }

    /// Number of allocator requests made while binding.
    pub fn fresh_allocations(&self) -> usize {
        self.fresh
    }

    pub fn alias_copies(&self) -> &[AliasCopy] {
        &self.alias_copies
    }

    /// Device memory of a slice of a slot.
    pub fn resolve(&self, slice: &BufferSlice) -> kiln_device::Result<DeviceMemory> {
        self.memory(slice.allocation).unwrap_or(DeviceMemory::NULL).slice(slice.offset, slice.size)
    }

    /// Enqueue the copies initializing may-alias outputs.
    pub(crate) fn enqueue_alias_copies(&self, device: &dyn Device, stream: StreamHandle) -> kiln_device::Result<()> {
        for copy in &self.alias_copies {
            trace!(dst = %copy.dst, src = %copy.src, "copying non-donated input into aliased output");
            device.copy(stream, copy.dst, copy.src)?;
        }
        Ok(())
    }

    /// Move the ownership of slot `index` out, e.g. into the result.
    pub(crate) fn take_owned(&mut self, index: usize) -> Option<OwnedDeviceMemory> {
        self.slots.get_mut(index)?.owned.take()
    }

    /// Number of slots whose memory will be freed when the bindings drop.
    pub fn owned_count(&self) -> usize {
        self.slots.iter().filter(|s| s.owned.is_some()).count()
    }
}

fn argument(
    arguments: &Arguments<'_>,
    number: usize,
    index: &ShapeIndex,
    allocation: &BufferAllocation,
) -> Result<DeviceMemory> {
    let memory = arguments.leaf(number, index).context(ArgumentMismatchSnafu {
        reason: format!("argument {number} has no buffer at {index}"),
    })?;
    ensure!(
        memory.size() == allocation.size,
        ArgumentMismatchSnafu {
            reason: format!(
                "argument {number} {index} is {} bytes, allocation {} expects {}",
                memory.size(),
                allocation.index,
                allocation.size
            )
        }
    );
    Ok(memory)
}
