//! Immutable compiled-artifact bundle.
//!
//! An [`ExecutableDescriptor`] is everything the compiler hands over: the target
//! hardware revision, the device binary and/or program text, the execution body
//! (a dependency-scheduled list of work units *or* one opaque program), the
//! buffer-allocation plan, constants and output metadata.
//!
//! # Design
//!
//! The descriptor is built once through a fallible `bon` builder that validates
//! every cross reference (allocation indices, aliases, schedule order), then moved
//! into an [`Executable`](crate::Executable). It has no mutators, so everything
//! downstream may assume the invariants hold.

use std::collections::{BTreeMap, HashSet};

use bon::bon;
use kiln_device::DeviceVersion;
use snafu::ensure;

use crate::error::{InvalidDescriptorSnafu, Result};
use crate::schedule::Schedule;
use crate::types::{BufferAllocation, ConstantInfo, OutputInfo, ParameterSlot, ShapeIndex};

/// A precompiled whole-program blob run by one device-level invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueProgram {
    pub blob: Vec<u8>,
    pub entry: String,
}

impl OpaqueProgram {
    pub fn new(blob: Vec<u8>, entry: impl Into<String>) -> Self {
        Self { blob, entry: entry.into() }
    }
}

/// How the executable runs: exactly one strategy per descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionBody {
    Scheduled(Schedule),
    Opaque(OpaqueProgram),
}

/// Compiled executable, validated and immutable.
#[derive(Debug, Clone)]
pub struct ExecutableDescriptor {
    module_name: String,
    target: DeviceVersion,
    binary: Vec<u8>,
    text: String,
    body: ExecutionBody,
    allocations: Vec<BufferAllocation>,
    constants: Vec<ConstantInfo>,
    outputs: BTreeMap<ShapeIndex, OutputInfo>,
    verbose_buffer_assignment: String,
}

#[bon]
impl ExecutableDescriptor {
    /// Build and validate a descriptor.
    ///
    /// Exactly one of `schedule` and `program` must be set.
    #[builder]
    pub fn new(
        #[builder(into)] module_name: String,
        target: DeviceVersion,
        #[builder(default)] binary: Vec<u8>,
        #[builder(default, into)] text: String,
        schedule: Option<Schedule>,
        program: Option<OpaqueProgram>,
        #[builder(default)] allocations: Vec<BufferAllocation>,
        #[builder(default)] constants: Vec<ConstantInfo>,
        #[builder(default)] outputs: BTreeMap<ShapeIndex, OutputInfo>,
        #[builder(default, into)] verbose_buffer_assignment: String,
    ) -> Result<Self> {
        let body = match (schedule, program) {
            (Some(schedule), None) => ExecutionBody::Scheduled(schedule),
            (None, Some(program)) => ExecutionBody::Opaque(program),
            (Some(_), Some(_)) => {
                return InvalidDescriptorSnafu { reason: "both a schedule and an opaque program were given" }.fail();
            }
            (None, None) => {
                return InvalidDescriptorSnafu { reason: "neither a schedule nor an opaque program was given" }.fail();
            }
        };

        let descriptor = Self {
            module_name,
            target,
            binary,
            text,
            body,
            allocations,
            constants,
            outputs,
            verbose_buffer_assignment,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

impl ExecutableDescriptor {
    fn validate(&self) -> Result<()> {
        for (position, allocation) in self.allocations.iter().enumerate() {
            ensure!(
                allocation.index == position,
                InvalidDescriptorSnafu {
                    reason: format!("allocation at position {position} has index {}", allocation.index)
                }
            );
            let kinds = [allocation.is_parameter(), allocation.is_constant, allocation.is_thread_local];
            ensure!(
                kinds.iter().filter(|&&k| k).count() <= 1,
                InvalidDescriptorSnafu {
                    reason: format!("allocation {position} mixes parameter, constant and thread-local roles")
                }
            );
        }

        let mut parameter_slots = HashSet::new();
        for slot in self.allocations.iter().filter_map(|a| a.parameter.as_ref()) {
            ensure!(
                parameter_slots.insert(slot.clone()),
                InvalidDescriptorSnafu { reason: format!("{slot} is bound by more than one allocation") }
            );
        }

        for constant in &self.constants {
            if let Some(index) = constant.allocation_index {
                ensure!(
                    self.allocations.get(index).is_some_and(|a| a.is_constant),
                    InvalidDescriptorSnafu {
                        reason: format!("constant '{}' targets non-constant allocation {index}", constant.symbol_name)
                    }
                );
            }
        }

        let backed: HashSet<usize> = self.constants.iter().filter_map(|c| c.allocation_index).collect();
        if let Some(orphan) = self.allocations.iter().find(|a| a.is_constant && !backed.contains(&a.index)) {
            return InvalidDescriptorSnafu { reason: format!("constant allocation {} has no constant", orphan.index) }
                .fail();
        }

        let mut aliased_inputs = HashSet::new();
        for (index, output) in &self.outputs {
            let allocation = self.allocations.get(output.allocation_index);
            ensure!(
                allocation.is_some(),
                InvalidDescriptorSnafu {
                    reason: format!("output {index} references unknown allocation {}", output.allocation_index)
                }
            );
            ensure!(
                !output.passthrough || allocation.is_some_and(BufferAllocation::is_parameter),
                InvalidDescriptorSnafu { reason: format!("passthrough output {index} is not bound to a parameter") }
            );
            if let Some(alias) = &output.alias {
                let slot = ParameterSlot { number: alias.parameter_number, shape_index: alias.parameter_index.clone() };
                ensure!(
                    parameter_slots.contains(&slot),
                    InvalidDescriptorSnafu { reason: format!("output {index} aliases unknown {slot}") }
                );
                ensure!(
                    aliased_inputs.insert(slot.clone()),
                    InvalidDescriptorSnafu { reason: format!("{slot} is aliased by more than one output") }
                );
            }
        }

        match &self.body {
            ExecutionBody::Scheduled(schedule) => schedule.validate(&self.allocations),
            ExecutionBody::Opaque(program) => {
                ensure!(!program.blob.is_empty(), InvalidDescriptorSnafu { reason: "opaque program blob is empty" });
                Ok(())
            }
        }
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Hardware revision the executable was compiled for.
    pub fn target(&self) -> DeviceVersion {
        self.target
    }

    pub fn binary(&self) -> &[u8] {
        &self.binary
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn body(&self) -> &ExecutionBody {
        &self.body
    }

    pub fn allocations(&self) -> &[BufferAllocation] {
        &self.allocations
    }

    pub fn constants(&self) -> &[ConstantInfo] {
        &self.constants
    }

    pub fn outputs(&self) -> &BTreeMap<ShapeIndex, OutputInfo> {
        &self.outputs
    }

    pub fn verbose_buffer_assignment(&self) -> &str {
        &self.verbose_buffer_assignment
    }

    /// Number of arguments a call must supply.
    pub fn parameter_count(&self) -> usize {
        self.allocations.iter().filter_map(|a| a.parameter.as_ref()).map(|p| p.number + 1).max().unwrap_or(0)
    }

    /// Whether there is code or constants to place on the device.
    pub fn needs_module(&self) -> bool {
        !self.binary.is_empty() || !self.text.is_empty() || !self.constants.is_empty()
    }
}
