//! Runtime for precompiled accelerator executables.
//!
//! Takes a computation the compiler already lowered to either a
//! dependency-scheduled list of device work units or one opaque program blob,
//! and runs it: binds logical allocation slots to device memory, launches the
//! work across one or more streams honoring declared dependencies, and returns
//! result buffers with explicit ownership.
//!
//! # Call flow
//!
//! `Executable::execute` checks device compatibility, resolves the per-device
//! module globals (loaded once per device), builds the slot bindings, hands them
//! to the execution strategy matching the descriptor, then packages outputs.
//!
//! # Devices
//!
//! All device access goes through [`kiln_device::Device`]; tests drive the
//! runtime against [`kiln_device::HostDevice`].

pub mod allocations;
pub mod buffers;
pub mod compatibility;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod executable;
pub mod globals;
pub mod options;
pub mod profile;
pub mod schedule;
pub mod types;

#[cfg(test)]
pub mod test;

pub use allocations::{AliasCopy, BufferAllocations, SlotSource};
pub use buffers::{ExecutionInput, ExecutionOutput, OutputBuffer, ShapedBuffer};
pub use descriptor::{ExecutableDescriptor, ExecutionBody, OpaqueProgram};
pub use engine::{ExecutionStrategy, RunContext};
pub use error::*;
pub use executable::Executable;
pub use globals::{GlobalsCache, ModuleGlobals};
pub use options::{BlockingPolicy, RunOptions};
pub use profile::{ExecutionProfile, UnitTiming};
pub use schedule::{Schedule, StreamId, WorkKind, WorkUnit, WorkUnitId};
pub use types::{
    AliasConfig, AliasKind, BufferAllocation, BufferSlice, ConstantInfo, ConstantStorage, OutputInfo, ParameterSlot,
    ShapeIndex,
};
