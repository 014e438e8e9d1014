//! Executable facade.
//!
//! [`Executable`] owns a validated descriptor and the per-device globals cache,
//! and runs one call as:
//!
//! 1. compatibility check (no allocation or device I/O before it passes);
//! 2. module globals resolution for the target device (cached);
//! 3. slot binding through [`BufferAllocations`];
//! 4. may-alias input copies, then the body's [`ExecutionStrategy`];
//! 5. result packaging, after which unreferenced temporaries are freed.
//!
//! Frees are ordered after the call's device work whether or not it succeeded:
//! a failed blocking call still waits for launched work, and a call on a
//! non-primary stream joins that stream into the primary one, where deferred
//! frees are enqueued.
//!
//! # Thread Safety
//!
//! `Executable` is `Send + Sync`. The globals cache is the only shared mutable
//! state; everything else is per call.

use std::sync::Arc;
use std::time::Instant;

use kiln_device::{Device, DeviceKey, DeviceMemory, StreamHandle};
use snafu::ResultExt;
use tracing::{debug, warn};

use crate::allocations::{BufferAllocations, SlotSource};
use crate::buffers::{Arguments, ExecutionInput, ExecutionOutput, OutputBuffer, ShapedBuffer};
use crate::compatibility;
use crate::descriptor::ExecutableDescriptor;
use crate::engine::{ExecutionStrategy, RunContext};
use crate::error::{ArgumentMismatchSnafu, ExecutionSnafu, Result};
use crate::globals::GlobalsCache;
use crate::options::RunOptions;
use crate::profile::ExecutionProfile;
use crate::types::{BufferAllocation, ConstantInfo, OutputInfo, ShapeIndex};

/// A loaded, runnable compiled computation.
#[derive(Debug)]
pub struct Executable {
    descriptor: ExecutableDescriptor,
    globals: GlobalsCache,
}

impl Executable {
    pub fn new(descriptor: ExecutableDescriptor) -> Self {
        Self { descriptor, globals: GlobalsCache::new() }
    }

    /// Run with donatable inputs.
    ///
    /// Donated leaves move into the call: outputs aliased to them take them over,
    /// and the rest come back in [`ExecutionOutput::to_be_released`].
    #[tracing::instrument(skip_all, fields(module = self.descriptor.module_name(), device = %options.device().key()))]
    pub fn execute(
        &self,
        options: &RunOptions,
        mut inputs: Vec<ExecutionInput>,
        profile: Option<&mut ExecutionProfile>,
    ) -> Result<ExecutionOutput> {
        self.execute_impl(options, Arguments::Inputs(&mut inputs), profile)
    }

    /// Run with pre-bound arguments. No ownership is transferred in.
    #[tracing::instrument(skip_all, fields(module = self.descriptor.module_name(), device = %options.device().key()))]
    pub fn execute_shaped(
        &self,
        options: &RunOptions,
        arguments: &[&ShapedBuffer],
        profile: Option<&mut ExecutionProfile>,
    ) -> Result<ExecutionOutput> {
        self.execute_impl(options, Arguments::Shaped(arguments), profile)
    }

    fn execute_impl(
        &self,
        options: &RunOptions,
        mut arguments: Arguments<'_>,
        mut profile: Option<&mut ExecutionProfile>,
    ) -> Result<ExecutionOutput> {
        let started = Instant::now();
        let device = options.device();
        compatibility::check(self.descriptor.target(), device.as_ref())?;

        let key = device.key();
        if let Some(ordinal) = arguments.foreign_ordinal(key.ordinal()) {
            let reason = format!("argument bound to device ordinal {ordinal}, running on {key}");
            return ArgumentMismatchSnafu { reason }.fail();
        }

        let stream = options.stream();
        let cached = self.globals.contains(key);
        let globals = self.globals.resolve(&self.descriptor, device, stream)?;
        let mut allocations =
            BufferAllocations::build(&self.descriptor, &mut arguments, &globals, options.allocator())?;

        let blocking = options.effective_blocking();
        if blocking && !options.blocking().is_blocking() {
            warn!(
                allocator = options.allocator().name(),
                "allocator cannot defer frees, blocking until the call completes"
            );
        }

        let mut ctx =
            RunContext { device, stream, module: globals.module(), blocking, profile: profile.as_deref_mut() };
        let ran = allocations
            .enqueue_alias_copies(device.as_ref(), stream)
            .context(ExecutionSnafu { unit: "alias copies" })
            .and_then(|()| self.descriptor.body().strategy().run(&allocations, &mut ctx));
        settle(device, stream, blocking, ran.is_err());
        ran?;

        let output = self.package(&mut allocations, &mut arguments);
        debug!(
            outputs = output.buffers.len(),
            aliased = output.aliased.len(),
            to_be_released = output.to_be_released.len(),
            freed = allocations.owned_count(),
            "call complete"
        );

        if let Some(profile) = profile {
            profile.total = started.elapsed();
            profile.fresh_allocations = allocations.fresh_allocations();
            profile.globals_cached = cached;
        }
        drop(allocations);
        Ok(output)
    }

    fn package(&self, allocations: &mut BufferAllocations, arguments: &mut Arguments<'_>) -> ExecutionOutput {
        let mut output = ExecutionOutput::default();
        for (index, info) in self.descriptor.outputs() {
            let slot = info.allocation_index;
            let memory = allocations.memory(slot).unwrap_or(DeviceMemory::NULL);
            let source = allocations.source(slot);

            let buffer = match source {
                Some(SlotSource::Donated | SlotSource::Temporary) => {
                    allocations.take_owned(slot).map(OutputBuffer::Owned)
                }
                // A donated input returned without an alias still passes its ownership to the caller.
                Some(SlotSource::Parameter) => self
                    .descriptor
                    .allocations()
                    .get(slot)
                    .and_then(|a| a.parameter.as_ref())
                    .and_then(|p| arguments.take_donated(p.number, &p.shape_index))
                    .map(OutputBuffer::Owned),
                _ => None,
            }
            .unwrap_or(OutputBuffer::Borrowed(memory));

            if info.passthrough || matches!(source, Some(SlotSource::Parameter | SlotSource::Donated)) {
                output.aliased.push(index.clone());
            }
            output.buffers.insert(index.clone(), buffer);
        }

        output.to_be_released = arguments.drain_donated();
        output
    }

    pub fn descriptor(&self) -> &ExecutableDescriptor {
        &self.descriptor
    }

    pub fn module_name(&self) -> &str {
        self.descriptor.module_name()
    }

    pub fn text(&self) -> &str {
        self.descriptor.text()
    }

    pub fn binary(&self) -> &[u8] {
        self.descriptor.binary()
    }

    pub fn allocations(&self) -> &[BufferAllocation] {
        self.descriptor.allocations()
    }

    pub fn constants(&self) -> &[ConstantInfo] {
        self.descriptor.constants()
    }

    pub fn output_info(&self) -> impl Iterator<Item = (&ShapeIndex, &OutputInfo)> {
        self.descriptor.outputs().iter()
    }

    pub fn verbose_buffer_assignment(&self) -> &str {
        self.descriptor.verbose_buffer_assignment()
    }

    /// Size of the device binary plus the constant allocations it carries.
    ///
    /// `None` when only program text is present: the driver compiles it at load
    /// time and the size is not known ahead of it.
    pub fn size_of_generated_code(&self) -> Option<usize> {
        if self.binary().is_empty() && !self.text().is_empty() {
            return None;
        }

        let allocations = self.allocations();
        let constants: usize = self
            .constants()
            .iter()
            .filter_map(|c| c.allocation_index)
            .filter_map(|index| allocations.get(index))
            .map(|a| a.size)
            .sum();
        Some(self.binary().len() + constants)
    }

    /// Whether module globals were already resolved for `device`.
    pub fn is_loaded_on(&self, device: DeviceKey) -> bool {
        self.globals.contains(device)
    }
}

/// Order the frees that follow a call after the call's device work.
///
/// Stream-ordered frees go to the device's primary stream, so a call running on
/// another stream joins that stream into the primary one. A failed blocking call
/// never reached its synchronization and waits for whatever was launched.
fn settle(device: &Arc<dyn Device>, stream: StreamHandle, blocking: bool, failed: bool) {
    if blocking && failed {
        if let Err(e) = device.synchronize() {
            warn!(error = %e, "synchronization after a failed call failed");
        }
        return;
    }

    let primary = device.primary_stream();
    if blocking || stream == primary {
        return;
    }
    let joined = device.record_event(stream).and_then(|event| device.wait_event(primary, &event));
    if let Err(e) = joined {
        warn!(error = %e, %stream, "could not order frees after the call's stream");
    }
}
