//! The device capability consumed by the runtime.
//!
//! [`Device`] is everything the runtime needs from a driver: streams and events,
//! asynchronous launches, module loading and symbol lookup, raw memory
//! management and a full-device barrier. It is object safe so executables can
//! be driven against real hardware or against the in-memory [`HostDevice`].
//!
//! [`HostDevice`]: crate::host::HostDevice

use std::fmt;

use derive_more::Display;

use crate::error::Result;
use crate::key::{DeviceKey, DeviceVersion};
use crate::memory::DeviceMemory;
use crate::stream::{Event, LaunchDims, StreamHandle};

/// Handle to a module loaded into a device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("module#{_0}")]
pub struct ModuleHandle(pub u64);

/// Code to load into a device context.
#[derive(Debug, Clone, Copy)]
pub struct ModuleImage<'a> {
    pub name: &'a str,
    /// Machine code for the target (cubin, HSA code object). May be empty.
    pub binary: &'a [u8],
    /// Assembly text (PTX). May be empty.
    pub text: &'a str,
}

impl ModuleImage<'_> {
    pub fn is_empty(&self) -> bool {
        self.binary.is_empty() && self.text.is_empty()
    }
}

/// One physical accelerator and its stream/memory APIs.
///
/// All enqueueing methods return once the work is queued; completion is only
/// observable through events or [`Device::synchronize`].
pub trait Device: Send + Sync + fmt::Debug {
    fn key(&self) -> DeviceKey;

    /// Hardware revision of this device.
    fn version(&self) -> DeviceVersion;

    /// The stream callers submit to by default. Always exists.
    fn primary_stream(&self) -> StreamHandle;

    /// Borrow an additional stream. Pair with [`Device::release_stream`].
    fn acquire_stream(&self) -> Result<StreamHandle>;

    fn release_stream(&self, stream: StreamHandle);

    /// Allocate device memory that outlives any single stream.
    fn allocate(&self, size: usize) -> Result<DeviceMemory>;

    fn deallocate(&self, memory: DeviceMemory);

    /// Free `memory` once all work enqueued on `stream` so far has completed.
    fn deallocate_on(&self, stream: StreamHandle, memory: DeviceMemory) -> Result<()>;

    fn load_module(&self, image: &ModuleImage<'_>) -> Result<ModuleHandle>;

    fn unload_module(&self, module: ModuleHandle);

    /// Address of a global symbol inside a loaded module.
    fn symbol(&self, module: ModuleHandle, name: &str) -> Result<DeviceMemory>;

    /// Enqueue a kernel launch.
    fn launch_kernel(
        &self,
        stream: StreamHandle,
        module: Option<ModuleHandle>,
        kernel: &str,
        dims: &LaunchDims,
        args: &[DeviceMemory],
    ) -> Result<()>;

    /// Enqueue a whole-program invocation over the given buffer table.
    fn run_program(&self, stream: StreamHandle, program: &[u8], buffers: &[DeviceMemory]) -> Result<()>;

    /// Enqueue a device-to-device copy. Sizes must match.
    fn copy(&self, stream: StreamHandle, dst: DeviceMemory, src: DeviceMemory) -> Result<()>;

    /// Enqueue filling `dst` with `value`.
    fn memset(&self, stream: StreamHandle, dst: DeviceMemory, value: u8) -> Result<()>;

    /// Enqueue a host-to-device copy. `data` is captured at call time.
    fn copy_from_host(&self, stream: StreamHandle, dst: DeviceMemory, data: &[u8]) -> Result<()>;

    /// Record an event after all work currently enqueued on `stream`.
    fn record_event(&self, stream: StreamHandle) -> Result<Event>;

    /// Make later work on `stream` wait for `event`.
    fn wait_event(&self, stream: StreamHandle, event: &Event) -> Result<()>;

    /// Block the host until all work on every stream has completed.
    fn synchronize(&self) -> Result<()>;
}
