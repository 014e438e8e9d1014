//! Shared fixtures for runtime tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_device::{
    Allocator, Device, DeviceAllocator, DeviceMemory, DeviceVersion, HostDevice, OwnedDeviceMemory, allocate_owned,
};

use crate::{
    AliasKind, BlockingPolicy, BufferAllocation, BufferSlice, ExecutableDescriptor, OutputInfo, RunOptions, Schedule,
    ShapeIndex, WorkUnit,
};

pub const HOST_V1: DeviceVersion = DeviceVersion::Host { revision: 1 };

/// Host device, an allocator on it, and the run options tying them together.
pub struct Fixture {
    pub host: Arc<HostDevice>,
    pub device: Arc<dyn Device>,
    pub allocator: Arc<DeviceAllocator>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_device(HostDevice::new(0, HOST_V1))
    }

    pub fn with_device(host: HostDevice) -> Self {
        Self::build(host, |allocator| allocator)
    }

    /// Allocator that orders frees on the primary stream.
    pub fn with_async_allocator() -> Self {
        Self::build(HostDevice::new(0, HOST_V1), |allocator| allocator.with_async_deallocation(true))
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(HostDevice::new(0, HOST_V1), |allocator| allocator.with_capacity(capacity))
    }

    fn build(host: HostDevice, configure: impl FnOnce(DeviceAllocator) -> DeviceAllocator) -> Self {
        let host = Arc::new(host);
        register_kernels(&host);
        let device: Arc<dyn Device> = host.clone();
        let allocator = Arc::new(configure(DeviceAllocator::new(Arc::clone(&device))));
        Self { host, device, allocator }
    }

    pub fn options(&self) -> RunOptions {
        RunOptions::builder().device(Arc::clone(&self.device)).allocator(self.dyn_allocator()).build()
    }

    pub fn blocking_options(&self) -> RunOptions {
        RunOptions::builder()
            .device(Arc::clone(&self.device))
            .allocator(self.dyn_allocator())
            .blocking(BlockingPolicy::BlockHostUntilDone)
            .build()
    }

    pub fn dyn_allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    /// Device buffer owned by the test, initialized with `data`.
    pub fn buffer(&self, data: &[u8]) -> OwnedDeviceMemory {
        let owned = allocate_owned(&self.dyn_allocator(), data.len()).unwrap();
        self.host.write(owned.memory(), data).unwrap();
        owned
    }

    pub fn read(&self, memory: DeviceMemory) -> Vec<u8> {
        self.host.read(memory).unwrap()
    }
}

/// `double`: arg1[i] = arg0[i] * 2. `add_one`: arg1[i] = arg0[i] + 1.
fn register_kernels(host: &HostDevice) {
    host.register_kernel("double", |args| {
        let data: Vec<u8> = args.read(0)?.iter().map(|v| v.wrapping_mul(2)).collect();
        args.write(1, &data)
    });
    host.register_kernel("add_one", |args| {
        let data: Vec<u8> = args.read(0)?.iter().map(|v| v.wrapping_add(1)).collect();
        args.write(1, &data)
    });
}

/// Two-unit, two-stream executable over one 4-byte input and one 4-byte output.
///
/// `double` runs on stream 0 from the input into the output, then `add_one`
/// runs in place on stream 1 after it. An input of `[1, 2, 3, 4]` yields
/// `[3, 5, 7, 9]`.
pub fn two_stream_descriptor(alias: Option<AliasKind>) -> ExecutableDescriptor {
    let input = BufferAllocation::parameter(0, 4, 0, ShapeIndex::root());
    let output = BufferAllocation::temp(1, 4).live_out();
    let units = vec![
        WorkUnit::kernel(1, "double", vec![BufferSlice::whole(&input), BufferSlice::whole(&output)]),
        WorkUnit::kernel(2, "add_one", vec![BufferSlice::whole(&output), BufferSlice::whole(&output)])
            .on_stream(1)
            .after(&[1]),
    ];

    let mut info = OutputInfo::new(1);
    if let Some(kind) = alias {
        info = info.aliasing(0, ShapeIndex::root(), kind);
    }

    ExecutableDescriptor::builder()
        .module_name("two_stream")
        .target(HOST_V1)
        .schedule(Schedule::new(units))
        .allocations(vec![input, output])
        .outputs(BTreeMap::from([(ShapeIndex::root(), info)]))
        .build()
        .unwrap()
}
