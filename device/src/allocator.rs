use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{trace, warn};

use crate::device::Device;
use crate::error::{OutOfMemorySnafu, Result};
use crate::memory::{DeviceMemory, OwnedDeviceMemory};

/// Source of call-scoped device memory (temporaries and outputs).
pub trait Allocator: Send + Sync + fmt::Debug {
    fn alloc(&self, size: usize) -> Result<DeviceMemory>;

    fn free(&self, memory: DeviceMemory);

    /// Whether `free` may run before device work touching the memory completes.
    ///
    /// Allocators that order deallocation on the device stream return `true`;
    /// everything else forces executions to block the host until work is done.
    fn allows_asynchronous_deallocation(&self) -> bool {
        false
    }

    fn name(&self) -> &str;
}

/// Allocate `size` bytes owned by the returned handle.
pub fn allocate_owned(allocator: &Arc<dyn Allocator>, size: usize) -> Result<OwnedDeviceMemory> {
    let memory = allocator.alloc(size)?;
    Ok(OwnedDeviceMemory::new(memory, Arc::clone(allocator)))
}

/// Allocation counters, readable while the allocator is in use.
#[derive(Debug, Default)]
pub struct AllocatorStats {
    allocations: AtomicU64,
    frees: AtomicU64,
    failed: AtomicU64,
    bytes_in_use: AtomicUsize,
}

impl AllocatorStats {
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Acquire)
    }

    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use.load(Ordering::Acquire)
    }

    /// Total number of `alloc` calls, successful or not.
    pub fn requests(&self) -> u64 {
        self.allocations() + self.failed()
    }
}

/// Allocator carving memory out of a device, with an optional byte budget.
#[derive(Debug)]
pub struct DeviceAllocator {
    device: Arc<dyn Device>,
    capacity: Option<usize>,
    async_deallocation: bool,
    stats: AllocatorStats,
    name: String,
}

impl DeviceAllocator {
    pub fn new(device: Arc<dyn Device>) -> Self {
        let name = format!("{}", device.key());
        Self { device, capacity: None, async_deallocation: false, stats: AllocatorStats::default(), name }
    }

    /// Limit the bytes this allocator may hand out at once.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Order frees behind the work already enqueued on the device's primary stream.
    pub fn with_async_deallocation(mut self, enabled: bool) -> Self {
        self.async_deallocation = enabled;
        self
    }

    pub fn stats(&self) -> &AllocatorStats {
        &self.stats
    }
}

impl Allocator for DeviceAllocator {
    fn alloc(&self, size: usize) -> Result<DeviceMemory> {
        if let Some(capacity) = self.capacity {
            let in_use = self.stats.bytes_in_use();
            if in_use + size > capacity {
                self.stats.failed.fetch_add(1, Ordering::AcqRel);
                return OutOfMemorySnafu { requested: size, available: capacity.saturating_sub(in_use) }.fail();
            }
        }

        let memory = match self.device.allocate(size) {
            Ok(memory) => memory,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::AcqRel);
                return Err(e);
            }
        };
        self.stats.allocations.fetch_add(1, Ordering::AcqRel);
        self.stats.bytes_in_use.fetch_add(size, Ordering::AcqRel);
        trace!(allocator = %self.name, %memory, "allocated");
        Ok(memory)
    }

    fn free(&self, memory: DeviceMemory) {
        trace!(allocator = %self.name, %memory, "freed");
        self.stats.frees.fetch_add(1, Ordering::AcqRel);
        self.stats.bytes_in_use.fetch_sub(memory.size(), Ordering::AcqRel);
        if self.async_deallocation {
            let stream = self.device.primary_stream();
            match self.device.deallocate_on(stream, memory) {
                Ok(()) => return,
                Err(e) => warn!(allocator = %self.name, %memory, error = %e, "stream-ordered free failed, freeing now"),
            }
        }
        self.device.deallocate(memory);
    }

    fn allows_asynchronous_deallocation(&self) -> bool {
        self.async_deallocation
    }

    fn name(&self) -> &str {
        &self.name
    }
}
