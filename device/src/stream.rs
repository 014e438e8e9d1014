//! Streams, events and launch parameters.
//!
//! A stream is an in-order queue of device work. Work on different streams may
//! run concurrently; ordering across streams is expressed with [`Event`]s.

use std::sync::Arc;

use derive_more::Display;

use crate::device::Device;
use crate::error::Result;

/// Handle to one device stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("stream#{_0}")]
pub struct StreamHandle(pub u32);

/// Point on a stream's timeline, recorded after the work enqueued before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    pub stream: StreamHandle,
    pub value: u64,
}

/// Kernel launch dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchDims {
    /// Number of blocks per grid dimension.
    pub grid: [u32; 3],
    /// Number of threads per block dimension.
    pub block: [u32; 3],
    /// Dynamic shared memory per block, in bytes.
    pub shared_mem_bytes: u32,
}

impl LaunchDims {
    /// Create 1D launch dimensions.
    pub fn new_1d(grid: u32, block: u32) -> Self {
        Self { grid: [grid, 1, 1], block: [block, 1, 1], shared_mem_bytes: 0 }
    }

    /// Create 3D launch dimensions.
    pub fn new_3d(grid: [u32; 3], block: [u32; 3]) -> Self {
        Self { grid, block, shared_mem_bytes: 0 }
    }

    pub fn with_shared_mem(mut self, bytes: u32) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    pub fn thread_count(&self) -> u64 {
        let blocks: u64 = self.grid.iter().map(|&d| d as u64).product();
        let threads: u64 = self.block.iter().map(|&d| d as u64).product();
        blocks * threads
    }
}

impl Default for LaunchDims {
    fn default() -> Self {
        Self::new_1d(1, 1)
    }
}

/// Stream borrowed from a device, returned when dropped.
#[derive(Debug)]
pub struct BorrowedStream {
    device: Arc<dyn Device>,
    handle: StreamHandle,
}

impl BorrowedStream {
    pub fn acquire(device: &Arc<dyn Device>) -> Result<Self> {
        let handle = device.acquire_stream()?;
        Ok(Self { device: Arc::clone(device), handle })
    }

    pub fn handle(&self) -> StreamHandle {
        self.handle
    }
}

impl Drop for BorrowedStream {
    fn drop(&mut self) {
        self.device.release_stream(self.handle);
    }
}
