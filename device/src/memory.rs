//! Device memory handles and ownership.
//!
//! [`DeviceMemory`] is a plain, copyable `(address, size)` pair with no ownership.
//! [`OwnedDeviceMemory`] frees its memory through the allocator that produced it
//! when dropped, unless ownership is released first. [`MaybeOwningDeviceMemory`]
//! is how callers hand inputs to an execution: borrowed, or donated.

use std::fmt;
use std::sync::Arc;

use snafu::ensure;

use crate::allocator::Allocator;
use crate::error::{InvalidViewSnafu, Result};

/// Non-owning handle to a range of device memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceMemory {
    addr: u64,
    size: usize,
}

impl DeviceMemory {
    /// Null handle (no backing memory).
    pub const NULL: DeviceMemory = DeviceMemory { addr: 0, size: 0 };

    pub const fn new(addr: u64, size: usize) -> Self {
        Self { addr, size }
    }

    pub const fn addr(&self) -> u64 {
        self.addr
    }

    pub const fn size(&self) -> usize {
        self.size
    }

    pub const fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// Sub-range of this memory.
    pub fn slice(&self, offset: usize, size: usize) -> Result<Self> {
        ensure!(
            offset.checked_add(size).is_some_and(|end| end <= self.size),
            InvalidViewSnafu { offset, size, buffer_size: self.size }
        );
        Ok(Self { addr: self.addr + offset as u64, size })
    }
}

impl fmt::Display for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{}", self.addr, self.size)
    }
}

/// Device memory freed through its allocator on drop.
pub struct OwnedDeviceMemory {
    memory: Option<DeviceMemory>,
    allocator: Arc<dyn Allocator>,
}

impl OwnedDeviceMemory {
    /// Take ownership of `memory`, which must have been produced by `allocator`.
    pub fn new(memory: DeviceMemory, allocator: Arc<dyn Allocator>) -> Self {
        Self { memory: Some(memory), allocator }
    }

    pub fn memory(&self) -> DeviceMemory {
        self.memory.unwrap_or(DeviceMemory::NULL)
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Give up ownership without freeing.
    pub fn release(mut self) -> DeviceMemory {
        self.memory.take().unwrap_or(DeviceMemory::NULL)
    }
}

impl Drop for OwnedDeviceMemory {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take()
            && !memory.is_null()
        {
            self.allocator.free(memory);
        }
    }
}

impl fmt::Debug for OwnedDeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedDeviceMemory")
            .field("memory", &self.memory)
            .field("allocator", &self.allocator.name())
            .finish()
    }
}

/// Caller input that is either borrowed or donated to the execution.
#[derive(Debug)]
pub enum MaybeOwningDeviceMemory {
    Borrowed(DeviceMemory),
    Owned(OwnedDeviceMemory),
}

impl MaybeOwningDeviceMemory {
    pub fn memory(&self) -> DeviceMemory {
        match self {
            MaybeOwningDeviceMemory::Borrowed(memory) => *memory,
            MaybeOwningDeviceMemory::Owned(owned) => owned.memory(),
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, MaybeOwningDeviceMemory::Owned(_))
    }

    /// Move ownership out, leaving a borrowed handle to the same memory behind.
    ///
    /// Returns `None` if this input was only borrowed.
    pub fn take_ownership(&mut self) -> Option<OwnedDeviceMemory> {
        let memory = self.memory();
        match std::mem::replace(self, MaybeOwningDeviceMemory::Borrowed(memory)) {
            MaybeOwningDeviceMemory::Owned(owned) => Some(owned),
            MaybeOwningDeviceMemory::Borrowed(_) => None,
        }
    }
}

impl From<DeviceMemory> for MaybeOwningDeviceMemory {
    fn from(memory: DeviceMemory) -> Self {
        MaybeOwningDeviceMemory::Borrowed(memory)
    }
}

impl From<OwnedDeviceMemory> for MaybeOwningDeviceMemory {
    fn from(owned: OwnedDeviceMemory) -> Self {
        MaybeOwningDeviceMemory::Owned(owned)
    }
}
