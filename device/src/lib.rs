//! Device layer for the kiln executable runtime.
//!
//! Provides what an executable needs from an accelerator and nothing more:
//! typed device memory handles with ownership, allocators, streams and events,
//! module loading with symbol lookup, and the [`Device`] trait tying them together.
//!
//! # Host device
//!
//! [`HostDevice`] implements [`Device`] entirely in host memory. Work is queued per
//! stream and executed at synchronization, which makes asynchronous semantics
//! (pending launches, cross-stream waits, deferred frees) observable in tests.

pub mod allocator;
pub mod device;
pub mod error;
pub mod host;
pub mod key;
pub mod memory;
pub mod stream;
pub mod sync;


pub use allocator::{Allocator, AllocatorStats, DeviceAllocator, allocate_owned};
pub use device::{Device, ModuleHandle, ModuleImage};
pub use error::{Error, Result};
pub use host::{HostCounters, HostDevice, HostKernel, KernelArgs, TraceEvent};
pub use key::{DeviceKey, DeviceVersion};
pub use memory::{DeviceMemory, MaybeOwningDeviceMemory, OwnedDeviceMemory};
pub use stream::{BorrowedStream, Event, LaunchDims, StreamHandle};
pub use sync::{HostTimeline, TimelineSignal};
