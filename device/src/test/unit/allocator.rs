use std::sync::Arc;

use crate::{Allocator, Device, DeviceAllocator, DeviceVersion, HostDevice};

fn device() -> Arc<dyn Device> {
    Arc::new(HostDevice::new(0, DeviceVersion::Host { revision: 1 }))
}

#[test]
fn test_allocator_tracks_usage() {
    let allocator = DeviceAllocator::new(device());
    let a = allocator.alloc(100).unwrap();
    let b = allocator.alloc(50).unwrap();
    assert_ne!(a.addr(), b.addr());
    assert_eq!(allocator.stats().allocations(), 2);
    assert_eq!(allocator.stats().bytes_in_use(), 150);

    allocator.free(a);
    assert_eq!(allocator.stats().bytes_in_use(), 50);
    assert_eq!(allocator.stats().frees(), 1);
}

#[test]
fn test_allocator_capacity() {
    let allocator = DeviceAllocator::new(device()).with_capacity(128);
    let first = allocator.alloc(100).unwrap();

    let err = allocator.alloc(64).unwrap_err();
    assert!(matches!(err, crate::Error::OutOfMemory { requested: 64, available: 28 }));
    assert_eq!(allocator.stats().failed(), 1);
    assert_eq!(allocator.stats().requests(), 2);

    allocator.free(first);
    assert!(allocator.alloc(64).is_ok());
}

#[test]
fn test_allocator_async_deallocation_flag() {
    let allocator = DeviceAllocator::new(device());
    assert!(!allocator.allows_asynchronous_deallocation());
    let allocator = allocator.with_async_deallocation(true);
    assert!(allocator.allows_asynchronous_deallocation());
    assert_eq!(allocator.name(), "HOST:0");
}

#[test]
fn test_async_free_waits_for_primary_stream() {
    let host = Arc::new(HostDevice::new(0, DeviceVersion::Host { revision: 1 }));
    let allocator = DeviceAllocator::new(host.clone() as Arc<dyn Device>).with_async_deallocation(true);
    let memory = allocator.alloc(8).unwrap();

    allocator.free(memory);
    assert!(host.is_live(memory));
    assert_eq!(allocator.stats().bytes_in_use(), 0);

    host.synchronize().unwrap();
    assert!(!host.is_live(memory));
}
