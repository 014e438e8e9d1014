use std::sync::Arc;

use kiln_device::{Device, HostDevice};

use crate::test::helpers::HOST_V1;
use crate::{BufferAllocation, ConstantInfo, ExecutableDescriptor, GlobalsCache, Schedule};

fn descriptor(constants: Vec<ConstantInfo>) -> ExecutableDescriptor {
    ExecutableDescriptor::builder()
        .module_name("globals")
        .target(HOST_V1)
        .binary(b"\x7fELF-host".to_vec())
        .schedule(Schedule::default())
        .allocations(vec![BufferAllocation::constant(0, 4), BufferAllocation::constant(1, 2)])
        .constants(constants)
        .build()
        .unwrap()
}

fn standard_constants() -> Vec<ConstantInfo> {
    vec![
        ConstantInfo::embedded("weights", vec![1, 2, 3, 4], Some(0)),
        ConstantInfo::allocated("bias", vec![7, 8], Some(1)),
        ConstantInfo::embedded("scratch_init", vec![], None),
    ]
}

fn host(ordinal: usize) -> Arc<HostDevice> {
    let host = HostDevice::new(ordinal, HOST_V1);
    host.define_symbol("weights", 4);
    host.define_symbol("scratch_init", 16);
    Arc::new(host)
}

#[test]
fn test_resolve_loads_once_per_device() {
    let descriptor = descriptor(standard_constants());
    let cache = GlobalsCache::new();
    let host = host(0);
    let device: Arc<dyn Device> = host.clone();

    let first = cache.resolve(&descriptor, &device, device.primary_stream()).unwrap();
    let second = cache.resolve(&descriptor, &device, device.primary_stream()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(host.counters().module_loads(), 1);
    assert_eq!(cache.len(), 1);

    // Only constants with an allocation index are addressable.
    assert_eq!(first.addresses().len(), 2);
    assert_eq!(host.read(first.address(0).unwrap()).unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(host.read(first.address(1).unwrap()).unwrap(), vec![7, 8]);
    assert!(first.module().is_some());
}

#[test]
fn test_resolve_per_device_key() {
    let descriptor = descriptor(standard_constants());
    let cache = GlobalsCache::new();
    let (a, b) = (host(0), host(1));
    let (da, db): (Arc<dyn Device>, Arc<dyn Device>) = (a.clone(), b.clone());

    cache.resolve(&descriptor, &da, da.primary_stream()).unwrap();
    cache.resolve(&descriptor, &db, db.primary_stream()).unwrap();
    assert_eq!(a.counters().module_loads() + b.counters().module_loads(), 2);
    assert_eq!(cache.len(), 2);
    assert!(cache.contains(da.key()) && cache.contains(db.key()));
}

#[test]
fn test_failed_load_commits_nothing_and_retries() {
    let descriptor = descriptor(standard_constants());
    let cache = GlobalsCache::new();
    let host = host(0);
    let device: Arc<dyn Device> = host.clone();
    host.fail_module_loads(1);

    let err = cache.resolve(&descriptor, &device, device.primary_stream()).unwrap_err();
    assert!(matches!(err, crate::Error::ModuleLoad { .. }));
    assert!(err.is_retryable());
    assert!(cache.is_empty());

    cache.resolve(&descriptor, &device, device.primary_stream()).unwrap();
    assert_eq!(host.counters().module_loads(), 2);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_missing_symbol_unloads_partial_module() {
    let mut constants = standard_constants();
    constants.push(ConstantInfo::embedded("missing", vec![0], None));
    let descriptor = descriptor(constants);
    let cache = GlobalsCache::new();
    let host = host(0);
    let device: Arc<dyn Device> = host.clone();

    let err = cache.resolve(&descriptor, &device, device.primary_stream()).unwrap_err();
    assert!(matches!(err, crate::Error::SymbolResolution { ref symbol, .. } if symbol == "missing"));
    assert!(cache.is_empty());
    assert_eq!(host.loaded_modules(), 0);
    assert_eq!(host.counters().module_unloads(), 1);
    // Nothing was enqueued against the released memory.
    assert_eq!(host.pending_ops(), 0);
    host.synchronize().unwrap();
}

#[test]
fn test_failed_upload_lands_earlier_copies_before_release() {
    // `weights` holds 4 bytes of content but the module only exports 2, so its upload is rejected.
    let descriptor = descriptor(vec![
        ConstantInfo::allocated("bias", vec![7, 8], Some(1)),
        ConstantInfo::embedded("weights", vec![1, 2, 3, 4], Some(0)),
    ]);
    let host = HostDevice::new(0, HOST_V1);
    host.define_symbol("weights", 2);
    let host = Arc::new(host);
    let device: Arc<dyn Device> = host.clone();
    let cache = GlobalsCache::new();

    let err = cache.resolve(&descriptor, &device, device.primary_stream()).unwrap_err();
    assert!(matches!(err, crate::Error::SymbolResolution { ref symbol, .. } if symbol == "weights"));
    assert!(err.is_retryable());
    assert!(cache.is_empty());
    assert_eq!(host.loaded_modules(), 0);
    assert_eq!(host.pending_ops(), 0);
    assert!(host.counters().synchronizations() >= 1);
}

#[test]
fn test_dropping_cache_releases_device_resources() {
    let descriptor = descriptor(standard_constants());
    let host = host(0);
    let device: Arc<dyn Device> = host.clone();
    let cache = GlobalsCache::new();
    let bias = cache.resolve(&descriptor, &device, device.primary_stream()).unwrap().address(1).unwrap();
    assert_eq!(host.loaded_modules(), 1);

    drop(cache);
    assert_eq!(host.loaded_modules(), 0);
    assert!(!host.is_live(bias));
}

#[test]
fn test_nothing_to_load() {
    let descriptor = ExecutableDescriptor::builder()
        .module_name("empty")
        .target(HOST_V1)
        .schedule(Schedule::default())
        .build()
        .unwrap();
    let host = host(0);
    let device: Arc<dyn Device> = host.clone();
    let cache = GlobalsCache::new();

    let globals = cache.resolve(&descriptor, &device, device.primary_stream()).unwrap();
    assert!(globals.module().is_none());
    assert!(globals.addresses().is_empty());
    assert_eq!(host.counters().total_io(), 0);
}

#[test]
fn test_concurrent_first_resolve_loads_once() {
    let descriptor = descriptor(standard_constants());
    let cache = GlobalsCache::new();
    let host = host(0);
    let device: Arc<dyn Device> = host.clone();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| cache.resolve(&descriptor, &device, device.primary_stream()).unwrap());
        }
    });
    assert_eq!(host.counters().module_loads(), 1);
}
