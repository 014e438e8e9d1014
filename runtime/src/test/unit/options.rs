use kiln_device::Device;

use crate::BlockingPolicy;
use crate::test::helpers::Fixture;

#[test]
fn test_run_options_defaults() {
    let fixture = Fixture::new();
    let options = fixture.options();
    assert_eq!(options.blocking(), BlockingPolicy::Async);
    assert_eq!(options.stream(), fixture.host.primary_stream());
}

#[test]
fn test_effective_blocking() {
    // Synchronous deallocation forces blocking even when the caller asked for async.
    let fixture = Fixture::new();
    assert!(fixture.options().effective_blocking());

    let fixture = Fixture::with_async_allocator();
    assert!(!fixture.options().effective_blocking());
    assert!(fixture.blocking_options().effective_blocking());
}

#[test]
fn test_blocking_policy() {
    assert!(BlockingPolicy::BlockHostUntilDone.is_blocking());
    assert!(!BlockingPolicy::default().is_blocking());
}
