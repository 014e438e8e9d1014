use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_device::{Allocator, Device, DeviceMemory};

use crate::allocations::BufferAllocations;
use crate::buffers::Arguments;
use crate::test::helpers::{Fixture, HOST_V1};
use crate::{
    AliasKind, BufferAllocation, ConstantInfo, ExecutableDescriptor, ExecutionInput, GlobalsCache, ModuleGlobals,
    OutputInfo, Schedule, ShapeIndex, ShapedBuffer, SlotSource,
};

fn descriptor(allocations: Vec<BufferAllocation>, outputs: Vec<(ShapeIndex, OutputInfo)>) -> ExecutableDescriptor {
    let constants = allocations
        .iter()
        .filter(|a| a.is_constant)
        .map(|a| ConstantInfo::allocated(format!("const{}", a.index), vec![0xAB; a.size], Some(a.index)))
        .collect();
    ExecutableDescriptor::builder()
        .module_name("bindings")
        .target(HOST_V1)
        .schedule(Schedule::default())
        .allocations(allocations)
        .constants(constants)
        .outputs(outputs.into_iter().collect::<BTreeMap<_, _>>())
        .build()
        .unwrap()
}

fn globals(fixture: &Fixture, descriptor: &ExecutableDescriptor) -> Arc<ModuleGlobals> {
    GlobalsCache::new().resolve(descriptor, &fixture.device, fixture.device.primary_stream()).unwrap()
}

fn build(
    fixture: &Fixture,
    descriptor: &ExecutableDescriptor,
    inputs: &mut [ExecutionInput],
) -> crate::Result<BufferAllocations> {
    let globals = globals(fixture, descriptor);
    BufferAllocations::build(descriptor, &mut Arguments::Inputs(inputs), &globals, &fixture.dyn_allocator())
}

#[test]
fn test_slot_precedence() {
    let fixture = Fixture::new();
    let descriptor = descriptor(
        vec![
            BufferAllocation::parameter(0, 4, 0, ShapeIndex::root()),
            BufferAllocation::constant(1, 2),
            BufferAllocation::temp(2, 16),
            BufferAllocation::thread_local(3),
            BufferAllocation::temp(4, 0),
        ],
        vec![],
    );
    let globals = globals(&fixture, &descriptor);
    let input = fixture.buffer(&[1, 2, 3, 4]);
    let mut inputs = vec![ExecutionInput::borrowed(input.memory())];
    let requests_before = fixture.allocator.stats().requests();

    let bindings =
        BufferAllocations::build(&descriptor, &mut Arguments::Inputs(&mut inputs), &globals, &fixture.dyn_allocator())
            .unwrap();

    assert_eq!(bindings.len(), 5);
    assert_eq!(bindings.memory(0), Some(input.memory()));
    assert_eq!(bindings.source(0), Some(SlotSource::Parameter));
    assert_eq!(bindings.memory(1), globals.address(1));
    assert_eq!(bindings.source(1), Some(SlotSource::Constant));
    assert_eq!(bindings.source(2), Some(SlotSource::Temporary));
    assert_eq!(bindings.memory(2).unwrap().size(), 16);
    assert_eq!(bindings.memory(3), Some(DeviceMemory::NULL));
    assert_eq!(bindings.source(4), Some(SlotSource::Null));
    assert_eq!(bindings.fresh_allocations(), 1);
    assert_eq!(fixture.allocator.stats().requests() - requests_before, 1);
    assert_eq!(bindings.owned_count(), 1);

    let temp = bindings.memory(2).unwrap();
    drop(bindings);
    assert!(!fixture.host.is_live(temp));
    assert!(fixture.host.is_live(input.memory()));
}

#[test]
fn test_argument_mismatches() {
    let fixture = Fixture::new();
    let descriptor = descriptor(
        vec![
            BufferAllocation::parameter(0, 4, 0, ShapeIndex::root()),
            BufferAllocation::parameter(1, 4, 1, ShapeIndex::new(&[0])),
        ],
        vec![],
    );
    let a = fixture.buffer(&[0; 4]);
    let short = fixture.buffer(&[0; 2]);

    let err = build(&fixture, &descriptor, &mut [ExecutionInput::borrowed(a.memory())]).unwrap_err();
    assert!(matches!(err, crate::Error::ArgumentMismatch { ref reason } if reason.contains("expected 2 arguments")));

    let mut missing_leaf = [ExecutionInput::borrowed(a.memory()), ExecutionInput::borrowed(a.memory())];
    let err = build(&fixture, &descriptor, &mut missing_leaf).unwrap_err();
    assert!(matches!(err, crate::Error::ArgumentMismatch { ref reason } if reason.contains("no buffer at {0}")));

    let mut wrong_size =
        [ExecutionInput::borrowed(short.memory()), ExecutionInput::new().with(ShapeIndex::new(&[0]), a.memory())];
    let err = build(&fixture, &descriptor, &mut wrong_size).unwrap_err();
    assert!(matches!(err, crate::Error::ArgumentMismatch { ref reason } if reason.contains("is 2 bytes")));
    assert!(!err.is_retryable());
}

#[test]
fn test_must_alias_requires_donation_before_allocating() {
    let fixture = Fixture::new();
    let descriptor = descriptor(
        vec![
            BufferAllocation::parameter(0, 4, 0, ShapeIndex::root()),
            BufferAllocation::temp(1, 4),
            BufferAllocation::temp(2, 8),
        ],
        vec![(ShapeIndex::root(), OutputInfo::new(1).aliasing(0, ShapeIndex::root(), AliasKind::MustAlias))],
    );
    let input = fixture.buffer(&[0; 4]);
    let requests_before = fixture.allocator.stats().requests();

    let err = build(&fixture, &descriptor, &mut [ExecutionInput::borrowed(input.memory())]).unwrap_err();
    assert!(matches!(err, crate::Error::ArgumentMismatch { ref reason } if reason.contains("must alias")));
    assert_eq!(fixture.allocator.stats().requests(), requests_before);
}

#[test]
fn test_donated_alias_reuses_input() {
    let fixture = Fixture::new();
    let descriptor = descriptor(
        vec![BufferAllocation::parameter(0, 4, 0, ShapeIndex::root()), BufferAllocation::temp(1, 4).live_out()],
        vec![(ShapeIndex::root(), OutputInfo::new(1).aliasing(0, ShapeIndex::root(), AliasKind::MustAlias))],
    );
    let donated = fixture.buffer(&[5; 4]);
    let address = donated.memory();
    let mut inputs = vec![ExecutionInput::donated(donated)];

    let bindings = build(&fixture, &descriptor, &mut inputs).unwrap();
    assert_eq!(bindings.memory(1), Some(address));
    assert_eq!(bindings.source(1), Some(SlotSource::Donated));
    assert_eq!(bindings.fresh_allocations(), 0);
    assert!(bindings.alias_copies().is_empty());
    // Ownership moved out of the caller's input.
    assert!(!inputs[0].buffers[&ShapeIndex::root()].is_owned());
}

#[test]
fn test_may_alias_without_donation_copies_input() {
    let fixture = Fixture::new();
    let descriptor = descriptor(
        vec![BufferAllocation::parameter(0, 4, 0, ShapeIndex::root())],
        vec![(ShapeIndex::root(), OutputInfo::new(0).aliasing(0, ShapeIndex::root(), AliasKind::MayAlias))],
    );
    let input = fixture.buffer(&[1, 2, 3, 4]);

    let bindings = build(&fixture, &descriptor, &mut [ExecutionInput::borrowed(input.memory())]).unwrap();
    let fresh = bindings.memory(0).unwrap();
    assert_ne!(fresh, input.memory());
    assert_eq!(bindings.source(0), Some(SlotSource::Temporary));
    assert_eq!(bindings.alias_copies().len(), 1);
    assert_eq!(bindings.alias_copies()[0].src, input.memory());
    assert_eq!(bindings.alias_copies()[0].dst, fresh);

    bindings.enqueue_alias_copies(fixture.device.as_ref(), fixture.device.primary_stream()).unwrap();
    fixture.host.synchronize().unwrap();
    assert_eq!(fixture.read(fresh), vec![1, 2, 3, 4]);
}

#[test]
fn test_passthrough_output_does_not_allocate() {
    let fixture = Fixture::new();
    let descriptor = descriptor(
        vec![BufferAllocation::parameter(0, 4, 0, ShapeIndex::root())],
        vec![(ShapeIndex::root(), OutputInfo::passthrough(0))],
    );
    let input = fixture.buffer(&[0; 4]);
    let requests_before = fixture.allocator.stats().requests();

    let bindings = build(&fixture, &descriptor, &mut [ExecutionInput::borrowed(input.memory())]).unwrap();
    assert_eq!(bindings.memory(0), Some(input.memory()));
    assert_eq!(fixture.allocator.stats().requests(), requests_before);
}

#[test]
fn test_out_of_memory_releases_earlier_slots() {
    let fixture = Fixture::with_capacity(64);
    let descriptor = descriptor(vec![BufferAllocation::temp(0, 48), BufferAllocation::temp(1, 32)], vec![]);

    let err = build(&fixture, &descriptor, &mut []).unwrap_err();
    assert!(matches!(err, crate::Error::Allocation { allocation: 1, size: 32, .. }));
    assert!(err.is_retryable());
    assert_eq!(fixture.allocator.stats().bytes_in_use(), 0);
}

#[test]
fn test_shaped_arguments_are_never_donated() {
    let fixture = Fixture::new();
    let descriptor = descriptor(
        vec![BufferAllocation::parameter(0, 4, 0, ShapeIndex::root())],
        vec![(ShapeIndex::root(), OutputInfo::new(0).aliasing(0, ShapeIndex::root(), AliasKind::MustAlias))],
    );
    let input = fixture.buffer(&[0; 4]);
    let shaped = ShapedBuffer::scalar(0, input.memory());
    let globals = globals(&fixture, &descriptor);
    let allocator: Arc<dyn Allocator> = fixture.dyn_allocator();

    let err =
        BufferAllocations::build(&descriptor, &mut Arguments::Shaped(&[&shaped]), &globals, &allocator).unwrap_err();
    assert!(matches!(err, crate::Error::ArgumentMismatch { .. }));
}

#[test]
fn test_passthrough_alias_binds_parameter() {
    let fixture = Fixture::new();
    let info = OutputInfo::passthrough(0).aliasing(0, ShapeIndex::root(), AliasKind::MayAlias);
    let descriptor =
        descriptor(vec![BufferAllocation::parameter(0, 4, 0, ShapeIndex::root())], vec![(ShapeIndex::root(), info)]);
    let input = fixture.buffer(&[1, 2, 3, 4]);
    let mut inputs = [ExecutionInput::borrowed(input.memory())];

    let bindings = build(&fixture, &descriptor, &mut inputs).unwrap();
    assert_eq!(bindings.source(0), Some(SlotSource::Parameter));
    assert_eq!(bindings.memory(0), Some(input.memory()));
    assert_eq!(bindings.fresh_allocations(), 0);
    assert!(bindings.alias_copies().is_empty());
}
