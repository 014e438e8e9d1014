//! Multi-stream scheduled execution.
//!
//! Logical stream 0 is the caller's stream; every other logical stream borrows a
//! device stream for the duration of the call. Units are launched in schedule
//! order. A unit waits on the completion event of each predecessor that ran on
//! another stream, and records an event itself only if some later unit depends on
//! it. Once everything is launched, or a launch failed, the caller's stream
//! waits on every borrowed stream, so work enqueued on it afterwards is ordered
//! after everything the schedule put on the device.

use std::collections::HashMap;
use std::time::Instant;

use kiln_device::{BorrowedStream, Event, StreamHandle};
use snafu::ResultExt;
use tracing::{debug, trace, warn};

use crate::allocations::BufferAllocations;
use crate::engine::{ExecutionStrategy, RunContext};
use crate::error::{ExecutionSnafu, Result};
use crate::schedule::{Schedule, StreamId, WorkKind, WorkUnit, WorkUnitId};

impl ExecutionStrategy for Schedule {
    fn run(&self, allocations: &BufferAllocations, ctx: &mut RunContext<'_>) -> Result<()> {
        let device = ctx.device;
        let primary = ctx.stream;

        let mut borrowed: Vec<BorrowedStream> = Vec::new();
        let mut streams: HashMap<StreamId, StreamHandle> = HashMap::new();
        for id in self.stream_ids() {
            if id.is_primary() {
                streams.insert(id, primary);
                continue;
            }
            let stream =
                BorrowedStream::acquire(device).context(ExecutionSnafu { unit: format!("stream {id} setup") })?;
            streams.insert(id, stream.handle());
            borrowed.push(stream);
        }

        let launched = self.launch_units(allocations, ctx, &streams);
        if let Err(e) = &launched {
            warn!(error = %e, borrowed = borrowed.len(), "schedule aborted, joining launched work");
        }

        // Joined even on failure: slot memory is freed in order on the caller's stream.
        let joined = join(ctx, &borrowed);
        launched?;
        joined?;
        ctx.finish()
    }
}

impl Schedule {
    fn launch_units(
        &self,
        allocations: &BufferAllocations,
        ctx: &mut RunContext<'_>,
        streams: &HashMap<StreamId, StreamHandle>,
    ) -> Result<()> {
        let device = ctx.device;
        let primary = ctx.stream;
        let depended = self.depended_on();
        let mut events: HashMap<WorkUnitId, Event> = HashMap::with_capacity(depended.len());
        let mut placed: HashMap<WorkUnitId, StreamId> = HashMap::with_capacity(self.len());
        debug!(units = self.len(), streams = streams.len(), "launching schedule");

        for unit in self.units() {
            let started = Instant::now();
            let stream = streams.get(&unit.stream).copied().unwrap_or(primary);
            let label = unit.label();

            for dep in &unit.depends_on {
                if placed.get(dep) == Some(&unit.stream) {
                    continue;
                }
                if let Some(event) = events.get(dep) {
                    trace!(unit = %unit.id, on = %dep, "cross-stream wait");
                    device.wait_event(stream, event).context(ExecutionSnafu { unit: label.as_str() })?;
                }
            }

            launch(unit, stream, allocations, ctx).context(ExecutionSnafu { unit: label.as_str() })?;
            placed.insert(unit.id, unit.stream);

            if depended.contains(&unit.id) {
                let event = device.record_event(stream).context(ExecutionSnafu { unit: label.as_str() })?;
                events.insert(unit.id, event);
            }

            if let Some(profile) = ctx.profile.as_deref_mut() {
                profile.record_unit(unit.id, label, started.elapsed());
            }
        }
        Ok(())
    }
}

/// Make the caller's stream wait on every borrowed stream.
fn join(ctx: &RunContext<'_>, borrowed: &[BorrowedStream]) -> Result<()> {
    for stream in borrowed {
        let unit = format!("join of {}", stream.handle());
        let event = ctx.device.record_event(stream.handle()).context(ExecutionSnafu { unit: unit.as_str() })?;
        ctx.device.wait_event(ctx.stream, &event).context(ExecutionSnafu { unit: unit.as_str() })?;
    }
    Ok(())
}

fn launch(
    unit: &WorkUnit,
    stream: StreamHandle,
    allocations: &BufferAllocations,
    ctx: &RunContext<'_>,
) -> kiln_device::Result<()> {
    trace!(unit = %unit.id, %stream, "launch");
    match &unit.kind {
        WorkKind::Kernel { name, args, dims } => {
            let args = args.iter().map(|slice| allocations.resolve(slice)).collect::<kiln_device::Result<Vec<_>>>()?;
            ctx.device.launch_kernel(stream, ctx.module, name, dims, &args)
        }
        WorkKind::Copy { src, dst } => ctx.device.copy(stream, allocations.resolve(dst)?, allocations.resolve(src)?),
        WorkKind::Memset { dst, value } => ctx.device.memset(stream, allocations.resolve(dst)?, *value),
    }
}
