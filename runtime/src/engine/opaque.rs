//! Whole-program execution.
//!
//! The program receives the full slot table in allocation order and runs as a
//! single device invocation on the caller's stream.

use std::time::Instant;

use snafu::ResultExt;
use tracing::debug;

use crate::allocations::BufferAllocations;
use crate::descriptor::OpaqueProgram;
use crate::engine::{ExecutionStrategy, RunContext};
use crate::error::{ExecutionSnafu, Result};
use crate::schedule::WorkUnitId;

impl ExecutionStrategy for OpaqueProgram {
    fn run(&self, allocations: &BufferAllocations, ctx: &mut RunContext<'_>) -> Result<()> {
        let started = Instant::now();
        let buffers = allocations.addresses();
        debug!(entry = %self.entry, buffers = buffers.len(), blob = self.blob.len(), "running opaque program");

        let unit = format!("program '{}'", self.entry);
        ctx.device.run_program(ctx.stream, &self.blob, &buffers).context(ExecutionSnafu { unit: unit.as_str() })?;
        if let Some(profile) = ctx.profile.as_deref_mut() {
            profile.record_unit(WorkUnitId(0), unit, started.elapsed());
        }

        ctx.finish()
    }
}
