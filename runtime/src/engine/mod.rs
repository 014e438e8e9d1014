//! Execution strategies.
//!
//! A descriptor's [`ExecutionBody`] is either a dependency-scheduled list of
//! work units or one opaque program. Both implement [`ExecutionStrategy`]: given
//! the bound slots of one call they enqueue all device work on the caller's
//! stream (plus any borrowed streams), then block only if asked to.

mod opaque;
mod scheduled;

use std::sync::Arc;

use kiln_device::{Device, ModuleHandle, StreamHandle};
use snafu::ResultExt;
use tracing::trace;

use crate::allocations::BufferAllocations;
use crate::descriptor::ExecutionBody;
use crate::error::{ExecutionSnafu, Result};
use crate::profile::ExecutionProfile;

/// Per-call state shared with a strategy.
pub struct RunContext<'a> {
    pub device: &'a Arc<dyn Device>,
    /// Caller's stream; logical stream 0 of a schedule.
    pub stream: StreamHandle,
    /// Module loaded for the device, if any.
    pub module: Option<ModuleHandle>,
    /// Block the host until all enqueued work completed.
    pub blocking: bool,
    pub profile: Option<&'a mut ExecutionProfile>,
}

impl RunContext<'_> {
    /// Full-device barrier when blocking; no-op otherwise.
    pub(crate) fn finish(&mut self) -> Result<()> {
        if !self.blocking {
            trace!(device = %self.device.key(), "returning with work in flight");
            return Ok(());
        }

        self.device.synchronize().context(ExecutionSnafu { unit: "synchronize" })?;
        if let Some(profile) = self.profile.as_deref_mut() {
            profile.synchronized = true;
        }
        Ok(())
    }
}

/// Runs one call's device work.
pub trait ExecutionStrategy {
    fn run(&self, allocations: &BufferAllocations, ctx: &mut RunContext<'_>) -> Result<()>;
}

impl ExecutionBody {
    /// Strategy matching this body's variant.
    pub fn strategy(&self) -> &dyn ExecutionStrategy {
        match self {
            ExecutionBody::Scheduled(schedule) => schedule,
            ExecutionBody::Opaque(program) => program,
        }
    }
}
