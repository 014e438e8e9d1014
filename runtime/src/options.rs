//! Per-call run options.
//!
//! Typed configuration with a bon builder and an environment fallback for the
//! blocking policy.

use std::sync::Arc;

use bon::bon;
use kiln_device::{Allocator, Device, StreamHandle};

/// Whether `execute` waits for the device work it enqueued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BlockingPolicy {
    /// Return as soon as all work is enqueued (default).
    #[default]
    Async,

    /// Block the host until all work of the call has completed.
    BlockHostUntilDone,
}

impl BlockingPolicy {
    /// Get the policy from the environment.
    ///
    /// # Environment Variables
    ///
    /// * `KILN_BLOCK_HOST_UNTIL_DONE=1` - Block after every call (`0`/`false` disables)
    pub fn from_env() -> Self {
        match std::env::var("KILN_BLOCK_HOST_UNTIL_DONE") {
            Ok(value) if !matches!(value.trim().to_ascii_lowercase().as_str(), "" | "0" | "false" | "no") => {
                Self::BlockHostUntilDone
            }
            _ => Self::Async,
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::BlockHostUntilDone)
    }
}

/// Where and how one call runs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    device: Arc<dyn Device>,
    allocator: Arc<dyn Allocator>,
    stream: Option<StreamHandle>,
    blocking: BlockingPolicy,
}

#[bon]
impl RunOptions {
    /// Create run options with builder pattern.
    ///
    /// Without an explicit `stream` the device's primary stream is used.
    #[builder]
    pub fn new(
        device: Arc<dyn Device>,
        allocator: Arc<dyn Allocator>,
        stream: Option<StreamHandle>,
        #[builder(default)] blocking: BlockingPolicy,
    ) -> Self {
        Self { device, allocator, stream, blocking }
    }
}

impl RunOptions {
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Stream the call's work is ordered on.
    pub fn stream(&self) -> StreamHandle {
        self.stream.unwrap_or_else(|| self.device.primary_stream())
    }

    pub fn blocking(&self) -> BlockingPolicy {
        self.blocking
    }

    /// Whether the call must block.
    ///
    /// Temporaries are freed as soon as their work is enqueued, which is only
    /// sound if the allocator orders frees behind outstanding device work.
    pub fn effective_blocking(&self) -> bool {
        self.blocking.is_blocking() || !self.allocator.allows_asynchronous_deallocation()
    }
}
