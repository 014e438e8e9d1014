//! Error types for executable runtime operations.

use kiln_device::{DeviceKey, DeviceVersion};
use snafu::Snafu;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while building or running an executable.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Target device does not match the hardware the executable was compiled for.
    #[snafu(display("executable compiled for {expected} cannot run on {device} ({actual})"))]
    IncompatibleDevice { expected: DeviceVersion, actual: DeviceVersion, device: DeviceKey },

    /// Caller arguments do not fit the executable's parameters.
    #[snafu(display("argument mismatch: {reason}"))]
    ArgumentMismatch { reason: String },

    /// Allocator could not provide memory for an allocation slot.
    #[snafu(display("failed to allocate {size} bytes for allocation {allocation}: {source}"))]
    Allocation { allocation: usize, size: usize, source: kiln_device::Error },

    #[snafu(display("failed to load module '{module}' on {device}: {source}"))]
    ModuleLoad { module: String, device: DeviceKey, source: kiln_device::Error },

    #[snafu(display("failed to resolve constant '{symbol}': {source}"))]
    SymbolResolution { symbol: String, source: kiln_device::Error },

    /// Device work failed to launch, wait or complete.
    #[snafu(display("execution failed at {unit}: {source}"))]
    Execution { unit: String, source: kiln_device::Error },

    /// Descriptor rejected at construction.
    #[snafu(display("invalid executable descriptor: {reason}"))]
    InvalidDescriptor { reason: String },
}

impl Error {
    /// Whether the same call may succeed if retried (after freeing memory or fixing the device).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Allocation { .. } | Error::ModuleLoad { .. } | Error::SymbolResolution { .. })
    }
}
