use snafu::Snafu;

use crate::key::DeviceKey;
use crate::stream::StreamHandle;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Allocator could not satisfy the request.
    #[snafu(display("out of device memory: requested {requested} bytes, {available} available"))]
    OutOfMemory { requested: usize, available: usize },

    /// Address does not belong to any live allocation.
    #[snafu(display("invalid device address {addr:#x} (+{size} bytes)"))]
    InvalidAddress { addr: u64, size: usize },

    #[snafu(display("invalid view: offset {offset} + size {size} exceeds buffer size {buffer_size}"))]
    InvalidView { offset: usize, size: usize, buffer_size: usize },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Invalid device specification.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    #[snafu(display("unknown stream {stream} on {device}"))]
    UnknownStream { device: DeviceKey, stream: StreamHandle },

    #[snafu(display("no free stream on {device}: all {capacity} streams are borrowed"))]
    StreamsExhausted { device: DeviceKey, capacity: usize },

    #[snafu(display("module load failed on {device}: {reason}"))]
    ModuleLoad { device: DeviceKey, reason: String },

    #[snafu(display("module {module} is not loaded on {device}"))]
    UnknownModule { device: DeviceKey, module: u64 },

    #[snafu(display("symbol '{name}' not found in module {module}"))]
    SymbolNotFound { name: String, module: u64 },

    #[snafu(display("launch of '{kernel}' failed: {reason}"))]
    Launch { kernel: String, reason: String },

    /// Device-side work could not make progress (e.g. a wait on an event that is never signalled).
    #[snafu(display("device runtime error: {message}"))]
    Runtime { message: String },
}
