//! Device compatibility check.
//!
//! Compiled code only runs on the exact hardware revision it was built for:
//! same CUDA compute capability (major and minor), same AMDGPU ISA, same host
//! device revision. Cross-platform pairs never match.

use kiln_device::{Device, DeviceVersion};
use snafu::ensure;
use tracing::trace;

use crate::error::{IncompatibleDeviceSnafu, Result};

/// Whether code compiled for `target` runs on a device reporting `actual`.
pub fn is_compatible(target: DeviceVersion, actual: DeviceVersion) -> bool {
    match (target, actual) {
        (DeviceVersion::Cuda { major: m1, minor: n1 }, DeviceVersion::Cuda { major: m2, minor: n2 }) => {
            m1 == m2 && n1 == n2
        }
        (DeviceVersion::Rocm { isa: a }, DeviceVersion::Rocm { isa: b }) => a == b,
        (DeviceVersion::Host { revision: a }, DeviceVersion::Host { revision: b }) => a == b,
        _ => false,
    }
}

/// Fail with `IncompatibleDevice` unless `device` matches `target`.
///
/// Only queries the device's identity; performs no allocation or device I/O.
pub fn check(target: DeviceVersion, device: &dyn Device) -> Result<()> {
    let actual = device.version();
    trace!(%target, %actual, device = %device.key(), "checking device compatibility");
    ensure!(is_compatible(target, actual), IncompatibleDeviceSnafu { expected: target, actual, device: device.key() });
    Ok(())
}
