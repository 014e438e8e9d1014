//! Device identity and hardware revision.
//!
//! A [`DeviceKey`] names one physical accelerator (platform + ordinal) and is the
//! key of every per-device cache in the runtime. A [`DeviceVersion`] is the
//! hardware revision an artifact is compiled for and a device reports.

use derive_more::Display;

use crate::error::{InvalidDeviceSnafu, Result};

/// Identifies one physical accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
pub enum DeviceKey {
    /// In-memory host device (simulated accelerator).
    #[display("HOST:{ordinal}")]
    Host { ordinal: usize },
    #[display("CUDA:{ordinal}")]
    Cuda { ordinal: usize },
    #[display("ROCM:{ordinal}")]
    Rocm { ordinal: usize },
}

impl DeviceKey {
    /// Device ordinal within its platform.
    pub fn ordinal(&self) -> usize {
        match self {
            DeviceKey::Host { ordinal } | DeviceKey::Cuda { ordinal } | DeviceKey::Rocm { ordinal } => *ordinal,
        }
    }

    /// Platform name without the ordinal (e.g. "CUDA").
    pub fn platform(&self) -> &'static str {
        match self {
            DeviceKey::Host { .. } => "HOST",
            DeviceKey::Cuda { .. } => "CUDA",
            DeviceKey::Rocm { .. } => "ROCM",
        }
    }

    /// Parse a device string.
    ///
    /// Examples:
    /// - "HOST" -> DeviceKey::Host { ordinal: 0 }
    /// - "CUDA:1" -> DeviceKey::Cuda { ordinal: 1 }
    /// - "gpu" -> DeviceKey::Cuda { ordinal: 0 }
    /// - "rocm:2" -> DeviceKey::Rocm { ordinal: 2 }
    pub fn parse(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        let (platform, ordinal) = match upper.split_once(':') {
            Some((platform, ordinal)) => {
                let ordinal = ordinal.parse().map_err(|_| InvalidDeviceSnafu { device: s.to_string() }.build())?;
                (platform, ordinal)
            }
            None => (upper.as_str(), 0),
        };

        match platform {
            "HOST" | "CPU" => Ok(DeviceKey::Host { ordinal }),
            "CUDA" | "GPU" => Ok(DeviceKey::Cuda { ordinal }),
            "ROCM" | "HIP" => Ok(DeviceKey::Rocm { ordinal }),
            _ => InvalidDeviceSnafu { device: s.to_string() }.fail(),
        }
    }
}

/// Hardware revision an artifact targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum DeviceVersion {
    /// NVIDIA compute capability.
    #[display("sm_{major}{minor}")]
    Cuda { major: u32, minor: u32 },
    /// AMDGPU GCN ISA version (e.g. 908 for gfx908).
    #[display("gfx{isa}")]
    Rocm { isa: u32 },
    /// Revision of the simulated host device.
    #[display("host-r{revision}")]
    Host { revision: u32 },
}
