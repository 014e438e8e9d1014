use test_case::test_case;

use crate::{DeviceKey, DeviceVersion};

#[test_case("HOST", DeviceKey::Host { ordinal: 0 }; "host default ordinal")]
#[test_case("cpu:3", DeviceKey::Host { ordinal: 3 }; "cpu alias")]
#[test_case("CUDA:1", DeviceKey::Cuda { ordinal: 1 }; "cuda with ordinal")]
#[test_case("gpu", DeviceKey::Cuda { ordinal: 0 }; "gpu alias")]
#[test_case(" rocm:2 ", DeviceKey::Rocm { ordinal: 2 }; "rocm trimmed")]
#[test_case("hip", DeviceKey::Rocm { ordinal: 0 }; "hip alias")]
fn test_device_key_parse(input: &str, expected: DeviceKey) {
    assert_eq!(DeviceKey::parse(input).unwrap(), expected);
}

#[test_case("TPU"; "unknown platform")]
#[test_case("CUDA:x"; "bad ordinal")]
#[test_case(""; "empty")]
fn test_device_key_parse_rejects(input: &str) {
    assert!(matches!(DeviceKey::parse(input), Err(crate::Error::InvalidDevice { .. })));
}

#[test]
fn test_device_key_display_round_trips() {
    for key in [DeviceKey::Host { ordinal: 0 }, DeviceKey::Cuda { ordinal: 7 }, DeviceKey::Rocm { ordinal: 1 }] {
        assert_eq!(DeviceKey::parse(&key.to_string()).unwrap(), key);
    }
}

#[test_case(DeviceVersion::Cuda { major: 8, minor: 0 }, "sm_80")]
#[test_case(DeviceVersion::Rocm { isa: 908 }, "gfx908")]
#[test_case(DeviceVersion::Host { revision: 2 }, "host-r2")]
fn test_device_version_display(version: DeviceVersion, expected: &str) {
    assert_eq!(version.to_string(), expected);
}
