use test_case::test_case;

use crate::{DeviceLimits, DeviceSpec, Error};

#[test_case("HOST", DeviceSpec::Host; "host")]
#[test_case("cpu", DeviceSpec::Host; "cpu_lowercase")]
#[test_case("CUDA", DeviceSpec::Cuda { device_id: 0 }; "cuda_default")]
#[test_case("cuda:3", DeviceSpec::Cuda { device_id: 3 }; "cuda_ordinal")]
#[test_case("GPU:2", DeviceSpec::Cuda { device_id: 2 }; "gpu_alias")]
fn test_device_spec_parse(input: &str, expected: DeviceSpec) {
    assert_eq!(DeviceSpec::parse(input).unwrap(), expected);
}

#[test_case("TPU"; "unknown")]
#[test_case("CUDA:x"; "bad_ordinal")]
#[test_case("HOST:1"; "host_ordinal")]
fn test_device_spec_parse_invalid(input: &str) {
    assert!(matches!(DeviceSpec::parse(input), Err(Error::InvalidDevice { .. })));
}

#[test]
fn test_device_spec_display() {
    assert_eq!(DeviceSpec::Cuda { device_id: 1 }.to_string(), "CUDA:1");
    assert_eq!(DeviceSpec::Host.base_type(), "HOST");
}

#[test_case(1, 32; "tiny_rounds_to_warp")]
#[test_case(100, 128; "rounds_up_to_warp_multiple")]
#[test_case(1_000_000, 256; "large_caps_at_target")]
fn test_block_size_single_unit(n: usize, expected: usize) {
    let limits = DeviceLimits::default();
    assert_eq!(limits.block_size_for(0, n, usize::MAX), expected);
}

#[test]
fn test_block_size_spreads_across_compute_units() {
    let limits = DeviceLimits { compute_units: 8, ..DeviceLimits::default() };

    // 1024 instances at 256 per block is only 4 blocks; shrink until 8 fit.
    assert_eq!(limits.block_size_for(0, 1024, usize::MAX), 128);
    // Never below a warp even when there is not enough work.
    assert_eq!(limits.block_size_for(0, 64, usize::MAX), 32);
}

#[test]
fn test_block_size_respects_hardware_caps() {
    let limits = DeviceLimits { max_local_size: [64, 4], max_local_total: 64, ..DeviceLimits::default() };

    assert_eq!(limits.block_size_for(0, 10_000, usize::MAX), 64);
    assert_eq!(limits.block_size_for(1, 10_000, usize::MAX), 4);
}

#[test]
fn test_block_size_stays_within_budget() {
    let limits = DeviceLimits::default();

    // 1024 total with 128 already spent on dimension 0 leaves 8.
    assert_eq!(limits.block_size_for(1, 10_000, 8), 8);
    // A budget of zero still yields a usable block.
    assert_eq!(limits.block_size_for(1, 10_000, 0), 1);
}
