use crate::{Context, DeviceLimits, DeviceSpec};

#[test]
fn test_context_ids_are_unique() {
    let a = Context::new("test", DeviceSpec::Host, DeviceLimits::default());
    let b = Context::new("test", DeviceSpec::Host, DeviceLimits::default());

    assert_ne!(a.id(), b.id());
    assert_ne!(a, b);
    assert_eq!(a, a.clone());
}

#[test]
fn test_native_state() {
    let ctx = Context::with_native("test", DeviceSpec::Cuda { device_id: 1 }, DeviceLimits::default(), 42u32);

    assert_eq!(ctx.native::<u32>(), Some(&42));
    assert_eq!(ctx.native::<u64>(), None);
    assert_eq!(ctx.backend(), "test");
    assert_eq!(ctx.device(), &DeviceSpec::Cuda { device_id: 1 });

    let plain = Context::new("test", DeviceSpec::Host, DeviceLimits::default());
    assert_eq!(plain.native::<u32>(), None);
}
