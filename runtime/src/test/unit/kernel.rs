use std::sync::Arc;
use std::sync::atomic::Ordering;

use skein_device::{DeviceLimits, DeviceSpec, KernelFlags, LaunchDims};
use skein_dtype::DType;
use test_case::test_case;

use crate::error::Error;
use crate::kernel::Kernel;
use crate::test::helpers::{Bound, Call, MOCK, RecordingOps, host_buffer, mock_context};

fn compile(ops: &Arc<RecordingOps>) -> Kernel {
    Kernel::new(ops.clone(), &mock_context(), &["void k() {}"], "k", KernelFlags::empty()).unwrap()
}

#[test]
fn test_new_exposes_construction_context() {
    let ops = RecordingOps::new();
    let ctx = mock_context();
    let flags = KernelFlags::DOUBLE | KernelFlags::from_bits_retain(0x1_0000);
    let kernel = Kernel::new(ops.clone(), &ctx, &["a", "b"], "saxpy", flags).unwrap();

    assert!(kernel.is_initialized());
    assert_eq!(kernel.context(), &ctx);
    assert_eq!(kernel.context().id(), ctx.id());
    assert_eq!(kernel.name(), "saxpy");
    assert_eq!(kernel.max_args(), 4);
    assert_eq!(
        ops.calls(),
        vec![Call::Compile { sources: vec!["a".into(), "b".into()], name: "saxpy".into(), flags }]
    );
}

#[test]
fn test_zero_fragments_rejected_without_backend_call() {
    let ops = RecordingOps::new();
    let result = Kernel::init(ops.clone(), &mock_context(), &[], None, "k", KernelFlags::empty());

    assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    assert!(ops.calls().is_empty());
}

#[test_case("" ; "empty")]
#[test_case("k\0x" ; "embedded nul")]
fn test_bad_name_rejected(name: &str) {
    let ops = RecordingOps::new();
    let result = Kernel::new(ops.clone(), &mock_context(), &["src"], name, KernelFlags::empty());

    assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    assert_eq!(ops.releases(), 0);
    assert!(ops.calls().is_empty());
}

#[test]
fn test_all_empty_fragments_rejected() {
    let ops = RecordingOps::new();
    let result = Kernel::init(ops.clone(), &mock_context(), &[b"", b"\0ignored"], None, "k", KernelFlags::empty());
    assert!(matches!(result, Err(Error::InvalidArgument { .. })));
}

#[test_case(None, &["abc"] ; "nul terminated")]
#[test_case(Some(&[0][..]), &["abc"] ; "zero length scans")]
#[test_case(Some(&[2][..]), &["ab"] ; "explicit length")]
#[test_case(Some(&[8][..]), &["abc\0junk"] ; "explicit length keeps nul")]
fn test_fragment_lengths(lens: Option<&[usize]>, expected: &[&str]) {
    let ops = RecordingOps::new();
    Kernel::init(ops.clone(), &mock_context(), &[b"abc\0junk"], lens, "k", KernelFlags::empty()).unwrap();

    let Call::Compile { sources, .. } = &ops.calls()[0] else { panic!("expected compile") };
    assert_eq!(sources, expected);
}

#[test_case(&[1, 2] ; "count mismatch")]
#[test_case(&[9] ; "longer than fragment")]
fn test_bad_lengths_rejected(lens: &[usize]) {
    let ops = RecordingOps::new();
    let result = Kernel::init(ops.clone(), &mock_context(), &[b"abcdefgh"], Some(lens), "k", KernelFlags::empty());
    assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    assert!(ops.calls().is_empty());
}

#[test]
fn test_non_utf8_fragment_rejected() {
    let ops = RecordingOps::new();
    let result = Kernel::init(ops.clone(), &mock_context(), &[&[0xff, 0xfe]], None, "k", KernelFlags::empty());
    assert!(matches!(result, Err(Error::InvalidArgument { .. })));
}

#[test]
fn test_foreign_context_rejected() {
    let ops = RecordingOps::new();
    let ctx = skein_device::Context::new("other", DeviceSpec::Host, DeviceLimits::default());
    let result = Kernel::new(ops.clone(), &ctx, &["src"], "k", KernelFlags::empty());
    assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    assert!(ops.calls().is_empty());
}

#[test]
fn test_compilation_failure_leaves_nothing_to_release() {
    let ops = RecordingOps::new();
    ops.fail_compile.store(true, Ordering::SeqCst);
    let result = Kernel::new(ops.clone(), &mock_context(), &["src"], "broken", KernelFlags::empty());

    match result {
        Err(Error::Compilation { name, log }) => {
            assert_eq!(name, "broken");
            assert_eq!(log, "syntax error");
        }
        other => panic!("expected compilation error, got {other:?}"),
    }
    assert_eq!(ops.releases(), 0);
}

#[test]
fn test_later_binding_wins() {
    let ops = RecordingOps::new();
    let mut kernel = compile(&ops);

    kernel.set_arg(0, DType::Int32.code(), &1i32.to_ne_bytes()).unwrap();
    kernel.set_arg(0, DType::Int32.code(), &2i32.to_ne_bytes()).unwrap();
    kernel.call(1, 1, 1).unwrap();

    let (_, args) = ops.last_launch().unwrap();
    assert_eq!(args[0], Bound::Scalar(DType::Int32, 2i32.to_ne_bytes().to_vec()));
}

#[test]
fn test_buffer_replaces_scalar_in_slot() {
    let ops = RecordingOps::new();
    let ctx = mock_context();
    let mut kernel = Kernel::new(ops.clone(), &ctx, &["src"], "k", KernelFlags::empty()).unwrap();
    let buffer = host_buffer(&ctx, DType::Int32, 8);

    kernel.set_scalar(0, 5i32).unwrap();
    kernel.set_buffer_arg(0, &buffer).unwrap();
    kernel.call(8, 0, 0).unwrap();

    let (_, args) = ops.last_launch().unwrap();
    assert_eq!(args, vec![Bound::Buffer(ctx.id())]);
}

#[test]
fn test_typed_scalar_binding() {
    let ops = RecordingOps::new();
    let mut kernel = compile(&ops);

    kernel.set_scalar(1, 2.5f64).unwrap();
    kernel.set_scalar(2, 7u8).unwrap();
    kernel.call(1, 0, 0).unwrap();

    let (_, args) = ops.last_launch().unwrap();
    assert_eq!(
        args,
        vec![
            Bound::Unbound,
            Bound::Scalar(DType::Float64, 2.5f64.to_ne_bytes().to_vec()),
            Bound::Scalar(DType::UInt8, vec![7]),
        ]
    );
}

#[test_case(4, DType::Int32.code(), 4 ; "index out of range")]
#[test_case(0, 99, 4 ; "unknown type code")]
#[test_case(0, -1, 4 ; "negative type code")]
#[test_case(0, DType::Int32.code(), 2 ; "wrong width")]
fn test_bad_scalar_rejected(index: u32, typecode: i32, len: usize) {
    let ops = RecordingOps::new();
    let mut kernel = compile(&ops);

    let result = kernel.set_arg(index, typecode, &vec![0u8; len]);
    assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    assert_eq!(ops.count(|call| matches!(call, Call::SetArg { .. })), 0);
}

#[test]
fn test_buffer_binding() {
    let ops = RecordingOps::new();
    let ctx = mock_context();
    let mut kernel = Kernel::new(ops.clone(), &ctx, &["src"], "k", KernelFlags::empty()).unwrap();
    let buffer = host_buffer(&ctx, DType::Float32, 16);

    kernel.set_buffer_arg(0, &buffer).unwrap();
    kernel.call(16, 0, 0).unwrap();

    let (_, args) = ops.last_launch().unwrap();
    assert_eq!(args, vec![Bound::Buffer(ctx.id())]);
}

#[test]
fn test_cross_context_buffer_rejected() {
    let ops = RecordingOps::new();
    let ctx = mock_context();
    let other = mock_context();
    let mut kernel = Kernel::new(ops.clone(), &ctx, &["src"], "k", KernelFlags::empty()).unwrap();
    kernel.set_scalar(0, 1i32).unwrap();
    let calls_before = ops.calls().len();

    let foreign = host_buffer(&other, DType::Float32, 4);
    match kernel.set_buffer_arg(0, &foreign) {
        Err(Error::ContextMismatch { expected, actual }) => {
            assert_eq!(expected, ctx.id());
            assert_eq!(actual, other.id());
        }
        other => panic!("expected context mismatch, got {other:?}"),
    }
    assert_eq!(ops.calls().len(), calls_before);

    kernel.call(1, 0, 0).unwrap();
    let (_, args) = ops.last_launch().unwrap();
    assert_eq!(args[0], Bound::Scalar(DType::Int32, 1i32.to_ne_bytes().to_vec()));
}

#[test]
fn test_heuristic_launch_covers_n() {
    let ops = RecordingOps::new();
    let mut kernel = compile(&ops);

    let dims = kernel.call2([100, 1], [0, 0], [0, 0]).unwrap();
    assert!(dims.local[0] > 0);
    assert!(dims.local[0] * dims.grid[0] >= 100);
    assert_eq!(ops.count(|call| matches!(call, Call::Hint { dim: 0, n: 100, budget: 1024 })), 1);
}

#[test]
fn test_heuristic_2d_block_within_device_limit() {
    let ops = RecordingOps::new();
    let mut kernel = compile(&ops);

    let dims = kernel.call2([300, 100], [0, 0], [0, 0]).unwrap();
    let limits = DeviceLimits::default();
    assert!(dims.local[0] * dims.local[1] <= limits.max_local_total);
    assert!(dims.instances(0) >= 300 && dims.instances(1) >= 100);
    assert_eq!(ops.count(|call| matches!(call, Call::Hint { dim: 1, n: 100, budget: 4 })), 1);
    assert_eq!(ops.last_launch().unwrap().0, dims);
}

#[test]
fn test_explicit_geometry_used_verbatim() {
    let ops = RecordingOps::new();
    let mut kernel = compile(&ops);

    let dims = kernel.call2([0, 0], [10, 1], [5, 1]).unwrap();
    assert_eq!(dims, LaunchDims::new_1d(10, 5));
    assert_eq!(dims.total(), 50);
    assert_eq!(ops.last_launch().unwrap().0, dims);
    assert_eq!(ops.count(|call| matches!(call, Call::Hint { .. })), 0);
}

#[test]
fn test_uneven_n_rounds_up() {
    let ops = RecordingOps::new();
    let mut kernel = compile(&ops);

    let dims = kernel.call(1000, 64, 0).unwrap();
    assert_eq!(dims, LaunchDims::new_1d(64, 16));
    assert_eq!(dims.total(), 1024);
}

#[test]
fn test_empty_launch_is_single_instance() {
    let ops = RecordingOps::new();
    let mut kernel = compile(&ops);
    assert_eq!(kernel.call(0, 0, 0).unwrap(), LaunchDims::default());
}

#[test]
fn test_clear_is_idempotent() {
    let ops = RecordingOps::new();
    let mut kernel = compile(&ops);

    kernel.clear();
    kernel.clear();
    assert!(!kernel.is_initialized());
    assert_eq!(ops.releases(), 1);

    drop(kernel);
    assert_eq!(ops.releases(), 1);
}

#[test]
fn test_drop_releases_once() {
    let ops = RecordingOps::new();
    drop(compile(&ops));
    assert_eq!(ops.releases(), 1);
}

#[test]
fn test_cleared_kernel_rejects_use() {
    let ops = RecordingOps::new();
    let ctx = mock_context();
    let mut kernel = Kernel::new(ops.clone(), &ctx, &["src"], "k", KernelFlags::empty()).unwrap();
    kernel.clear();

    assert!(matches!(kernel.set_scalar(0, 1i32), Err(Error::InvalidArgument { .. })));
    assert!(matches!(kernel.set_buffer_arg(0, &host_buffer(&ctx, DType::Int8, 1)), Err(Error::InvalidArgument { .. })));
    assert!(matches!(kernel.call(1, 1, 1), Err(Error::InvalidArgument { .. })));
    assert_eq!(ops.count(|call| matches!(call, Call::Launch { .. } | Call::SetArg { .. })), 0);
}

#[test]
fn test_release_failure_is_swallowed() {
    let ops = RecordingOps::new();
    ops.fail_release.store(true, Ordering::SeqCst);
    let mut kernel = compile(&ops);

    kernel.clear();
    assert!(!kernel.is_initialized());
    assert_eq!(ops.releases(), 1);
}

#[test]
fn test_failed_launch_requires_rebinding() {
    let ops = RecordingOps::new();
    let mut kernel = compile(&ops);
    kernel.set_scalar(0, 1i32).unwrap();
    kernel.set_scalar(1, 2i32).unwrap();

    ops.set_fail_launch(true);
    assert!(matches!(kernel.call(8, 0, 0), Err(Error::LaunchFailure { .. })));
    ops.set_fail_launch(false);

    assert!(matches!(kernel.call(8, 0, 0), Err(Error::InvalidArgument { .. })));
    kernel.set_scalar(0, 3i32).unwrap();
    assert!(matches!(kernel.call(8, 0, 0), Err(Error::InvalidArgument { .. })));
    kernel.set_scalar(1, 4i32).unwrap();
    kernel.call(8, 0, 0).unwrap();
    assert_eq!(ops.count(|call| matches!(call, Call::Launch { .. })), 1);
}

#[test]
fn test_failed_launch_keeps_arguments_when_backend_allows() {
    let ops = RecordingOps::with_policy(false);
    let mut kernel = compile(&ops);
    kernel.set_scalar(0, 1i32).unwrap();

    ops.set_fail_launch(true);
    assert!(kernel.call(8, 0, 0).is_err());
    ops.set_fail_launch(false);

    kernel.call(8, 0, 0).unwrap();
    let (_, args) = ops.last_launch().unwrap();
    assert_eq!(args[0], Bound::Scalar(DType::Int32, 1i32.to_ne_bytes().to_vec()));
}

#[test]
fn test_debug_output() {
    let ops = RecordingOps::new();
    let kernel = compile(&ops);
    let text = format!("{kernel:?}");
    assert!(text.contains("\"k\""));
    assert!(text.contains(MOCK));
}
