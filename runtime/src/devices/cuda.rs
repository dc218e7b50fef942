//! CUDA backend: NVRTC compilation, module loading and driver launches.
//!
//! Sources are compiled to PTX with NVRTC (or taken as PTX when
//! [`KernelFlags::PTX`] is set), loaded into the context's driver context and
//! launched on its default stream. Launches are asynchronous.

use std::sync::Arc;

use cudarc::driver::sys::CUdevice_attribute;
use cudarc::driver::{CudaContext, CudaFunction, CudaModule, DevicePtr, LaunchConfig, PushKernelArg};
use cudarc::nvrtc::{CompileOptions, Ptx};
use skein_device::{
    Context, CudaAllocator, DeviceLimits, DeviceSpec, KernelArg, KernelFlags, KernelHandle, KernelOps, LaunchDims,
    RawBuffer, ScalarValue, WeakBuffer,
};
use smallvec::SmallVec;
use snafu::ResultExt;
use tracing::debug;

use crate::error::{CompilationSnafu, CudaSnafu, Error, InvalidArgumentSnafu, LaunchFailureSnafu, Result};

pub const BACKEND_NAME: &str = "cuda";

/// The driver limits kernel parameters to 4 KiB; every argument is at most 8 bytes.
const MAX_KERNEL_ARGS: u32 = 512;

const FLAG_DEFINES: &[(KernelFlags, &str)] = &[
    (KernelFlags::CLUDA, "SKEIN_CLUDA"),
    (KernelFlags::SMALL, "SKEIN_SMALL"),
    (KernelFlags::DOUBLE, "SKEIN_DOUBLE"),
    (KernelFlags::COMPLEX, "SKEIN_COMPLEX"),
    (KernelFlags::HALF, "SKEIN_HALF"),
];

/// Operations vector of the CUDA backend, bound to one device.
#[derive(Debug, Clone)]
pub struct CudaOps {
    device: Arc<CudaContext>,
}

impl CudaOps {
    pub fn new(device_id: usize) -> Result<Self> {
        let device = CudaContext::new(device_id).context(CudaSnafu)?;
        Ok(Self { device })
    }

    pub fn device_id(&self) -> usize {
        self.device.ordinal()
    }

    /// Context carrying the driver context as native state.
    pub fn create_context(&self) -> Result<Context> {
        let limits = self.limits()?;
        Ok(Context::with_native(
            BACKEND_NAME,
            DeviceSpec::Cuda { device_id: self.device_id() },
            limits,
            Arc::clone(&self.device),
        ))
    }

    /// Allocator for buffers on this device.
    pub fn allocator(&self) -> CudaAllocator {
        CudaAllocator::from_context(Arc::clone(&self.device))
    }

    fn limits(&self) -> Result<DeviceLimits> {
        let attr = |attribute| self.device.attribute(attribute).map(|value| value as usize).context(CudaSnafu);
        Ok(DeviceLimits {
            warp_size: attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_WARP_SIZE)?,
            max_local_size: [
                attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_X)?,
                attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_BLOCK_DIM_Y)?,
            ],
            max_local_total: attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK)?,
            max_grid_size: [
                attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_X)?,
                attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MAX_GRID_DIM_Y)?,
            ],
            compute_units: attr(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT)?,
            max_kernel_args: MAX_KERNEL_ARGS,
        })
    }
}

#[derive(Debug, Clone)]
enum CudaArg {
    Scalar(ScalarValue),
    Buffer(WeakBuffer),
}

/// One launch parameter, sized like the kernel expects it.
enum Param {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

impl Param {
    fn from_scalar(scalar: &ScalarValue) -> Self {
        let word = scalar.to_word();
        match scalar.as_bytes().len() {
            1 => Self::U8(word as u8),
            2 => Self::U16(word as u16),
            4 => Self::U32(word as u32),
            _ => Self::U64(word),
        }
    }
}

struct CudaKernel {
    name: String,
    function: CudaFunction,
    _module: Arc<CudaModule>,
    max_args: u32,
    args: SmallVec<[Option<CudaArg>; 8]>,
}

impl KernelOps for CudaOps {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn accepts(&self, ctx: &Context) -> bool {
        ctx.backend() == BACKEND_NAME && ctx.device() == &DeviceSpec::Cuda { device_id: self.device_id() }
    }

    #[tracing::instrument(skip_all, fields(kernel.name = name))]
    fn compile(&self, ctx: &Context, sources: &[&str], name: &str, flags: KernelFlags) -> Result<KernelHandle> {
        snafu::ensure!(
            !flags.contains(KernelFlags::BINARY),
            InvalidArgumentSnafu { reason: "CUDA backend takes source or PTX text, not binaries" }
        );

        let source = sources.concat();
        let ptx = if flags.contains(KernelFlags::PTX) {
            Ptx::from_src(source)
        } else {
            let mut options = CompileOptions::default();
            for (flag, define) in FLAG_DEFINES {
                if flags.contains(*flag) {
                    options.options.push(format!("-D{define}=1"));
                }
            }
            cudarc::nvrtc::compile_ptx_with_opts(source, options)
                .map_err(|e| CompilationSnafu { name, log: e.to_string() }.build())?
        };

        let module =
            self.device.load_module(ptx).map_err(|e| CompilationSnafu { name, log: e.to_string() }.build())?;
        let function = module
            .load_function(name)
            .map_err(|e| CompilationSnafu { name, log: format!("entry point not found: {e}") }.build())?;

        debug!(device = self.device_id(), "CUDA kernel loaded");
        let kernel = CudaKernel {
            name: name.to_string(),
            function,
            _module: module,
            max_args: ctx.limits().max_kernel_args,
            args: SmallVec::new(),
        };
        Ok(KernelHandle::new(BACKEND_NAME, kernel))
    }

    fn release(&self, handle: KernelHandle) -> Result<()> {
        let kernel = handle.into_inner::<CudaKernel>()?;
        debug!(kernel.name = %kernel.name, "CUDA kernel released");
        Ok(())
    }

    fn max_args(&self, handle: &KernelHandle) -> u32 {
        handle.downcast_ref::<CudaKernel>().map_or(0, |kernel| kernel.max_args)
    }

    fn set_arg(&self, handle: &mut KernelHandle, index: u32, arg: KernelArg<'_>) -> Result<()> {
        let kernel = handle.downcast_mut::<CudaKernel>()?;
        snafu::ensure!(
            index < kernel.max_args,
            InvalidArgumentSnafu { reason: format!("argument index {index} out of range ({} slots)", kernel.max_args) }
        );

        let value = match arg {
            KernelArg::Scalar(scalar) => CudaArg::Scalar(scalar),
            KernelArg::Buffer(buffer) => {
                buffer.ensure_allocated()?;
                CudaArg::Buffer(buffer.downgrade())
            }
        };

        let index = index as usize;
        if kernel.args.len() <= index {
            kernel.args.resize_with(index + 1, || None);
        }
        kernel.args[index] = Some(value);
        Ok(())
    }

    fn launch(&self, handle: &mut KernelHandle, dims: &LaunchDims) -> Result<()> {
        let kernel = handle.downcast_mut::<CudaKernel>()?;
        let stream = self.device.default_stream();

        let mut params: SmallVec<[Param; 8]> = SmallVec::with_capacity(kernel.args.len());
        for (index, arg) in kernel.args.iter().enumerate() {
            let param = match arg {
                None => {
                    return LaunchFailureSnafu { reason: format!("argument {index} of '{}' is not bound", kernel.name) }
                        .fail();
                }
                Some(CudaArg::Scalar(scalar)) => Param::from_scalar(scalar),
                Some(CudaArg::Buffer(weak)) => {
                    let buffer = weak.upgrade().ok_or_else(|| {
                        LaunchFailureSnafu { reason: format!("buffer bound to argument {index} was dropped") }.build()
                    })?;
                    match buffer.raw()? {
                        RawBuffer::Cuda { data, .. } => {
                            let data = data.borrow();
                            let (base, _sync) = data.device_ptr(&stream);
                            Param::U64(base + buffer.offset() as u64)
                        }
                        RawBuffer::Cpu { .. } => {
                            return LaunchFailureSnafu { reason: format!("argument {index} is host memory") }.fail();
                        }
                    }
                }
            };
            params.push(param);
        }

        let cfg = LaunchConfig {
            grid_dim: (to_u32(dims.grid[0])?, to_u32(dims.grid[1])?, 1),
            block_dim: (to_u32(dims.local[0])?, to_u32(dims.local[1])?, 1),
            shared_mem_bytes: 0,
        };

        let mut builder = stream.launch_builder(&kernel.function);
        for param in &params {
            match param {
                Param::U8(v) => builder.arg(v),
                Param::U16(v) => builder.arg(v),
                Param::U32(v) => builder.arg(v),
                Param::U64(v) => builder.arg(v),
            };
        }
        // SAFETY: parameter widths follow the bound scalar types and buffers
        // are device pointers owned by live allocations.
        unsafe { builder.launch(cfg) }
            .map(|_| ())
            .map_err(|e| LaunchFailureSnafu { reason: e.to_string() }.build())?;

        debug!(kernel.name = %kernel.name, grid = ?cfg.grid_dim, block = ?cfg.block_dim, "CUDA kernel enqueued");
        Ok(())
    }
}

fn to_u32(extent: usize) -> Result<u32> {
    u32::try_from(extent).map_err(|_| -> Error {
        LaunchFailureSnafu { reason: format!("extent {extent} does not fit the driver's 32-bit launch fields") }.build()
    })
}
