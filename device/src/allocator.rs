use std::cell::RefCell;
#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaContext, CudaSlice};
#[cfg(feature = "cuda")]
use snafu::ResultExt;

#[cfg(feature = "cuda")]
use crate::error::CudaSnafu;
use crate::error::Result;

/// Opaque handle to device memory.
///
/// Uses `RefCell` for interior mutability with runtime borrow checking.
/// Safe for single-threaded use (Buffer is !Send + !Sync).
#[derive(Debug)]
pub enum RawBuffer {
    /// Host memory, stored as words so every element type is suitably aligned.
    Cpu { data: RefCell<Box<[u64]>>, len: usize },
    #[cfg(feature = "cuda")]
    Cuda { data: RefCell<CudaSlice<u8>>, device: Arc<CudaContext> },
}

impl RawBuffer {
    /// Get the size of the buffer in bytes.
    pub fn size(&self) -> usize {
        match self {
            RawBuffer::Cpu { len, .. } => *len,
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, .. } => data.borrow().len(),
        }
    }
}

/// Options for buffer allocation.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// Whether to zero-initialize the buffer.
    pub zero_init: bool,
}

pub trait Allocator: Send + Sync + std::fmt::Debug {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer>;
    fn free(&self, _buffer: RawBuffer) {}
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &str;
}

/// CPU allocator using system memory.
#[derive(Debug, Clone)]
pub struct CpuAllocator;

impl Allocator for CpuAllocator {
    fn alloc(&self, size: usize, _options: &BufferOptions) -> Result<RawBuffer> {
        // Host memory is always zeroed.
        let data = vec![0u64; size.div_ceil(8)].into_boxed_slice();
        Ok(RawBuffer::Cpu { data: RefCell::new(data), len: size })
    }

    fn name(&self) -> &str {
        "CPU"
    }
}

/// CUDA allocator using GPU memory.
#[cfg(feature = "cuda")]
#[derive(Debug, Clone)]
pub struct CudaAllocator {
    device: Arc<CudaContext>,
}

#[cfg(feature = "cuda")]
impl CudaAllocator {
    pub fn new(device_id: usize) -> Result<Self> {
        let device = CudaContext::new(device_id).context(CudaSnafu)?;
        Ok(Self { device })
    }

    /// Allocate from an already-open driver context.
    pub fn from_context(device: Arc<CudaContext>) -> Self {
        Self { device }
    }

    pub fn device_id(&self) -> usize {
        self.device.ordinal()
    }
}

#[cfg(feature = "cuda")]
impl Allocator for CudaAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        let stream = self.device.default_stream();
        let data = if options.zero_init { stream.alloc_zeros::<u8>(size) } else { unsafe { stream.alloc::<u8>(size) } }
            .context(CudaSnafu)?;

        Ok(RawBuffer::Cuda { data: RefCell::new(data), device: Arc::clone(&self.device) })
    }

    fn synchronize(&self) -> Result<()> {
        self.device.default_stream().synchronize().context(CudaSnafu)
    }

    fn name(&self) -> &str {
        "CUDA"
    }
}
