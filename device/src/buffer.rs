use std::cell::OnceCell;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use skein_dtype::DType;
use smallvec::SmallVec;
#[cfg(feature = "cuda")]
use snafu::ResultExt;

use crate::allocator::{Allocator, BufferOptions, RawBuffer};
use crate::context::{Context, ContextId};
#[cfg(feature = "cuda")]
use crate::error::CudaSnafu;
use crate::error::{InvalidViewSnafu, NotAllocatedSnafu, Result, SizeMismatchSnafu};

/// Shared buffer data that can be referenced by multiple views.
#[derive(Debug)]
struct BufferData {
    /// Lazily-initialized raw buffer.
    raw: OnceCell<RawBuffer>,
    allocator: Arc<dyn Allocator>,
    /// Total size of the underlying allocation in bytes.
    total_size: usize,
    options: BufferOptions,
}

impl BufferData {
    fn new(allocator: Arc<dyn Allocator>, size: usize, options: BufferOptions) -> Self {
        Self { raw: OnceCell::new(), allocator, total_size: size, options }
    }

    fn ensure_allocated(&self) -> Result<&RawBuffer> {
        if let Some(raw) = self.raw.get() {
            return Ok(raw);
        }
        let raw = self.allocator.alloc(self.total_size, &self.options)?;
        Ok(self.raw.get_or_init(|| raw))
    }
}

impl Drop for BufferData {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            self.allocator.free(raw);
        }
    }
}

/// A device buffer that may be a view into another buffer.
///
/// Every buffer is tagged with the context it was created in; kernels refuse
/// buffers from other contexts. This type is `!Send + !Sync`.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Rc<BufferData>,
    /// Offset into the base buffer (in bytes).
    offset: usize,
    /// Size of this view (in bytes).
    size: usize,
    dtype: DType,
    shape: SmallVec<[usize; 4]>,
    context: ContextId,
    _not_send_sync: PhantomData<Rc<()>>,
}

impl Buffer {
    /// Create a new buffer with lazy allocation.
    pub fn new(
        allocator: Arc<dyn Allocator>,
        context: &Context,
        dtype: DType,
        shape: Vec<usize>,
        options: BufferOptions,
    ) -> Self {
        let size = dtype.bytes() * shape.iter().product::<usize>();
        Self {
            data: Rc::new(BufferData::new(allocator, size, options)),
            offset: 0,
            size,
            dtype,
            shape: SmallVec::from_vec(shape),
            context: context.id(),
            _not_send_sync: PhantomData,
        }
    }

    /// Create a new buffer with immediate allocation.
    pub fn allocate(
        allocator: Arc<dyn Allocator>,
        context: &Context,
        dtype: DType,
        shape: Vec<usize>,
        options: BufferOptions,
    ) -> Result<Self> {
        let buffer = Self::new(allocator, context, dtype, shape, options);
        buffer.ensure_allocated()?;
        Ok(buffer)
    }

    /// Create a view of `size` bytes starting `offset` bytes into this buffer.
    pub fn view(&self, offset: usize, size: usize) -> Result<Self> {
        snafu::ensure!(
            offset.checked_add(size).is_some_and(|end| end <= self.size),
            InvalidViewSnafu { offset, size, buffer_size: self.size }
        );

        Ok(Self {
            data: Rc::clone(&self.data),
            offset: self.offset + offset,
            size,
            dtype: self.dtype,
            shape: SmallVec::from_elem(size / self.dtype.bytes(), 1),
            context: self.context,
            _not_send_sync: PhantomData,
        })
    }

    pub fn ensure_allocated(&self) -> Result<()> {
        self.data.ensure_allocated().map(|_| ())
    }

    pub fn is_allocated(&self) -> bool {
        self.data.raw.get().is_some()
    }

    /// Size of this view in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of this view into the base allocation, in bytes.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Context the buffer was created in.
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn allocator(&self) -> &dyn Allocator {
        &*self.data.allocator
    }

    /// Raw allocation backing this buffer, allocating it if needed.
    ///
    /// Backends add [`Buffer::offset`] themselves.
    pub fn raw(&self) -> Result<&RawBuffer> {
        self.data.ensure_allocated()
    }

    /// Host address of the first byte of this view.
    ///
    /// The pointer stays valid while any clone of the buffer is alive. Writing
    /// through it while a `copyin`/`copyout` runs is a data race.
    pub fn host_ptr(&self) -> Result<*mut u8> {
        match self.raw()? {
            RawBuffer::Cpu { data, .. } => {
                let words = data.as_ptr();
                // SAFETY: `words` points at the live boxed slice owned by the RefCell;
                // only its data address is read and no reference is kept.
                let base = unsafe { (*words).as_mut_ptr() } as *mut u8;
                Ok(base.wrapping_add(self.offset))
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { .. } => crate::error::NotHostAccessibleSnafu.fail(),
        }
    }

    /// Copy data from host memory into this buffer.
    pub fn copyin(&mut self, src: &[u8]) -> Result<()> {
        let expected = self.size;
        let actual = src.len();
        snafu::ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        match self.raw()? {
            RawBuffer::Cpu { data, .. } => {
                let mut words = data.borrow_mut();
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut words[..]);
                bytes[self.offset..self.offset + self.size].copy_from_slice(src);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, device } => {
                let mut cuda_data = data.borrow_mut();
                let mut view = cuda_data.slice_mut(self.offset..self.offset + self.size);
                device.default_stream().memcpy_htod(src, &mut view).context(CudaSnafu)
            }
        }
    }

    /// Copy data from this buffer to host memory.
    pub fn copyout(&self, dst: &mut [u8]) -> Result<()> {
        let expected = self.size;
        let actual = dst.len();
        snafu::ensure!(expected == actual, SizeMismatchSnafu { expected, actual });

        match self.raw()? {
            RawBuffer::Cpu { data, .. } => {
                let words = data.borrow();
                let bytes: &[u8] = bytemuck::cast_slice(&words[..]);
                dst.copy_from_slice(&bytes[self.offset..self.offset + self.size]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            RawBuffer::Cuda { data, device } => {
                let stream = device.default_stream();
                stream.synchronize().context(CudaSnafu)?;
                let cuda_data = data.borrow();
                let view = cuda_data.slice(self.offset..self.offset + self.size);
                stream.memcpy_dtoh(&view, dst).context(CudaSnafu)
            }
        }
    }

    /// Wait for all outstanding work on the buffer's device.
    pub fn synchronize(&self) -> Result<()> {
        self.data.allocator.synchronize()
    }

    /// Non-owning reference to this buffer.
    pub fn downgrade(&self) -> WeakBuffer {
        WeakBuffer {
            data: Rc::downgrade(&self.data),
            offset: self.offset,
            size: self.size,
            dtype: self.dtype,
            shape: self.shape.clone(),
            context: self.context,
        }
    }
}

/// Non-owning reference to a [`Buffer`], as stored by kernel argument tables.
#[derive(Debug, Clone)]
pub struct WeakBuffer {
    data: Weak<BufferData>,
    offset: usize,
    size: usize,
    dtype: DType,
    shape: SmallVec<[usize; 4]>,
    context: ContextId,
}

impl WeakBuffer {
    /// The buffer, if its owner still keeps it alive.
    pub fn upgrade(&self) -> Option<Buffer> {
        let data = self.data.upgrade()?;
        Some(Buffer {
            data,
            offset: self.offset,
            size: self.size,
            dtype: self.dtype,
            shape: self.shape.clone(),
            context: self.context,
            _not_send_sync: PhantomData,
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Upgrade or fail with [`crate::Error::NotAllocated`] when the buffer is gone.
    pub fn require(&self) -> Result<Buffer> {
        self.upgrade().ok_or_else(|| NotAllocatedSnafu.build())
    }
}
