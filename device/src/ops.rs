//! The kernel operations vector.
//!
//! Every backend implements [`KernelOps`] once. Kernels hold an
//! `Arc<dyn KernelOps>` and route compilation, argument binding and launches
//! through it; nothing above this trait knows which backend is active.
//!
//! # Lifecycle
//!
//! ```ignore
//! let handle = ops.compile(&ctx, &[src], "saxpy", KernelFlags::empty())?;
//! ops.set_arg(&mut handle, 0, KernelArg::Scalar(ScalarValue::new(2.0f32)))?;
//! ops.set_arg(&mut handle, 1, KernelArg::Buffer(&x))?;
//! ops.launch(&mut handle, &LaunchDims::new_1d(256, 4))?;
//! ops.release(handle)?;
//! ```

use std::any::Any;
use std::fmt;

use skein_dtype::{DType, HasDType};
use smallvec::SmallVec;

use crate::buffer::Buffer;
use crate::context::Context;
use crate::error::{InvalidArgumentSnafu, Result};

bitflags::bitflags! {
    /// Compilation/use flags. Bit meanings are backend-defined; kernels pass
    /// them through untouched, unknown bits included.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KernelFlags: u32 {
        /// Source uses the portable kernel dialect header.
        const CLUDA = 0x01;
        /// Index arithmetic fits in 32 bits.
        const SMALL = 0x02;
        /// Source uses double precision.
        const DOUBLE = 0x04;
        /// Source uses complex types.
        const COMPLEX = 0x08;
        /// Source uses half precision.
        const HALF = 0x10;
        /// Source is a prebuilt binary rather than text.
        const BINARY = 0x20;
        /// Source is PTX assembly.
        const PTX = 0x40;
        /// Source targets the CUDA dialect.
        const CUDA = 0x2000;
        /// Source targets the OpenCL dialect.
        const OPENCL = 0x4000;
    }
}

/// Behaviour a backend guarantees beyond the trait contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpsCapabilities {
    /// A failed launch leaves the bound arguments in an unknown state; every
    /// bound slot must be rebound before the next launch.
    pub launch_failure_invalidates_args: bool,
}

impl Default for OpsCapabilities {
    fn default() -> Self {
        Self { launch_failure_invalidates_args: true }
    }
}

/// Opaque, backend-owned compiled kernel.
///
/// Only the backend that produced a handle can look inside it. It is handed
/// back to that backend's [`KernelOps::release`] exactly once.
pub struct KernelHandle {
    backend: &'static str,
    inner: Box<dyn Any>,
}

impl KernelHandle {
    pub fn new<T: Any>(backend: &'static str, inner: T) -> Self {
        Self { backend, inner: Box::new(inner) }
    }

    /// Name of the backend that created the handle.
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Borrow the backend state, failing if the handle came from another backend.
    pub fn downcast_ref<T: Any>(&self) -> Result<&T> {
        let backend = self.backend;
        self.inner
            .downcast_ref()
            .ok_or_else(|| InvalidArgumentSnafu { reason: format!("kernel handle belongs to backend '{backend}'") }.build())
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Result<&mut T> {
        let backend = self.backend;
        self.inner
            .downcast_mut()
            .ok_or_else(|| InvalidArgumentSnafu { reason: format!("kernel handle belongs to backend '{backend}'") }.build())
    }

    /// Take the backend state out of the handle.
    pub fn into_inner<T: Any>(self) -> Result<Box<T>> {
        let backend = self.backend;
        self.inner
            .downcast()
            .map_err(|_| InvalidArgumentSnafu { reason: format!("kernel handle belongs to backend '{backend}'") }.build())
    }
}

impl fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelHandle").field("backend", &self.backend).finish_non_exhaustive()
    }
}

/// A scalar kernel argument: a type plus exactly `dtype.bytes()` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarValue {
    dtype: DType,
    bytes: SmallVec<[u8; 8]>,
}

impl ScalarValue {
    pub fn new<T: HasDType>(value: T) -> Self {
        let mut bytes = SmallVec::from_elem(0u8, T::DTYPE.bytes());
        value.encode(&mut bytes);
        Self { dtype: T::DTYPE, bytes }
    }

    /// Build from raw native-endian bytes; the length must match the type's width.
    pub fn from_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        snafu::ensure!(
            bytes.len() == dtype.bytes(),
            InvalidArgumentSnafu {
                reason: format!("{dtype} argument needs {} bytes, got {}", dtype.bytes(), bytes.len())
            }
        );
        Ok(Self { dtype, bytes: SmallVec::from_slice(bytes) })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Bytes zero-extended into a native-endian 64-bit word.
    pub fn to_word(&self) -> u64 {
        let mut word = [0u8; 8];
        if cfg!(target_endian = "little") {
            word[..self.bytes.len()].copy_from_slice(&self.bytes);
        } else {
            word[8 - self.bytes.len()..].copy_from_slice(&self.bytes);
        }
        u64::from_ne_bytes(word)
    }
}

/// One argument as handed to [`KernelOps::set_arg`].
#[derive(Debug, Clone)]
pub enum KernelArg<'a> {
    Scalar(ScalarValue),
    /// Borrowed for the duration of the call; backends keep at most a
    /// [`crate::WeakBuffer`].
    Buffer(&'a Buffer),
}

/// Fully resolved launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDims {
    /// Block (work-group) size per dimension.
    pub local: [usize; 2],
    /// Grid size (number of blocks) per dimension.
    pub grid: [usize; 2],
}

impl LaunchDims {
    pub fn new_1d(local: usize, grid: usize) -> Self {
        Self { local: [local, 1], grid: [grid, 1] }
    }

    pub fn new_2d(local: [usize; 2], grid: [usize; 2]) -> Self {
        Self { local, grid }
    }

    /// Instances launched along `dim`.
    pub fn instances(&self, dim: usize) -> usize {
        self.local[dim] * self.grid[dim]
    }

    /// Total instances launched.
    pub fn total(&self) -> usize {
        self.instances(0) * self.instances(1)
    }
}

impl Default for LaunchDims {
    fn default() -> Self {
        Self { local: [1, 1], grid: [1, 1] }
    }
}

/// Backend capability table.
///
/// Handles passed to a backend were produced by its own [`KernelOps::compile`].
pub trait KernelOps: Send + Sync + fmt::Debug {
    /// Backend name; contexts created by this backend carry the same name.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> OpsCapabilities {
        OpsCapabilities::default()
    }

    /// Whether kernels for `ctx` can be built by this backend.
    fn accepts(&self, ctx: &Context) -> bool {
        ctx.backend() == self.name()
    }

    /// Compile and link `sources` (concatenated in order) and look up `name`.
    ///
    /// Fails with [`crate::Error::Compilation`] when the source is rejected.
    fn compile(&self, ctx: &Context, sources: &[&str], name: &str, flags: KernelFlags) -> Result<KernelHandle>;

    /// Release a compiled kernel.
    fn release(&self, handle: KernelHandle) -> Result<()>;

    /// Number of argument slots the kernel declares.
    fn max_args(&self, handle: &KernelHandle) -> u32;

    /// Record `arg` for slot `index`, replacing any previous value.
    fn set_arg(&self, handle: &mut KernelHandle, index: u32, arg: KernelArg<'_>) -> Result<()>;

    /// Enqueue a launch. Does not wait for completion.
    fn launch(&self, handle: &mut KernelHandle, dims: &LaunchDims) -> Result<()>;

    /// Block size to use along `dim` when only the instance count `n` is known.
    ///
    /// `budget` is how many block instances the other dimension leaves; a
    /// result above it makes the block exceed the device limit.
    fn block_size_hint(
        &self,
        _handle: &KernelHandle,
        ctx: &Context,
        dim: usize,
        n: usize,
        budget: usize,
    ) -> Result<usize> {
        Ok(ctx.limits().block_size_for(dim, n, budget))
    }
}
