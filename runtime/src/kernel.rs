//! The backend-agnostic kernel object.
//!
//! A [`Kernel`] owns one compiled-kernel handle and reaches its backend only
//! through the [`KernelOps`] it was created with.
//!
//! ```ignore
//! let mut kernel = Kernel::new(ops, &ctx, &[SAXPY], "saxpy", KernelFlags::empty())?;
//! kernel.set_scalar(0, 2.0f32)?;
//! kernel.set_buffer_arg(1, &x)?;
//! kernel.set_buffer_arg(2, &y)?;
//! kernel.call(len, 0, 0)?;
//! ```

use std::fmt;
use std::sync::Arc;

use skein_device::{Buffer, Context, KernelArg, KernelFlags, KernelHandle, KernelOps, LaunchDims, ScalarValue};
use skein_dtype::{DType, HasDType, TypeCode};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::{ContextMismatchSnafu, InvalidArgumentSnafu, Result};
use crate::launch;

/// State of one argument slot as seen by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Unbound,
    Bound,
    /// Bound before a failed launch; must be rebound.
    Stale,
}

/// A compiled kernel bound to one context and one backend.
///
/// Either initialized (holding a backend handle) or cleared. Binding and
/// launching take `&mut self`, so one caller at a time binds and launches.
pub struct Kernel {
    handle: Option<KernelHandle>,
    ops: Arc<dyn KernelOps>,
    context: Context,
    name: String,
    flags: KernelFlags,
    max_args: u32,
    slots: SmallVec<[Slot; 8]>,
}

impl Kernel {
    /// Compile `sources` (concatenated in order) and look up entry point `name`.
    pub fn new(
        ops: Arc<dyn KernelOps>,
        ctx: &Context,
        sources: &[&str],
        name: &str,
        flags: KernelFlags,
    ) -> Result<Self> {
        let strs: SmallVec<[&[u8]; 4]> = sources.iter().map(|s| s.as_bytes()).collect();
        Self::init(ops, ctx, &strs, None, name, flags)
    }

    /// Compile from raw source fragments.
    ///
    /// `lens[i] == 0` (or no `lens` at all) means fragment `i` ends at its
    /// first NUL byte, or at the end of the slice when it has none.
    #[tracing::instrument(skip_all, fields(kernel.name = name, backend = ops.name()))]
    pub fn init(
        ops: Arc<dyn KernelOps>,
        ctx: &Context,
        strs: &[&[u8]],
        lens: Option<&[usize]>,
        name: &str,
        flags: KernelFlags,
    ) -> Result<Self> {
        snafu::ensure!(!strs.is_empty(), InvalidArgumentSnafu { reason: "no source fragments" });
        if let Some(lens) = lens {
            snafu::ensure!(
                lens.len() == strs.len(),
                InvalidArgumentSnafu { reason: format!("{} fragments but {} lengths", strs.len(), lens.len()) }
            );
        }
        snafu::ensure!(!name.is_empty(), InvalidArgumentSnafu { reason: "kernel name is empty" });
        snafu::ensure!(!name.contains('\0'), InvalidArgumentSnafu { reason: "kernel name contains NUL" });
        snafu::ensure!(
            ops.accepts(ctx),
            InvalidArgumentSnafu {
                reason: format!("context of backend '{}' cannot run '{}' kernels", ctx.backend(), ops.name())
            }
        );

        let sources = strs
            .iter()
            .enumerate()
            .map(|(i, src)| fragment(src, lens.map_or(0, |lens| lens[i]), i))
            .collect::<Result<SmallVec<[&str; 4]>>>()?;
        snafu::ensure!(
            sources.iter().any(|s| !s.is_empty()),
            InvalidArgumentSnafu { reason: "kernel source is empty" }
        );

        let handle = ops.compile(ctx, &sources, name, flags)?;
        let max_args = ops.max_args(&handle);
        debug!(
            kernel.fragments = sources.len(),
            kernel.flags = flags.bits(),
            kernel.max_args = max_args,
            context.id = ctx.id(),
            "kernel compiled"
        );

        Ok(Self {
            handle: Some(handle),
            ops,
            context: ctx.clone(),
            name: name.to_string(),
            flags,
            max_args,
            slots: SmallVec::new(),
        })
    }

    /// Release the backend handle. Calling it again does nothing.
    ///
    /// Release errors are logged, never returned.
    pub fn clear(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Err(error) = self.ops.release(handle) {
            warn!(kernel.name = %self.name, %error, "kernel release failed");
        }
        self.slots.clear();
        debug!(kernel.name = %self.name, "kernel cleared");
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.is_some()
    }

    /// Context the kernel was compiled in.
    ///
    /// Calling this on a cleared kernel is a precondition violation.
    pub fn context(&self) -> &Context {
        debug_assert!(self.is_initialized(), "context() on cleared kernel '{}'", self.name);
        &self.context
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> KernelFlags {
        self.flags
    }

    pub fn ops(&self) -> &Arc<dyn KernelOps> {
        &self.ops
    }

    /// Number of argument slots the kernel declares.
    pub fn max_args(&self) -> u32 {
        self.max_args
    }

    /// Bind a scalar given as a type code plus its native-endian bytes.
    pub fn set_arg(&mut self, index: u32, typecode: TypeCode, value: &[u8]) -> Result<()> {
        self.check_slot(index)?;
        let dtype = DType::from_code(typecode)
            .ok_or_else(|| InvalidArgumentSnafu { reason: format!("unknown type code {typecode}") }.build())?;
        let scalar = ScalarValue::from_bytes(dtype, value)?;
        self.bind(index, KernelArg::Scalar(scalar))
    }

    /// Bind a typed scalar.
    pub fn set_scalar<T: HasDType>(&mut self, index: u32, value: T) -> Result<()> {
        self.check_slot(index)?;
        self.bind(index, KernelArg::Scalar(ScalarValue::new(value)))
    }

    /// Bind a buffer. The kernel does not keep the buffer alive.
    pub fn set_buffer_arg(&mut self, index: u32, buffer: &Buffer) -> Result<()> {
        self.check_slot(index)?;
        let expected = self.context.id();
        let actual = buffer.context_id();
        snafu::ensure!(expected == actual, ContextMismatchSnafu { expected, actual });
        self.bind(index, KernelArg::Buffer(buffer))
    }

    /// Launch over a 2-D decomposition; `0` marks an unspecified extent.
    ///
    /// Returns the geometry actually launched. The launch is enqueued, not
    /// awaited.
    pub fn call2(&mut self, n: [usize; 2], ls: [usize; 2], gs: [usize; 2]) -> Result<LaunchDims> {
        let Self { handle, ops, context, name, slots, .. } = self;
        let handle = handle.as_mut().ok_or_else(|| cleared(name))?;

        if let Some(index) = slots.iter().position(|slot| *slot == Slot::Stale) {
            return InvalidArgumentSnafu {
                reason: format!("argument {index} of kernel '{name}' must be rebound after a failed launch"),
            }
            .fail();
        }

        let max_block = context.limits().max_local_total;
        let dims = launch::resolve(n, ls, gs, max_block, |dim, count, budget| {
            ops.block_size_hint(&*handle, &*context, dim, count, budget)
        })?;
        debug!(
            kernel.name = %name,
            n = ?n,
            local = ?dims.local,
            grid = ?dims.grid,
            "launching kernel"
        );

        if let Err(error) = ops.launch(handle, &dims) {
            if ops.capabilities().launch_failure_invalidates_args {
                for slot in slots.iter_mut().filter(|slot| **slot == Slot::Bound) {
                    *slot = Slot::Stale;
                }
            }
            warn!(kernel.name = %name, %error, "kernel launch failed");
            return Err(error);
        }
        Ok(dims)
    }

    /// One-dimensional launch.
    pub fn call(&mut self, n: usize, ls: usize, gs: usize) -> Result<LaunchDims> {
        self.call2([n, 1], [ls, 1], [gs, 1])
    }

    fn check_slot(&self, index: u32) -> Result<()> {
        snafu::ensure!(self.handle.is_some(), InvalidArgumentSnafu { reason: cleared_reason(&self.name) });
        snafu::ensure!(
            index < self.max_args,
            InvalidArgumentSnafu {
                reason: format!("argument index {index} out of range for '{}' ({} slots)", self.name, self.max_args)
            }
        );
        Ok(())
    }

    fn bind(&mut self, index: u32, arg: KernelArg<'_>) -> Result<()> {
        let handle = self.handle.as_mut().ok_or_else(|| cleared(&self.name))?;
        self.ops.set_arg(handle, index, arg)?;

        let index = index as usize;
        if self.slots.len() <= index {
            self.slots.resize(index + 1, Slot::Unbound);
        }
        self.slots[index] = Slot::Bound;
        Ok(())
    }
}

fn cleared_reason(name: &str) -> String {
    format!("kernel '{name}' has been cleared")
}

fn cleared(name: &str) -> crate::error::Error {
    InvalidArgumentSnafu { reason: cleared_reason(name) }.build()
}

/// Source text of one fragment.
fn fragment(src: &[u8], len: usize, index: usize) -> Result<&str> {
    let bytes = if len == 0 {
        let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
        &src[..end]
    } else {
        snafu::ensure!(
            len <= src.len(),
            InvalidArgumentSnafu { reason: format!("fragment {index}: length {len} exceeds {} bytes", src.len()) }
        );
        &src[..len]
    };
    std::str::from_utf8(bytes)
        .map_err(|e| InvalidArgumentSnafu { reason: format!("fragment {index} is not UTF-8: {e}") }.build())
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("backend", &self.ops.name())
            .field("context", &self.context.id())
            .field("flags", &self.flags)
            .field("initialized", &self.handle.is_some())
            .finish()
    }
}
