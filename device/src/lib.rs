//! Device-side collaborators of the kernel layer.
//!
//! - [`Context`]: an execution environment kernels are compiled in and buffers
//!   are allocated in
//! - [`Buffer`]: context-tagged device memory
//! - [`KernelOps`]: the operations vector each backend implements
//! - [`Error`]: the shared error taxonomy and status codes

pub mod allocator;
pub mod buffer;
pub mod context;
pub mod device;
pub mod error;
pub mod ops;


pub use allocator::{Allocator, BufferOptions, CpuAllocator, RawBuffer};
#[cfg(feature = "cuda")]
pub use allocator::CudaAllocator;
pub use buffer::{Buffer, WeakBuffer};
pub use context::{Context, ContextId};
pub use device::{DeviceLimits, DeviceSpec};
pub use error::{Error, NO_ERROR, Result, describe, status_code};
pub use ops::{KernelArg, KernelFlags, KernelHandle, KernelOps, LaunchDims, OpsCapabilities, ScalarValue};
