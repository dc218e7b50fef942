//! Backend-agnostic kernel compilation, argument binding and launch.
//!
//! A [`Kernel`] is compiled from source fragments for one [`Context`], has
//! its scalar and buffer arguments bound by index, and is launched over a
//! 1-D or 2-D decomposition. Everything backend-specific sits behind the
//! [`KernelOps`] operations vector:
//!
//! - [`devices::host`]: C kernels built by the system compiler, run on the host
//! - `devices::cuda` (feature `cuda`): NVRTC-compiled kernels on CUDA devices
//!
//! [`DEVICES`] opens and caches devices by [`DeviceSpec`].

pub mod config;
pub mod device_registry;
pub mod devices;
pub mod error;
pub mod kernel;
pub mod launch;


pub use config::HostConfig;
pub use device_registry::{DEVICES, DeviceFactory, DeviceFactoryRegistry, DeviceHandle};
pub use devices::HostOps;
#[cfg(feature = "cuda")]
pub use devices::CudaOps;
pub use error::{Error, Result};
pub use kernel::Kernel;
pub use skein_device::{Buffer, Context, DeviceSpec, KernelFlags, KernelOps, LaunchDims};
