//! Concrete backends.

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod host;

#[cfg(feature = "cuda")]
pub use cuda::CudaOps;
pub use host::HostOps;
