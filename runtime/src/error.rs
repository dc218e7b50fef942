//! Error types for kernel compilation, binding and launch.
//!
//! The runtime shares the device-layer taxonomy so status codes stay the same
//! on both sides of the operations vector.

pub use skein_device::error::*;
